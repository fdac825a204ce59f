//! HTTP client construction and request decoration.

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder};
use std::collections::HashMap;

use crate::options::ClientOptions;

/// Build a configured HTTP client from the connection options.
///
/// Only the connect phase is bounded; streaming bodies may stay open
/// indefinitely.
pub fn build_http_client(options: &ClientOptions) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder();

    if let Some(timeout) = options.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }

    if let Some(proxy_url) = &options.proxy {
        match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => tracing::warn!("Ignoring invalid proxy {}: {}", proxy_url, e),
        }
    }

    builder.build()
}

/// Add the bearer token and extra headers configured in `options`.
pub fn decorate(mut request: RequestBuilder, options: &ClientOptions) -> RequestBuilder {
    if let Some(api_key) = &options.api_key {
        request = request.header(AUTHORIZATION, format!("Bearer {}", api_key.expose_secret()));
    }
    add_extra_headers(request, &options.extra_headers)
}

/// Add extra headers to a request if specified.
pub fn add_extra_headers(
    mut request: RequestBuilder,
    extra_headers: &Option<HashMap<String, String>>,
) -> RequestBuilder {
    if let Some(headers) = extra_headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}
