//! HTTP Client Factory
//!
//! Provides a factory function for building reqwest clients with proxy and
//! timeout support.

use std::time::Duration;

use crate::types::{LlmError, LlmResult};

/// Build a `reqwest::Client` for a provider.
///
/// - `Some(proxy_url)` -> route every request through that proxy
/// - `None` -> explicitly disable proxy (`no_proxy`), ignoring env vars
pub fn build_http_client(proxy_url: Option<&str>, timeout: Duration) -> LlmResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    match proxy_url {
        Some(url) => {
            let proxy = reqwest::Proxy::all(url).map_err(|e| LlmError::InvalidRequest {
                message: format!("invalid proxy URL {}: {}", url, e),
            })?;
            builder = builder.proxy(proxy);
        }
        None => {
            builder = builder.no_proxy();
        }
    }
    builder.build().map_err(|e| LlmError::Other {
        message: format!("failed to build HTTP client: {}", e),
    })
}
