use crate::config::FetchConfig;
use reqwest::{Client, Proxy};
use std::time::Duration;

/// Builds an HTTP client with the configured user agent and timeout
///
/// # Arguments
///
/// * `config` - The fetch configuration
/// * `proxy` - Optional proxy every request is routed through
///
/// # Example
///
/// ```no_run
/// use ourgraph::config::FetchConfig;
/// use ourgraph::fetch::build_http_client;
///
/// let client = build_http_client(&FetchConfig::default(), None).unwrap();
/// ```
pub fn build_http_client(
    config: &FetchConfig,
    proxy: Option<Proxy>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(config.timeout())
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true);

    builder = match proxy {
        Some(proxy) => builder.proxy(proxy),
        None => builder.no_proxy(),
    };

    builder.build()
}
