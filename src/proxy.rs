use std::fmt;

use rand::seq::SliceRandom;
use tokio::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: String,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Picks a random egress proxy from a newline-delimited `host:port` list.
///
/// Selection is best-effort: any provider problem yields `None`.
#[derive(Clone)]
pub struct ProxySelector {
    provider_url: Url,
    http_client: reqwest::Client,
}

impl ProxySelector {
    pub fn new(provider_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            provider_url,
            http_client,
        })
    }

    pub async fn select_proxy(&self) -> Option<ProxyEndpoint> {
        let body = match self.fetch_list().await {
            Ok(body) => body,
            Err(error) => {
                warn!("Error fetching proxy list: {error}");
                return None;
            }
        };

        let candidates = parse_proxy_list(&body);
        let chosen = candidates.choose(&mut rand::thread_rng()).cloned();
        match &chosen {
            Some(proxy) => debug!(
                "Selected proxy {proxy} out of {} candidate(s)",
                candidates.len()
            ),
            None => warn!("Proxy provider returned no usable endpoints"),
        }
        chosen
    }

    async fn fetch_list(&self) -> Result<String, reqwest::Error> {
        self.http_client
            .get(self.provider_url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

pub fn parse_proxy_list(body: &str) -> Vec<ProxyEndpoint> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (host, port) = line.rsplit_once(':')?;
            let host = host.trim();
            let port = port.trim();
            if host.is_empty() || port.parse::<u16>().is_err() {
                return None;
            }
            Some(ProxyEndpoint {
                host: host.to_string(),
                port: port.to_string(),
            })
        })
        .collect()
}
