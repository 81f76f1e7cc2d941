use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Header sent with every precheck so backends can tell it apart from probe traffic.
pub const PRECHECK_HEADER: &str = "x-rpcprobe-precheck";
pub const PRECHECK_HEADER_VALUE: &str = "1";

const PRECHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable,
}

/// Advisory health check run before a probe connects.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, endpoint: &str) -> Availability;
}

pub struct HttpPrecheck {
    client: reqwest::Client,
    marker: String,
}

impl HttpPrecheck {
    pub fn new(marker: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PRECHECK_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            marker: marker.into(),
        })
    }

    async fn fetch(&self, url: Url) -> reqwest::Result<(StatusCode, String)> {
        let response = self
            .client
            .get(url)
            .header(PRECHECK_HEADER, PRECHECK_HEADER_VALUE)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

#[async_trait]
impl HealthCheck for HttpPrecheck {
    async fn check(&self, endpoint: &str) -> Availability {
        let Some(url) = http_url(endpoint) else {
            debug!("Skipping precheck for unparseable endpoint {}", endpoint);
            return Availability::Available;
        };

        match self.fetch(url).await {
            Ok((status, body))
                if status == StatusCode::SERVICE_UNAVAILABLE && body.contains(&self.marker) =>
            {
                warn!("{} reports maintenance (status {})", endpoint, status);
                Availability::Unavailable
            }
            Ok((status, _)) => {
                debug!("Precheck of {} returned {}", endpoint, status);
                Availability::Available
            }
            Err(e) => {
                debug!("Precheck of {} failed, assuming available: {}", endpoint, e);
                Availability::Available
            }
        }
    }
}

/// Map a probe endpoint onto the HTTP URL that serves its precheck.
/// WebSocket schemes become their HTTP counterparts; bare `host:port`
/// endpoints are assumed to speak HTTPS.
pub fn http_url(endpoint: &str) -> Option<Url> {
    let mut url = match Url::parse(endpoint) {
        Ok(url) if url.has_host() => url,
        _ => Url::parse(&format!("https://{}", endpoint)).ok()?,
    };
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        "http" | "https" => return Some(url),
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    Some(url)
}
