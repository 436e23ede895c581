use std::time::Duration;

use async_trait::async_trait;

use super::Probe;
use crate::error::ProbeFailure;

/// Single-attempt HTTP reachability check.
///
/// Any HTTP response counts as reachable, whatever its status; only transport
/// failures mean the bridge is down.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProbeFailure> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProbeFailure::Request(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> Result<(), ProbeFailure> {
        self.client.get(&self.url).send().await?;
        Ok(())
    }
}
