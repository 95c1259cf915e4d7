use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;

/// Outcome of fetching one remote media object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Bytes(Vec<u8>),
    /// The object is larger than the ceiling it was fetched under.
    TooLarge { observed: u64 },
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetches `url`, reading at most `max_bytes` of its body.
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Fetched>;
}

pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create media HTTP client")?;
        Ok(HttpMediaFetcher { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Fetched> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Fetching {url}"))?;
        if !response.status().is_success() {
            return Err(anyhow!("Fetching {url}: HTTP {}", response.status()));
        }
        if let Some(declared) = response.content_length().filter(|len| *len > max_bytes) {
            return Ok(Fetched::TooLarge { observed: declared });
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.with_context(|| format!("Reading {url}"))? {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > max_bytes {
                return Ok(Fetched::TooLarge {
                    observed: bytes.len() as u64,
                });
            }
        }
        Ok(Fetched::Bytes(bytes))
    }
}
