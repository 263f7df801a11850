//! External data-source access.
//!
//! The pipeline talks to a project's API through the [`Fetcher`] trait so
//! that the transport can be swapped (tests use an in-memory fetcher).
//! [`HttpFetcher`] is the reqwest implementation used by the CLI.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::models::HttpMethod;
use crate::params::{query_pairs, Params};

/// Issues one request against a project's data source.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Sends `params` as query string (GET-like methods) or JSON body, and
    /// returns the decoded JSON response.
    async fn fetch(&self, method: HttpMethod, url: &str, params: &Params) -> Result<Value>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, method: HttpMethod, url: &str, params: &Params) -> Result<Value> {
        let request = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        };
        let request = if method.sends_query() {
            request.query(&query_pairs(params))
        } else {
            request.json(params)
        };

        debug!(method = method.as_str(), url, "fetching");
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::fetch(format!(
                "{} {} returned {}: {}",
                method.as_str(),
                url,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let value = response.json::<Value>().await?;
        Ok(value)
    }
}
