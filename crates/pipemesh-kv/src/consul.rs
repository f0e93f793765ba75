//! Consul KV HTTP transport.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::KvError;
use crate::store::{KvList, KvPair, KvStore};

/// Slack added to a blocking list's HTTP timeout on top of the requested
/// wait, since Consul adds up to `wait / 16` of jitter.
const LONG_POLL_SLACK: Duration = Duration::from_secs(5);

/// Consul KV API client.
#[derive(Debug, Clone)]
pub struct ConsulKv {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulPair {
    key: String,
    value: Option<String>,
    modify_index: u64,
}

impl ConsulKv {
    /// Create a client for the agent at `addr` (`host:port` or a full URL).
    pub fn new(addr: &str) -> Result<Self, KvError> {
        if addr.is_empty() {
            return Err(KvError::Transport("consul address is empty".into()));
        }

        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        // The `Err` case just means it was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder().build()?;
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        Ok(Self { http, base_url })
    }

    /// Build the KV endpoint URL for `key`, escaping each path segment.
    pub(crate) fn kv_url(&self, key: &str) -> String {
        let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
        format!("{}/v1/kv/{}", self.base_url, encoded.join("/"))
    }

    fn decode_pair(pair: ConsulPair) -> Result<KvPair, KvError> {
        let value = match pair.value {
            Some(v) => STANDARD
                .decode(v)
                .map_err(|e| KvError::Transport(format!("bad base64 for {}: {e}", pair.key)))?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: pair.key,
            value,
            modify_index: pair.modify_index,
        })
    }

    fn index_header(resp: &reqwest::Response) -> Option<u64> {
        resp.headers()
            .get("x-consul-index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    fn check_status(key: &str, resp: &reqwest::Response) -> Result<(), KvError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(KvError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for ConsulKv {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError> {
        let resp = self
            .http
            .get(self.kv_url(key))
            .query(&[("consistent", "")])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(key, &resp)?;
        let pairs: Vec<ConsulPair> = resp.json().await?;
        pairs.into_iter().next().map(Self::decode_pair).transpose()
    }

    async fn cas(&self, key: &str, value: Vec<u8>, index: u64) -> Result<bool, KvError> {
        let resp = self
            .http
            .put(self.kv_url(key))
            .query(&[("cas", index.to_string())])
            .body(value)
            .send()
            .await?;
        Self::check_status(key, &resp)?;
        let body = resp.text().await?;
        Ok(body.trim() == "true")
    }

    async fn list(
        &self,
        prefix: &str,
        index: u64,
        wait: Option<Duration>,
    ) -> Result<KvList, KvError> {
        let mut req = self
            .http
            .get(self.kv_url(prefix))
            .query(&[("recurse", ""), ("consistent", "")]);
        if let Some(wait) = wait {
            req = req
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", wait.as_secs().max(1))),
                ])
                .timeout(wait + LONG_POLL_SLACK);
        }
        let resp = req.send().await?;
        let new_index = Self::index_header(&resp).unwrap_or(index);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(KvList {
                pairs: Vec::new(),
                index: new_index,
            });
        }
        Self::check_status(prefix, &resp)?;
        let pairs: Vec<ConsulPair> = resp.json().await?;
        let pairs = pairs
            .into_iter()
            .map(Self::decode_pair)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(KvList {
            pairs,
            index: new_index,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let resp = self.http.delete(self.kv_url(key)).send().await?;
        Self::check_status(key, &resp)
    }
}
