//! Transient Name Server client
//!
//! Two endpoints are used, both as form posts carrying `api_key` and a JSON
//! `data` field:
//! - `api/get/search`: cone search, returns `{"data": {"reply": [{"objname": ..}]}}`
//! - `api/get/object`: object details, classification at
//!   `data.reply.object_type.name`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{NameBroker, NameQuery};
use crate::error::OrchestratorErrorTrait;
use crate::models::SkyPosition;
use crate::utils::error::BrokerError;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Public TNS endpoint
pub const TNS_BASE_URL: &str = "https://www.wis-tns.org/";

/// TNS client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TnsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Bot id and name for the `tns_marker` user agent
    pub bot_id: Option<u64>,
    pub bot_name: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for TnsConfig {
    fn default() -> Self {
        Self {
            base_url: TNS_BASE_URL.to_string(),
            api_key: None,
            bot_id: None,
            bot_name: None,
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

/// Name and classification lookups against TNS
pub struct TnsClient {
    client: Client,
    base_url: String,
    api_key: String,
    retry: RetryConfig,
}

impl TnsClient {
    /// Build a client; fails without an API key
    pub fn new(config: &TnsConfig) -> Result<Self, BrokerError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BrokerError::MissingCredential("tns.api_key".to_string()))?;

        let mut headers = HeaderMap::new();
        if let (Some(id), Some(name)) = (config.bot_id, config.bot_name.as_deref()) {
            let marker = format!(r#"tns_marker{{"tns_id":{id},"type":"bot","name":"{name}"}}"#);
            if let Ok(value) = HeaderValue::from_str(&marker) {
                headers.insert(USER_AGENT, value);
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()?;

        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            api_key,
            retry: RetryConfig::new(
                config.max_retries,
                Duration::from_secs(1),
                Duration::from_secs(10),
            ),
        })
    }

    /// TNS names of objects within `radius_arcsec` of `position`
    pub async fn search_names(
        &self,
        position: SkyPosition,
        radius_arcsec: f64,
    ) -> Result<Vec<String>, BrokerError> {
        let data = json!({
            "ra": position.ra,
            "dec": position.dec,
            "radius": radius_arcsec,
            "units": "arcsec",
        });
        let body = self.post("api/get/search", &data).await?;

        let reply = body
            .pointer("/data/reply")
            .and_then(Value::as_array)
            .ok_or_else(|| BrokerError::UnexpectedResponse("missing data.reply".to_string()))?;

        Ok(reply
            .iter()
            .filter_map(|entry| entry.get("objname").and_then(Value::as_str))
            .map(String::from)
            .collect())
    }

    /// Classification label of a named object
    pub async fn classification(&self, objname: &str) -> Result<String, BrokerError> {
        let data = json!({
            "objname": objname,
            "photometry": 1,
            "spectroscopy": 0,
        });
        let body = self.post("api/get/object", &data).await?;

        body.pointer("/data/reply/object_type/name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .ok_or_else(|| BrokerError::NotFound(objname.to_string()))
    }

    async fn post(&self, endpoint: &str, data: &Value) -> Result<Value, BrokerError> {
        let url = format!("{}{endpoint}", self.base_url);
        let form = [
            ("api_key", self.api_key.clone()),
            ("data", data.to_string()),
        ];

        debug!(url = %url, "TNS request");
        let client = &self.client;
        let url = url.as_str();
        let form = &form;
        let result = with_retry_if(
            &self.retry,
            || async move {
                let response = client
                    .post(url)
                    .form(form)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<Value, BrokerError>(response.json::<Value>().await?)
            },
            // 4xx means a bad key or request; retrying will not help
            |e| match e {
                BrokerError::Http(err) => !err.status().is_some_and(|s| s.is_client_error()),
                other => other.is_recoverable(),
            },
        )
        .await;

        result.map_err(|exhausted| exhausted.error)
    }
}

#[async_trait]
impl NameBroker for TnsClient {
    async fn lookup(&self, query: &NameQuery) -> Result<String, BrokerError> {
        match query {
            NameQuery::Name(name) => self.classification(name).await,
            NameQuery::Position {
                position,
                radius_arcsec,
            } => {
                let names = self.search_names(*position, *radius_arcsec).await?;
                let first = names.first().ok_or_else(|| {
                    BrokerError::NotFound(format!("{:.5} {:.5}", position.ra, position.dec))
                })?;
                self.classification(first).await
            }
        }
    }
}
