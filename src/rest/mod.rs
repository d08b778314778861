//! # REST Collaborator
//!
//! File transfers and state storage against the Pepeunit backend.
//!
//! All endpoints live under
//! `{PU_HTTP_TYPE}://{PU_DOMAIN}{PU_APP_PREFIX}{PU_API_ACTUAL_PREFIX}` and
//! authenticate with the unit token in the `x-auth-token` header. The unit id
//! in the path comes from the [`IdentityProvider`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{PepeunitError, Result};
use crate::files;
use crate::identity::IdentityProvider;
use crate::settings::{Settings, SettingsStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_HEADER: &str = "x-auth-token";

#[async_trait]
pub trait RestClient: Send + Sync {
    /// Fetches the unit's update archive (tar, gzip or zlib compressed).
    async fn download_update_archive(&self, dest: &Path) -> Result<()>;

    async fn download_env(&self, dest: &Path) -> Result<()>;

    async fn download_schema(&self, dest: &Path) -> Result<()>;

    /// Fetches an arbitrary URL without the auth header.
    async fn download_binary(&self, url: &str, dest: &Path) -> Result<()>;

    async fn get_state(&self) -> Result<String>;

    async fn set_state(&self, state: &str) -> Result<()>;
}

pub fn base_url(settings: &Settings) -> String {
    format!(
        "{}://{}{}{}",
        settings.http_type, settings.domain, settings.app_prefix, settings.api_actual_prefix
    )
}

/// Parses a JSON body, unwrapping a document the server sent as a JSON string.
pub fn normalize_json(body: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| PepeunitError::DownloadFailed(format!("response is not JSON: {e}")))?;
    Ok(match value {
        Value::String(inner) => serde_json::from_str(&inner).unwrap_or(Value::String(inner)),
        other => other,
    })
}

pub struct PepeunitRestClient {
    http: Client,
    settings: Arc<SettingsStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl PepeunitRestClient {
    pub fn new(settings: Arc<SettingsStore>, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PepeunitError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            settings,
            identity,
        })
    }

    fn unit_url(&self, endpoint: &str) -> Result<String> {
        let unit_id = self.identity.unit_id()?;
        Ok(format!(
            "{}/units/{}/{}",
            base_url(&self.settings.snapshot()),
            endpoint,
            unit_id
        ))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTH_HEADER, self.settings.snapshot().auth_token.clone())
    }

    async fn send(request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| PepeunitError::DownloadFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PepeunitError::DownloadFailed(format!(
                "request failed with status {status}: {body}"
            )));
        }
        Ok(response)
    }

    async fn body(request: RequestBuilder) -> Result<Vec<u8>> {
        let bytes = Self::send(request)
            .await?
            .bytes()
            .await
            .map_err(|e| PepeunitError::DownloadFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn download_to(request: RequestBuilder, dest: &Path) -> Result<()> {
        let body = Self::body(request).await?;
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PepeunitError::io(dir, e))?;
        }
        tokio::fs::write(dest, &body)
            .await
            .map_err(|e| PepeunitError::io(dest, e))?;
        debug!("Downloaded {} bytes to {:?}", body.len(), dest);
        Ok(())
    }

    async fn download_json(&self, endpoint: &str, dest: &Path) -> Result<()> {
        let url = self.unit_url(endpoint)?;
        let body = Self::body(self.authorized(self.http.get(&url))).await?;
        let value = normalize_json(&body)?;
        files::write_json(dest, &value)?;
        info!("Stored {} at {:?}", endpoint, dest);
        Ok(())
    }
}

#[async_trait]
impl RestClient for PepeunitRestClient {
    async fn download_update_archive(&self, dest: &Path) -> Result<()> {
        let url = format!("{}?wbits=9&level=9", self.unit_url("firmware/tgz")?);
        let request = self
            .authorized(self.http.get(&url))
            .header("Accept", "application/octet-stream")
            .header("Accept-Encoding", "identity");
        Self::download_to(request, dest).await
    }

    async fn download_env(&self, dest: &Path) -> Result<()> {
        self.download_json("env", dest).await
    }

    async fn download_schema(&self, dest: &Path) -> Result<()> {
        self.download_json("get_current_schema", dest).await
    }

    async fn download_binary(&self, url: &str, dest: &Path) -> Result<()> {
        Self::download_to(self.http.get(url), dest).await
    }

    async fn get_state(&self) -> Result<String> {
        let url = self.unit_url("get_state_storage")?;
        let body = Self::body(self.authorized(self.http.get(&url))).await?;
        let text = String::from_utf8_lossy(&body).into_owned();
        // The server answers with a JSON string; keep anything else verbatim.
        Ok(match serde_json::from_str::<Value>(&text) {
            Ok(Value::String(state)) => state,
            _ => text,
        })
    }

    async fn set_state(&self, state: &str) -> Result<()> {
        let url = self.unit_url("set_state_storage")?;
        let request = self
            .authorized(self.http.post(&url))
            .json(&json!({ "state": state }));
        Self::send(request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{token_for, JwtIdentity};

    #[test]
    fn base_url_joins_prefixes() {
        let settings = Settings {
            domain: "pepeunit.example.com".into(),
            app_prefix: "/pepeunit".into(),
            api_actual_prefix: "/api/v1".into(),
            ..Settings::default()
        };
        assert_eq!(
            base_url(&settings),
            "https://pepeunit.example.com/pepeunit/api/v1"
        );
    }

    #[test]
    fn json_in_string_is_unwrapped() {
        let wrapped = br#""{\"PU_DOMAIN\": \"d\"}""#;
        assert_eq!(normalize_json(wrapped).unwrap(), json!({"PU_DOMAIN": "d"}));
        assert_eq!(normalize_json(br#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(normalize_json(br#""plain""#).unwrap(), json!("plain"));
        assert!(normalize_json(b"<html>").is_err());
    }

    #[test]
    fn unit_urls_carry_the_token_uuid() {
        let settings = Settings {
            domain: "host".into(),
            http_type: "http".into(),
            auth_token: token_for("abc"),
            ..Settings::default()
        };
        let store = Arc::new(SettingsStore::from_settings("env.json", settings));
        let identity = Arc::new(JwtIdentity::new(store.clone()));
        let client = PepeunitRestClient::new(store, identity).unwrap();
        assert_eq!(
            client.unit_url("env").unwrap(),
            "http://host/units/env/abc"
        );
    }

    #[test]
    fn invalid_token_blocks_requests() {
        let store = Arc::new(SettingsStore::from_settings("env.json", Settings::default()));
        let identity = Arc::new(JwtIdentity::new(store.clone()));
        let client = PepeunitRestClient::new(store, identity).unwrap();
        assert!(matches!(
            client.unit_url("env"),
            Err(PepeunitError::InvalidToken(_))
        ));
    }
}
