use crate::error::{CidmarkError, Result};
use crate::store::{ContentStoreBackend, StoreHandle};
use crate::types::ContentId;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

/// Store backed by an IPFS node's HTTP RPC API (`/api/v0`).
pub struct IpfsHttpStore {
    api_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "Version")]
    version: String,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl IpfsHttpStore {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.api_url, command)
    }
}

#[async_trait]
impl ContentStoreBackend for IpfsHttpStore {
    async fn start(&self) -> Result<StoreHandle> {
        let response = self
            .client
            .post(self.endpoint("version"))
            .send()
            .await
            .map_err(|e| {
                CidmarkError::StoreUnavailable(format!("ipfs api {} unreachable: {}", self.api_url, e))
            })?;

        if !response.status().is_success() {
            return Err(CidmarkError::StoreUnavailable(format!(
                "ipfs api {} returned {}",
                self.api_url,
                response.status()
            )));
        }

        let version: VersionResponse = response.json().await.map_err(|e| {
            CidmarkError::StoreUnavailable(format!("invalid ipfs version response: {}", e))
        })?;

        tracing::info!("IPFS node version: {}", version.version);

        Ok(StoreHandle {
            backend: "ipfs".to_string(),
            version: version.version,
            started_at: Utc::now(),
        })
    }

    async fn add(&self, body: Bytes, name: &str) -> Result<ContentId> {
        let part = Part::bytes(body.to_vec()).file_name(name.to_string());
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint("add"))
            .query(&[("cid-version", "0")])
            .multipart(form)
            .send()
            .await
            .map_err(|e| CidmarkError::IngestError(format!("ipfs add failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(CidmarkError::IngestError(format!(
                "ipfs add returned {}: {}",
                status, message
            )));
        }

        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| CidmarkError::IngestError(format!("invalid ipfs add response: {}", e)))?;

        ContentId::new(added.hash)
    }

    async fn get(&self, cid: &ContentId) -> Result<Bytes> {
        let response = self
            .client
            .post(self.endpoint("cat"))
            .query(&[("arg", cid.as_str())])
            .send()
            .await
            .map_err(|e| CidmarkError::Internal(format!("ipfs cat failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CidmarkError::ContentNotFound(format!(
                "{} (ipfs returned {})",
                cid,
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| CidmarkError::Internal(format!("ipfs cat body failed: {}", e)))
    }
}
