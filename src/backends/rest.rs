//! REST Backend
//!
//! Allocates iSCSI storage through an HTTP storage-management server:
//!
//! - `POST {url}/volumes` allocates and returns `{targetPortal, iqn}`
//! - `DELETE {url}/volumes/{name}` reclaims
//! - `GET {url}/volumes/{name}` checks existence (200 present, 404 absent)
//!
//! Every request carries HTTP basic auth.

use crate::config::BackendConfig;
use crate::domain::ports::{AllocatedVolume, VolumeBackend, VolumeOptions};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const BACKEND: &str = "restapi";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the REST backend
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Server base URL, without a trailing slash
    pub url: String,
    pub user: String,
    pub key: Option<String>,
    pub timeout: Duration,
}

impl RestConfig {
    pub fn from_backend(config: &BackendConfig) -> Self {
        Self {
            url: config.rest_url.trim_end_matches('/').to_string(),
            user: config.rest_user.clone(),
            key: config.rest_key.clone(),
            timeout: Duration::from_secs(config.rest_timeout_secs),
        }
    }
}

/// Allocation request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocateRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    capacity: Option<&'a str>,
    access_modes: &'a [String],
    parameters: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a VolumeOptions> for AllocateRequest<'a> {
    fn from(options: &'a VolumeOptions) -> Self {
        Self {
            name: &options.pv_name,
            capacity: options.capacity.as_ref().map(|q| q.0.as_str()),
            access_modes: &options.access_modes,
            parameters: &options.parameters,
        }
    }
}

// =============================================================================
// REST Backend
// =============================================================================

/// Backend backed by a storage-management HTTP server
pub struct RestBackend {
    config: RestConfig,
    client: Client,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    pub fn volumes_url(&self) -> String {
        format!("{}/volumes", self.config.url)
    }

    pub fn volume_url(&self, name: &str) -> String {
        format!("{}/volumes/{}", self.config.url, urlencoding::encode(name))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.config.user, self.config.key.as_ref())
    }

    async fn failed(operation: &str, response: Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Error::BackendOperationFailed {
            backend: BACKEND.into(),
            operation: operation.into(),
            reason: format!("{}: {}", status, body.trim()),
        }
    }
}

#[async_trait]
impl VolumeBackend for RestBackend {
    async fn allocate(&self, options: &VolumeOptions) -> Result<AllocatedVolume> {
        debug!(volume = %options.pv_name, url = %self.volumes_url(), "allocating volume");
        let response = self
            .authorized(self.client.post(self.volumes_url()))
            .json(&AllocateRequest::from(options))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::failed("allocate", response).await);
        }

        let target: AllocatedVolume = response.json().await?;
        info!(
            volume = %options.pv_name,
            portal = %target.location,
            iqn = %target.identifier,
            "server allocated volume"
        );
        Ok(target)
    }

    async fn deallocate(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        let response = self
            .authorized(self.client.delete(self.volume_url(name)))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                info!(volume = name, "server deallocated volume");
                Ok(())
            }
            _ => Err(Self::failed("deallocate", response).await),
        }
    }

    async fn exists(&self, volume_name: &str) -> Result<bool> {
        let response = self
            .authorized(self.client.get(self.volume_url(volume_name)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(Self::failed("exists", response).await),
        }
    }

    fn backend_name(&self) -> &str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn backend(url: &str) -> RestBackend {
        let config = BackendConfig {
            rest_url: url.into(),
            ..Default::default()
        };
        RestBackend::new(RestConfig::from_backend(&config)).unwrap()
    }

    #[test]
    fn test_urls() {
        let backend = backend("http://storage:8081/");
        assert_eq!(backend.volumes_url(), "http://storage:8081/volumes");
        assert_eq!(backend.volume_url("pvc-u1"), "http://storage:8081/volumes/pvc-u1");
        assert_eq!(backend.volume_url("a b"), "http://storage:8081/volumes/a%20b");
    }

    #[test]
    fn test_request_body() {
        let mut parameters = BTreeMap::new();
        parameters.insert("pool".to_string(), "ssd".to_string());
        let options = VolumeOptions {
            capacity: Some(Quantity("1Gi".into())),
            access_modes: vec!["ReadWriteOnce".into()],
            reclaim_policy: "Delete".into(),
            pv_name: "pvc-u1".into(),
            parameters,
        };

        let body = serde_json::to_value(AllocateRequest::from(&options)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "name": "pvc-u1",
                "capacity": "1Gi",
                "accessModes": ["ReadWriteOnce"],
                "parameters": { "pool": "ssd" },
            })
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let backend = backend("http://127.0.0.1:1");
        let err = backend.exists("pvc-u1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
