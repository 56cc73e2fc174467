//! Hetzner Cloud compute binding.
//!
//! Thin reqwest client over the parts of the Hetzner Cloud API the
//! orchestrator needs: create/delete servers, look servers up by name,
//! and list server types for the size-class catalog.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{
    classify_send_error, classify_status, CallKind, ComputeInstance, ComputeProvisioner,
    InstanceSpec, ProviderError, ServerType,
};
use crate::node::Provider;

pub const DEFAULT_API_URL: &str = "https://api.hetzner.cloud/v1";

/// Hetzner Cloud client configuration.
#[derive(Debug, Clone)]
pub struct HcloudConfig {
    pub api_url: String,
    pub token: String,
    /// Transport-level timeout for a single HTTP request.
    pub request_timeout: Duration,
}

/// Hetzner Cloud API client.
pub struct HcloudClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    location: &'a str,
    labels: &'a BTreeMap<String, String>,
    start_after_create: bool,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: ApiServer,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<ApiServer>,
}

#[derive(Debug, Deserialize)]
struct ApiServer {
    id: i64,
    name: String,
    #[serde(default)]
    public_net: Option<ApiPublicNet>,
}

#[derive(Debug, Deserialize)]
struct ApiPublicNet {
    #[serde(default)]
    ipv4: Option<ApiIpv4>,
}

#[derive(Debug, Deserialize)]
struct ApiIpv4 {
    ip: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
struct ServerTypeList {
    server_types: Vec<ApiServerType>,
}

#[derive(Debug, Deserialize)]
struct ApiServerType {
    name: String,
    cores: i32,
    /// GiB, as a float.
    memory: f64,
    #[serde(default)]
    deprecated: Option<bool>,
}

impl HcloudClient {
    pub fn new(config: &HcloudConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    /// Non-deprecated server types, converted to MiB.
    pub async fn server_types(&self) -> Result<Vec<ServerType>, ProviderError> {
        let url = format!("{}/server_types?per_page=50", self.api_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, CallKind::Delete))?;

        if !response.status().is_success() {
            return Err(failure(response).await);
        }

        let list: ServerTypeList = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid server type list: {e}")))?;

        Ok(list
            .server_types
            .into_iter()
            .filter(|t| !t.deprecated.unwrap_or(false))
            .map(|t| ServerType::new(t.name, t.cores, (t.memory * 1024.0).round() as i64))
            .collect())
    }

    async fn find_servers(&self, name: &str) -> Result<Vec<ApiServer>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/servers", self.api_url))
            .query(&[("name", name)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, CallKind::Delete))?;

        if !response.status().is_success() {
            return Err(failure(response).await);
        }

        let list: ServerList = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid server list: {e}")))?;
        Ok(list.servers)
    }
}

async fn failure(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body)
}

#[async_trait]
impl ComputeProvisioner for HcloudClient {
    fn provider(&self) -> Provider {
        Provider::Hcloud
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, server_type = %spec.server_type))]
    async fn create(&self, spec: &InstanceSpec) -> Result<ComputeInstance, ProviderError> {
        let body = CreateServerRequest {
            name: &spec.name,
            server_type: &spec.server_type,
            image: &spec.image,
            location: &spec.location,
            labels: &spec.labels,
            start_after_create: true,
        };

        let response = self
            .client
            .post(format!("{}/servers", self.api_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, CallKind::Create))?;

        if !response.status().is_success() {
            return Err(failure(response).await);
        }

        // The server exists from here on; anything unreadable is ambiguous.
        let envelope: ServerEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Ambiguous(format!("unreadable create response: {e}")))?;

        let server = envelope.server;
        let Some(ipv4) = server.public_net.and_then(|net| net.ipv4) else {
            return Err(ProviderError::Ambiguous(format!(
                "server {} created without a public IPv4",
                server.id
            )));
        };

        info!(instance_id = server.id, ip = %ipv4.ip, "Server created");

        Ok(ComputeInstance {
            instance_id: server.id.to_string(),
            name: server.name,
            public_ipv4: ipv4.ip,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, instance_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(format!("{}/servers/{}", self.api_url, instance_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, CallKind::Delete))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("Server already gone");
                Ok(())
            }
            s if s.is_success() => {
                info!("Server deleted");
                Ok(())
            }
            _ => Err(failure(response).await),
        }
    }

    #[instrument(skip(self))]
    async fn delete_by_name(&self, name: &str) -> Result<bool, ProviderError> {
        let servers = self.find_servers(name).await?;
        if servers.is_empty() {
            return Ok(false);
        }
        for server in servers {
            self.delete(&server.id.to_string()).await?;
        }
        Ok(true)
    }
}
