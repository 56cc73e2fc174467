//! Cloudflare DNS binding.
//!
//! Cloudflare wraps every response in `{ success, errors, result }`. A 2xx
//! with `success: false` is treated the same as a 4xx.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{
    classify_send_error, classify_status, CallKind, DnsRecordSpec, DnsRegistrar, ProviderError,
};

pub const DEFAULT_API_URL: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare client configuration.
#[derive(Debug, Clone)]
pub struct CloudflareConfig {
    pub api_url: String,
    pub token: String,
    pub request_timeout: Duration,
}

/// Cloudflare DNS API client.
pub struct CloudflareClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: String,
    ttl: u32,
    proxied: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RecordRef {
    id: String,
}

fn describe(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "request unsuccessful".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{}: {}", e.code, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CloudflareClient {
    pub fn new(config: &CloudflareConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn records_url(&self, zone: &str) -> String {
        format!("{}/zones/{}/dns_records", self.api_url, zone)
    }

    async fn find_records(&self, zone: &str, name: &str) -> Result<Vec<RecordRef>, ProviderError> {
        let response = self
            .client
            .get(self.records_url(zone))
            .query(&[("type", "A"), ("name", name)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, CallKind::Delete))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let envelope: Envelope<Vec<RecordRef>> = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid record list: {e}")))?;
        if !envelope.success {
            return Err(ProviderError::Rejected(describe(&envelope.errors)));
        }
        Ok(envelope.result.unwrap_or_default())
    }
}

#[async_trait]
impl DnsRegistrar for CloudflareClient {
    #[instrument(skip(self, record), fields(name = %record.name, address = %record.address))]
    async fn create_record(&self, record: &DnsRecordSpec) -> Result<String, ProviderError> {
        let body = CreateRecordRequest {
            record_type: "A",
            name: &record.name,
            content: record.address.to_string(),
            ttl: record.ttl,
            proxied: false,
        };

        let response = self
            .client
            .post(self.records_url(&record.zone))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, CallKind::Create))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let envelope: Envelope<RecordRef> = response
            .json()
            .await
            .map_err(|e| ProviderError::Ambiguous(format!("unreadable create response: {e}")))?;

        if !envelope.success {
            return Err(ProviderError::Rejected(describe(&envelope.errors)));
        }
        let Some(result) = envelope.result else {
            return Err(ProviderError::Ambiguous(
                "create succeeded without a record id".to_string(),
            ));
        };

        info!(record_id = %result.id, "DNS record created");
        Ok(result.id)
    }

    #[instrument(skip(self))]
    async fn delete_record(&self, zone: &str, record_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(format!("{}/{}", self.records_url(zone), record_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| classify_send_error(&e, CallKind::Delete))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("DNS record already gone");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        info!("DNS record deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_record_by_name(&self, zone: &str, name: &str) -> Result<bool, ProviderError> {
        let records = self.find_records(zone, name).await?;
        if records.is_empty() {
            return Ok(false);
        }
        for record in records {
            self.delete_record(zone, &record.id).await?;
        }
        Ok(true)
    }
}
