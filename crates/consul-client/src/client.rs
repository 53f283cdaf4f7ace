//! Consul agent HTTP client
//!
//! Implements the agent endpoints used by the controllers:
//! `/v1/agent/service/register`, `/v1/agent/service/deregister/<id>`,
//! `/v1/agent/services?filter=...` and `/v1/config/proxy-defaults/<name>`.

use crate::consul_trait::ConsulClientTrait;
use crate::error::ConsulError;
use crate::models::*;
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Settings for one agent client
#[derive(Debug, Clone)]
pub struct ConsulClientConfig {
    /// Agent address, e.g. `https://10.0.0.12:8501`. `http://` is assumed without a scheme.
    pub address: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// PEM CA certificate trusted for https agents
    pub ca_cert_pem: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ConsulClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: None,
            ca_cert_pem: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Consul agent API client
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: Client,
    address: String,
    token: Option<String>,
}

impl ConsulClient {
    /// Create a new Consul client
    ///
    /// # Arguments
    /// * `config` - agent address, optional token and CA certificate
    pub fn new(config: ConsulClientConfig) -> Result<Self, ConsulError> {
        let mut builder = Client::builder().timeout(config.timeout);
        if let Some(pem) = &config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| ConsulError::InvalidConfig(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build()?;

        let address = config.address.trim_end_matches('/');
        let address = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        Ok(Self {
            client,
            address,
            token: config.token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.address, path);
        debug!("Consul request: {} {}", method, url);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    /// Map non-success responses to errors, keeping 404 distinct
    async fn check(response: Response, what: &str) -> Result<Response, ConsulError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(ConsulError::NotFound(format!("{}: {}", what, body)));
        }
        Err(ConsulError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait::async_trait]
impl ConsulClientTrait for ConsulClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn service_register(&self, registration: &AgentServiceRegistration) -> Result<(), ConsulError> {
        let response = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .json(registration)
            .send()
            .await?;
        Self::check(response, &format!("service {}", registration.id)).await?;
        Ok(())
    }

    async fn service_deregister(&self, service_id: &str) -> Result<(), ConsulError> {
        let path = format!(
            "/v1/agent/service/deregister/{}",
            urlencoding::encode(service_id)
        );
        let response = self.request(reqwest::Method::PUT, &path).send().await?;
        Self::check(response, &format!("service {}", service_id)).await?;
        Ok(())
    }

    async fn services_with_filter(&self, filter: &ServiceFilter) -> Result<HashMap<String, AgentService>, ConsulError> {
        let path = format!(
            "/v1/agent/services?filter={}",
            urlencoding::encode(&filter.expression())
        );
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = Self::check(response, "agent services").await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn proxy_defaults(&self, name: &str) -> Result<ProxyConfigEntry, ConsulError> {
        let path = format!("/v1/config/proxy-defaults/{}", urlencoding::encode(name));
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = Self::check(response, &format!("proxy-defaults {}", name)).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}
