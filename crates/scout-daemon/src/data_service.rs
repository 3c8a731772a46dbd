//! Admin client for the Couchbase-style data service.
//!
//! Joining a cluster ends by asking an existing data-service node to add this
//! node: `POST /controller/addNode` with form fields and basic auth.

use async_trait::async_trait;
use scout_core::{ClusterError, DataService};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CouchbaseAdmin {
    client: reqwest::Client,
    /// How this node names itself to the data service
    hostname: String,
    username: String,
    password: String,
    services: Vec<String>,
}

impl CouchbaseAdmin {
    pub fn new(
        local_ip: IpAddr,
        username: impl Into<String>,
        password: impl Into<String>,
        services: Vec<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            hostname: local_ip.to_string(),
            username: username.into(),
            password: password.into(),
            services,
        })
    }
}

#[async_trait]
impl DataService for CouchbaseAdmin {
    async fn add_node(&self, address: &str) -> scout_core::Result<()> {
        let url = format!("http://{}/controller/addNode", address);
        let services = self.services.join(",");
        let form = [
            ("hostname", self.hostname.as_str()),
            ("user", self.username.as_str()),
            ("password", self.password.as_str()),
            ("services", services.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(&form)
            .send()
            .await
            .map_err(|e| ClusterError::DataService(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ClusterError::DataService(format!(
                "{} answered {}: {}",
                url,
                status,
                body.trim()
            )));
        }
        info!("Data service at {} added {}", address, self.hostname);
        Ok(())
    }
}

/// Used when the data service is disabled in configuration.
pub struct NoopDataService;

#[async_trait]
impl DataService for NoopDataService {
    async fn add_node(&self, address: &str) -> scout_core::Result<()> {
        debug!("Data service disabled, not adding to {}", address);
        Ok(())
    }
}
