//! Consul service directory.
//!
//! Nodes register under one service name with an HTTP health check pointing
//! at their `/health` endpoint; discovery lists the instances Consul reports
//! as passing.

use async_trait::async_trait;
use scout_core::{ClusterError, NodeIdentity, PeerDirectory};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CHECK_INTERVAL: &str = "5s";
const CHECK_TIMEOUT: &str = "3s";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Registration {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    address: String,
    port: u16,
    check: HealthCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    #[serde(rename = "HTTP")]
    http: String,
    interval: String,
    timeout: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    address: String,
}

pub struct ConsulDirectory {
    client: reqwest::Client,
    base_url: String,
    service_name: String,
    health_port: u16,
}

impl ConsulDirectory {
    /// `base_url` is the agent endpoint, e.g. `http://consul:8500`.
    pub fn new(
        base_url: impl Into<String>,
        service_name: impl Into<String>,
        health_port: u16,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_name: service_name.into(),
            health_port,
        })
    }

    fn registration(&self, identity: &NodeIdentity) -> Registration {
        Registration {
            id: identity.hostname.clone(),
            name: self.service_name.clone(),
            address: identity.ip.to_string(),
            port: self.health_port,
            check: HealthCheck {
                http: format!(
                    "http://{}/health",
                    std::net::SocketAddr::new(identity.ip, self.health_port)
                ),
                interval: CHECK_INTERVAL.to_string(),
                timeout: CHECK_TIMEOUT.to_string(),
            },
        }
    }
}

fn directory_err(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Directory(e.to_string())
}

#[async_trait]
impl PeerDirectory for ConsulDirectory {
    async fn register_self(&self, identity: &NodeIdentity) -> scout_core::Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        self.client
            .put(&url)
            .json(&self.registration(identity))
            .send()
            .await
            .map_err(directory_err)?
            .error_for_status()
            .map_err(directory_err)?;
        info!(
            "Registered {} ({}) as {}",
            identity.hostname, identity.ip, self.service_name
        );
        Ok(())
    }

    async fn list_healthy_peers(&self) -> scout_core::Result<Vec<IpAddr>> {
        let url = format!(
            "{}/v1/health/service/{}?passing=true",
            self.base_url, self.service_name
        );
        let entries: Vec<HealthEntry> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(directory_err)?
            .error_for_status()
            .map_err(directory_err)?
            .json()
            .await
            .map_err(directory_err)?;

        let peers: Vec<IpAddr> = entries
            .into_iter()
            .filter_map(|entry| match entry.service.address.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Ignoring directory entry with address {:?}", entry.service.address);
                    None
                }
            })
            .collect();
        debug!("Directory lists {} healthy peer(s)", peers.len());
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Registry = Arc<Mutex<Vec<Value>>>;

    async fn register(State(registry): State<Registry>, Json(body): Json<Value>) -> StatusCode {
        registry.lock().unwrap().push(body);
        StatusCode::OK
    }

    async fn health(
        State(registry): State<Registry>,
        Path(name): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        assert_eq!(query.get("passing").map(String::as_str), Some("true"));
        let entries: Vec<Value> = registry
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["Name"] == name.as_str())
            .map(|r| json!({ "Service": { "Address": r["Address"] } }))
            .collect();
        Json(Value::Array(entries))
    }

    /// Just enough of the Consul agent API.
    async fn fake_consul() -> (String, Registry) {
        let registry: Registry = Arc::default();
        let app = Router::new()
            .route("/v1/agent/service/register", put(register))
            .route("/v1/health/service/{name}", get(health))
            .with_state(registry.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), registry)
    }

    fn identity() -> NodeIdentity {
        NodeIdentity::new("node-a", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    }

    #[tokio::test]
    async fn test_register_payload() {
        let (url, registry) = fake_consul().await;
        let directory = ConsulDirectory::new(url, "scout-node", 8600).unwrap();

        directory.register_self(&identity()).await.unwrap();

        let registered = registry.lock().unwrap()[0].clone();
        assert_eq!(registered["ID"], "node-a");
        assert_eq!(registered["Name"], "scout-node");
        assert_eq!(registered["Address"], "10.0.0.1");
        assert_eq!(registered["Port"], 8600);
        assert_eq!(registered["Check"]["HTTP"], "http://10.0.0.1:8600/health");
        assert_eq!(registered["Check"]["Interval"], "5s");
        assert_eq!(registered["Check"]["Timeout"], "3s");
    }

    #[tokio::test]
    async fn test_list_after_register() {
        let (url, _registry) = fake_consul().await;
        let directory = ConsulDirectory::new(format!("{}/", url), "scout-node", 8600).unwrap();
        assert!(directory.list_healthy_peers().await.unwrap().is_empty());

        directory.register_self(&identity()).await.unwrap();

        let peers = directory.list_healthy_peers().await.unwrap();
        assert_eq!(peers, vec![identity().ip]);
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_directory_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let directory = ConsulDirectory::new(format!("http://{}", addr), "scout-node", 8600).unwrap();
        let result = directory.list_healthy_peers().await;
        assert!(matches!(result, Err(ClusterError::Directory(_))));
    }
}
