//! HTTP client for the cluster manager API

use crate::common::{Error, Result};
use crate::meta::http::{ClusterRequest, ClusterResponse, HeartbeatResponse};
use crate::meta::model::{Instance, InstanceSpec, LogicalRoom, StoreHeartbeat};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Deserialize)]
struct TopologyBody {
    logical_rooms: Vec<LogicalRoom>,
}

#[derive(Deserialize)]
struct InstancesBody {
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
struct SelectedBody {
    address: String,
}

/// Rebuild a typed error from an error body
fn remote_error(response: ClusterResponse) -> Error {
    let message = response.error.unwrap_or_else(|| response.status.clone());
    match response.status.as_str() {
        "ALREADY_EXISTS" => Error::AlreadyExists(message),
        "NOT_FOUND" => Error::NotFound(message),
        "NOT_EMPTY" => Error::NotEmpty(message),
        "NOT_LEADER" => Error::NotLeader(response.leader.unwrap_or_else(|| "unknown".into())),
        "TIMEOUT" => Error::Timeout(message),
        "INVALID_ARGUMENT" => Error::InvalidArgument(message),
        "NO_ELIGIBLE_INSTANCE" => Error::NoEligibleInstance {
            resource_tag: response.resource_tag.unwrap_or_default(),
        },
        _ => Error::Internal(message),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    if response.status().is_success() {
        return Ok(response.json().await?);
    }
    let status = response.status();
    let body = response.text().await?;
    match serde_json::from_str::<ClusterResponse>(&body) {
        Ok(error) => Err(remote_error(error)),
        Err(_) => Err(Error::Internal(format!("{}: {}", status, body))),
    }
}

/// Admin client
#[derive(Debug, Clone)]
pub struct AdminClient {
    base_url: String,
    client: Client,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a membership change; errors from the manager come back as `Err`
    pub async fn send(&self, request: &ClusterRequest) -> Result<()> {
        let response = self
            .client
            .post(self.url("/cluster"))
            .json(request)
            .send()
            .await?;
        let _: ClusterResponse = decode(response).await?;
        Ok(())
    }

    pub async fn heartbeat(&self, heartbeat: &StoreHeartbeat) -> Result<HeartbeatResponse> {
        let response = self
            .client
            .post(self.url("/heartbeat"))
            .json(heartbeat)
            .send()
            .await?;
        decode(response).await
    }

    /// Stats-only heartbeat; the instance's region placement is kept
    pub async fn instance_heartbeat(&self, spec: &InstanceSpec) -> Result<HeartbeatResponse> {
        let response = self
            .client
            .post(self.url("/heartbeat/instance"))
            .json(spec)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn topology(&self) -> Result<Vec<LogicalRoom>> {
        let response = self.client.get(self.url("/cluster/topology")).send().await?;
        let body: TopologyBody = decode(response).await?;
        Ok(body.logical_rooms)
    }

    pub async fn instances(&self) -> Result<Vec<Instance>> {
        let response = self.client.get(self.url("/cluster/instances")).send().await?;
        let body: InstancesBody = decode(response).await?;
        Ok(body.instances)
    }

    pub async fn instance(&self, address: &str) -> Result<Instance> {
        let response = self
            .client
            .get(self.url(&format!("/cluster/instances/{}", address)))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn select_rolling(&self, resource_tag: &str, exclude: &[String]) -> Result<String> {
        let exclude = exclude.join(",");
        let response = self
            .client
            .get(self.url("/select/rolling"))
            .query(&[("resource_tag", resource_tag), ("exclude", exclude.as_str())])
            .send()
            .await?;
        let body: SelectedBody = decode(response).await?;
        Ok(body.address)
    }

    pub async fn select_min(
        &self,
        resource_tag: &str,
        exclude: &[String],
        table_id: i64,
    ) -> Result<String> {
        let exclude = exclude.join(",");
        let table_id = table_id.to_string();
        let response = self
            .client
            .get(self.url("/select/min"))
            .query(&[
                ("resource_tag", resource_tag),
                ("exclude", exclude.as_str()),
                ("table_id", table_id.as_str()),
            ])
            .send()
            .await?;
        let body: SelectedBody = decode(response).await?;
        Ok(body.address)
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        let response = self.client.get(self.url("/admin/status")).send().await?;
        decode(response).await
    }
}
