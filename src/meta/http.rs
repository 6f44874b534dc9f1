//! HTTP API for the cluster manager
//!
//! - `POST /cluster`: membership changes, tagged by `op_type`
//! - `POST /heartbeat`: store heartbeats
//! - `POST /heartbeat/instance`: stats-only heartbeats, placement untouched
//! - `GET /cluster/...`: topology and instance views
//! - `GET /select/...`: placement
//! - `GET /health`, `GET /admin/status`

use crate::common::{Error, Result};
use crate::meta::manager::ClusterManager;
use crate::meta::model::{InstanceSpec, Mutation, StoreHeartbeat};
use crate::meta::registry::HeartbeatOutcome;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ClusterManager>,
}

/// Admin request body of `POST /cluster`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRequest {
    AddLogical {
        logical_room: String,
    },
    DropLogical {
        logical_room: String,
    },
    AddPhysical {
        logical_room: String,
        physical_room: String,
    },
    DropPhysical {
        logical_room: String,
        physical_room: String,
    },
    MovePhysical {
        physical_room: String,
        old_logical_room: String,
        new_logical_room: String,
    },
    AddInstance {
        instance: InstanceSpec,
    },
    DropInstance {
        address: String,
    },
    UpdateInstance {
        instance: InstanceSpec,
    },
}

impl From<ClusterRequest> for Mutation {
    fn from(request: ClusterRequest) -> Self {
        match request {
            ClusterRequest::AddLogical { logical_room } => Mutation::AddLogical { name: logical_room },
            ClusterRequest::DropLogical { logical_room } => Mutation::DropLogical { name: logical_room },
            ClusterRequest::AddPhysical {
                logical_room,
                physical_room,
            } => Mutation::AddPhysical {
                logical: logical_room,
                physical: physical_room,
            },
            ClusterRequest::DropPhysical {
                logical_room,
                physical_room,
            } => Mutation::DropPhysical {
                logical: logical_room,
                physical: physical_room,
            },
            ClusterRequest::MovePhysical {
                physical_room,
                old_logical_room,
                new_logical_room,
            } => Mutation::MovePhysical {
                physical: physical_room,
                from: old_logical_room,
                to: new_logical_room,
            },
            ClusterRequest::AddInstance { instance } => Mutation::AddInstance(instance),
            ClusterRequest::DropInstance { address } => Mutation::DropInstance { address },
            ClusterRequest::UpdateInstance { instance } => Mutation::UpdateInstance(instance),
        }
    }
}

/// Response body of admin requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResponse {
    /// "OK" or an error code such as "NOT_LEADER"
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the request must be resent to another node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    /// Set on NO_ELIGIBLE_INSTANCE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_tag: Option<String>,
}

impl ClusterResponse {
    pub fn ok() -> Self {
        Self {
            status: "OK".to_string(),
            error: None,
            leader: None,
            resource_tag: None,
        }
    }

    pub fn from_error(e: &Error) -> Self {
        Self {
            status: e.code().to_string(),
            error: Some(e.to_string()),
            leader: match e {
                Error::NotLeader(leader) => Some(leader.clone()),
                _ => None,
            },
            resource_tag: match e {
                Error::NoEligibleInstance { resource_tag } => Some(resource_tag.clone()),
                _ => None,
            },
        }
    }
}

fn error_response(e: Error) -> Response {
    (e.to_http_status(), Json(ClusterResponse::from_error(&e))).into_response()
}

/// Create the router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/cluster", post(cluster_request))
        .route("/cluster/topology", get(topology))
        .route("/cluster/instances", get(instances))
        .route("/cluster/instances/:address", get(instance))
        .route("/heartbeat", post(heartbeat))
        .route("/heartbeat/instance", post(instance_heartbeat))
        .route("/select/rolling", get(select_rolling))
        .route("/select/min", get(select_min))
        .route("/health", get(health))
        .route("/admin/status", get(admin_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn cluster_request(
    State(state): State<AppState>,
    Json(request): Json<ClusterRequest>,
) -> Response {
    match state.manager.submit(request.into()).await {
        Ok(()) => (StatusCode::OK, Json(ClusterResponse::ok())).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub known: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl From<HeartbeatOutcome> for HeartbeatResponse {
    fn from(outcome: HeartbeatOutcome) -> Self {
        match outcome {
            HeartbeatOutcome::Refreshed(status) => Self {
                known: true,
                status: Some(status.to_string()),
            },
            HeartbeatOutcome::Unknown => Self {
                known: false,
                status: None,
            },
        }
    }
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(heartbeat): Json<StoreHeartbeat>,
) -> Json<HeartbeatResponse> {
    Json(state.manager.process_store_heartbeat(&heartbeat).await.into())
}

async fn instance_heartbeat(
    State(state): State<AppState>,
    Json(spec): Json<InstanceSpec>,
) -> Json<HeartbeatResponse> {
    Json(state.manager.process_instance_heartbeat(&spec).into())
}

async fn topology(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "logical_rooms": state.manager.logical_rooms() }))
}

async fn instances(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "instances": state.manager.instances() }))
}

async fn instance(State(state): State<AppState>, Path(address): Path<String>) -> Response {
    match state.manager.instance(&address) {
        Some(instance) => Json(instance).into_response(),
        None => error_response(Error::NotFound(format!("instance {}", address))),
    }
}

/// Query string of the selection endpoints
#[derive(Debug, Default, Deserialize)]
pub struct SelectParams {
    #[serde(default)]
    pub resource_tag: String,
    /// Comma-separated addresses to skip
    #[serde(default)]
    pub exclude: String,
    pub table_id: Option<i64>,
}

impl SelectParams {
    fn excluded(&self) -> BTreeSet<String> {
        self.exclude
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(String::from)
            .collect()
    }
}

fn selected(result: Result<String>) -> Response {
    match result {
        Ok(address) => Json(json!({ "address": address })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn select_rolling(
    State(state): State<AppState>,
    Query(params): Query<SelectParams>,
) -> Response {
    selected(
        state
            .manager
            .select_instance_rolling(&params.resource_tag, &params.excluded()),
    )
}

async fn select_min(State(state): State<AppState>, Query(params): Query<SelectParams>) -> Response {
    let Some(table_id) = params.table_id else {
        return error_response(Error::InvalidArgument("table_id is required".into()));
    };
    selected(state.manager.select_instance_min(
        &params.resource_tag,
        &params.excluded(),
        table_id,
    ))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let role = if state.manager.is_leader() {
        "Leader"
    } else {
        "Follower"
    };

    Json(json!({
        "status": "healthy",
        "role": role,
        "is_leader": state.manager.is_leader(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Cluster summary for dashboards
async fn admin_status(State(state): State<AppState>) -> impl IntoResponse {
    let manager = &state.manager;
    let instances = manager.instances();
    let normal = instances.iter().filter(|i| i.is_normal()).count();
    let rooms = manager.logical_rooms();

    Json(json!({
        "node_id": manager.node_id(),
        "is_leader": manager.is_leader(),
        "leader": manager.leader(),
        "applied_index": manager.gateway().applied_index(),
        "logical_rooms": rooms.len(),
        "physical_rooms": rooms.iter().map(|r| r.physical_rooms.len()).sum::<usize>(),
        "instances": instances.len(),
        "normal_instances": normal,
        "dead_instances": instances.len() - normal,
        "pending_requests": manager.gateway().pending().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: ClusterRequest = serde_json::from_str(
            r#"{"op_type":"MOVE_PHYSICAL","physical_room":"bj-1","old_logical_room":"bj","new_logical_room":"sh"}"#,
        )
        .unwrap();
        assert_eq!(
            Mutation::from(request),
            Mutation::MovePhysical {
                physical: "bj-1".into(),
                from: "bj".into(),
                to: "sh".into(),
            }
        );

        let request: ClusterRequest = serde_json::from_str(
            r#"{"op_type":"ADD_INSTANCE","instance":{"address":"10.0.0.1:8010","capacity":100}}"#,
        )
        .unwrap();
        match Mutation::from(request) {
            Mutation::AddInstance(spec) => {
                assert_eq!(spec.used_size, None);
                assert_eq!(spec.resource_tag, "");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_carries_leader() {
        let response = ClusterResponse::from_error(&Error::NotLeader("meta-2".into()));
        assert_eq!(response.status, "NOT_LEADER");
        assert_eq!(response.leader.as_deref(), Some("meta-2"));

        let json = serde_json::to_value(ClusterResponse::ok()).unwrap();
        assert_eq!(json, json!({ "status": "OK" }));

        let response = ClusterResponse::from_error(&Error::NoEligibleInstance {
            resource_tag: "ssd".into(),
        });
        assert_eq!(response.status, "NO_ELIGIBLE_INSTANCE");
        assert_eq!(response.resource_tag.as_deref(), Some("ssd"));
    }

    #[test]
    fn test_exclude_list_parsing() {
        let params = SelectParams {
            exclude: " a:1, ,b:2,".into(),
            ..Default::default()
        };
        let excluded = params.excluded();
        assert_eq!(excluded.len(), 2);
        assert!(excluded.contains("a:1") && excluded.contains("b:2"));
    }
}
