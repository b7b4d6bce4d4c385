//! Agent protocol handlers.
//!
//! Every call runs on the blocking pool; see [`run_blocking`].

use axum::Json;
use axum::extract::State;

use fleet_common::protocol::{
    GetTaskRequest, GetTaskResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse, SubmitResultRequest, SubmitResultResponse,
};

use super::extract::ApiJson;
use super::{ApiError, SharedState, run_blocking};

pub async fn register(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    run_blocking(&state, move |s| s.dispatcher.register(req))
        .await
        .map(Json)
}

pub async fn heartbeat(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    run_blocking(&state, move |s| s.dispatcher.heartbeat(req))
        .await
        .map(Json)
}

pub async fn get_task(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<GetTaskRequest>,
) -> Result<Json<GetTaskResponse>, ApiError> {
    run_blocking(&state, move |s| s.dispatcher.get_task(&req))
        .await
        .map(Json)
}

pub async fn submit_result(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<SubmitResultRequest>,
) -> Result<Json<SubmitResultResponse>, ApiError> {
    run_blocking(&state, move |s| s.dispatcher.submit_result(req))
        .await
        .map(Json)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use axum::http::StatusCode;
    use serde_json::json;

    use fleet_common::protocol::ErrorBody;
    use fleet_common::{AgentStatus, TaskResult, TaskStatus, codes, routes};

    use super::super::test_support::{post_as, send, state};
    use super::*;

    fn register_body(agent_id: &str) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.to_string(),
            agent_name: format!("agent-{agent_id}"),
            version: "1.0.0".to_string(),
            capabilities: HashMap::new(),
            hostname: agent_id.to_string(),
            ip_address: "10.0.0.2".to_string(),
        }
    }

    #[tokio::test]
    async fn full_protocol_round_trip_over_http() {
        let (state, _) = state();
        let RegisterResponse { session_token } =
            post_as(&state, routes::REGISTER, &register_body("a1")).await;

        let heartbeat = HeartbeatRequest {
            agent_id: "a1".to_string(),
            session_token: session_token.clone(),
            status: AgentStatus::Idle,
            metrics: HashMap::from([("load_1m".to_string(), "0.25".to_string())]),
        };
        let hb: HeartbeatResponse = post_as(&state, routes::HEARTBEAT, &heartbeat).await;
        assert!(!hb.has_task);

        let (status, created) = send(
            &state,
            "POST",
            routes::TASKS,
            Some(&json!({
                "type": "port_forward",
                "command": "nat",
                "parameters": {
                    "dport": "8080",
                    "to-destination-ip": "10.0.0.5",
                    "to-destination-port": "80"
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let task_id = created["data"]["id"].as_str().unwrap().to_string();

        let hb: HeartbeatResponse = post_as(&state, routes::HEARTBEAT, &heartbeat).await;
        assert!(hb.has_task);

        let poll = GetTaskRequest {
            agent_id: "a1".to_string(),
            session_token: session_token.clone(),
        };
        let got: GetTaskResponse = post_as(&state, routes::GET_TASK, &poll).await;
        let assignment = got.task.unwrap();
        assert_eq!(assignment.task_id, task_id);
        assert_eq!(assignment.parameters["dport"], "8080");

        let submit = SubmitResultRequest {
            agent_id: "a1".to_string(),
            session_token,
            task_id: task_id.clone(),
            result: TaskResult {
                success: true,
                output: "6 rules applied".to_string(),
                ..TaskResult::default()
            },
        };
        let accepted: SubmitResultResponse = post_as(&state, routes::SUBMIT_RESULT, &submit).await;
        assert!(accepted.accepted);
        assert_eq!(
            state.ledger().get_task(&task_id).unwrap().status,
            TaskStatus::Completed
        );

        let got: GetTaskResponse = post_as(&state, routes::GET_TASK, &poll).await;
        assert!(got.task.is_none());
    }

    #[tokio::test]
    async fn stale_token_is_rejected_with_401() {
        let (state, _) = state();
        let first: RegisterResponse = post_as(&state, routes::REGISTER, &register_body("a1")).await;
        let _second: RegisterResponse =
            post_as(&state, routes::REGISTER, &register_body("a1")).await;

        let (status, body) = send(
            &state,
            "POST",
            routes::GET_TASK,
            Some(&GetTaskRequest {
                agent_id: "a1".to_string(),
                session_token: first.session_token,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let body: ErrorBody = serde_json::from_value(body).unwrap();
        assert_eq!(body.code, codes::UNAUTHENTICATED);
    }

    #[tokio::test]
    async fn unknown_agent_is_404() {
        let (state, _) = state();
        let (status, body) = send(
            &state,
            "POST",
            routes::HEARTBEAT,
            Some(&json!({"agent_id": "ghost", "session_token": "x", "status": "idle"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_before_dispatch() {
        let (state, _) = state();
        let (status, body) = send(
            &state,
            "POST",
            routes::REGISTER,
            Some(&json!({"agent_id": 42})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: ErrorBody = serde_json::from_value(body).unwrap();
        assert_eq!(body.code, codes::VALIDATION_FAILED);
        assert!(body.message.contains("agent_id"));
        assert!(state.ledger().list_agents().is_empty());
    }
}
