//! The HTTP + WebSocket control surface.
//!
//! Request decoding and response framing only: every semantic operation is a
//! [`Controller`] call. Failures come back as `{"errors": [{"id", "status"}]}`
//! envelopes; the WebSocket endpoint streams element-scoped diffs for the
//! topics a client subscribes to by sending `{"id": "..."}` frames.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, RawQuery, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel;
use crate::graph::element::{ElementId, Envelope, UpdateElement};
use crate::graph::GraphError;
use crate::pubsub::SubscriptionId;
use crate::runtime::Controller;

/// Wire shape of one failure, mirrored into the `errors` list.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub id: &'static str,
    pub status: u16,
}

#[derive(Debug, Serialize)]
struct Errors {
    errors: Vec<ApiError>,
}

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> ApiError {
        let (id, status) = match err {
            GraphError::NotFound(_) => ("not_found", 404),
            GraphError::Invalid { .. } | GraphError::Validation(_) => ("bad_request", 400),
            GraphError::Conflict => ("conflict", 409),
            GraphError::Internal(_) => ("internal_server_error", 500),
        };
        warn!("request failed: {err}");
        ApiError { id, status }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(Errors { errors: vec![self] })).into_response()
    }
}

fn bad_request() -> ApiError {
    ApiError {
        id: "bad_request",
        status: 400,
    }
}

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/pattern", post(create).get(get_all).put(batch))
        .route(
            "/pattern/:id",
            post(create_under)
                .get(get_one)
                .put(update)
                .delete(delete_one),
        )
        .route("/pattern/:id/state", get(get_state).put(set_state))
        .route("/pattern/:id/route/:route_id", put(update_group_route))
        .route("/ws", get(websocket))
        .with_state(controller)
}

async fn create(
    State(controller): State<Arc<Controller>>,
    Json(drafts): Json<Vec<Envelope>>,
) -> Result<Json<Vec<ElementId>>, ApiError> {
    Ok(Json(controller.create(drafts, None)?))
}

async fn create_under(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<String>,
    Json(drafts): Json<Vec<Envelope>>,
) -> Result<Json<Vec<ElementId>>, ApiError> {
    Ok(Json(controller.create(drafts, Some(id.into()))?))
}

async fn get_all(State(controller): State<Arc<Controller>>) -> Json<Vec<Envelope>> {
    Json(controller.get_all())
}

async fn get_one(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Envelope>>, ApiError> {
    Ok(Json(controller.get(&id.into())?))
}

async fn update(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<String>,
    Json(patch): Json<UpdateElement>,
) -> Result<StatusCode, ApiError> {
    controller.update(&id.into(), &patch)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_one(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    controller.batch_delete(&[id.into()])?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_state(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(controller.get_state(&id.into())?))
}

async fn set_state(
    State(controller): State<Arc<Controller>>,
    Path(id): Path<String>,
    Json(state): Json<Value>,
) -> Result<StatusCode, ApiError> {
    controller.set_state(&id.into(), state)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_group_route(
    State(controller): State<Arc<Controller>>,
    Path((id, route_id)): Path<(String, String)>,
    Json(patch): Json<UpdateElement>,
) -> Result<StatusCode, ApiError> {
    controller.update_group_route(&id.into(), &route_id.into(), &patch)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /pattern?action=...&id=...&id=...` batch dispatch.
#[derive(Debug, Default, PartialEq)]
struct BatchQuery {
    action: String,
    ids: Vec<ElementId>,
    x: i64,
    y: i64,
}

fn parse_batch_query(raw: &str) -> Option<BatchQuery> {
    let mut query = BatchQuery::default();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=')?;
        match key {
            "action" => query.action = value.to_owned(),
            "id" => query.ids.push(value.into()),
            "x" => query.x = value.parse().ok()?,
            "y" => query.y = value.parse().ok()?,
            _ => return None,
        }
    }
    if query.action.is_empty() {
        return None;
    }
    Some(query)
}

async fn batch(
    State(controller): State<Arc<Controller>>,
    RawQuery(raw): RawQuery,
) -> Result<StatusCode, ApiError> {
    let query = raw
        .as_deref()
        .and_then(parse_batch_query)
        .ok_or_else(bad_request)?;
    match query.action.as_str() {
        "translate" => controller.batch_translate(&query.ids, query.x, query.y)?,
        "delete" => controller.batch_delete(&query.ids)?,
        "ungroup" => controller.batch_ungroup(&query.ids)?,
        "reset" => controller.batch_reset(&query.ids)?,
        _ => return Err(bad_request()),
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    id: String,
}

async fn websocket(
    State(controller): State<Arc<Controller>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| serve_socket(socket, controller))
}

/// One socket, one diff channel, any number of topics. Dropping the socket
/// unsubscribes everything; a failed unrelated transaction never terminates
/// the stream.
async fn serve_socket(mut socket: WebSocket, controller: Arc<Controller>) {
    let (diff_tx, diff_rx) = channel::unbounded();
    let mut subscriptions: Vec<SubscriptionId> = Vec::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(request) = serde_json::from_str::<SubscribeRequest>(&text) else {
                            debug!("ignoring malformed subscribe frame");
                            continue;
                        };
                        match controller.subscribe_with(&request.id, diff_tx.clone()) {
                            Ok(subscription) => subscriptions.push(subscription),
                            Err(err) => warn!("subscribe {} failed: {err}", request.id),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            diff = diff_rx.recv_async() => {
                let Ok(diff) = diff else { break };
                let Ok(frame) = serde_json::to_string(&diff) else { continue };
                if socket.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    controller.unsubscribe_all(&subscriptions);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_query_accepts_repeated_ids() {
        let query = parse_batch_query("action=translate&x=10&y=20&id=3&id=4").unwrap();
        assert_eq!(query.action, "translate");
        assert_eq!(query.x, 10);
        assert_eq!(query.y, 20);
        assert_eq!(query.ids, vec![ElementId::from("3"), ElementId::from("4")]);
    }

    #[test]
    fn batch_query_requires_an_action() {
        assert_eq!(parse_batch_query("id=3"), None);
        assert_eq!(parse_batch_query(""), None);
        assert_eq!(parse_batch_query("action=delete&bogus=1"), None);
    }

    #[test]
    fn errors_map_to_wire_codes() {
        let err: ApiError = GraphError::NotFound("9".into()).into();
        assert_eq!((err.id, err.status), ("not_found", 404));
        let err: ApiError = GraphError::Conflict.into();
        assert_eq!((err.id, err.status), ("conflict", 409));
        let err: ApiError = GraphError::Validation("x".into()).into();
        assert_eq!((err.id, err.status), ("bad_request", 400));
    }
}
