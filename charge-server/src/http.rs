//! HTTP routes: world update events (SSE) and membership.
//!
//! Authentication happens in front of this service; the authenticated user
//! arrives in the `x-user-id` header. Requests without it get 401.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get},
    Json, Router,
};
use charge_collab::membership::{MembershipError, MembershipRegistry};
use charge_collab::notify::UpdateHub;
use charge_core::membership::{Membership, Role};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<UpdateHub>,
    pub memberships: Arc<MembershipRegistry>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/worlds/{world_id}/events", get(world_events))
        .route("/worlds/{world_id}/membership", get(my_membership))
        .route("/worlds/{world_id}/members", get(list_members).post(add_player))
        .route("/worlds/{world_id}/members/{user_id}", delete(remove_member))
        .with_state(state)
}

/// The authenticated user id.
pub struct CurrentUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(|user| CurrentUser(user.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn world_events(
    State(state): State<AppState>,
    Path(world_id): Path<Uuid>,
    CurrentUser(user_id): CurrentUser,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    log::debug!("User {user_id} listening for updates to world {world_id}");
    let events = state
        .hub
        .subscribe(world_id, user_id)
        .into_stream()
        .map(|event| Event::default().json_data(event));
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// The caller's role, making them owner of an unowned world.
async fn my_membership(
    State(state): State<AppState>,
    Path(world_id): Path<Uuid>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Membership>, ApiError> {
    let role = state.memberships.ensure_membership(world_id, &user_id).await?;
    Ok(Json(Membership {
        world_id,
        user_id,
        role,
    }))
}

async fn list_members(
    State(state): State<AppState>,
    Path(world_id): Path<Uuid>,
    CurrentUser(_): CurrentUser,
) -> Result<Json<Vec<Membership>>, ApiError> {
    Ok(Json(state.memberships.members(world_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddPlayer {
    user_id: String,
}

async fn add_player(
    State(state): State<AppState>,
    Path(world_id): Path<Uuid>,
    CurrentUser(caller): CurrentUser,
    Json(body): Json<AddPlayer>,
) -> Result<Json<Membership>, ApiError> {
    require_owner(&state, world_id, &caller).await?;
    let role = state.memberships.add_player(world_id, &body.user_id).await?;
    Ok(Json(Membership {
        world_id,
        user_id: body.user_id,
        role,
    }))
}

async fn remove_member(
    State(state): State<AppState>,
    Path((world_id, user_id)): Path<(Uuid, String)>,
    CurrentUser(caller): CurrentUser,
) -> Result<StatusCode, ApiError> {
    require_owner(&state, world_id, &caller).await?;
    if state.memberships.remove_member(world_id, &user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

async fn require_owner(state: &AppState, world_id: Uuid, user_id: &str) -> Result<(), ApiError> {
    match state.memberships.role_of(world_id, user_id).await? {
        Role::Owner => Ok(()),
        _ => Err(ApiError::Forbidden),
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    NotFound,
    BadRequest(String),
    Internal(String),
}

impl From<MembershipError> for ApiError {
    fn from(err: MembershipError) -> Self {
        match err {
            MembershipError::EmptyUserId | MembershipError::OwnerRemoval { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            MembershipError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Internal(msg) => {
                log::error!("Request failed: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}
