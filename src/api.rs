use anyhow::anyhow;
use axum::{
    Json, Router,
    body::Body,
    extract::{FromRequestParts, Path, State},
    http::{
        HeaderMap, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE},
        request::Parts,
    },
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::json;

use crate::error::{ErrorKind, LibError};
use crate::events::StreamSettings;
use crate::identity::{SessionCredentials, SessionStrategy, SessionValidator};
use crate::models::{
    AttachEvidencePayload, CaseId, CommentId, CreateCasePayload, CreateCommentPayload,
    CreateElementPayload, ElementId, MoveTarget, ResolveCommentPayload, TeamId, UpdateCommentPayload,
    UpdateElementPayload, UserId,
};
use crate::operations::{CaseOperations, SetPermissionPayload};
use crate::permissions::{self, CASE_READ_LEVEL};
use crate::store::CaseStore;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

pub(crate) fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Database | ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind);
        if status.is_server_error() {
            tracing::error!(kind = ?self.0.kind, code = self.0.code, error = %self.0.source, "case api request failed");
        } else {
            tracing::warn!(kind = ?self.0.kind, code = self.0.code, error = %self.0.source, "case api request rejected");
        }
        (
            status,
            Json(json!({
                "error": {
                    "code": self.0.code,
                    "message": self.0.public,
                }
            })),
        )
            .into_response()
    }
}

/// Application state the case routes run against.
pub trait CaseApp: Clone + Send + Sync + 'static {
    type Store: CaseStore;

    fn operations(&self) -> &CaseOperations<Self::Store>;

    fn sessions(&self) -> &SessionStrategy<Self::Store>;

    fn stream_settings(&self) -> StreamSettings {
        StreamSettings::default()
    }
}

/// The user behind a request, resolved by the configured session strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

impl AuthenticatedUser {
    pub fn id(&self) -> UserId {
        self.0
    }
}

impl<S: CaseApp> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let credentials = credentials_from(&parts.headers);
        match state.sessions().validate(&credentials).await? {
            Some(user_id) => Ok(Self(user_id)),
            None => Err(AppError(LibError::unauthenticated(
                "A valid session is required",
                anyhow!("request carried no valid session"),
            ))),
        }
    }
}

fn credentials_from(headers: &HeaderMap) -> SessionCredentials {
    let mut credentials = SessionCredentials::default();
    if let Some(value) = header_value(headers, "x-user-id") {
        credentials = credentials.with_claimed_user(value);
    }
    if let Some(value) = header_value(headers, AUTHORIZATION.as_str()) {
        credentials = credentials.with_authorization(value);
    }
    credentials
}

fn header_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|value| value.to_str().ok())
}

async fn create_case_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Json(payload): Json<CreateCasePayload>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = app.operations().create_case(auth_user.id(), payload).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_case_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = app.operations().get_case(auth_user.id(), case_id).await?;
    Ok(Json(snapshot))
}

async fn case_access_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
) -> Result<impl IntoResponse, AppError> {
    let access = app.operations().case_access(auth_user.id(), case_id).await?;
    Ok(Json(access))
}

async fn create_element_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
    Json(payload): Json<CreateElementPayload>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = app
        .operations()
        .create_element(auth_user.id(), case_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn update_element_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(element_id): Path<ElementId>,
    Json(payload): Json<UpdateElementPayload>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = app
        .operations()
        .update_element(auth_user.id(), element_id, payload)
        .await?;
    Ok(Json(snapshot))
}

async fn delete_element_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(element_id): Path<ElementId>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = app
        .operations()
        .delete_element(auth_user.id(), element_id)
        .await?;
    Ok(Json(snapshot))
}

async fn move_element_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(element_id): Path<ElementId>,
    Json(target): Json<MoveTarget>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = app
        .operations()
        .move_element(auth_user.id(), element_id, target)
        .await?;
    Ok(Json(snapshot))
}

async fn detach_element_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(element_id): Path<ElementId>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = app
        .operations()
        .detach_element(auth_user.id(), element_id)
        .await?;
    Ok(Json(snapshot))
}

async fn attach_evidence_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(element_id): Path<ElementId>,
    Json(payload): Json<AttachEvidencePayload>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = app
        .operations()
        .attach_evidence(auth_user.id(), element_id, payload)
        .await?;
    Ok(Json(snapshot))
}

async fn list_comments_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
) -> Result<impl IntoResponse, AppError> {
    let comments = app.operations().list_comments(auth_user.id(), case_id).await?;
    Ok(Json(comments))
}

async fn create_comment_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
    Json(payload): Json<CreateCommentPayload>,
) -> Result<impl IntoResponse, AppError> {
    let comment = app
        .operations()
        .create_comment(auth_user.id(), case_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn update_comment_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(comment_id): Path<CommentId>,
    Json(payload): Json<UpdateCommentPayload>,
) -> Result<impl IntoResponse, AppError> {
    let comment = app
        .operations()
        .update_comment(auth_user.id(), comment_id, payload)
        .await?;
    Ok(Json(comment))
}

async fn delete_comment_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(comment_id): Path<CommentId>,
) -> Result<impl IntoResponse, AppError> {
    let comment_ids = app
        .operations()
        .delete_comment(auth_user.id(), comment_id)
        .await?;
    Ok(Json(json!({ "deleted": comment_ids })))
}

async fn resolve_comment_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(comment_id): Path<CommentId>,
    Json(payload): Json<ResolveCommentPayload>,
) -> Result<impl IntoResponse, AppError> {
    let comment = app
        .operations()
        .resolve_comment(auth_user.id(), comment_id, payload)
        .await?;
    Ok(Json(comment))
}

async fn set_user_permission_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path((case_id, user_id)): Path<(CaseId, UserId)>,
    Json(payload): Json<SetPermissionPayload>,
) -> Result<impl IntoResponse, AppError> {
    let permission = app
        .operations()
        .set_user_permission(auth_user.id(), case_id, user_id, payload.permission)
        .await?;
    Ok(Json(SetPermissionPayload { permission }))
}

async fn set_team_permission_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path((case_id, team_id)): Path<(CaseId, TeamId)>,
    Json(payload): Json<SetPermissionPayload>,
) -> Result<impl IntoResponse, AppError> {
    let permission = app
        .operations()
        .set_team_permission(auth_user.id(), case_id, team_id, payload.permission)
        .await?;
    Ok(Json(SetPermissionPayload { permission }))
}

async fn acquire_lock_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
) -> Result<impl IntoResponse, AppError> {
    let lock = app.operations().acquire_lock(auth_user.id(), case_id).await?;
    Ok(Json(lock))
}

async fn release_lock_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
) -> Result<impl IntoResponse, AppError> {
    app.operations().release_lock(auth_user.id(), case_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Long-lived `text/event-stream` response for one case.
async fn case_events_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
) -> Result<Response, AppError> {
    let operations = app.operations();
    permissions::require_case_permission(
        &*operations.store(),
        auth_user.id(),
        case_id,
        CASE_READ_LEVEL,
    )
    .await?;

    let settings = app.stream_settings();
    let subscription = operations
        .broadcaster()
        .subscribe(case_id, auth_user.id(), settings.buffer);
    let body = Body::from_stream(subscription.into_stream(settings.max_lifetime));
    Ok((
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn presence_handler<S: CaseApp>(
    State(app): State<S>,
    auth_user: AuthenticatedUser,
    Path(case_id): Path<CaseId>,
) -> Result<impl IntoResponse, AppError> {
    let operations = app.operations();
    permissions::require_case_permission(
        &*operations.store(),
        auth_user.id(),
        case_id,
        CASE_READ_LEVEL,
    )
    .await?;

    let broadcaster = operations.broadcaster();
    Ok(Json(json!({
        "caseId": case_id,
        "connectionCount": broadcaster.connection_count(case_id),
        "connectedUsers": broadcaster.connected_users(case_id),
    })))
}

pub fn routes<S: CaseApp>() -> Router<S> {
    tracing::info!("Registering route /case [POST]");
    tracing::info!("Registering route /case/{{case_id}} [GET]");
    tracing::info!("Registering route /case/{{case_id}}/access [GET]");
    tracing::info!("Registering route /case/{{case_id}}/element [POST]");
    tracing::info!("Registering route /element/{{element_id}} [PUT,DELETE]");
    tracing::info!("Registering route /element/{{element_id}}/move [POST]");
    tracing::info!("Registering route /element/{{element_id}}/detach [POST]");
    tracing::info!("Registering route /element/{{element_id}}/attach [POST]");
    tracing::info!("Registering route /case/{{case_id}}/comment [GET,POST]");
    tracing::info!("Registering route /comment/{{comment_id}} [PUT,DELETE]");
    tracing::info!("Registering route /comment/{{comment_id}}/resolve [POST]");
    tracing::info!("Registering route /case/{{case_id}}/permissions/user/{{user_id}} [PUT]");
    tracing::info!("Registering route /case/{{case_id}}/permissions/team/{{team_id}} [PUT]");
    tracing::info!("Registering route /case/{{case_id}}/lock [POST,DELETE]");
    tracing::info!("Registering route /case/{{case_id}}/events [GET]");
    tracing::info!("Registering route /case/{{case_id}}/presence [GET]");

    Router::new()
        .route("/case", post(create_case_handler::<S>))
        .route("/case/{case_id}", get(get_case_handler::<S>))
        .route("/case/{case_id}/access", get(case_access_handler::<S>))
        .route("/case/{case_id}/element", post(create_element_handler::<S>))
        .route(
            "/element/{element_id}",
            put(update_element_handler::<S>).delete(delete_element_handler::<S>),
        )
        .route("/element/{element_id}/move", post(move_element_handler::<S>))
        .route(
            "/element/{element_id}/detach",
            post(detach_element_handler::<S>),
        )
        .route(
            "/element/{element_id}/attach",
            post(attach_evidence_handler::<S>),
        )
        .route(
            "/case/{case_id}/comment",
            get(list_comments_handler::<S>).post(create_comment_handler::<S>),
        )
        .route(
            "/comment/{comment_id}",
            put(update_comment_handler::<S>).delete(delete_comment_handler::<S>),
        )
        .route(
            "/comment/{comment_id}/resolve",
            post(resolve_comment_handler::<S>),
        )
        .route(
            "/case/{case_id}/permissions/user/{user_id}",
            put(set_user_permission_handler::<S>),
        )
        .route(
            "/case/{case_id}/permissions/team/{team_id}",
            put(set_team_permission_handler::<S>),
        )
        .route(
            "/case/{case_id}/lock",
            post(acquire_lock_handler::<S>).delete(release_lock_handler::<S>),
        )
        .route("/case/{case_id}/events", get(case_events_handler::<S>))
        .route("/case/{case_id}/presence", get(presence_handler::<S>))
}
