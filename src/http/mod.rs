use std::{collections::VecDeque, convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Extension, FromRequest, FromRequestParts, Path, Query, Request},
    http::{StatusCode, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::{SecondsFormat, Utc};
use futures_util::{Stream, stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::{sync::broadcast, time::Duration};
use tracing::debug;

use crate::{
    config::Config,
    consent::{ConsentService, NewRequest, VoteReceipt},
    domain::{
        AccessRequest, AccessScope, ApprovalFlavor, Decision, DocumentKind, DomainError, Identity,
    },
    events::StatusEvent,
    lifecycle::spawn_validator_feed,
    state::{RequestRecord, StoreError},
    tally::{ConsensusTransaction, RandomVotes, Vote},
};

/// Header carrying the caller's directory id, as established by the identity provider.
pub const ACTOR_HEADER: &str = "x-consent-actor";

const SIMULATED_APPROVE_RATIO: f64 = 0.75;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<ConsentService>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new("invalid_argument", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", StatusCode::UNAUTHORIZED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        let status = match &value {
            DomainError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            DomainError::TargetNotFound { .. } | DomainError::NotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            DomainError::Forbidden { .. } => StatusCode::FORBIDDEN,
            DomainError::InvalidState { .. } => StatusCode::CONFLICT,
            DomainError::ConfigurationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let err = ApiError::new(value.code(), status, value.to_string());
        match value {
            DomainError::InvalidArgument { field, .. } => err.with_detail("field", field),
            DomainError::TargetNotFound { target_id } => err.with_detail("target_id", target_id),
            DomainError::NotFound { kind, id } => {
                err.with_detail("kind", kind).with_detail("id", id)
            }
            DomainError::Forbidden { request_id, .. } => err.with_detail("request_id", request_id),
            DomainError::InvalidState { id, .. } => err.with_detail("id", id),
            DomainError::ConfigurationError { .. } => err,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(domain) => domain.into(),
            StoreError::SchemaVersionMismatch { .. }
            | StoreError::Io(_)
            | StoreError::SerdeJson(_) => ApiError::internal(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_argument(e.to_string()))?;
        Ok(Self(value))
    }
}

/// The authenticated caller, resolved from [`ACTOR_HEADER`] through the directory.
pub struct Caller(pub Identity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let state = parts
            .extensions
            .get::<AppState>()
            .cloned()
            .ok_or_else(|| ApiError::internal("app state is not installed"))?;
        let actor_id = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::unauthorized(format!("missing {ACTOR_HEADER} header")))?;
        let identity = state
            .service
            .directory()
            .resolve_identity(actor_id)
            .ok_or_else(|| ApiError::unauthorized(format!("unknown actor: {actor_id}")))?;
        Ok(Self(identity))
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct DecisionRequest {
    decision: Decision,
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    vote: Vote,
}

#[derive(Debug, Deserialize)]
struct AccessQuery {
    owner_id: String,
    document: DocumentKind,
    #[serde(default)]
    scope: AccessScope,
}

#[derive(Debug, Serialize)]
struct AccessResponse {
    allowed: bool,
}

#[derive(Debug, Deserialize)]
struct RecentEventsQuery {
    after: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EventsSseHello {
    actor_id: String,
    connected_at: String,
}

#[derive(Debug, Serialize)]
struct EventsSseLagged {
    missed: u64,
}

pub fn build_router(config: Config, service: Arc<ConsentService>) -> Router {
    let app_state = AppState {
        config: Arc::new(config),
        service,
    };

    let api = Router::new()
        .route("/health", get(health))
        .route("/requests", post(create_request))
        .route("/requests/outgoing", get(list_outgoing))
        .route("/requests/incoming", get(list_incoming))
        .route("/requests/:request_id", get(get_request))
        .route("/requests/:request_id/delivered", post(mark_delivered))
        .route("/requests/:request_id/decision", post(decide_request))
        .route("/transactions/:request_id", get(get_transaction))
        .route("/transactions/:request_id/votes", post(cast_vote))
        .route("/access", get(check_access))
        .route("/events", get(stream_events))
        .route("/events/recent", get(recent_events));

    Router::new()
        .nest("/api", api)
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
        "requests": state.service.len().await,
    }))
}

async fn create_request(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
    ApiJson(input): ApiJson<NewRequest>,
) -> Result<(StatusCode, Json<RequestRecord>), ApiError> {
    let record = state
        .service
        .create_request(Utc::now(), &caller, input)
        .await?;

    if state.config.simulate_validators && record.request.flavor == ApprovalFlavor::Quorum {
        debug!(
            request_id = record.request.request_id,
            "starting simulated validator feed"
        );
        spawn_validator_feed(
            state.service.clone(),
            record.request.request_id.clone(),
            Box::new(RandomVotes::from_entropy(SIMULATED_APPROVE_RATIO)),
            state.config.simulated_vote_delay(),
        );
    }

    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_outgoing(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
) -> Json<Items<AccessRequest>> {
    let items = state
        .service
        .list_for_requester(Utc::now(), &caller.id)
        .await;
    Json(Items { items })
}

async fn list_incoming(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
) -> Json<Items<AccessRequest>> {
    let items = state
        .service
        .list_pending_for_owner(Utc::now(), &caller.id)
        .await;
    Json(Items { items })
}

async fn get_request(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
    Path(request_id): Path<String>,
) -> Result<Json<RequestRecord>, ApiError> {
    let record = state
        .service
        .get_request(Utc::now(), &request_id, &caller.id)
        .await?;
    Ok(Json(record))
}

async fn mark_delivered(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
    Path(request_id): Path<String>,
) -> Result<Json<AccessRequest>, ApiError> {
    let request = state
        .service
        .mark_delivered(Utc::now(), &request_id, &caller.id)
        .await?;
    Ok(Json(request))
}

async fn decide_request(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
    Path(request_id): Path<String>,
    ApiJson(body): ApiJson<DecisionRequest>,
) -> Result<Json<AccessRequest>, ApiError> {
    let request = state
        .service
        .transition(Utc::now(), &request_id, &caller.id, body.decision)
        .await?;
    Ok(Json(request))
}

async fn get_transaction(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
    Path(request_id): Path<String>,
) -> Result<Json<ConsensusTransaction>, ApiError> {
    let transaction = state
        .service
        .get_transaction(Utc::now(), &request_id, &caller.id)
        .await?;
    Ok(Json(transaction))
}

// The caller votes as itself: it must be a validator identity listed on the transaction.
async fn cast_vote(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
    Path(request_id): Path<String>,
    ApiJson(body): ApiJson<VoteRequest>,
) -> Result<Json<VoteReceipt>, ApiError> {
    let receipt = state
        .service
        .cast_vote_as(Utc::now(), &request_id, &caller, body.vote)
        .await?;
    Ok(Json(receipt))
}

async fn check_access(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
    Query(query): Query<AccessQuery>,
) -> Json<AccessResponse> {
    let allowed = state
        .service
        .has_access(
            Utc::now(),
            &caller.id,
            &query.owner_id,
            query.document,
            query.scope,
        )
        .await;
    Json(AccessResponse { allowed })
}

async fn recent_events(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
    Query(query): Query<RecentEventsQuery>,
) -> Json<Items<StatusEvent>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let items = state
        .service
        .events()
        .since(query.after.as_deref(), usize::MAX)
        .await
        .into_iter()
        .filter(|event| visible_to(&state, event, &caller.id))
        .take(limit)
        .collect();
    Json(Items { items })
}

fn visible_to(state: &AppState, event: &StatusEvent, actor_id: &str) -> bool {
    event.involves(actor_id)
        || state
            .service
            .directory()
            .may_decide_for(&event.target_id, actor_id)
}

async fn stream_events(
    Extension(state): Extension<AppState>,
    Caller(caller): Caller,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send> {
    let hello = EventsSseHello {
        actor_id: caller.id.clone(),
        connected_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    let mut initial_events = VecDeque::new();
    initial_events.push_back(sse_json_event("hello", &hello));

    let rx = state.service.events().subscribe();
    let out_stream = stream::unfold(
        (initial_events, rx, state, caller.id),
        |(mut initial, mut rx, state, actor_id)| async move {
            if let Some(event) = initial.pop_front() {
                return Some((Ok(event), (initial, rx, state, actor_id)));
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if visible_to(&state, &event, &actor_id) {
                            let out = sse_json_event("status", &event);
                            return Some((Ok(out), (initial, rx, state, actor_id)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let out = sse_json_event("lagged", &EventsSseLagged { missed });
                        return Some((Ok(out), (initial, rx, state, actor_id)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    Sse::new(out_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    )
}

fn sse_json_event<T: Serialize>(event: &'static str, payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => Event::default().event(event).data(data),
        Err(err) => Event::default().event("error").data(err.to_string()),
    }
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
