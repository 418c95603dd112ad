//! REST gateway in front of the controller.
//!
//! Every `/api` route requires the `X-WLM-User-Name` and `X-WLM-User-Token`
//! headers; `/healthz` does not.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::accounting::{JobRecord, RecordFilter};
use crate::auth::{Principal, TokenAuthority, USER_NAME_HEADER, USER_TOKEN_HEADER};
use crate::cluster::{JobFilter, NodeStatus};
use crate::controller::ControllerHandle;
use crate::error::WlmError;
use crate::registry::NodeState;
use crate::resources::ResourceVector;
use crate::scheduler::{Job, JobSpec, JobState};

#[derive(Clone)]
pub struct GatewayState {
    pub controller: ControllerHandle,
    pub authority: Arc<TokenAuthority>,
}

/// A [`WlmError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub WlmError);

impl From<WlmError> for ApiError {
    fn from(err: WlmError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WlmError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            WlmError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            WlmError::JobNotFound(_) | WlmError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            WlmError::Unsatisfiable { .. } | WlmError::InvalidJob(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            WlmError::InvalidTransition { .. } => StatusCode::CONFLICT,
            WlmError::QueueFull | WlmError::Busy | WlmError::ControllerUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            WlmError::DispatchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            WlmError::NodeUnreachable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct NodeView {
    id: String,
    state: NodeState,
    capacity: ResourceVector,
    free: ResourceVector,
    allocated: ResourceVector,
    address: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    drained: bool,
    reason: Option<String>,
    active_jobs: usize,
}

impl From<NodeStatus> for NodeView {
    fn from(status: NodeStatus) -> Self {
        let node = status.node;
        Self {
            id: node.id,
            state: node.state,
            capacity: node.capacity,
            free: status.free,
            allocated: status.allocated,
            address: node.address,
            last_heartbeat: node.last_heartbeat,
            drained: node.drained,
            reason: node.reason,
            active_jobs: status.active_jobs,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct JobQuery {
    state: Option<String>,
    owner: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountingQuery {
    state: Option<String>,
    owner: Option<String>,
    limit: Option<usize>,
}

fn parse_state(raw: Option<String>) -> ApiResult<Option<JobState>> {
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<JobState>())
        .transpose()
        .map_err(ApiError::from)
}

pub fn router(state: GatewayState) -> Router {
    let api = Router::new()
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/api/jobs/:id", get(get_job).delete(cancel_job))
        .route("/api/nodes", get(list_nodes))
        .route("/api/accounting", get(list_accounting))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(api)
        .with_state(state)
}

pub async fn run_gateway(addr: SocketAddr, state: GatewayState, shutdown: CancellationToken) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = router(state).layer(cors).layer(TraceLayer::new_for_http());

    tracing::info!(addr = %addr, "Starting REST gateway");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind REST gateway");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "REST gateway failed");
    }
}

async fn authenticate(
    State(state): State<GatewayState>,
    mut request: Request,
    next: Next,
) -> ApiResult<Response> {
    let principal = principal_from_headers(&state.authority, request.headers())?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

fn principal_from_headers(authority: &TokenAuthority, headers: &HeaderMap) -> ApiResult<Principal> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| WlmError::Unauthorized(format!("missing {name} header")))
    };
    let user = header(USER_NAME_HEADER)?;
    let token = header(USER_TOKEN_HEADER)?;
    Ok(authority.authenticate(user, token, Utc::now())?)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn submit_job(
    State(state): State<GatewayState>,
    Extension(principal): Extension<Principal>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let Principal::User { name, .. } = &principal else {
        return Err(WlmError::PermissionDenied(format!(
            "{} may not submit jobs",
            principal.name()
        ))
        .into());
    };
    let job = state.controller.submit(name, spec).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(
    State(state): State<GatewayState>,
    Query(query): Query<JobQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let filter = JobFilter {
        state: parse_state(query.state)?,
        owner: query.owner.filter(|o| !o.is_empty()),
    };
    Ok(Json(state.controller.list_jobs(filter).await?))
}

async fn get_job(
    State(state): State<GatewayState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.controller.get_job(job_id).await?))
}

async fn cancel_job(
    State(state): State<GatewayState>,
    Extension(principal): Extension<Principal>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.controller.cancel_job(principal, job_id).await?))
}

async fn list_nodes(State(state): State<GatewayState>) -> ApiResult<Json<Vec<NodeView>>> {
    let nodes = state.controller.list_nodes().await?;
    Ok(Json(nodes.into_iter().map(NodeView::from).collect()))
}

async fn list_accounting(
    State(state): State<GatewayState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<AccountingQuery>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    let requested_owner = query.owner.filter(|o| !o.is_empty());
    let owner = match &principal {
        Principal::User { name, admin: false } => {
            if requested_owner.as_ref().is_some_and(|o| o != name) {
                return Err(WlmError::PermissionDenied(
                    "only administrators may read other users' records".to_string(),
                )
                .into());
            }
            Some(name.clone())
        }
        _ => requested_owner,
    };
    let filter = RecordFilter {
        owner,
        state: parse_state(query.state)?,
        limit: query.limit,
    };
    Ok(Json(state.controller.history(filter).await?))
}
