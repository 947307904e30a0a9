//! Management API: login, API keys, service registry, user administration
//! and monitoring
//!
//! Every route except login requires an authenticated caller, resolved the
//! same way the gateway resolves credentials.

use super::AppState;
use crate::access_log::LogStats;
use crate::auth::{extract_credentials, generate_api_key, hash_password, issue_token};
use crate::directory::ServiceWithStats;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{
    AccessLogRecord, ApiKey, Identity, LogFilter, NewApiKey, NewService, NewUser, Role,
    ServiceDescriptor, ServicePatch, ServiceStatus, User, UserPatch, Visibility, MAX_LOG_PAGE,
};
use crate::pipeline::Stage;
use crate::store::{LogScope, Page, ServiceQuery, StoreError};
use axum::{
    extract::{
        rejection::{FormRejection, JsonRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    routing::{delete, get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/api-keys", post(create_api_key).get(list_api_keys))
        .route("/auth/api-keys/:id", delete(revoke_api_key))
        .route("/services", post(create_service).get(list_services))
        .route(
            "/services/:id",
            get(read_service).put(update_service).delete(delete_service),
        )
        .route("/services/:id/stats", get(read_service_stats))
        .route("/admin/users", get(list_users))
        .route(
            "/admin/users/:id",
            get(read_user).put(update_user).delete(delete_user),
        )
        .route("/monitoring/logs", get(read_logs))
        .route("/monitoring/stats", get(read_stats))
}

/// The authenticated caller of a management route
pub struct CurrentUser(pub User);

impl CurrentUser {
    fn is_admin(&self) -> bool {
        self.0.role == Role::Admin
    }

    fn require_admin(&self) -> GatewayResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(GatewayError::Authorization(
                "Not enough permissions".to_string(),
            ))
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let credentials = extract_credentials(&parts.headers);
        let identity = match state.resolver.resolve(&credentials).await? {
            Stage::Continue(identity) => identity,
            Stage::Reject(e) => return Err(e),
        };

        let user_id = match identity {
            Identity::Authenticated { user_id, .. } => user_id,
            Identity::Anonymous => return Err(GatewayError::bearer("Not authenticated")),
        };

        match state.stores.users.user_by_id(user_id).await? {
            Some(user) => Ok(CurrentUser(user)),
            None => Err(GatewayError::bearer("Could not validate credentials")),
        }
    }
}

/// One page of a listing
#[derive(Debug, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
    pub pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> Paginated<T> {
    fn new(items: Vec<T>, total: usize, page: usize, size: usize) -> Self {
        let pages = total.div_ceil(size);
        Self {
            items,
            total,
            page,
            size,
            pages,
            has_next: page < pages,
            has_prev: page > 1,
        }
    }
}

fn default_page() -> usize {
    1
}

fn default_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_size")]
    size: usize,
}

impl PageParams {
    fn validated(&self) -> GatewayResult<Page> {
        if self.page < 1 {
            return Err(GatewayError::BadRequest("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.size) {
            return Err(GatewayError::BadRequest(format!(
                "size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Page::numbered(self.page, self.size)
            .ok_or_else(|| GatewayError::BadRequest("page is out of range".to_string()))
    }
}

fn bad_query(rejection: QueryRejection) -> GatewayError {
    GatewayError::BadRequest(rejection.body_text())
}

fn bad_json(rejection: JsonRejection) -> GatewayError {
    GatewayError::BadRequest(rejection.body_text())
}

/// bcrypt is CPU-bound; keep it off the runtime threads
async fn hash_off_thread(state: &AppState, password: String) -> GatewayResult<String> {
    let cost = state.config.auth.password_hash_cost;
    tokio::task::spawn_blocking(move || hash_password(&password, cost))
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .map_err(|e| GatewayError::Internal(format!("failed to hash password: {}", e)))
}

fn conflict_as_bad_request(e: StoreError) -> GatewayError {
    match e {
        StoreError::Conflict(detail) => GatewayError::BadRequest(detail),
        other => other.into(),
    }
}

// --- auth ---

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
}

async fn login(
    State(state): State<AppState>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> GatewayResult<Json<TokenResponse>> {
    let Form(form) = form.map_err(|e| GatewayError::BadRequest(e.body_text()))?;

    let user = state
        .resolver
        .authenticate_password(&form.username, &form.password)
        .await?
        .ok_or_else(|| GatewayError::bearer("Incorrect username or password"))?;

    let auth = &state.config.auth;
    let access_token = issue_token(&user.username, &auth.jwt_secret, auth.token_expire_minutes)
        .map_err(|e| GatewayError::Internal(format!("failed to sign token: {}", e)))?;

    info!(username = %user.username, "User logged in");
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    role: Role,
}

async fn register(
    State(state): State<AppState>,
    caller: CurrentUser,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> GatewayResult<(StatusCode, Json<User>)> {
    caller.require_admin()?;
    let Json(request) = body.map_err(bad_json)?;

    if request.username.trim().is_empty() || request.password.is_empty() {
        return Err(GatewayError::BadRequest(
            "username and password must not be empty".to_string(),
        ));
    }

    let password_hash = hash_off_thread(&state, request.password).await?;

    let user = state
        .stores
        .users
        .insert_user(NewUser {
            username: request.username,
            email: request.email,
            full_name: request.full_name,
            password_hash,
            role: request.role,
            is_active: true,
        })
        .await
        .map_err(conflict_as_bad_request)?;

    info!(username = %user.username, role = %user.role, "User registered");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn create_api_key(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    body: Result<Json<NewApiKey>, JsonRejection>,
) -> GatewayResult<(StatusCode, Json<ApiKey>)> {
    let Json(new_key) = body.map_err(bad_json)?;
    if new_key.name.trim().is_empty() {
        return Err(GatewayError::BadRequest("name must not be empty".to_string()));
    }

    let key = state
        .stores
        .keys
        .insert_key(user.id, generate_api_key(), new_key)
        .await
        .map_err(conflict_as_bad_request)?;

    info!(key_id = key.id, username = %user.username, "API key created");
    Ok((StatusCode::CREATED, Json(key)))
}

async fn list_api_keys(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    params: Result<Query<PageParams>, QueryRejection>,
) -> GatewayResult<Json<Paginated<ApiKey>>> {
    let Query(params) = params.map_err(bad_query)?;
    let page = params.validated()?;

    let (items, total) = state.stores.keys.keys_for_user(user.id, page).await?;
    Ok(Json(Paginated::new(items, total, params.page, params.size)))
}

async fn revoke_api_key(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> GatewayResult<StatusCode> {
    if !state.stores.keys.deactivate_key(id, user.id).await? {
        return Err(GatewayError::NotFound("API key not found".to_string()));
    }
    info!(key_id = id, username = %user.username, "API key revoked");
    Ok(StatusCode::NO_CONTENT)
}

// --- admin ---

async fn list_users(
    State(state): State<AppState>,
    caller: CurrentUser,
    params: Result<Query<PageParams>, QueryRejection>,
) -> GatewayResult<Json<Paginated<User>>> {
    caller.require_admin()?;
    let Query(params) = params.map_err(bad_query)?;
    let page = params.validated()?;

    let (items, total) = state.stores.users.list_users(page).await?;
    Ok(Json(Paginated::new(items, total, params.page, params.size)))
}

fn user_not_found() -> GatewayError {
    GatewayError::NotFound("User not found".to_string())
}

async fn read_user(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(id): Path<i64>,
) -> GatewayResult<Json<User>> {
    caller.require_admin()?;
    let user = state
        .stores
        .users
        .user_by_id(id)
        .await?
        .ok_or_else(user_not_found)?;
    Ok(Json(user))
}

/// Admin edit of a user; absent or null fields stay unchanged
#[derive(Debug, Deserialize)]
struct UserUpdate {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    is_active: Option<bool>,
}

async fn update_user(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(id): Path<i64>,
    body: Result<Json<UserUpdate>, JsonRejection>,
) -> GatewayResult<Json<User>> {
    caller.require_admin()?;
    let Json(update) = body.map_err(bad_json)?;

    let password_hash = match update.password {
        Some(password) if password.is_empty() => {
            return Err(GatewayError::BadRequest(
                "password must not be empty".to_string(),
            ))
        }
        Some(password) => Some(hash_off_thread(&state, password).await?),
        None => None,
    };

    let patch = UserPatch {
        email: update.email,
        full_name: update.full_name,
        password_hash,
        role: update.role,
        is_active: update.is_active,
    };
    let user = state
        .stores
        .users
        .update_user(id, &patch)
        .await?
        .ok_or_else(user_not_found)?;

    info!(user_id = user.id, admin = %caller.0.username, "User updated");
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(id): Path<i64>,
) -> GatewayResult<StatusCode> {
    caller.require_admin()?;
    if id == caller.0.id {
        return Err(GatewayError::BadRequest("Cannot delete yourself".to_string()));
    }

    if !state.stores.users.delete_user(id).await? {
        return Err(user_not_found());
    }
    info!(user_id = id, admin = %caller.0.username, "User deleted");
    Ok(StatusCode::NO_CONTENT)
}

// --- services ---

async fn create_service(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    body: Result<Json<NewService>, JsonRejection>,
) -> GatewayResult<(StatusCode, Json<ServiceDescriptor>)> {
    if !user.role.can_manage_services() {
        return Err(GatewayError::Authorization(
            "Not enough permissions".to_string(),
        ));
    }
    let Json(new_service) = body.map_err(bad_json)?;
    new_service.validate().map_err(GatewayError::BadRequest)?;

    let service = state
        .stores
        .services
        .insert_service(user.id, new_service)
        .await
        .map_err(conflict_as_bad_request)?;

    info!(service = %service.name, username = %user.username, "Service created");
    Ok((StatusCode::CREATED, Json(service)))
}

#[derive(Debug, Deserialize)]
struct ServiceListParams {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_size")]
    size: usize,
    #[serde(default)]
    status: Option<ServiceStatus>,
    #[serde(default)]
    is_public: Option<bool>,
}

async fn list_services(
    State(state): State<AppState>,
    caller: CurrentUser,
    params: Result<Query<ServiceListParams>, QueryRejection>,
) -> GatewayResult<Json<Paginated<ServiceDescriptor>>> {
    let Query(params) = params.map_err(bad_query)?;
    let page = PageParams {
        page: params.page,
        size: params.size,
    }
    .validated()?;

    let query = ServiceQuery {
        owner_id: if caller.is_admin() { None } else { Some(caller.0.id) },
        status: params.status,
        visibility: params.is_public.map(|public| {
            if public {
                Visibility::Public
            } else {
                Visibility::Private
            }
        }),
    };

    let (items, total) = state.stores.services.list_services(&query, page).await?;
    Ok(Json(Paginated::new(items, total, params.page, params.size)))
}

async fn load_service(state: &AppState, id: i64) -> GatewayResult<ServiceDescriptor> {
    state
        .stores
        .services
        .service_by_id(id)
        .await?
        .ok_or_else(|| GatewayError::NotFound("Service not found".to_string()))
}

fn ensure_can_read(caller: &CurrentUser, service: &ServiceDescriptor) -> GatewayResult<()> {
    if service.owner_id == caller.0.id || service.is_public() || caller.is_admin() {
        Ok(())
    } else {
        Err(GatewayError::Authorization(
            "Not enough permissions".to_string(),
        ))
    }
}

fn ensure_can_modify(caller: &CurrentUser, service: &ServiceDescriptor) -> GatewayResult<()> {
    if service.owner_id == caller.0.id || caller.is_admin() {
        Ok(())
    } else {
        Err(GatewayError::Authorization(
            "Not enough permissions".to_string(),
        ))
    }
}

async fn read_service(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(id): Path<i64>,
) -> GatewayResult<Json<ServiceDescriptor>> {
    let service = load_service(&state, id).await?;
    ensure_can_read(&caller, &service)?;
    Ok(Json(service))
}

async fn read_service_stats(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(id): Path<i64>,
) -> GatewayResult<Json<ServiceWithStats>> {
    let stats = state
        .directory
        .service_with_stats(id)
        .await?
        .ok_or_else(|| GatewayError::NotFound("Service not found".to_string()))?;
    ensure_can_read(&caller, &stats.service)?;
    Ok(Json(stats))
}

async fn update_service(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(id): Path<i64>,
    body: Result<Json<ServicePatch>, JsonRejection>,
) -> GatewayResult<Json<ServiceDescriptor>> {
    let service = load_service(&state, id).await?;
    ensure_can_modify(&caller, &service)?;

    let Json(patch) = body.map_err(bad_json)?;
    patch.validate().map_err(GatewayError::BadRequest)?;

    let updated = state
        .stores
        .services
        .update_service(id, &patch)
        .await
        .map_err(conflict_as_bad_request)?
        .ok_or_else(|| GatewayError::NotFound("Service not found".to_string()))?;

    info!(service = %updated.name, username = %caller.0.username, "Service updated");
    Ok(Json(updated))
}

async fn delete_service(
    State(state): State<AppState>,
    caller: CurrentUser,
    Path(id): Path<i64>,
) -> GatewayResult<StatusCode> {
    let service = load_service(&state, id).await?;
    ensure_can_modify(&caller, &service)?;

    state.stores.services.delete_service(id).await?;
    info!(service_id = id, username = %caller.0.username, "Service deleted");
    Ok(StatusCode::NO_CONTENT)
}

// --- monitoring ---

async fn read_logs(
    State(state): State<AppState>,
    caller: CurrentUser,
    filter: Result<Query<LogFilter>, QueryRejection>,
) -> GatewayResult<Json<Vec<AccessLogRecord>>> {
    caller.require_admin()?;
    let Query(filter) = filter.map_err(bad_query)?;
    if !(1..=MAX_LOG_PAGE).contains(&filter.limit) {
        return Err(GatewayError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_LOG_PAGE
        )));
    }

    Ok(Json(state.logger.find_logs(&filter).await?))
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    #[serde(default)]
    service_id: Option<i64>,
    #[serde(default)]
    from_date: Option<DateTime<Utc>>,
    #[serde(default)]
    to_date: Option<DateTime<Utc>>,
}

async fn read_stats(
    State(state): State<AppState>,
    _caller: CurrentUser,
    params: Result<Query<StatsParams>, QueryRejection>,
) -> GatewayResult<Json<LogStats>> {
    let Query(params) = params.map_err(bad_query)?;
    let now = Utc::now();
    let scope = LogScope {
        service_id: params.service_id,
        from: Some(params.from_date.unwrap_or(now - Duration::days(1))),
        to: Some(params.to_date.unwrap_or(now)),
    };

    Ok(Json(state.logger.stats(&scope).await?))
}
