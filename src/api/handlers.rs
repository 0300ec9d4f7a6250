use std::sync::Arc;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use log::{info, warn};

use crate::auth::{extract_bearer_token, AuthError, Claims, JwtGenerator, JwtValidator, User, UserStore};
use crate::error::ApiError;
use crate::market::{PriceEntry, PriceTable};
use crate::trading::{Order, OrderRequest, OrderStore};

#[derive(Clone)]
pub struct ApiState {
    pub table: Arc<PriceTable>,
    pub users: UserStore,
    pub orders: OrderStore,
    pub jwt_generator: Arc<JwtGenerator>,
    pub jwt_validator: Arc<JwtValidator>,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

// Authenticate request and extract user claims
fn authenticate_request(headers: &HeaderMap, validator: &JwtValidator) -> Result<Claims, ApiError> {
    let token = extract_bearer_token(headers).ok_or(AuthError::MissingToken)?;
    Ok(validator.validate_token(&token)?)
}

// bcrypt and SQLite work stays off the async workers
async fn run_blocking<T, E, F>(job: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {}", e)))?
        .map_err(Into::into)
}

// POST /api/login
pub async fn login(
    State(state): State<ApiState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(request) = payload?;
    let users = state.users.clone();

    let user = run_blocking(move || users.verify(&request.username, &request.password))
        .await
        .inspect_err(|_| warn!("Failed login attempt"))?;
    let token = state.jwt_generator.issue(&user)?;

    info!("User {} logged in", user.username);
    Ok(Json(LoginResponse { token, user }))
}

// POST /api/signup
pub async fn signup(
    State(state): State<ApiState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LoginResponse>), ApiError> {
    let Json(request) = payload?;
    let users = state.users.clone();

    let user = run_blocking(move || users.create(&request.username, &request.password)).await?;
    let token = state.jwt_generator.issue(&user)?;

    Ok((StatusCode::CREATED, Json(LoginResponse { token, user })))
}

// GET /api/prices
pub async fn get_prices(State(state): State<ApiState>) -> Json<Vec<PriceEntry>> {
    Json(state.table.snapshot())
}

// POST /api/orders - Place a new order
pub async fn place_order(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<OrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let claims = authenticate_request(&headers, &state.jwt_validator)?;
    let Json(order_request) = payload?;

    let orders = state.orders.clone();

    let order = run_blocking(move || orders.place(order_request, claims.user_id)).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

// GET /api/orders - Get user's orders, newest first
pub async fn get_orders(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Order>>, ApiError> {
    let claims = authenticate_request(&headers, &state.jwt_validator)?;
    let orders = state.orders.clone();

    Ok(Json(run_blocking(move || orders.list_for_user(claims.user_id)).await?))
}

// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "stock_stream_api",
        "timestamp": chrono::Utc::now()
    }))
}

/// Explicit origins allow credentials; an empty list allows any origin.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        .allow_credentials(true)
}

// Create the API router
pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/login", post(login))
        .route("/signup", post(signup))
        .route("/prices", get(get_prices))
        .route("/orders", post(place_order).get(get_orders))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
}
