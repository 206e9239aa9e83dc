use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::db::Db;
use crate::plant::{NewPlant, PlantPatch};
use crate::profile::{Profile, ProfileUpdate};
use crate::session::SessionManager;
use crate::state::SharedState;
use crate::store::{PlantData, StoreError};

#[derive(Clone)]
pub struct AppContext {
    pub shared: SharedState,
    pub plants: Arc<PlantData>,
    pub sessions: Arc<SessionManager>,
    pub db: Db,
}

#[derive(Deserialize)]
struct LoginRequest {
    user_id: String,
}

#[derive(Serialize)]
struct ProfileResponse {
    #[serde(flatten)]
    profile: Profile,
    total_plants: i64,
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            StoreError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Backend(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/plants", get(list_plants).post(create_plant))
        .route("/api/plants/{id}", patch(update_plant).delete(delete_plant))
        .route("/api/plants/{id}/water", post(toggle_water))
        .route("/api/session", post(login).delete(logout))
        .route("/api/profile", get(get_profile).put(put_profile))
        .with_state(ctx)
}

async fn api_status(State(ctx): State<AppContext>) -> impl IntoResponse {
    let st = ctx.shared.read().await;
    Json(st.to_status())
}

async fn list_plants(State(ctx): State<AppContext>) -> Result<impl IntoResponse, StoreError> {
    Ok(Json(ctx.plants.plants().await?))
}

async fn create_plant(
    State(ctx): State<AppContext>,
    Json(body): Json<NewPlant>,
) -> Result<impl IntoResponse, StoreError> {
    let plant = ctx.plants.add(body).await?;
    Ok((StatusCode::CREATED, Json(plant)))
}

async fn update_plant(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
    Json(body): Json<PlantPatch>,
) -> Result<impl IntoResponse, StoreError> {
    Ok(Json(ctx.plants.update(id, body).await?))
}

async fn toggle_water(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StoreError> {
    Ok(Json(ctx.plants.toggle_water(id).await?))
}

async fn delete_plant(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StoreError> {
    ctx.plants.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn login(
    State(ctx): State<AppContext>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, StoreError> {
    ctx.sessions.login(&body.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn logout(State(ctx): State<AppContext>) -> impl IntoResponse {
    ctx.sessions.logout().await;
    StatusCode::NO_CONTENT
}

fn session_user(ctx: &AppContext) -> Result<String, StoreError> {
    ctx.sessions
        .current()
        .map(|s| s.user_id)
        .ok_or(StoreError::NotAuthenticated)
}

async fn profile_response(ctx: &AppContext, profile: Profile) -> Result<ProfileResponse, StoreError> {
    let total_plants = ctx.db.count_plants(&profile.user_id).await?;
    Ok(ProfileResponse {
        profile,
        total_plants,
    })
}

async fn get_profile(State(ctx): State<AppContext>) -> Result<impl IntoResponse, StoreError> {
    let user_id = session_user(&ctx)?;
    let profile = ctx
        .db
        .load_profile(&user_id)
        .await?
        .unwrap_or_else(|| Profile::empty(&user_id));
    Ok(Json(profile_response(&ctx, profile).await?))
}

async fn put_profile(
    State(ctx): State<AppContext>,
    Json(body): Json<ProfileUpdate>,
) -> Result<impl IntoResponse, StoreError> {
    let user_id = session_user(&ctx)?;
    let update = body.validated()?;

    let mut profile = ctx
        .db
        .load_profile(&user_id)
        .await?
        .unwrap_or_else(|| Profile::empty(&user_id));
    profile.apply(update, OffsetDateTime::now_utc());
    ctx.db.save_profile(&profile).await?;

    ctx.shared
        .write()
        .await
        .record_system(format!("{user_id} updated profile"));
    info!(user = %user_id, "profile updated");
    Ok(Json(profile_response(&ctx, profile).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(ctx: AppContext, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(ctx))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
