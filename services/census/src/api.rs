use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::household::{Household, HouseholdUpdate, NewHousehold, UpdateMode};
use crate::household_store::HouseholdStore;
use crate::photo_upload::{IncomingFile, PhotoUploader};
use crate::s3_gateway::PutResponse;
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};
use uuid::Uuid;

/// Headroom above the photo limit for multipart framing
const BODY_LIMIT_HEADROOM: usize = 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn HouseholdStore>,
    pub photos: Arc<PhotoUploader>,
}

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

fn success<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub message: String,
}

/// Result of a focal point photo upload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUploadResponse {
    pub filename: String,
    pub s3_res_data: PutResponse,
    pub s3_path: String,
    pub household: Household,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = state.photos.max_file_size_bytes() + BODY_LIMIT_HEADROOM;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/api/v1/households",
            get(list_households).post(create_household),
        )
        .route(
            "/api/v1/households/:id",
            get(get_household)
                .put(update_household)
                .delete(delete_household),
        )
        .route("/api/v1/households/:id/admin-update", put(admin_update_household))
        .route("/api/v1/households/:id/complete-survey", post(complete_survey))
        .route(
            "/api/v1/households/:id/focal-point-photo",
            put(upload_focal_point_photo),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "census-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Unknown and malformed ids both read as a missing record
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(raw.to_string()))
}

async fn load(state: &AppState, raw_id: &str) -> Result<Household, ApiError> {
    let id = parse_id(raw_id)?;
    state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(raw_id.to_string()))
}

async fn save(state: &AppState, household: &Household) -> Result<(), ApiError> {
    if state.store.replace(household).await? {
        Ok(())
    } else {
        Err(ApiError::NotFound(household.id.to_string()))
    }
}

#[instrument(skip(state))]
async fn list_households(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Household>>>, ApiError> {
    let households = state.store.list().await?;
    Ok(success(households))
}

#[instrument(skip(state))]
async fn get_household(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Household>>, ApiError> {
    Ok(success(load(&state, &id).await?))
}

#[instrument(skip(state, body))]
async fn create_household(
    State(state): State<AppState>,
    body: Result<Json<NewHousehold>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Household>>), ApiError> {
    let Json(input) = body?;
    let household = Household::create(input, Utc::now())?;
    state.store.insert(&household).await?;

    info!(household_id = %household.id, slug = %household.slug, "Household created");
    metrics::counter!("census.households.created").increment(1);

    Ok((StatusCode::CREATED, success(household)))
}

async fn apply_update(
    state: &AppState,
    id: &str,
    update: HouseholdUpdate,
    mode: UpdateMode,
) -> Result<Household, ApiError> {
    let mut household = load(state, id).await?;
    household.apply_update(update, mode, Utc::now())?;
    save(state, &household).await?;
    Ok(household)
}

#[instrument(skip(state, body))]
async fn update_household(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<HouseholdUpdate>, JsonRejection>,
) -> Result<Json<ApiResponse<Household>>, ApiError> {
    let Json(update) = body?;
    let household = apply_update(&state, &id, update, UpdateMode::General).await?;
    Ok(success(household))
}

#[instrument(skip(state, body))]
async fn admin_update_household(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<HouseholdUpdate>, JsonRejection>,
) -> Result<Json<ApiResponse<Household>>, ApiError> {
    let Json(update) = body?;
    let household = apply_update(&state, &id, update, UpdateMode::Admin).await?;
    Ok(success(household))
}

#[instrument(skip(state, body))]
async fn complete_survey(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<HouseholdUpdate>, JsonRejection>,
) -> Result<Json<ApiResponse<Household>>, ApiError> {
    let Json(update) = body?;
    let mut household = load(&state, &id).await?;
    household.complete(update, Utc::now())?;
    save(&state, &household).await?;

    info!(household_id = %household.id, "Survey completed");
    metrics::counter!("census.households.completed").increment(1);

    Ok(success(household))
}

#[instrument(skip(state))]
async fn delete_household(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<DeletedResponse>>, ApiError> {
    let household_id = parse_id(&id)?;
    if !state.store.delete(household_id).await? {
        return Err(ApiError::NotFound(id));
    }

    info!(household_id = %household_id, "Household deleted");
    metrics::counter!("census.households.deleted").increment(1);

    Ok(success(DeletedResponse {
        message: "Household deleted successfully".to_string(),
    }))
}

#[instrument(skip(state, multipart))]
async fn upload_focal_point_photo(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<ApiResponse<PhotoUploadResponse>>), ApiError> {
    let mut household = load(&state, &id).await?;

    let file = match multipart {
        Ok(multipart) => read_photo_field(multipart, &state.photos).await?,
        Err(_) => None,
    };

    let uploaded = state
        .photos
        .upload(household.id, file, household.photo.as_ref())
        .await?;

    household.set_photo(uploaded.object, Utc::now());
    save(&state, &household).await?;

    info!(
        household_id = %household.id,
        path = %uploaded.public_url,
        replaced = uploaded.deleted_previous,
        "Focal point photo uploaded"
    );

    Ok((
        StatusCode::CREATED,
        success(PhotoUploadResponse {
            filename: uploaded.filename,
            s3_res_data: uploaded.provider_response,
            s3_path: uploaded.public_url,
            household,
        }),
    ))
}

/// Take the `file` field, or else the first field carrying a file name
async fn read_photo_field(
    mut multipart: Multipart,
    photos: &PhotoUploader,
) -> Result<Option<IncomingFile>, ApiError> {
    let mut chosen: Option<IncomingFile> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, photos))?
    {
        let is_file_field = field.name() == Some("file");
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        if chosen.is_some() && !is_file_field {
            continue;
        }

        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, photos))?;

        chosen = Some(IncomingFile {
            file_name,
            content_type,
            data,
        });
        if is_file_field {
            break;
        }
    }

    Ok(chosen)
}

fn multipart_error(e: MultipartError, photos: &PhotoUploader) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::BadRequest(photos.too_large_message())
    } else {
        ApiError::BadRequest(e.body_text())
    }
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting census API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_maps_garbage_to_not_found() {
        let err = parse_id("not-a-uuid").unwrap_err();
        assert!(matches!(err, ApiError::NotFound(ref id) if id == "not-a-uuid"));

        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_upload_response_layout() {
        let household = crate::household::Household::create(
            NewHousehold {
                family_name: "Smith".to_string(),
                address: "1 Main St".to_string(),
                focal_point: crate::household::NewFocalPoint {
                    first_name: None,
                    email: "a@b.com".to_string(),
                },
            },
            Utc::now(),
        )
        .unwrap();

        let response = PhotoUploadResponse {
            filename: "photo_1.jpg".to_string(),
            s3_res_data: PutResponse {
                e_tag: Some("\"abc\"".to_string()),
                ..Default::default()
            },
            s3_path: "https://b.s3.r.amazonaws.com/p/photo_1.jpg".to_string(),
            household,
        };
        let json = serde_json::to_value(success(response).0).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["filename"], "photo_1.jpg");
        assert_eq!(json["data"]["s3ResData"]["eTag"], "\"abc\"");
        assert_eq!(json["data"]["household"]["slug"], "smith-a");
    }
}
