use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, future::join_all};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use crate::{
    error::AppError,
    family::join_url,
    models::{ImageProvider, Product, Settings, Theme, ViewType},
    state::AppState,
    store::LeaveOutcome,
    sync::ListState,
};

#[derive(Deserialize)]
pub struct AddItemPayload {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Deserialize)]
pub struct AddBatchPayload {
    pub names: Vec<String>,
}

#[derive(Deserialize)]
pub struct CreateFamilyPayload {
    pub name: String,
}

#[derive(Deserialize)]
pub struct JoinFamilyPayload {
    pub code: String,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

#[derive(Deserialize)]
pub struct ExtractPayload {
    #[serde(rename = "photoDataUri")]
    pub photo_data_uri: String,
}

#[derive(Default, Deserialize)]
pub struct SettingsUpdate {
    pub provider: Option<ImageProvider>,
    pub view: Option<ViewType>,
    pub theme: Option<Theme>,
}

impl SettingsUpdate {
    fn apply(self, settings: &mut Settings) {
        if let Some(provider) = self.provider {
            settings.provider = provider;
        }
        if let Some(view) = self.view {
            settings.view = view;
        }
        if let Some(theme) = self.theme {
            settings.theme = theme;
        }
    }
}

#[derive(Serialize)]
pub struct FamilyResponse {
    pub code: String,
    pub name: String,
    pub members: u32,
    pub join_url: String,
}

#[derive(Serialize)]
pub struct LeaveResponse {
    pub deleted: bool,
    pub remaining: u32,
}

#[derive(Serialize)]
pub struct FavoriteResponse {
    pub favorite: bool,
    pub favorites: Vec<Product>,
}

#[derive(Serialize)]
pub struct ImagesResponse {
    pub provider: ImageProvider,
    pub urls: Vec<String>,
}

#[derive(Serialize)]
pub struct ExtractResponse {
    #[serde(rename = "productNames")]
    pub product_names: Vec<String>,
}

/// Resolve a product image through the active provider, persisting a
/// rate-limit rotation so the next search starts on the working provider.
async fn resolve_image(state: &AppState, name: &str) -> String {
    let provider = state.settings.get().provider;
    let result = state.images.first(name, provider).await;

    if result.provider != provider {
        state.settings.update(|s| s.provider = result.provider);
    }
    result
        .urls
        .into_iter()
        .next()
        .unwrap_or_else(|| crate::images::fallback_image(name))
}

pub async fn list_handler(State(state): State<Arc<AppState>>) -> Json<ListState> {
    Json(state.bridge.snapshot())
}

pub async fn list_events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream =
        WatchStream::new(state.bridge.watch()).map(|snapshot| Event::default().json_data(&snapshot));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn add_item_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AddItemPayload>,
) -> Result<Json<ListState>, AppError> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::MalformedPayload);
    }

    let image = match payload.image.filter(|i| !i.is_empty()) {
        Some(image) => image,
        None => resolve_image(&state, &name).await,
    };

    state.bridge.add_product(Product::new(&name, image)).await;
    Ok(Json(state.bridge.snapshot()))
}

pub async fn add_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AddBatchPayload>,
) -> Result<Json<ListState>, AppError> {
    let names: Vec<String> = payload
        .names
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        return Err(AppError::MalformedPayload);
    }

    let images = join_all(names.iter().map(|name| resolve_image(&state, name))).await;
    let products = names
        .iter()
        .zip(images)
        .map(|(name, image)| Product::new(name, image))
        .collect();

    state.bridge.add_products(products).await;
    Ok(Json(state.bridge.snapshot()))
}

pub async fn toggle_item_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ListState>, AppError> {
    if !state.bridge.toggle_bought(id).await {
        return Err(AppError::ProductNotFound);
    }
    Ok(Json(state.bridge.snapshot()))
}

pub async fn delete_item_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ListState>, AppError> {
    if !state.bridge.remove_product(id).await {
        return Err(AppError::ProductNotFound);
    }
    Ok(Json(state.bridge.snapshot()))
}

pub async fn clear_handler(State(state): State<Arc<AppState>>) -> Json<ListState> {
    state.bridge.clear().await;
    Json(state.bridge.snapshot())
}

pub async fn favorites_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Product>> {
    Json(state.bridge.snapshot().favorites)
}

pub async fn toggle_favorite_handler(
    State(state): State<Arc<AppState>>,
    Json(product): Json<Product>,
) -> Json<FavoriteResponse> {
    let favorite = state.bridge.toggle_favorite(product).await;
    Json(FavoriteResponse {
        favorite,
        favorites: state.bridge.snapshot().favorites,
    })
}

pub async fn family_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FamilyResponse>, AppError> {
    let family = state.bridge.snapshot().family.ok_or(AppError::NotInFamily)?;
    Ok(Json(FamilyResponse {
        join_url: join_url(&state.config.base_url, &family.code),
        code: family.code,
        name: family.name,
        members: family.members,
    }))
}

pub async fn create_family_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateFamilyPayload>,
) -> Result<Json<FamilyResponse>, AppError> {
    let code = state.bridge.create_family(&payload.name).await?;
    Ok(Json(FamilyResponse {
        join_url: join_url(&state.config.base_url, &code),
        code,
        name: payload.name.trim().to_string(),
        members: 1,
    }))
}

pub async fn join_family_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JoinFamilyPayload>,
) -> Result<Json<FamilyResponse>, AppError> {
    let family = state.bridge.join_family(&payload.code).await?;
    Ok(Json(FamilyResponse {
        join_url: join_url(&state.config.base_url, &family.code),
        code: family.code,
        name: family.name,
        members: family.members,
    }))
}

pub async fn leave_family_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LeaveResponse>, AppError> {
    let outcome = state.bridge.leave_family().await?;
    let (deleted, remaining) = match outcome {
        LeaveOutcome::Remaining(n) => (false, n),
        LeaveOutcome::Deleted | LeaveOutcome::NotFound => (true, 0),
    };
    Ok(Json(LeaveResponse { deleted, remaining }))
}

pub async fn settings_handler(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.settings.get())
}

pub async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SettingsUpdate>,
) -> Json<Settings> {
    state.settings.update(|s| payload.apply(s));
    Json(state.settings.get())
}

pub async fn search_images_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ImagesResponse>, AppError> {
    let q = query.q.trim();
    if q.is_empty() {
        return Err(AppError::MalformedPayload);
    }

    let provider = state.settings.get().provider;
    let result = state.images.search(q, provider).await;
    if result.provider != provider {
        state.settings.update(|s| s.provider = result.provider);
    }

    Ok(Json(ImagesResponse {
        provider: result.provider,
        urls: result.urls,
    }))
}

pub async fn extract_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExtractPayload>,
) -> Result<Json<ExtractResponse>, AppError> {
    let product_names = state.extract.extract(&payload.photo_data_uri).await?;
    Ok(Json(ExtractResponse { product_names }))
}
