use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Not an image data URI")]
    InvalidImage,

    #[error("Family not found")]
    FamilyNotFound,

    #[error("Product not found")]
    ProductNotFound,

    #[error("Not part of a family")]
    NotInFamily,

    #[error("Already part of a family")]
    AlreadyInFamily,

    #[error("No products could be extracted from the image")]
    EmptyExtraction,

    #[error("Extraction service is not configured")]
    ExtractionUnavailable,

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::MalformedPayload | AppError::InvalidImage => StatusCode::BAD_REQUEST,
            AppError::FamilyNotFound | AppError::ProductNotFound => StatusCode::NOT_FOUND,
            AppError::NotInFamily | AppError::AlreadyInFamily => StatusCode::CONFLICT,
            AppError::EmptyExtraction => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Upstream { .. } | AppError::ExtractionUnavailable => StatusCode::BAD_GATEWAY,
            AppError::Store { .. } | AppError::Serde { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
