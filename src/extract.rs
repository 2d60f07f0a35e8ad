//! # List Extraction
//!
//! Opaque OCR service: a photo of a handwritten shopping list goes in as a
//! data URI, an array of product names comes back. The model and OCR engine
//! behind the endpoint are not this crate's business.
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::AppError};

#[derive(Serialize)]
struct ExtractRequest<'a> {
    #[serde(rename = "photoDataUri")]
    photo_data_uri: &'a str,
}

#[derive(Deserialize)]
struct ExtractResponse {
    #[serde(rename = "productNames", default)]
    product_names: Vec<String>,
}

pub struct ExtractClient {
    http: reqwest::Client,
    endpoint: Option<String>,
}

impl ExtractClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.extract_url.clone(),
        }
    }

    pub async fn extract(&self, photo_data_uri: &str) -> Result<Vec<String>, AppError> {
        if !is_image_data_uri(photo_data_uri) {
            return Err(AppError::InvalidImage);
        }
        let Some(endpoint) = &self.endpoint else {
            return Err(AppError::ExtractionUnavailable);
        };

        let response: ExtractResponse = self
            .http
            .post(endpoint)
            .json(&ExtractRequest { photo_data_uri })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let names = clean_names(response.product_names);
        if names.is_empty() {
            return Err(AppError::EmptyExtraction);
        }
        Ok(names)
    }
}

fn is_image_data_uri(input: &str) -> bool {
    input.starts_with("data:image/")
}

fn clean_names(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}
