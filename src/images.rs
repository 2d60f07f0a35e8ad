//! # Image Providers
//!
//! Opaque external image search: a query string in, a list of image URLs out.
//! Three interchangeable providers (Google CSE, Pexels, Pixabay). Any failure
//! degrades to a letter-avatar placeholder so adding an item never fails on
//! account of a picture.
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::warn;

use crate::{config::Config, models::ImageProvider};

const PEXELS_ENDPOINT: &str = "https://api.pexels.com/v1/search";
const PIXABAY_ENDPOINT: &str = "https://pixabay.com/api/";
const GOOGLE_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
const FALLBACK_ENDPOINT: &str = "https://ui-avatars.com/api/";

#[derive(Deserialize)]
struct PexelsResponse {
    #[serde(default)]
    photos: Vec<PexelsPhoto>,
}

#[derive(Deserialize)]
struct PexelsPhoto {
    src: PexelsSrc,
}

#[derive(Deserialize)]
struct PexelsSrc {
    medium: Option<String>,
    large: Option<String>,
}

#[derive(Deserialize)]
struct PixabayResponse {
    #[serde(default)]
    hits: Vec<PixabayHit>,
}

#[derive(Deserialize)]
struct PixabayHit {
    #[serde(rename = "webformatURL")]
    webformat_url: Option<String>,
    #[serde(rename = "largeImageURL")]
    large_image_url: Option<String>,
}

#[derive(Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    items: Vec<GoogleItem>,
}

#[derive(Deserialize)]
struct GoogleItem {
    link: Option<String>,
    image: Option<GoogleImage>,
}

#[derive(Deserialize)]
struct GoogleImage {
    #[serde(rename = "thumbnailLink")]
    thumbnail_link: Option<String>,
}

/// Result of a provider search, carrying the provider that actually answered
/// so a rate-limit rotation can be persisted by the caller.
pub struct ImageSearch {
    pub urls: Vec<String>,
    pub provider: ImageProvider,
}

pub struct ImageClient {
    http: reqwest::Client,
    pexels_key: Option<String>,
    pixabay_key: Option<String>,
    google_key: Option<String>,
    google_cx: Option<String>,
}

impl ImageClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            pexels_key: config.pexels_key.clone(),
            pixabay_key: config.pixabay_key.clone(),
            google_key: config.google_key.clone(),
            google_cx: config.google_cx.clone(),
        }
    }

    /// Search image URLs for a product name. Infallible: provider errors land
    /// on the placeholder image. A rate-limited Google search rotates to the
    /// next provider once, mirrored in the returned provider.
    pub async fn search(&self, query: &str, provider: ImageProvider) -> ImageSearch {
        let query = query.trim();
        if query.is_empty() {
            return ImageSearch {
                urls: vec![fallback_image(query)],
                provider,
            };
        }

        let mut active = provider;
        for attempt in 0..2 {
            match self.fetch(query, active).await {
                Ok(urls) if !urls.is_empty() => {
                    return ImageSearch {
                        urls,
                        provider: active,
                    };
                }
                Ok(_) => break,
                Err(FetchError::RateLimited) if attempt == 0 && rotates_on_rate_limit(active) => {
                    warn!(
                        "{} rate limited, rotating to next provider",
                        active.as_str()
                    );
                    active = active.next();
                }
                Err(FetchError::MissingCredentials) => {
                    warn!("No credentials configured for {}", active.as_str());
                    break;
                }
                Err(FetchError::Other(e)) => {
                    warn!("Image search via {} failed: {e}", active.as_str());
                    break;
                }
                Err(FetchError::RateLimited) => break,
            }
        }

        ImageSearch {
            urls: vec![fallback_image(query)],
            provider: active,
        }
    }

    /// First hit for a product name, used when adding items.
    pub async fn first(&self, query: &str, provider: ImageProvider) -> ImageSearch {
        let mut result = self.search(query, provider).await;
        result.urls.truncate(1);
        result
    }

    async fn fetch(&self, query: &str, provider: ImageProvider) -> Result<Vec<String>, FetchError> {
        match provider {
            ImageProvider::Pexels => {
                let Some(key) = &self.pexels_key else {
                    return Err(FetchError::MissingCredentials);
                };

                let response = self
                    .http
                    .get(PEXELS_ENDPOINT)
                    .query(&[("query", query), ("locale", "es-ES"), ("per_page", "20")])
                    .header("Authorization", key)
                    .send()
                    .await?;
                let body: PexelsResponse = check(response, provider).await?.json().await?;

                Ok(body
                    .photos
                    .into_iter()
                    .filter_map(|p| p.src.medium.or(p.src.large))
                    .collect())
            }
            ImageProvider::Pixabay => {
                let Some(key) = &self.pixabay_key else {
                    return Err(FetchError::MissingCredentials);
                };

                let response = self
                    .http
                    .get(PIXABAY_ENDPOINT)
                    .query(&[
                        ("key", key.as_str()),
                        ("q", query),
                        ("lang", "es"),
                        ("image_type", "photo"),
                        ("per_page", "20"),
                    ])
                    .send()
                    .await?;
                let body: PixabayResponse = check(response, provider).await?.json().await?;

                Ok(body
                    .hits
                    .into_iter()
                    .filter_map(|h| h.webformat_url.or(h.large_image_url))
                    .collect())
            }
            ImageProvider::Google => {
                let (Some(key), Some(cx)) = (&self.google_key, &self.google_cx) else {
                    return Err(FetchError::MissingCredentials);
                };

                let response = self
                    .http
                    .get(GOOGLE_ENDPOINT)
                    .query(&[
                        ("q", query),
                        ("searchType", "image"),
                        ("cx", cx.as_str()),
                        ("key", key.as_str()),
                        ("num", "10"),
                        ("safe", "active"),
                        ("hl", "es"),
                        ("gl", "ES"),
                        ("lr", "lang_es"),
                    ])
                    .send()
                    .await?;
                let body: GoogleResponse = check(response, provider).await?.json().await?;

                Ok(body
                    .items
                    .into_iter()
                    .filter_map(|i| i.link.or(i.image.and_then(|img| img.thumbnail_link)))
                    .collect())
            }
        }
    }
}

/// Rotation happens only out of Google; a 429 from Pexels or Pixabay falls
/// straight through to the placeholder.
fn rotates_on_rate_limit(provider: ImageProvider) -> bool {
    provider == ImageProvider::Google
}

enum FetchError {
    MissingCredentials,
    RateLimited,
    Other(reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self::Other(e)
    }
}

async fn check(
    response: reqwest::Response,
    provider: ImageProvider,
) -> Result<reqwest::Response, FetchError> {
    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited);
    }
    match response.error_for_status() {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!("{} returned an error status", provider.as_str());
            Err(FetchError::Other(e))
        }
    }
}

/// Letter-avatar placeholder shown when no provider yields a picture.
pub fn fallback_image(name: &str) -> String {
    let url = Url::parse_with_params(
        FALLBACK_ENDPOINT,
        &[
            ("name", name),
            ("background", "7d3eea"),
            ("color", "fff"),
            ("length", "1"),
            ("bold", "false"),
            ("uppercase", "true"),
            ("format", "svg"),
        ],
    )
    .expect("static fallback URL");
    url.to_string()
}
