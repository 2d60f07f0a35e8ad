use std::{env, fmt::Display, fs::read_to_string, path::PathBuf, str::FromStr};

use tracing::{info, warn};

pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub data_dir: PathBuf,
    pub debounce_ms: u64,
    /// Base URL used when generating join links.
    pub base_url: String,
    /// Endpoint of the OCR list-extraction service, if deployed.
    pub extract_url: Option<String>,
    pub pexels_key: Option<String>,
    pub pixabay_key: Option<String>,
    pub google_key: Option<String>,
    pub google_cx: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("GROCER_PORT", "4000"),
            redis_url: try_load("GROCER_REDIS_URL", "redis://127.0.0.1:6379"),
            data_dir: PathBuf::from(try_load::<String>("GROCER_DATA_DIR", "./data")),
            debounce_ms: try_load("GROCER_DEBOUNCE_MS", "400"),
            base_url: try_load("GROCER_BASE_URL", "http://localhost:4000"),
            extract_url: maybe_load("GROCER_EXTRACT_URL"),
            pexels_key: maybe_secret("PEXELS_API_KEY"),
            pixabay_key: maybe_secret("PIXABAY_API_KEY"),
            google_key: maybe_secret("GOOGLE_API_KEY"),
            google_cx: maybe_secret("GOOGLE_CSE_CX"),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}

fn maybe_load(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Docker secret with an environment variable fallback. Image provider keys
/// are optional; searches without a key fall back to the placeholder image.
fn maybe_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| maybe_load(secret_name))
}
