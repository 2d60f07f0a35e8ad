//! # Shared Types
//!
//! Domain types for the shopping list and the family document.
//!
//! ## Ordering
//!
//! The list is always kept with unbought items before bought ones. Sorting is
//! stable, so new items stay on top of the unbought partition and bought items
//! keep their relative order at the bottom.
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// One entry on the shopping list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub bought: bool,
}

impl Product {
    pub fn new(name: &str, image: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            image,
            bought: false,
        }
    }
}

/// Per-write revision tag. Lets a subscriber tell its own writes apart from
/// writes made by other family members.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rev {
    pub writer: Uuid,
    pub seq: u64,
}

/// The shared family document, one per family code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FamilyDoc {
    pub id: String,
    pub name: String,
    pub members: u32,
    pub shopping_list: Vec<Product>,
    pub favorites: Vec<Product>,
    #[serde(default)]
    pub rev: Rev,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageProvider {
    #[default]
    Google,
    Pexels,
    Pixabay,
}

impl ImageProvider {
    /// Rotation order used when a provider is rate limited.
    pub fn next(self) -> Self {
        match self {
            Self::Google => Self::Pexels,
            Self::Pexels => Self::Pixabay,
            Self::Pixabay => Self::Google,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Pexels => "pexels",
            Self::Pixabay => "pixabay",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewType {
    #[default]
    List,
    Grid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

/// User settings persisted in the local cache. Unknown stored values fall back
/// to the defaults field by field instead of discarding the whole file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, deserialize_with = "ok_or_default")]
    pub provider: ImageProvider,
    #[serde(default, deserialize_with = "ok_or_default")]
    pub view: ViewType,
    #[serde(default, deserialize_with = "ok_or_default")]
    pub theme: Theme,
    #[serde(default)]
    pub family_id: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
}

fn ok_or_default<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: DeserializeOwned + Default,
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Unbought items first, otherwise stable.
pub fn sort_products(products: &mut [Product]) {
    products.sort_by_key(|p| p.bought);
}
