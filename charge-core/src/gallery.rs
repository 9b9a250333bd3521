//! Shared image gallery.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{Schema, SchemaError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryItem {
    pub id: String,
    pub image_url: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default = "default_hidden")]
    pub hidden: bool,
}

fn default_hidden() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GalleryItemInput {
    pub image_url: String,
    pub caption: Option<String>,
    pub hidden: Option<bool>,
}

impl Schema for GalleryItem {
    type Input = GalleryItemInput;
    const KIND: &'static str = "gallery item";

    fn from_input(input: GalleryItemInput) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            image_url: input.image_url,
            caption: input.caption.unwrap_or_default(),
            hidden: input.hidden.unwrap_or(true),
        }
    }

    fn normalize(self) -> Result<Self, SchemaError> {
        if self.image_url.trim().is_empty() {
            return Err(SchemaError::Invalid {
                kind: Self::KIND,
                reason: "imageUrl is empty".into(),
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let item = GalleryItem::from_input(GalleryItemInput {
            image_url: "https://img/1.png".into(),
            ..GalleryItemInput::default()
        });
        assert_eq!(item.caption, "");
        assert!(item.hidden);
    }

    #[test]
    fn test_missing_url_rejected() {
        assert!(GalleryItem::parse(&json!({ "id": "g", "caption": "x" })).is_err());
        assert!(GalleryItem::parse(&json!({ "id": "g", "imageUrl": "" })).is_err());
    }

    #[test]
    fn test_parse_camel_case() {
        let item = GalleryItem::parse(&json!({ "id": "g", "imageUrl": "u", "hidden": false })).unwrap();
        assert_eq!(item.image_url, "u");
        assert!(!item.hidden);
    }
}
