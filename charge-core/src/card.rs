//! Scene cards built from typed content blocks.
//!
//! ```text
//!   Card ── title / hidden / titleHidden
//!     └── blocks: [ CardBlock { id, hidden, type, data } ... ]
//!                                         │
//!                 BlockRegistry["text"] ──┤  validates `data`
//!                 BlockRegistry["image"] ─┘
//! ```
//!
//! The card schema only checks block structure. Payloads are validated per
//! block kind through a [`BlockRegistry`], so applications can plug in their
//! own kinds without touching this module.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schema::{Schema, SchemaError};

pub const TEXT_BLOCK: &str = "text";
pub const IMAGE_BLOCK: &str = "image";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardBlock {
    pub id: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl CardBlock {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            hidden: false,
            kind: kind.into(),
            data,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(TEXT_BLOCK, serde_json::json!({ "text": text.into() }))
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::new(IMAGE_BLOCK, serde_json::json!({ "url": url.into() }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_hidden")]
    pub hidden: bool,
    #[serde(default)]
    pub title_hidden: bool,
    #[serde(default)]
    pub blocks: Vec<CardBlock>,
}

fn default_hidden() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CardInput {
    pub title: Option<String>,
    pub hidden: Option<bool>,
    pub title_hidden: Option<bool>,
    pub blocks: Option<Vec<CardBlock>>,
}

impl Schema for Card {
    type Input = CardInput;
    const KIND: &'static str = "card";

    fn from_input(input: CardInput) -> Self {
        Self {
            title: input.title.unwrap_or_default(),
            hidden: input.hidden.unwrap_or(true),
            title_hidden: input.title_hidden.unwrap_or(false),
            blocks: input.blocks.unwrap_or_default(),
        }
    }

    fn normalize(self) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for block in &self.blocks {
            if !seen.insert(block.id.as_str()) {
                return Err(SchemaError::Invalid {
                    kind: Self::KIND,
                    reason: format!("duplicate block id '{}'", block.id),
                });
            }
        }
        Ok(self)
    }
}

impl Card {
    pub fn block(&self, id: &str) -> Option<&CardBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Blocks visible to a viewer who cannot see hidden content.
    pub fn visible_blocks(&self) -> impl Iterator<Item = &CardBlock> {
        self.blocks.iter().filter(|b| !b.hidden)
    }
}

/// Payload of a `text` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBlock {
    pub text: String,
}

impl Schema for TextBlock {
    type Input = ();
    const KIND: &'static str = "text block";

    fn from_input(_: ()) -> Self {
        Self::default()
    }
}

/// Payload of an `image` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBlock {
    pub url: String,
    #[serde(default)]
    pub alt: String,
}

impl Schema for ImageBlock {
    type Input = ();
    const KIND: &'static str = "image block";

    fn from_input(_: ()) -> Self {
        Self::default()
    }

    fn normalize(self) -> Result<Self, SchemaError> {
        if self.url.trim().is_empty() {
            return Err(SchemaError::Invalid {
                kind: Self::KIND,
                reason: "url is empty".into(),
            });
        }
        Ok(self)
    }
}

type BlockValidator = Arc<dyn Fn(&Value) -> Result<(), SchemaError> + Send + Sync>;

/// Validators for card block payloads, keyed by block `type`.
#[derive(Clone)]
pub struct BlockRegistry {
    validators: HashMap<String, BlockValidator>,
}

impl BlockRegistry {
    /// A registry with no kinds. Every block fails validation.
    pub fn empty() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// Register a kind whose payload must parse as `S`.
    pub fn register<S: Schema>(&mut self, kind: impl Into<String>) -> &mut Self {
        self.register_fn(kind, |data| S::parse(data).map(|_| ()))
    }

    pub fn register_fn<F>(&mut self, kind: impl Into<String>, validate: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<(), SchemaError> + Send + Sync + 'static,
    {
        self.validators.insert(kind.into(), Arc::new(validate));
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.validators.contains_key(kind)
    }

    pub fn validate_block(&self, block: &CardBlock) -> Result<(), SchemaError> {
        match self.validators.get(&block.kind) {
            Some(validate) => validate(&block.data),
            None => Err(SchemaError::Invalid {
                kind: Card::KIND,
                reason: format!("block '{}' has unknown type '{}'", block.id, block.kind),
            }),
        }
    }

    pub fn validate_card(&self, card: &Card) -> Result<(), SchemaError> {
        card.blocks.iter().try_for_each(|b| self.validate_block(b))
    }
}

impl Default for BlockRegistry {
    /// The built-in `text` and `image` kinds.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register::<TextBlock>(TEXT_BLOCK)
            .register::<ImageBlock>(IMAGE_BLOCK);
        registry
    }
}

impl fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.validators.keys().collect();
        kinds.sort();
        f.debug_struct("BlockRegistry").field("kinds", &kinds).finish()
    }
}
