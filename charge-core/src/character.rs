//! Player characters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::{Schema, SchemaError};

/// Highest allowed action rating.
pub const MAX_ACTION_LEVEL: u8 = 4;

pub const DEFAULT_MOMENTUM: i32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_momentum")]
    pub momentum: i32,
    #[serde(default)]
    pub stress: i32,
    #[serde(default)]
    pub condition: String,
    /// Values of world-defined custom fields, keyed by field id.
    #[serde(default)]
    pub field_values: BTreeMap<String, String>,
    /// Action ratings (0..=4), keyed by action name.
    #[serde(default)]
    pub action_levels: BTreeMap<String, u8>,
    #[serde(default = "default_hidden")]
    pub hidden: bool,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

fn default_momentum() -> i32 {
    DEFAULT_MOMENTUM
}

fn default_hidden() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterInput {
    pub name: Option<String>,
    pub momentum: Option<i32>,
    pub stress: Option<i32>,
    pub condition: Option<String>,
    pub field_values: Option<BTreeMap<String, String>>,
    pub action_levels: Option<BTreeMap<String, u8>>,
    pub hidden: Option<bool>,
    pub color: Option<String>,
    pub image: Option<String>,
}

impl Schema for Character {
    type Input = CharacterInput;
    const KIND: &'static str = "character";

    fn from_input(input: CharacterInput) -> Self {
        Self {
            name: input.name.unwrap_or_default(),
            momentum: input.momentum.unwrap_or(DEFAULT_MOMENTUM),
            stress: input.stress.unwrap_or(0),
            condition: input.condition.unwrap_or_default(),
            field_values: input.field_values.unwrap_or_default(),
            action_levels: input.action_levels.unwrap_or_default(),
            hidden: input.hidden.unwrap_or(true),
            color: input.color,
            image: input.image,
        }
    }

    fn normalize(self) -> Result<Self, SchemaError> {
        if let Some((action, level)) = self
            .action_levels
            .iter()
            .find(|(_, level)| **level > MAX_ACTION_LEVEL)
        {
            return Err(SchemaError::OutOfRange {
                kind: Self::KIND,
                field: format!("actionLevels.{action}"),
                reason: format!("{level} exceeds {MAX_ACTION_LEVEL}"),
            });
        }
        Ok(self)
    }
}

impl Character {
    /// Rating for `action`, zero when unset.
    pub fn action_level(&self, action: &str) -> u8 {
        self.action_levels.get(action).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_empty_input() {
        let c = Character::from_input(CharacterInput::default());
        assert_eq!(c.momentum, 2);
        assert_eq!(c.stress, 0);
        assert!(c.hidden);
        assert!(c.field_values.is_empty());
        assert!(c.action_levels.is_empty());
        assert_eq!(c.color, None);
    }

    #[test]
    fn test_parse_matches_from_input_defaults() {
        let parsed = Character::parse(&json!({})).unwrap();
        assert_eq!(parsed, Character::from_input(CharacterInput::default()));
    }

    #[test]
    fn test_camel_case_fields() {
        let c = Character::parse(&json!({
            "name": "Vex",
            "fieldValues": { "heritage": "Skovlan" },
            "actionLevels": { "hunt": 2 }
        }))
        .unwrap();
        assert_eq!(c.field_values["heritage"], "Skovlan");
        assert_eq!(c.action_level("hunt"), 2);
        assert_eq!(c.action_level("sway"), 0);

        let fields = c.to_fields().unwrap();
        assert!(fields.contains_key("fieldValues"));
        assert!(fields.contains_key("actionLevels"));
    }

    #[test]
    fn test_action_level_out_of_range() {
        let err = Character::parse(&json!({ "actionLevels": { "wreck": 5 } })).unwrap_err();
        assert!(matches!(err, SchemaError::OutOfRange { .. }));
    }

    #[test]
    fn test_wrong_type_rejected() {
        assert!(Character::parse(&json!({ "momentum": "lots" })).is_err());
        assert!(Character::parse(&json!({ "hidden": 1 })).is_err());
    }

    #[test]
    fn test_input_deserializes_partial_json() {
        let input: CharacterInput = serde_json::from_value(json!({ "name": "Ash" })).unwrap();
        let c = Character::from_input(input);
        assert_eq!(c.name, "Ash");
        assert_eq!(c.momentum, 2);
    }
}
