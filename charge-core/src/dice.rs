//! Dice rolls and the roll log.
//!
//! A roll of `n` dice keeps the highest result. A roll with an empty pool
//! rolls two dice and keeps the lowest (a "desperate" roll).

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::schema::{Schema, SchemaError};

/// Entries retained in a world's roll log.
pub const DICE_LOG_RETENTION: usize = 100;

pub const DEFAULT_SIDES: u32 = 6;

/// Dice rolled when the pool is empty.
const ZERO_POOL_DICE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Die {
    pub sides: u32,
    pub result: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Highest,
    Lowest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceRoll {
    pub dice: Vec<Die>,
    pub result_type: ResultType,
    #[serde(default)]
    pub intent: String,
    pub rolled_by: String,
    /// RFC 3339 UTC timestamp.
    pub rolled_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiceRollInput {
    pub pool_size: u32,
    pub sides: Option<u32>,
    pub intent: String,
    pub rolled_by: String,
}

impl DiceRoll {
    /// Roll `input` with the given random source.
    pub fn roll_with<R: Rng + ?Sized>(input: DiceRollInput, rng: &mut R) -> Self {
        let sides = input.sides.unwrap_or(DEFAULT_SIDES).max(1);
        let (count, result_type) = if input.pool_size == 0 {
            (ZERO_POOL_DICE, ResultType::Lowest)
        } else {
            (input.pool_size, ResultType::Highest)
        };
        let dice = (0..count)
            .map(|_| Die {
                sides,
                result: rng.gen_range(1..=sides),
            })
            .collect();
        Self {
            dice,
            result_type,
            intent: input.intent,
            rolled_by: input.rolled_by,
            rolled_at: now_rfc3339(),
        }
    }

    /// The kept die result, `None` for a roll without dice.
    pub fn outcome(&self) -> Option<u32> {
        let results = self.dice.iter().map(|d| d.result);
        match self.result_type {
            ResultType::Highest => results.max(),
            ResultType::Lowest => results.min(),
        }
    }

    pub fn rolled_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.rolled_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Schema for DiceRoll {
    type Input = DiceRollInput;
    const KIND: &'static str = "dice roll";

    fn from_input(input: DiceRollInput) -> Self {
        Self::roll_with(input, &mut rand::thread_rng())
    }

    fn normalize(self) -> Result<Self, SchemaError> {
        if let Some(die) = self
            .dice
            .iter()
            .find(|d| d.sides == 0 || d.result == 0 || d.result > d.sides)
        {
            return Err(SchemaError::OutOfRange {
                kind: Self::KIND,
                field: "dice".into(),
                reason: format!("result {} on a d{}", die.result, die.sides),
            });
        }
        if DateTime::parse_from_rfc3339(&self.rolled_at).is_err() {
            return Err(SchemaError::Invalid {
                kind: Self::KIND,
                reason: format!("rolledAt '{}' is not an RFC 3339 timestamp", self.rolled_at),
            });
        }
        Ok(self)
    }
}

/// A request, raised anywhere in the UI, to pre-fill the roll form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollIntent {
    pub pool_size: u32,
    pub intent: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn input(pool_size: u32) -> DiceRollInput {
        DiceRollInput {
            pool_size,
            intent: "pick the lock".into(),
            rolled_by: "user-1".into(),
            ..DiceRollInput::default()
        }
    }

    #[test]
    fn test_zero_pool_rolls_two_lowest() {
        let mut rng = StdRng::seed_from_u64(7);
        let roll = DiceRoll::roll_with(input(0), &mut rng);
        assert_eq!(roll.dice.len(), 2);
        assert_eq!(roll.result_type, ResultType::Lowest);
        let min = roll.dice.iter().map(|d| d.result).min();
        assert_eq!(roll.outcome(), min);
    }

    #[test]
    fn test_pool_rolls_n_highest() {
        let mut rng = StdRng::seed_from_u64(7);
        let roll = DiceRoll::roll_with(input(4), &mut rng);
        assert_eq!(roll.dice.len(), 4);
        assert_eq!(roll.result_type, ResultType::Highest);
        assert!(roll.dice.iter().all(|d| d.sides == 6 && (1..=6).contains(&d.result)));
    }

    #[test]
    fn test_roll_round_trips_through_parse() {
        let roll = DiceRoll::from_input(input(3));
        let value = serde_json::to_value(&roll).unwrap();
        assert_eq!(value["resultType"], "highest");
        assert_eq!(DiceRoll::parse(&value).unwrap(), roll);
        assert!(roll.rolled_at().is_some());
    }

    #[test]
    fn test_impossible_result_rejected() {
        let value = json!({
            "dice": [{ "sides": 6, "result": 7 }],
            "resultType": "highest",
            "rolledBy": "u",
            "rolledAt": "2024-01-01T00:00:00Z"
        });
        assert!(DiceRoll::parse(&value).is_err());
    }

    #[test]
    fn test_bad_result_type_rejected() {
        let value = json!({
            "dice": [],
            "resultType": "median",
            "rolledBy": "u",
            "rolledAt": "2024-01-01T00:00:00Z"
        });
        assert!(DiceRoll::parse(&value).is_err());
    }
}
