//! Progress clocks.
//!
//! Progress is clamped into `[0, max_progress]` whenever a clock is decoded,
//! so every clock read back from storage satisfies the range invariant no
//! matter what a client wrote.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{Schema, SchemaError};

pub const DEFAULT_MAX_PROGRESS: i32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clock {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub progress: i32,
    #[serde(default = "default_max_progress")]
    pub max_progress: i32,
}

fn default_max_progress() -> i32 {
    DEFAULT_MAX_PROGRESS
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClockInput {
    pub name: Option<String>,
    pub progress: Option<i32>,
    pub max_progress: Option<i32>,
}

impl Schema for Clock {
    type Input = ClockInput;
    const KIND: &'static str = "clock";

    fn from_input(input: ClockInput) -> Self {
        let max_progress = input.max_progress.unwrap_or(DEFAULT_MAX_PROGRESS).max(1);
        Self {
            id: Uuid::new_v4().to_string(),
            name: input.name.unwrap_or_default(),
            progress: input.progress.unwrap_or(0).clamp(0, max_progress),
            max_progress,
        }
    }

    fn normalize(mut self) -> Result<Self, SchemaError> {
        if self.max_progress < 1 {
            return Err(SchemaError::OutOfRange {
                kind: Self::KIND,
                field: "maxProgress".into(),
                reason: format!("{} is below 1", self.max_progress),
            });
        }
        self.progress = self.progress.clamp(0, self.max_progress);
        Ok(self)
    }
}

impl Clock {
    pub fn is_complete(&self) -> bool {
        self.progress >= self.max_progress
    }
}
