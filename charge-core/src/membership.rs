//! World membership roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user's role in one world. Users without a membership record are
/// spectators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Owner,
    Player,
    Spectator,
}

impl Role {
    /// Whether the role may write to shared room storage.
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Owner | Role::Player)
    }

    pub fn is_owner(self) -> bool {
        self == Role::Owner
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "OWNER",
            Role::Player => "PLAYER",
            Role::Spectator => "SPECTATOR",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OWNER" => Ok(Role::Owner),
            "PLAYER" => Ok(Role::Player),
            "SPECTATOR" => Ok(Role::Spectator),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// One (world, user) membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub world_id: Uuid,
    pub user_id: String,
    pub role: Role,
}
