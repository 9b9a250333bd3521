//! # charge-core: Records and signals for Charge Worlds
//!
//! Plain, synchronous building blocks shared by the collaboration layer and
//! the server: validated entity records and in-process pub/sub.
//!
//! ## Modules
//!
//! - [`schema`]: `Schema` trait: defaults, decoding, partial patches
//! - [`character`], [`clock`], [`dice`], [`card`], [`gallery`]: entity records
//! - [`membership`]: world roles
//! - [`signal`]: `Emitter`, `Store` and per-room `RoomSignals`

pub mod schema;
pub mod character;
pub mod clock;
pub mod dice;
pub mod card;
pub mod gallery;
pub mod membership;
pub mod signal;

pub use schema::{Entry, Patch, Schema, SchemaError, patch};
pub use character::{Character, CharacterInput};
pub use clock::{Clock, ClockInput};
pub use dice::{DICE_LOG_RETENTION, DiceRoll, DiceRollInput, Die, ResultType, RollIntent};
pub use card::{BlockRegistry, Card, CardBlock, CardInput, ImageBlock, TextBlock};
pub use gallery::{GalleryItem, GalleryItemInput};
pub use membership::{Membership, Role};
pub use signal::{Emitter, Notice, NoticeLevel, RoomSignals, Store, Subscription};
