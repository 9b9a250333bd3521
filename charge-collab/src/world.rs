//! The collections that make up one world's room.

use std::sync::Arc;

use charge_core::card::BlockRegistry;
use charge_core::dice::DICE_LOG_RETENTION;
use charge_core::signal::RoomSignals;
use charge_core::{Card, Character, Clock, DiceRoll, DiceRollInput, GalleryItem};
use rand::Rng;
use uuid::Uuid;

use crate::collection::{CollectionError, Diagnostics, ListCollection, MapCollection};
use crate::room::StoragePort;

pub const CHARACTERS_SLOT: &str = "characters";
pub const CLOCKS_SLOT: &str = "clocks";
pub const DICE_SLOT: &str = "diceRolls";
pub const GALLERY_SLOT: &str = "gallery";
pub const CARDS_SLOT: &str = "cards";

/// The roll log: append-only, newest last, bounded.
#[derive(Clone)]
pub struct DiceLog {
    rolls: ListCollection<DiceRoll>,
    retention: usize,
}

impl DiceLog {
    pub fn new(rolls: ListCollection<DiceRoll>) -> Self {
        Self {
            rolls,
            retention: DICE_LOG_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Roll and record the result.
    pub fn roll(&self, input: DiceRollInput) -> Result<DiceRoll, CollectionError> {
        self.roll_with(input, &mut rand::thread_rng())
    }

    pub fn roll_with<R: Rng + ?Sized>(
        &self,
        input: DiceRollInput,
        rng: &mut R,
    ) -> Result<DiceRoll, CollectionError> {
        let roll = DiceRoll::roll_with(input, rng);
        log::debug!(
            "{} rolled {} dice for '{}': {:?}",
            roll.rolled_by,
            roll.dice.len(),
            roll.intent,
            roll.outcome()
        );
        self.rolls.push_bounded(roll, self.retention)
    }

    /// Rolls oldest first.
    pub fn items(&self) -> Vec<DiceRoll> {
        self.rolls.items()
    }

    pub fn latest(&self) -> Option<DiceRoll> {
        self.items().pop()
    }

    pub fn collection(&self) -> &ListCollection<DiceRoll> {
        &self.rolls
    }
}

/// Typed access to every collection in a world.
#[derive(Clone)]
pub struct WorldCollections {
    pub characters: MapCollection<Character>,
    pub clocks: ListCollection<Clock>,
    pub dice: DiceLog,
    pub gallery: ListCollection<GalleryItem>,
    pub cards: MapCollection<Card>,
    world_id: Uuid,
}

impl WorldCollections {
    pub fn new(port: Arc<dyn StoragePort>, signals: &RoomSignals) -> Self {
        Self::with_blocks(port, signals, BlockRegistry::default())
    }

    /// Bind with a custom set of card block kinds.
    pub fn with_blocks(
        port: Arc<dyn StoragePort>,
        signals: &RoomSignals,
        blocks: BlockRegistry,
    ) -> Self {
        let diagnostics = Diagnostics::new(signals.notices.clone());
        let world_id = port.world_id();
        Self {
            characters: MapCollection::new(CHARACTERS_SLOT, port.clone(), diagnostics.clone()),
            clocks: ListCollection::new(CLOCKS_SLOT, port.clone(), diagnostics.clone()),
            dice: DiceLog::new(ListCollection::new(DICE_SLOT, port.clone(), diagnostics.clone())),
            gallery: ListCollection::new(GALLERY_SLOT, port.clone(), diagnostics.clone()),
            cards: MapCollection::new(CARDS_SLOT, port, diagnostics)
                .with_validator(move |card: &Card| blocks.validate_card(card)),
            world_id,
        }
    }

    pub fn world_id(&self) -> Uuid {
        self.world_id
    }
}
