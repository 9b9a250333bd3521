//! Schema-validated collections over room storage slots.
//!
//! A collection is a named slot in the room document, viewed through a
//! [`Schema`]:
//!
//! ```text
//!   MapCollection<T>   slot = YMap  { id ─► record }   create / update / remove
//!   ListCollection<T>  slot = YArray [ record ... ]    append / update(_where) /
//!                                                      remove(_where) / move_item
//! ```
//!
//! Reads never fail. A missing slot reads as empty, a slot of the wrong kind
//! reads as empty with one warning, and items that fail validation are left
//! out with one warning each. Mutations are optimistic: they apply to the
//! local replica before returning and travel to peers as one incremental
//! update. The slot is created on first mutation and never overwritten.
//!
//! List indices always refer to positions among the *valid* items, the same
//! positions `items()` returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use charge_core::schema::{Entry, Patch, Schema, SchemaError};
use charge_core::signal::{Emitter, Notice};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::room::{RoomError, SlotKind, SlotRead, StoragePort, StorageTxn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectionError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error("no item '{id}' in '{slot}'")]
    NotFound { slot: &'static str, id: String },
    #[error("index {index} out of range for '{slot}' ({len} items)")]
    IndexOutOfRange {
        slot: &'static str,
        index: usize,
        len: usize,
    },
    #[error("stored item '{key}' in '{slot}' is invalid: {source}")]
    InvalidStored {
        slot: &'static str,
        key: String,
        source: SchemaError,
    },
    #[error("storage did not run the edit on '{slot}'")]
    NotApplied { slot: &'static str },
}

/// Extra validation applied after an item's schema.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<(), SchemaError> + Send + Sync>;

/// Sink for read-side warnings and mutation failures.
///
/// Each distinct problem is surfaced to the user once as a [`Notice`];
/// repeats are only logged at debug level.
#[derive(Clone)]
pub struct Diagnostics {
    notices: Emitter<Notice>,
    reported: Arc<Mutex<HashSet<String>>>,
}

impl Diagnostics {
    pub fn new(notices: Emitter<Notice>) -> Self {
        Self {
            notices,
            reported: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn first_time(&self, key: String) -> bool {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key)
    }

    pub fn invalid_item(&self, slot: &str, key: &str, err: &SchemaError) {
        if self.first_time(format!("item:{slot}:{key}:{err}")) {
            log::warn!("Skipping invalid item '{key}' in '{slot}': {err}");
            self.notices
                .emit(&Notice::warning(format!("Some {slot} could not be loaded")));
        } else {
            log::debug!("Still skipping invalid item '{key}' in '{slot}'");
        }
    }

    pub fn shape_mismatch(&self, slot: &str, expected: SlotKind, found: &str) {
        if self.first_time(format!("shape:{slot}:{found}")) {
            log::warn!("Slot '{slot}' holds a {found}, expected a {expected}; reading as empty");
            self.notices
                .emit(&Notice::warning(format!("The {slot} data is damaged and was not shown")));
        }
    }

    pub fn mutation_failed(&self, slot: &str, op: &str, err: &CollectionError) {
        log::error!("{op} on '{slot}' failed: {err}");
        self.notices
            .emit(&Notice::error(format!("Could not {op} {slot}: {err}")));
    }

    /// Forget reported problems so they are surfaced again.
    pub fn reset(&self) {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Emitter::new())
    }
}

/// Run an edit whose failures are not all storage errors.
///
/// Non-storage errors end the edit without rolling back, so edits check
/// everything before their first write.
fn transact<R>(
    port: &dyn StoragePort,
    slot: &'static str,
    mut edit: impl FnMut(&mut dyn StorageTxn) -> Result<R, CollectionError>,
) -> Result<R, CollectionError> {
    let mut outcome = None;
    port.mutate(&mut |txn| match edit(txn) {
        Ok(value) => {
            outcome = Some(Ok(value));
            Ok(())
        }
        Err(CollectionError::Room(e)) => Err(e),
        Err(e) => {
            outcome = Some(Err(e));
            Ok(())
        }
    })?;
    outcome.unwrap_or(Err(CollectionError::NotApplied { slot }))
}

fn decode<T: Schema>(value: &Value, validator: Option<&Validator<T>>) -> Result<T, SchemaError> {
    let item = T::parse(value)?;
    if let Some(validate) = validator {
        validate(&item)?;
    }
    Ok(item)
}

fn canonical<T: Schema>(item: T, validator: Option<&Validator<T>>) -> Result<T, SchemaError> {
    let item = item.normalize()?;
    if let Some(validate) = validator {
        validate(&item)?;
    }
    Ok(item)
}

fn patch_item<T: Schema>(
    current: &T,
    patch: &Patch,
    validator: Option<&Validator<T>>,
) -> Result<(T, Patch), SchemaError> {
    let (next, written) = current.patched(patch)?;
    if let Some(validate) = validator {
        validate(&next)?;
    }
    Ok((next, written))
}

// ─── Map collections ──────────────────────────────────────────────────

/// Items keyed by a generated id.
#[derive(Clone)]
pub struct MapCollection<T: Schema> {
    slot: &'static str,
    port: Arc<dyn StoragePort>,
    diagnostics: Diagnostics,
    validator: Option<Validator<T>>,
}

impl<T: Schema> MapCollection<T> {
    pub fn new(slot: &'static str, port: Arc<dyn StoragePort>, diagnostics: Diagnostics) -> Self {
        Self {
            slot,
            port,
            diagnostics,
            validator: None,
        }
    }

    pub fn with_validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&T) -> Result<(), SchemaError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validate));
        self
    }

    pub fn slot(&self) -> &'static str {
        self.slot
    }

    /// All valid items, ordered by id.
    pub fn items(&self) -> Vec<Entry<T>> {
        match self.port.read_slot(self.slot) {
            SlotRead::Missing => Vec::new(),
            SlotRead::Map(entries) => entries
                .into_iter()
                .filter_map(|(id, value)| match decode(&value, self.validator.as_ref()) {
                    Ok(item) => Some(Entry::new(id, item)),
                    Err(e) => {
                        self.diagnostics.invalid_item(self.slot, &id, &e);
                        None
                    }
                })
                .collect(),
            SlotRead::List(_) => {
                self.diagnostics
                    .shape_mismatch(self.slot, SlotKind::Map, "list");
                Vec::new()
            }
            SlotRead::WrongShape { found } => {
                self.diagnostics
                    .shape_mismatch(self.slot, SlotKind::Map, &found);
                Vec::new()
            }
        }
    }

    /// One item by id. Absent and invalid items are both `None`.
    pub fn item(&self, id: &str) -> Option<Entry<T>> {
        self.items().into_iter().find(|entry| entry.id == id)
    }

    /// Create an item from a draft, applying the schema's defaults.
    pub fn create(&self, input: T::Input) -> Result<Entry<T>, CollectionError> {
        self.insert(T::from_input(input))
    }

    /// Store an already built item under a fresh id.
    pub fn insert(&self, item: T) -> Result<Entry<T>, CollectionError> {
        let result = self.try_insert(item);
        self.report("create", result)
    }

    fn try_insert(&self, item: T) -> Result<Entry<T>, CollectionError> {
        let item = canonical(item, self.validator.as_ref())?;
        let fields = item.to_fields()?;
        let id = Uuid::new_v4().to_string();
        let slot = self.slot;
        transact(self.port.as_ref(), slot, |txn| {
            txn.ensure_slot(slot, SlotKind::Map)?;
            txn.map_insert(slot, &id, &fields)?;
            Ok(())
        })?;
        Ok(Entry::new(id, item))
    }

    /// Overwrite exactly the keys in `patch` on item `id`.
    pub fn update(&self, id: &str, patch: &Patch) -> Result<T, CollectionError> {
        let slot = self.slot;
        let validator = self.validator.as_ref();
        let result = transact(self.port.as_ref(), slot, |txn| {
            let raw = txn
                .map_get(slot, id)?
                .ok_or_else(|| CollectionError::NotFound {
                    slot,
                    id: id.to_string(),
                })?;
            let current = decode(&raw, validator).map_err(|source| {
                CollectionError::InvalidStored {
                    slot,
                    key: id.to_string(),
                    source,
                }
            })?;
            let (next, written) = patch_item(&current, patch, validator)?;
            txn.map_set_fields(slot, id, &written)?;
            Ok(next)
        });
        self.report("update", result)
    }

    /// Remove item `id`. Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) -> Result<bool, CollectionError> {
        let slot = self.slot;
        let result = transact(self.port.as_ref(), slot, |txn| {
            Ok(txn.map_remove(slot, id)?)
        });
        self.report("remove", result)
    }

    /// Receiver that changes whenever room storage changes.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.port.subscribe()
    }

    fn report<R>(&self, op: &str, result: Result<R, CollectionError>) -> Result<R, CollectionError> {
        if let Err(e) = &result {
            self.diagnostics.mutation_failed(self.slot, op, e);
        }
        result
    }
}

// ─── List collections ─────────────────────────────────────────────────

/// Items in a meaningful order.
#[derive(Clone)]
pub struct ListCollection<T: Schema> {
    slot: &'static str,
    port: Arc<dyn StoragePort>,
    diagnostics: Diagnostics,
    validator: Option<Validator<T>>,
}

impl<T: Schema> ListCollection<T> {
    pub fn new(slot: &'static str, port: Arc<dyn StoragePort>, diagnostics: Diagnostics) -> Self {
        Self {
            slot,
            port,
            diagnostics,
            validator: None,
        }
    }

    pub fn with_validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&T) -> Result<(), SchemaError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validate));
        self
    }

    pub fn slot(&self) -> &'static str {
        self.slot
    }

    /// All valid items in order.
    pub fn items(&self) -> Vec<T> {
        match self.port.read_slot(self.slot) {
            SlotRead::Missing => Vec::new(),
            SlotRead::List(values) => values
                .iter()
                .enumerate()
                .filter_map(|(index, value)| match decode(value, self.validator.as_ref()) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        self.diagnostics
                            .invalid_item(self.slot, &index.to_string(), &e);
                        None
                    }
                })
                .collect(),
            SlotRead::Map(_) => {
                self.diagnostics
                    .shape_mismatch(self.slot, SlotKind::List, "map");
                Vec::new()
            }
            SlotRead::WrongShape { found } => {
                self.diagnostics
                    .shape_mismatch(self.slot, SlotKind::List, &found);
                Vec::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Valid items with their raw positions in the slot.
    fn valid_in(&self, txn: &dyn StorageTxn) -> Result<Vec<(u32, T)>, RoomError> {
        let values = txn.list_values(self.slot)?;
        Ok(values
            .iter()
            .enumerate()
            .filter_map(|(raw, value)| {
                decode(value, self.validator.as_ref())
                    .ok()
                    .map(|item| (raw as u32, item))
            })
            .collect())
    }

    fn out_of_range(&self, index: usize, len: usize) -> CollectionError {
        CollectionError::IndexOutOfRange {
            slot: self.slot,
            index,
            len,
        }
    }

    /// Append an item built from a draft.
    pub fn append(&self, input: T::Input) -> Result<T, CollectionError> {
        self.push(T::from_input(input))
    }

    /// Append an already built item.
    pub fn push(&self, item: T) -> Result<T, CollectionError> {
        let result = self.try_push(item, None);
        self.report("add", result)
    }

    /// Append, then drop the oldest entries until at most `max` remain.
    pub fn push_bounded(&self, item: T, max: usize) -> Result<T, CollectionError> {
        let result = self.try_push(item, Some(max));
        self.report("add", result)
    }

    pub fn append_bounded(&self, input: T::Input, max: usize) -> Result<T, CollectionError> {
        self.push_bounded(T::from_input(input), max)
    }

    fn try_push(&self, item: T, max: Option<usize>) -> Result<T, CollectionError> {
        let item = canonical(item, self.validator.as_ref())?;
        let fields = item.to_fields()?;
        let slot = self.slot;
        transact(self.port.as_ref(), slot, |txn| {
            txn.ensure_slot(slot, SlotKind::List)?;
            txn.list_push(slot, &fields)?;
            if let Some(max) = max {
                let len = txn.list_values(slot)?.len();
                if len > max {
                    let excess = (len - max) as u32;
                    txn.list_remove_range(slot, 0, excess)?;
                    log::debug!("Trimmed {excess} oldest item(s) from '{slot}'");
                }
            }
            Ok(())
        })?;
        Ok(item)
    }

    /// Overwrite exactly the keys in `patch` on the item at `index`.
    pub fn update(&self, index: usize, patch: &Patch) -> Result<T, CollectionError> {
        let slot = self.slot;
        let validator = self.validator.as_ref();
        let result = transact(self.port.as_ref(), slot, |txn| {
            let valid = self.valid_in(txn)?;
            let (raw, current) = valid
                .get(index)
                .ok_or_else(|| self.out_of_range(index, valid.len()))?;
            let (next, written) = patch_item(current, patch, validator)?;
            txn.list_set_fields(slot, *raw, &written)?;
            Ok(next)
        });
        self.report("update", result)
    }

    /// Patch every valid item matching `predicate`. Returns how many matched.
    pub fn update_where<P>(&self, predicate: P, patch: &Patch) -> Result<usize, CollectionError>
    where
        P: Fn(&T) -> bool,
    {
        let slot = self.slot;
        let validator = self.validator.as_ref();
        let result = transact(self.port.as_ref(), slot, |txn| {
            let writes = self
                .valid_in(txn)?
                .into_iter()
                .filter(|(_, item)| predicate(item))
                .map(|(raw, item)| patch_item(&item, patch, validator).map(|(_, w)| (raw, w)))
                .collect::<Result<Vec<_>, _>>()?;
            for (raw, written) in &writes {
                txn.list_set_fields(slot, *raw, written)?;
            }
            Ok(writes.len())
        });
        self.report("update", result)
    }

    /// Remove the item at `index`, returning it.
    pub fn remove(&self, index: usize) -> Result<T, CollectionError> {
        let slot = self.slot;
        let result = transact(self.port.as_ref(), slot, |txn| {
            let mut valid = self.valid_in(txn)?;
            if index >= valid.len() {
                return Err(self.out_of_range(index, valid.len()));
            }
            let (raw, item) = valid.swap_remove(index);
            txn.list_remove_range(slot, raw, 1)?;
            Ok(item)
        });
        self.report("remove", result)
    }

    /// Remove every valid item matching `predicate`. Returns how many.
    pub fn remove_where<P>(&self, predicate: P) -> Result<usize, CollectionError>
    where
        P: Fn(&T) -> bool,
    {
        let slot = self.slot;
        let result = transact(self.port.as_ref(), slot, |txn| {
            let doomed: Vec<u32> = self
                .valid_in(txn)?
                .into_iter()
                .filter(|(_, item)| predicate(item))
                .map(|(raw, _)| raw)
                .collect();
            for raw in doomed.iter().rev() {
                txn.list_remove_range(slot, *raw, 1)?;
            }
            Ok(doomed.len())
        });
        self.report("remove", result)
    }

    /// Move the item at `from` so it ends up at `to`. Other items keep
    /// their relative order.
    pub fn move_item(&self, from: usize, to: usize) -> Result<(), CollectionError> {
        let slot = self.slot;
        let result = transact(self.port.as_ref(), slot, |txn| {
            let valid = self.valid_in(txn)?;
            for index in [from, to] {
                if index >= valid.len() {
                    return Err(self.out_of_range(index, valid.len()));
                }
            }
            if from != to {
                txn.list_move(slot, valid[from].0, valid[to].0)?;
            }
            Ok(())
        });
        self.report("reorder", result)
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.port.subscribe()
    }

    fn report<R>(&self, op: &str, result: Result<R, CollectionError>) -> Result<R, CollectionError> {
        if let Err(e) = &result {
            self.diagnostics.mutation_failed(self.slot, op, e);
        }
        result
    }
}
