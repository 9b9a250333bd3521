//! Room storage: the shared document behind one world.
//!
//! ```text
//!   Doc ── root map "storage"
//!            ├── "characters" : YMap  { id ─► YMap { field ─► Any } }
//!            ├── "clocks"     : YArray [ YMap { field ─► Any } ... ]
//!            └── ...
//! ```
//!
//! Collections never touch yrs directly. They go through [`StoragePort`],
//! which decodes each named slot into a [`SlotRead`] once at the boundary
//! and exposes structural edits through [`StorageTxn`]. [`Replica`] is the
//! yrs-backed implementation used by clients and by the sync server.
//!
//! Items are stored as nested maps of fields, so concurrent edits to
//! different fields of the same item merge instead of overwriting each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map as JsonMap, Number, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector,
    Transact, TransactionMut, Update,
};

use crate::optimistic::{PendingLog, PendingOp, DEFAULT_PENDING_CAPACITY};

/// Name of the root map holding every collection slot.
pub const ROOT: &str = "storage";

/// Largest integer an f64 represents exactly.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Container kind of a collection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Map,
    List,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Map => f.write_str("map"),
            SlotKind::List => f.write_str("list"),
        }
    }
}

/// Typed decode of one named slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotRead {
    Missing,
    /// Entries sorted by key.
    Map(Vec<(String, Value)>),
    List(Vec<Value>),
    WrongShape { found: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoomError {
    #[error("slot '{slot}' holds a {found}, expected a {expected}")]
    WrongShape {
        slot: String,
        expected: SlotKind,
        found: String,
    },
    #[error("slot '{slot}' does not exist")]
    MissingSlot { slot: String },
    #[error("index {index} out of bounds for slot '{slot}' of length {len}")]
    IndexOutOfBounds { slot: String, index: u32, len: u32 },
    #[error("item '{key}' in slot '{slot}' is not a record")]
    NotARecord { slot: String, key: String },
    #[error("malformed update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

/// Reads and structural edits inside one storage transaction.
pub trait StorageTxn {
    fn read_slot(&self, slot: &str) -> SlotRead;

    /// Create `slot` as an empty container of `kind` if it does not exist.
    /// An existing slot is never replaced; one of the wrong kind is an error.
    fn ensure_slot(&mut self, slot: &str, kind: SlotKind) -> Result<(), RoomError>;

    fn map_get(&self, slot: &str, key: &str) -> Result<Option<Value>, RoomError>;
    fn map_insert(
        &mut self,
        slot: &str,
        key: &str,
        fields: &JsonMap<String, Value>,
    ) -> Result<(), RoomError>;
    /// Overwrite the given fields of an existing record.
    fn map_set_fields(
        &mut self,
        slot: &str,
        key: &str,
        fields: &JsonMap<String, Value>,
    ) -> Result<(), RoomError>;
    fn map_remove(&mut self, slot: &str, key: &str) -> Result<bool, RoomError>;

    fn list_values(&self, slot: &str) -> Result<Vec<Value>, RoomError>;
    fn list_insert(
        &mut self,
        slot: &str,
        index: u32,
        fields: &JsonMap<String, Value>,
    ) -> Result<(), RoomError>;
    fn list_push(&mut self, slot: &str, fields: &JsonMap<String, Value>) -> Result<(), RoomError>;
    fn list_set_fields(
        &mut self,
        slot: &str,
        index: u32,
        fields: &JsonMap<String, Value>,
    ) -> Result<(), RoomError>;
    fn list_remove_range(&mut self, slot: &str, index: u32, len: u32) -> Result<(), RoomError>;
    /// Move the element at `from` so that it ends up at index `to`.
    fn list_move(&mut self, slot: &str, from: u32, to: u32) -> Result<(), RoomError>;
}

/// The persistence port collections are written against.
pub trait StoragePort: Send + Sync {
    fn world_id(&self) -> Uuid;
    fn read_slot(&self, slot: &str) -> SlotRead;
    /// Run `edit` in one transaction. Its changes are applied locally at once
    /// and propagated as a single incremental update.
    fn mutate(
        &self,
        edit: &mut dyn FnMut(&mut dyn StorageTxn) -> Result<(), RoomError>,
    ) -> Result<(), RoomError>;
    /// Version counter bumped on every local or remote change.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

// ─── Value conversion ─────────────────────────────────────────────────

/// Convert a JSON value into a yrs `Any`.
///
/// Integers within the exact range of an f64 are stored as numbers so that
/// every client reads them back the same way.
pub fn value_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => number_to_any(n),
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => Any::Array(items.iter().map(value_to_any).collect()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_any(v)))
                .collect::<HashMap<String, Any>>(),
        )),
    }
}

fn number_to_any(n: &Number) -> Any {
    if let Some(i) = n.as_i64() {
        if i.abs() <= MAX_SAFE_INTEGER {
            Any::Number(i as f64)
        } else {
            Any::BigInt(i)
        }
    } else if let Some(u) = n.as_u64() {
        Any::BigInt(i64::try_from(u).unwrap_or(i64::MAX))
    } else {
        Any::Number(n.as_f64().unwrap_or(0.0))
    }
}

/// Convert a yrs `Any` into JSON. Integral numbers come back as integers.
#[allow(unreachable_patterns)]
pub fn any_to_value(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => float_to_value(*f),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_value).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), any_to_value(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn float_to_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER as f64 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn out_to_value<T: ReadTxn>(out: &Out, txn: &T) -> Value {
    match out {
        Out::Any(any) => any_to_value(any),
        other => any_to_value(&other.to_json(txn)),
    }
}

fn describe(out: &Out) -> String {
    let name = match out {
        Out::YMap(_) => "map",
        Out::YArray(_) => "list",
        Out::YText(_) => "text",
        Out::Any(Any::Null) | Out::Any(Any::Undefined) => "null",
        Out::Any(Any::Bool(_)) => "boolean",
        Out::Any(Any::Number(_)) | Out::Any(Any::BigInt(_)) => "number",
        Out::Any(Any::String(_)) => "string",
        Out::Any(Any::Array(_)) => "plain array",
        Out::Any(Any::Map(_)) => "plain object",
        _ => "shared value",
    };
    name.to_string()
}

fn record_prelim(fields: &JsonMap<String, Value>) -> MapPrelim {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), value_to_any(v)))
        .collect()
}

fn read_slot_in<T: ReadTxn>(root: &MapRef, txn: &T, slot: &str) -> SlotRead {
    match root.get(txn, slot) {
        None => SlotRead::Missing,
        Some(Out::YMap(map)) => {
            let mut entries: Vec<(String, Value)> = map
                .iter(txn)
                .map(|(key, out)| (key.to_string(), out_to_value(&out, txn)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            SlotRead::Map(entries)
        }
        Some(Out::YArray(array)) => {
            SlotRead::List(array.iter(txn).map(|out| out_to_value(&out, txn)).collect())
        }
        Some(other) => SlotRead::WrongShape {
            found: describe(&other),
        },
    }
}

// ─── Transaction adapter ──────────────────────────────────────────────

struct DocTxn<'a, 'doc> {
    txn: &'a mut TransactionMut<'doc>,
    root: &'a MapRef,
    changed: bool,
}

impl DocTxn<'_, '_> {
    fn slot_map(&self, slot: &str) -> Result<Option<MapRef>, RoomError> {
        match self.root.get(&*self.txn, slot) {
            None => Ok(None),
            Some(Out::YMap(map)) => Ok(Some(map)),
            Some(other) => Err(RoomError::WrongShape {
                slot: slot.to_string(),
                expected: SlotKind::Map,
                found: describe(&other),
            }),
        }
    }

    fn slot_array(&self, slot: &str) -> Result<Option<ArrayRef>, RoomError> {
        match self.root.get(&*self.txn, slot) {
            None => Ok(None),
            Some(Out::YArray(array)) => Ok(Some(array)),
            Some(other) => Err(RoomError::WrongShape {
                slot: slot.to_string(),
                expected: SlotKind::List,
                found: describe(&other),
            }),
        }
    }

    fn require_map(&self, slot: &str) -> Result<MapRef, RoomError> {
        self.slot_map(slot)?.ok_or_else(|| RoomError::MissingSlot {
            slot: slot.to_string(),
        })
    }

    fn require_array(&self, slot: &str) -> Result<ArrayRef, RoomError> {
        self.slot_array(slot)?.ok_or_else(|| RoomError::MissingSlot {
            slot: slot.to_string(),
        })
    }

    fn set_fields(&mut self, record: &MapRef, fields: &JsonMap<String, Value>) {
        for (key, value) in fields {
            record.insert(&mut *self.txn, key.as_str(), value_to_any(value));
        }
        if !fields.is_empty() {
            self.changed = true;
        }
    }
}

impl StorageTxn for DocTxn<'_, '_> {
    fn read_slot(&self, slot: &str) -> SlotRead {
        read_slot_in(self.root, &*self.txn, slot)
    }

    fn ensure_slot(&mut self, slot: &str, kind: SlotKind) -> Result<(), RoomError> {
        match (self.root.get(&*self.txn, slot), kind) {
            (Some(Out::YMap(_)), SlotKind::Map) | (Some(Out::YArray(_)), SlotKind::List) => Ok(()),
            (Some(other), _) => Err(RoomError::WrongShape {
                slot: slot.to_string(),
                expected: kind,
                found: describe(&other),
            }),
            (None, SlotKind::Map) => {
                self.root
                    .insert(&mut *self.txn, slot, record_prelim(&JsonMap::new()));
                self.changed = true;
                log::trace!("Initialized map slot '{slot}'");
                Ok(())
            }
            (None, SlotKind::List) => {
                self.root
                    .insert(&mut *self.txn, slot, ArrayPrelim::from(Vec::<Any>::new()));
                self.changed = true;
                log::trace!("Initialized list slot '{slot}'");
                Ok(())
            }
        }
    }

    fn map_get(&self, slot: &str, key: &str) -> Result<Option<Value>, RoomError> {
        Ok(self
            .slot_map(slot)?
            .and_then(|map| map.get(&*self.txn, key))
            .map(|out| out_to_value(&out, &*self.txn)))
    }

    fn map_insert(
        &mut self,
        slot: &str,
        key: &str,
        fields: &JsonMap<String, Value>,
    ) -> Result<(), RoomError> {
        let map = self.require_map(slot)?;
        map.insert(&mut *self.txn, key, record_prelim(fields));
        self.changed = true;
        log::trace!("Inserted '{key}' into '{slot}'");
        Ok(())
    }

    fn map_set_fields(
        &mut self,
        slot: &str,
        key: &str,
        fields: &JsonMap<String, Value>,
    ) -> Result<(), RoomError> {
        let map = self.require_map(slot)?;
        match map.get(&*self.txn, key) {
            Some(Out::YMap(record)) => {
                self.set_fields(&record, fields);
                log::trace!("Updated {} field(s) of '{key}' in '{slot}'", fields.len());
                Ok(())
            }
            _ => Err(RoomError::NotARecord {
                slot: slot.to_string(),
                key: key.to_string(),
            }),
        }
    }

    fn map_remove(&mut self, slot: &str, key: &str) -> Result<bool, RoomError> {
        let Some(map) = self.slot_map(slot)? else {
            return Ok(false);
        };
        let removed = map.remove(&mut *self.txn, key).is_some();
        if removed {
            self.changed = true;
            log::trace!("Removed '{key}' from '{slot}'");
        }
        Ok(removed)
    }

    fn list_values(&self, slot: &str) -> Result<Vec<Value>, RoomError> {
        Ok(match self.slot_array(slot)? {
            Some(array) => array
                .iter(&*self.txn)
                .map(|out| out_to_value(&out, &*self.txn))
                .collect(),
            None => Vec::new(),
        })
    }

    fn list_insert(
        &mut self,
        slot: &str,
        index: u32,
        fields: &JsonMap<String, Value>,
    ) -> Result<(), RoomError> {
        let array = self.require_array(slot)?;
        let len = array.len(&*self.txn);
        if index > len {
            return Err(RoomError::IndexOutOfBounds {
                slot: slot.to_string(),
                index,
                len,
            });
        }
        array.insert(&mut *self.txn, index, record_prelim(fields));
        self.changed = true;
        Ok(())
    }

    fn list_push(&mut self, slot: &str, fields: &JsonMap<String, Value>) -> Result<(), RoomError> {
        let array = self.require_array(slot)?;
        array.push_back(&mut *self.txn, record_prelim(fields));
        self.changed = true;
        log::trace!("Appended to '{slot}'");
        Ok(())
    }

    fn list_set_fields(
        &mut self,
        slot: &str,
        index: u32,
        fields: &JsonMap<String, Value>,
    ) -> Result<(), RoomError> {
        let array = self.require_array(slot)?;
        match array.get(&*self.txn, index) {
            Some(Out::YMap(record)) => {
                self.set_fields(&record, fields);
                Ok(())
            }
            Some(_) => Err(RoomError::NotARecord {
                slot: slot.to_string(),
                key: index.to_string(),
            }),
            None => Err(RoomError::IndexOutOfBounds {
                slot: slot.to_string(),
                index,
                len: array.len(&*self.txn),
            }),
        }
    }

    fn list_remove_range(&mut self, slot: &str, index: u32, len: u32) -> Result<(), RoomError> {
        if len == 0 {
            return Ok(());
        }
        let array = self.require_array(slot)?;
        let current = array.len(&*self.txn);
        if index.saturating_add(len) > current {
            return Err(RoomError::IndexOutOfBounds {
                slot: slot.to_string(),
                index: index.saturating_add(len) - 1,
                len: current,
            });
        }
        array.remove_range(&mut *self.txn, index, len);
        self.changed = true;
        log::trace!("Removed {len} item(s) at {index} from '{slot}'");
        Ok(())
    }

    fn list_move(&mut self, slot: &str, from: u32, to: u32) -> Result<(), RoomError> {
        let array = self.require_array(slot)?;
        let len = array.len(&*self.txn);
        for index in [from, to] {
            if index >= len {
                return Err(RoomError::IndexOutOfBounds {
                    slot: slot.to_string(),
                    index,
                    len,
                });
            }
        }
        if from == to {
            return Ok(());
        }
        // yrs takes the insertion point as seen before the element is lifted out.
        let target = if from < to { to + 1 } else { to };
        array.move_to(&mut *self.txn, from, target);
        self.changed = true;
        log::trace!("Moved item {from} -> {to} in '{slot}'");
        Ok(())
    }
}

// ─── Replica ──────────────────────────────────────────────────────────

struct DocState {
    doc: Doc,
    root: MapRef,
}

/// A yrs replica of one world's room storage.
///
/// All document access is serialized behind one lock. Local edits are
/// recorded in the pending log and queued on the outbox for whichever
/// transport is attached.
pub struct Replica {
    world_id: Uuid,
    state: Mutex<DocState>,
    version: watch::Sender<u64>,
    pending: Mutex<PendingLog>,
    outbox_tx: mpsc::UnboundedSender<PendingOp>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingOp>>>,
}

impl Replica {
    pub fn new(world_id: Uuid) -> Self {
        Self::with_pending_capacity(world_id, DEFAULT_PENDING_CAPACITY)
    }

    pub fn with_pending_capacity(world_id: Uuid, capacity: usize) -> Self {
        let doc = Doc::new();
        let root = doc.get_or_insert_map(ROOT);
        let (version, _) = watch::channel(0);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Self {
            world_id,
            state: Mutex::new(DocState { doc, root }),
            version,
            pending: Mutex::new(PendingLog::new(capacity)),
            outbox_tx,
            outbox_rx: Mutex::new(Some(outbox_rx)),
        }
    }

    /// Build a replica from a full encoded state.
    pub fn from_state(world_id: Uuid, state: &[u8]) -> Result<Self, RoomError> {
        let replica = Self::new(world_id);
        replica.apply_remote(state)?;
        Ok(replica)
    }

    fn lock_state(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingLog> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Current change counter.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Take the stream of local updates. Only the first caller gets it.
    pub fn take_outbox(&self) -> Option<mpsc::UnboundedReceiver<PendingOp>> {
        self.outbox_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Apply an update received from elsewhere. Re-applying is a no-op.
    pub fn apply_remote(&self, update: &[u8]) -> Result<(), RoomError> {
        let update = Update::decode_v1(update).map_err(|e| RoomError::Decode(e.to_string()))?;
        {
            let state = self.lock_state();
            let mut txn = state.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| RoomError::Apply(e.to_string()))?;
        }
        self.bump();
        Ok(())
    }

    /// Encoded state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let state = self.lock_state();
        let txn = state.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// The full document as one update.
    pub fn encode_state(&self) -> Vec<u8> {
        let state = self.lock_state();
        let txn = state.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that a peer with `remote_sv` lacks.
    pub fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, RoomError> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| RoomError::Decode(e.to_string()))?;
        let state = self.lock_state();
        let txn = state.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// This replica's own clock.
    pub fn local_clock(&self) -> u64 {
        let state = self.lock_state();
        let txn = state.doc.transact();
        txn.state_vector().get(&state.doc.client_id()) as u64
    }

    /// Drop pending ops already covered by an authoritative state vector.
    pub fn reconcile(&self, authoritative_sv: &[u8]) -> Result<usize, RoomError> {
        let sv = StateVector::decode_v1(authoritative_sv)
            .map_err(|e| RoomError::Decode(e.to_string()))?;
        let confirmed = {
            let state = self.lock_state();
            sv.get(&state.doc.client_id()) as u64
        };
        let removed = self.lock_pending().reconcile(confirmed);
        if removed > 0 {
            log::debug!("Reconciled {removed} pending op(s) at clock {confirmed}");
        }
        Ok(removed)
    }

    /// After the pending log evicted ops, queue one op carrying everything
    /// the server lacks so replaying the log covers every local edit again.
    ///
    /// Returns `None` when nothing was evicted since the last call.
    pub fn catch_up(&self, authoritative_sv: &[u8]) -> Result<Option<PendingOp>, RoomError> {
        if !self.lock_pending().take_gap() {
            return Ok(None);
        }
        let update = self.diff(authoritative_sv)?;
        // Lost ops may be deletions, which never show up in a state vector,
        // so only the server's ack confirms this one.
        let op = PendingOp {
            op_id: Uuid::new_v4(),
            clock: self.local_clock(),
            advances_clock: false,
            update,
        };
        log::warn!("Pending log overflowed, queueing full catch-up {}", op.op_id);
        self.lock_pending().push(op.clone());
        Ok(Some(op))
    }

    pub fn acknowledge(&self, op_id: Uuid) -> bool {
        self.lock_pending().acknowledge(op_id)
    }

    pub fn unconfirmed(&self) -> Vec<PendingOp> {
        self.lock_pending().unconfirmed()
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// The whole room storage as JSON.
    pub fn to_json(&self) -> Value {
        let state = self.lock_state();
        let txn = state.doc.transact();
        any_to_value(&state.root.to_json(&txn))
    }
}

impl StoragePort for Replica {
    fn world_id(&self) -> Uuid {
        self.world_id
    }

    fn read_slot(&self, slot: &str) -> SlotRead {
        let state = self.lock_state();
        let txn = state.doc.transact();
        read_slot_in(&state.root, &txn, slot)
    }

    fn mutate(
        &self,
        edit: &mut dyn FnMut(&mut dyn StorageTxn) -> Result<(), RoomError>,
    ) -> Result<(), RoomError> {
        let (result, op) = {
            let state = self.lock_state();
            let client_id = state.doc.client_id();
            let mut txn = state.doc.transact_mut();
            let clock_before = txn.state_vector().get(&client_id);

            let mut adapter = DocTxn {
                txn: &mut txn,
                root: &state.root,
                changed: false,
            };
            let result = edit(&mut adapter);
            let changed = adapter.changed;

            let op = changed.then(|| {
                let clock = txn.state_vector().get(&client_id);
                PendingOp {
                    op_id: Uuid::new_v4(),
                    clock: clock as u64,
                    advances_clock: clock > clock_before,
                    update: txn.encode_update_v1(),
                }
            });
            (result, op)
        };

        if let Some(op) = op {
            log::trace!(
                "Local op {} in world {} ({} bytes)",
                op.op_id,
                self.world_id,
                op.update.len()
            );
            self.lock_pending().push(op.clone());
            if self.outbox_tx.send(op).is_err() {
                log::trace!("No transport attached to world {}", self.world_id);
            }
            self.bump();
        }
        result
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> JsonMap<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        }
    }

    fn sync(from: &Replica, to: &Replica) {
        let diff = from.diff(&to.state_vector()).unwrap();
        to.apply_remote(&diff).unwrap();
    }

    #[test]
    fn test_value_any_conversion() {
        let value = json!({
            "n": 2, "f": 1.5, "s": "x", "b": true, "z": null,
            "list": [1, "two"], "obj": { "k": 4 }
        });
        assert_eq!(any_to_value(&value_to_any(&value)), value);
        assert_eq!(any_to_value(&Any::BigInt(7)), json!(7));
        assert_eq!(any_to_value(&Any::Number(3.0)), json!(3));
    }

    #[test]
    fn test_missing_slot_reads_missing() {
        let replica = Replica::new(Uuid::new_v4());
        assert_eq!(replica.read_slot("characters"), SlotRead::Missing);
    }

    #[test]
    fn test_ensure_slot_is_lazy_and_idempotent() {
        let replica = Replica::new(Uuid::new_v4());
        replica
            .mutate(&mut |txn| {
                txn.ensure_slot("chars", SlotKind::Map)?;
                txn.map_insert("chars", "a", &fields(json!({ "name": "A" })))
            })
            .unwrap();
        replica
            .mutate(&mut |txn| txn.ensure_slot("chars", SlotKind::Map))
            .unwrap();

        match replica.read_slot("chars") {
            SlotRead::Map(entries) => assert_eq!(entries.len(), 1),
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn test_ensure_slot_wrong_kind_errors() {
        let replica = Replica::new(Uuid::new_v4());
        replica
            .mutate(&mut |txn| txn.ensure_slot("clocks", SlotKind::List))
            .unwrap();
        let err = replica
            .mutate(&mut |txn| txn.ensure_slot("clocks", SlotKind::Map))
            .unwrap_err();
        assert!(matches!(err, RoomError::WrongShape { .. }));
    }

    #[test]
    fn test_list_move_semantics() {
        let replica = Replica::new(Uuid::new_v4());
        replica
            .mutate(&mut |txn| {
                txn.ensure_slot("l", SlotKind::List)?;
                for n in 0..4 {
                    txn.list_push("l", &fields(json!({ "n": n })))?;
                }
                Ok(())
            })
            .unwrap();

        let order = |r: &Replica| match r.read_slot("l") {
            SlotRead::List(items) => items.iter().map(|v| v["n"].as_i64().unwrap()).collect::<Vec<_>>(),
            _ => Vec::new(),
        };

        replica.mutate(&mut |txn| txn.list_move("l", 0, 3)).unwrap();
        assert_eq!(order(&replica), vec![1, 2, 3, 0]);

        replica.mutate(&mut |txn| txn.list_move("l", 3, 0)).unwrap();
        assert_eq!(order(&replica), vec![0, 1, 2, 3]);

        replica.mutate(&mut |txn| txn.list_move("l", 1, 2)).unwrap();
        assert_eq!(order(&replica), vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_noop_mutation_emits_nothing() {
        let replica = Replica::new(Uuid::new_v4());
        let mut outbox = replica.take_outbox().unwrap();
        replica.mutate(&mut |_| Ok(())).unwrap();
        assert!(outbox.try_recv().is_err());
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(replica.version(), 0);
    }

    #[test]
    fn test_local_op_logged_and_queued() {
        let replica = Replica::new(Uuid::new_v4());
        let mut outbox = replica.take_outbox().unwrap();
        assert!(replica.take_outbox().is_none());

        replica
            .mutate(&mut |txn| txn.ensure_slot("l", SlotKind::List))
            .unwrap();
        let op = outbox.try_recv().unwrap();
        assert!(op.advances_clock);
        assert_eq!(replica.unconfirmed(), vec![op.clone()]);

        assert!(replica.acknowledge(op.op_id));
        assert_eq!(replica.pending_len(), 0);
    }

    #[test]
    fn test_reconcile_against_peer_state() {
        let a = Replica::new(Uuid::new_v4());
        let b = Replica::new(a.world_id());
        a.mutate(&mut |txn| txn.ensure_slot("l", SlotKind::List)).unwrap();
        assert_eq!(a.pending_len(), 1);

        sync(&a, &b);
        assert_eq!(a.reconcile(&b.state_vector()).unwrap(), 1);
        assert_eq!(a.pending_len(), 0);
    }

    #[test]
    fn test_remote_apply_is_idempotent() {
        let a = Replica::new(Uuid::new_v4());
        let b = Replica::new(a.world_id());
        a.mutate(&mut |txn| {
            txn.ensure_slot("l", SlotKind::List)?;
            txn.list_push("l", &fields(json!({ "n": 1 })))
        })
        .unwrap();

        let state = a.encode_state();
        b.apply_remote(&state).unwrap();
        b.apply_remote(&state).unwrap();
        assert_eq!(b.to_json(), a.to_json());
        assert!(b.apply_remote(&[0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_scalar_slot_is_wrong_shape() {
        let replica = Replica::new(Uuid::new_v4());
        {
            let state = replica.lock_state();
            let mut txn = state.doc.transact_mut();
            state.root.insert(&mut txn, "gallery", Any::from("oops"));
        }
        assert_eq!(
            replica.read_slot("gallery"),
            SlotRead::WrongShape {
                found: "string".into()
            }
        );
    }

    #[test]
    fn test_catch_up_covers_evicted_ops() {
        let client = Replica::with_pending_capacity(Uuid::new_v4(), 1);
        let server = Replica::new(client.world_id());
        for name in ["x", "y"] {
            client
                .mutate(&mut |txn| {
                    txn.ensure_slot("l", SlotKind::List)?;
                    txn.list_push("l", &fields(json!({ "name": name })))
                })
                .unwrap();
        }

        let sv = server.state_vector();
        client.reconcile(&sv).unwrap();
        assert!(client.catch_up(&sv).unwrap().is_some());
        for op in client.unconfirmed() {
            server.apply_remote(&op.update).unwrap();
        }
        assert_eq!(server.to_json(), client.to_json());
        assert_eq!(server.to_json()["l"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_catch_up_idle_without_eviction() {
        let client = Replica::new(Uuid::new_v4());
        client
            .mutate(&mut |txn| {
                txn.ensure_slot("l", SlotKind::List)?;
                txn.list_push("l", &fields(json!({ "n": 1 })))
            })
            .unwrap();
        let sv = Replica::new(client.world_id()).state_vector();
        assert!(client.catch_up(&sv).unwrap().is_none());
        assert_eq!(client.pending_len(), 1);
    }
}
