// Mergeable document state.
//
// The engine only needs three operations from a CRDT: apply a remote update,
// encode the full state, and merge two replicas. `YrsDocument` is the
// shipped implementation on top of yrs (y-crdt Rust bindings).

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("failed to decode CRDT update: {0}")]
    Decode(String),

    #[error("failed to apply CRDT update: {0}")]
    Apply(String),
}

/// One document's replicated state.
///
/// Implementations must make `apply` commutative, associative and idempotent
/// over update sets; the registry relies on that for convergence and never
/// orders updates across connections.
pub trait CrdtState: Sized + Send + 'static {
    /// A state with no content.
    fn empty() -> Self;

    /// Rebuild a replica from bytes produced by `encode_state`.
    fn from_state(state: &[u8]) -> Result<Self, CrdtError>;

    /// Incorporate an update. A rejected update leaves the state unchanged.
    fn apply(&mut self, update: &[u8]) -> Result<(), CrdtError>;

    /// Encode the full state as a single update.
    fn encode_state(&self) -> Vec<u8>;

    /// A new replica containing everything from both inputs.
    fn merge(&self, other: &Self) -> Result<Self, CrdtError>;
}

/// Yjs-compatible document.
pub struct YrsDocument {
    doc: Doc,
}

impl YrsDocument {
    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Read the string content of a named text type.
    pub fn text(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    /// Length of a named text type.
    pub fn text_len(&self, name: &str) -> u32 {
        let text = self.doc.get_or_insert_text(name);
        let txn = self.doc.transact();
        text.len(&txn)
    }

    /// Insert text locally and return the resulting incremental update.
    pub fn insert_text(&self, name: &str, index: u32, content: &str) -> Vec<u8> {
        let text = self.doc.get_or_insert_text(name);
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            text.insert(&mut txn, index, content);
        }
        self.doc.transact().encode_diff_v1(&before)
    }

    /// Encode the state vector (logical timestamp) for sync protocol.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }
}

impl CrdtState for YrsDocument {
    fn empty() -> Self {
        Self { doc: Doc::new() }
    }

    fn from_state(state: &[u8]) -> Result<Self, CrdtError> {
        let mut document = Self::empty();
        document.apply(state)?;
        Ok(document)
    }

    fn apply(&mut self, update: &[u8]) -> Result<(), CrdtError> {
        let decoded =
            Update::decode_v1(update).map_err(|error| CrdtError::Decode(error.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(decoded)
            .map_err(|error| CrdtError::Apply(error.to_string()))
    }

    fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    fn merge(&self, other: &Self) -> Result<Self, CrdtError> {
        let mut merged = Self::from_state(&self.encode_state())?;
        merged.apply(&other.encode_state())?;
        Ok(merged)
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::empty()
    }
}
