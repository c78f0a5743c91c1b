//! CRDT backend seam.
//!
//! The relay never looks inside a document. It needs exactly three things
//! from the replicated-data engine: apply a remote update, produce a diff
//! against a peer's state vector, and produce its own state vector. Any
//! engine whose updates are commutative, associative and idempotent can sit
//! behind [`CrdtBackend`].
//!
//! Change notification is not a callback here: the [`Room`](crate::room::Room)
//! publishes every update for which `apply_update` reports a change on its
//! broadcast channel, and connection handlers consume that channel.

use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::BackendError;

/// Replicated document engine owned by one room.
pub trait CrdtBackend: Send {
    /// Integrate a remote update. Returns `true` if the document changed or
    /// the update is held back waiting for its dependencies, `false` for
    /// duplicates.
    fn apply_update(&mut self, update: &[u8]) -> Result<bool, BackendError>;

    /// Encode everything the holder of `since` is missing. `None` encodes
    /// the whole document.
    fn encode_state_as_update(&self, since: Option<&[u8]>) -> Result<Vec<u8>, BackendError>;

    /// Encode the summary of what this replica has seen.
    fn encode_state_vector(&self) -> Vec<u8>;
}

/// Builds a fresh, empty backend for each new room.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn CrdtBackend> + Send + Sync>;

/// Factory for the default [`YrsBackend`].
pub fn yrs_factory() -> BackendFactory {
    Arc::new(|| Box::new(YrsBackend::new()) as Box<dyn CrdtBackend>)
}

/// [`CrdtBackend`] over a Yrs document using the v1 update encoding, which
/// is what browser Yjs providers send.
pub struct YrsBackend {
    doc: Doc,
}

impl YrsBackend {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    pub fn from_doc(doc: Doc) -> Self {
        Self { doc }
    }

    /// The underlying document (for inspection in tests and tooling).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for YrsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtBackend for YrsBackend {
    fn apply_update(&mut self, update: &[u8]) -> Result<bool, BackendError> {
        let update =
            Update::decode_v1(update).map_err(|e| BackendError::DecodeUpdate(e.to_string()))?;

        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| BackendError::Apply(e.to_string()))?;

        // Deletions leave the state vector untouched. Pending structs are
        // relayed too, so peers that hold the missing dependency can use them.
        Ok(txn.state_vector() != *txn.before_state()
            || !txn.delete_set().is_empty()
            || txn.has_missing_updates())
    }

    fn encode_state_as_update(&self, since: Option<&[u8]>) -> Result<Vec<u8>, BackendError> {
        let sv = match since {
            Some(bytes) => StateVector::decode_v1(bytes)
                .map_err(|e| BackendError::DecodeStateVector(e.to_string()))?,
            None => StateVector::default(),
        };
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }
}
