//! Awareness table: ephemeral per-client presence for one room.
//!
//! ```text
//! Awareness frame ─► AwarenessUpdate ─► AwarenessTable::apply_update
//!                                                │ (clock check)
//!                                                ▼
//!                                      AwarenessChange ─► subscribers
//! ```
//!
//! Clocks are monotonic per client. Entries with `clock <= stored` are
//! dropped without a trace, so an old update delivered late can never bring
//! back a client that has already left. A departed client keeps its clock as
//! a tombstone for the same reason; it is excluded from [`snapshot`].
//!
//! An explicit leave is recorded at the client's current clock, the way
//! y-protocols removes remote states, so the client's own next update is
//! accepted when it reconnects.
//!
//! [`snapshot`]: AwarenessTable::snapshot

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{self, AwarenessUpdate};
use crate::room::PeerId;

/// Awareness client id (the CRDT client id chosen by the browser).
pub type ClientId = yrs::block::ClientID;

const EVENT_CAPACITY: usize = 64;

/// A live presence record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessState {
    pub clock: u32,
    /// JSON blob, relayed verbatim
    pub state: Arc<str>,
}

/// Why a change set happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// Entries received from a peer
    Remote,
    /// Server-issued explicit leave for a departed connection
    Leave,
    /// Silent removal after the connection was lost
    Expired,
}

/// One logical change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: Option<PeerId>,
    pub cause: ChangeCause,
}

impl AwarenessChange {
    fn empty(origin: Option<PeerId>, cause: ChangeCause) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
            cause,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client touched by this change, in added/updated/removed order.
    pub fn changed_ids(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }

    fn record(&mut self, outcome: Outcome, client_id: ClientId) {
        match outcome {
            Outcome::Added => self.added.push(client_id),
            Outcome::Updated => self.updated.push(client_id),
            Outcome::Removed => self.removed.push(client_id),
            Outcome::Accepted | Outcome::Stale => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Added,
    Updated,
    Removed,
    /// Accepted but invisible (null for a client that was not live)
    Accepted,
    Stale,
}

/// Cancellable subscription to change sets. Dropping it unsubscribes.
pub struct AwarenessSubscription {
    rx: broadcast::Receiver<AwarenessChange>,
}

impl AwarenessSubscription {
    /// Wait for the next change set. `None` once the table is gone.
    pub async fn recv(&mut self) -> Option<AwarenessChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Awareness subscriber lagged by {n} change sets");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<AwarenessChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Per-room awareness table.
pub struct AwarenessTable {
    states: HashMap<ClientId, Arc<str>>,
    /// Last accepted clock, kept after a client leaves
    clocks: HashMap<ClientId, u32>,
    events: broadcast::Sender<AwarenessChange>,
}

impl Default for AwarenessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AwarenessTable {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            states: HashMap::new(),
            clocks: HashMap::new(),
            events,
        }
    }

    /// Insert, update, or (with `state = None`) explicitly clear a client.
    ///
    /// Returns `false` if the clock is stale and the entry was discarded.
    pub fn set(&mut self, client_id: ClientId, state: Option<Arc<str>>, clock: u32) -> bool {
        let mut change = AwarenessChange::empty(None, ChangeCause::Remote);
        let outcome = self.apply_entry(client_id, state, clock);
        change.record(outcome, client_id);
        self.emit(change);
        outcome != Outcome::Stale
    }

    /// Apply a batch received from `origin`; one change set for the batch.
    pub fn apply_update(
        &mut self,
        update: &AwarenessUpdate,
        origin: Option<PeerId>,
    ) -> AwarenessChange {
        let mut change = AwarenessChange::empty(origin, ChangeCause::Remote);
        for client_id in protocol::client_ids(update) {
            let Some(entry) = update.clients.get(&client_id) else {
                continue;
            };
            let state = protocol::entry_state(entry).map(Arc::from);
            let outcome = self.apply_entry(client_id, state, entry.clock);
            change.record(outcome, client_id);
        }
        self.emit(change.clone());
        change
    }

    /// Explicit leave: clear each live client at its current clock.
    pub fn leave(&mut self, client_ids: &[ClientId], origin: Option<PeerId>) -> AwarenessChange {
        self.clear(client_ids, origin, ChangeCause::Leave)
    }

    /// Silent removal for a lost connection. The clock survives as a
    /// tombstone; no leave entry is generated.
    pub fn remove(&mut self, client_ids: &[ClientId], origin: Option<PeerId>) -> AwarenessChange {
        self.clear(client_ids, origin, ChangeCause::Expired)
    }

    /// Live entries only. Departed clients are absent, not null.
    pub fn snapshot(&self) -> BTreeMap<ClientId, AwarenessState> {
        self.states
            .iter()
            .map(|(&id, state)| {
                let clock = self.clocks.get(&id).copied().unwrap_or_default();
                (id, AwarenessState { clock, state: state.clone() })
            })
            .collect()
    }

    pub fn subscribe(&self) -> AwarenessSubscription {
        AwarenessSubscription { rx: self.events.subscribe() }
    }

    /// Wire entries for `client_ids`: live state, or a null at the last
    /// clock for departed clients. Unknown ids are skipped.
    pub fn encode_update(&self, client_ids: &[ClientId]) -> AwarenessUpdate {
        let clients = client_ids
            .iter()
            .filter_map(|&id| {
                let clock = *self.clocks.get(&id)?;
                Some((id, protocol::entry(clock, self.get(id))))
            })
            .collect();
        AwarenessUpdate { clients }
    }

    /// Every live entry, for peers that just joined or asked.
    pub fn encode_full(&self) -> AwarenessUpdate {
        let ids: Vec<ClientId> = self.states.keys().copied().collect();
        self.encode_update(&ids)
    }

    pub fn clock(&self, client_id: ClientId) -> Option<u32> {
        self.clocks.get(&client_id).copied()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&str> {
        self.states.get(&client_id).map(|state| &**state)
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn apply_entry(&mut self, client_id: ClientId, state: Option<Arc<str>>, clock: u32) -> Outcome {
        if let Some(&stored) = self.clocks.get(&client_id) {
            if clock <= stored {
                log::trace!("Stale awareness for client {client_id}: clock {clock} <= {stored}");
                return Outcome::Stale;
            }
        }
        self.clocks.insert(client_id, clock);
        match state {
            Some(state) => match self.states.insert(client_id, state) {
                Some(_) => Outcome::Updated,
                None => Outcome::Added,
            },
            None => match self.states.remove(&client_id) {
                Some(_) => Outcome::Removed,
                None => Outcome::Accepted,
            },
        }
    }

    fn clear(
        &mut self,
        client_ids: &[ClientId],
        origin: Option<PeerId>,
        cause: ChangeCause,
    ) -> AwarenessChange {
        let mut change = AwarenessChange::empty(origin, cause);
        for &client_id in client_ids {
            if self.states.remove(&client_id).is_some() {
                change.removed.push(client_id);
            }
        }
        self.emit(change.clone());
        change
    }

    fn emit(&self, change: AwarenessChange) {
        if !change.is_empty() {
            // No subscribers is fine.
            let _ = self.events.send(change);
        }
    }
}
