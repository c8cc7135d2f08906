//! Optimistic edit tokens.

use crate::types::{Entity, EntityId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for an optimistic edit, ordered by issue time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u64);

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.0)
    }
}

/// Lifecycle of an optimistic edit. `Confirmed` and `RolledBack` are
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    Confirmed,
    RolledBack,
}

/// What a `confirm` or `rollback` call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Confirmed,
    RolledBack,
    /// The token had already been resolved; nothing changed.
    AlreadyResolved,
}

/// Handle for one in-flight optimistic edit.
///
/// Holds a private snapshot of the entity as it was visible just before
/// the edit. Clones share the same resolution state.
#[derive(Clone)]
pub struct OptimisticToken {
    id: TokenId,
    entity_id: EntityId,
    snapshot: Entity,
    state: Arc<Mutex<TokenState>>,
}

impl OptimisticToken {
    pub(crate) fn new(id: TokenId, snapshot: Entity) -> Self {
        Self {
            id,
            entity_id: snapshot.id.clone(),
            snapshot,
            state: Arc::new(Mutex::new(TokenState::Pending)),
        }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// The entity as it was visible before the edit.
    pub fn snapshot(&self) -> &Entity {
        &self.snapshot
    }

    pub fn state(&self) -> TokenState {
        *self.state.lock()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == TokenState::Pending
    }

    /// Move from `Pending` to `to`. Returns false if already resolved.
    pub(crate) fn resolve(&self, to: TokenState) -> bool {
        let mut state = self.state.lock();
        if *state != TokenState::Pending {
            return false;
        }
        *state = to;
        true
    }
}

impl fmt::Debug for OptimisticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticToken")
            .field("id", &self.id)
            .field("entity_id", &self.entity_id)
            .field("state", &self.state())
            .finish()
    }
}
