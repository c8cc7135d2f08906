//! Paginated list cache reconciling fetches, pushes and optimistic edits.

use crate::error::{Result, SyncError};
use crate::types::{Entity, EntityId, FetchPage};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::token::{OptimisticToken, Resolution, TokenId, TokenState};

/// Function applied to an entity by an optimistic edit.
///
/// It may run more than once: edits are re-applied on top of the latest
/// server value whenever that value changes.
pub type Mutator = Arc<dyn Fn(&mut Entity) + Send + Sync>;

/// A visible cache entry with its position in the list.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub position: usize,
    pub entity: Entity,
}

/// Per-entity state.
struct Slot {
    /// Latest server-side value (from fetches, pushes and confirms).
    base: Entity,
    /// Pending edits on this entity, oldest first.
    pending: Vec<TokenId>,
    /// `base` with pending edits applied.
    visible: Entity,
}

impl Slot {
    fn new(base: Entity) -> Self {
        Self {
            visible: base.clone(),
            base,
            pending: Vec::new(),
        }
    }
}

struct PendingEdit {
    token: OptimisticToken,
    mutator: Mutator,
}

#[derive(Default)]
struct CacheState {
    /// Entity ids per page index, in display order.
    pages: BTreeMap<usize, Vec<EntityId>>,
    slots: HashMap<EntityId, Slot>,
    pending: BTreeMap<TokenId, PendingEdit>,
    has_more: bool,
    next_token: u64,
}

impl CacheState {
    /// Recompute an entity's visible value from its base and pending edits.
    fn rebase(&mut self, id: &EntityId) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let mut visible = slot.base.clone();
        for token_id in &slot.pending {
            if let Some(edit) = self.pending.get(token_id) {
                (edit.mutator)(&mut visible);
            }
        }
        visible.id = slot.base.id.clone();
        slot.visible = visible;
    }

    fn page_of(&self, id: &EntityId) -> Option<usize> {
        self.pages
            .iter()
            .find(|(_, ids)| ids.contains(id))
            .map(|(index, _)| *index)
    }

    /// Drop an entity that is on no page, unless it has pending edits.
    /// Returns whether it was removed.
    fn evict_if_detached(&mut self, id: &EntityId) -> bool {
        if self.page_of(id).is_some() {
            return false;
        }
        match self.slots.get(id) {
            Some(slot) if slot.pending.is_empty() => {
                self.slots.remove(id);
                true
            }
            Some(_) => {
                tracing::trace!(id = %id, "Keeping detached entity until its edits resolve");
                false
            }
            None => false,
        }
    }

    fn ordered_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.pages.values().flatten()
    }
}

/// Keeps one paginated entity list consistent under page fetches, pushed
/// entities and optimistic local edits.
///
/// All mutation goes through `apply_fetch_page`, `apply_push`,
/// `apply_optimistic`, `confirm` and `rollback`, applied strictly in call
/// order.
pub struct CacheSyncEngine {
    state: Mutex<CacheState>,
}

impl CacheSyncEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
        }
    }

    // --- Mutation ---

    /// Insert or replace the page at `page_index`.
    ///
    /// Other pages keep their relative order. Ids that moved here from
    /// another page are removed there; ids that disappeared from this page
    /// (and are not on any other) are evicted. An entity with a pending
    /// optimistic edit leaves the list but stays cached until the edit
    /// resolves.
    pub fn apply_fetch_page(&self, entries: Vec<Entity>, page_index: usize) {
        let mut state = self.state.lock();

        let mut ids: Vec<EntityId> = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for entity in &entries {
            if seen.insert(entity.id.clone()) {
                ids.push(entity.id.clone());
            }
        }

        for (index, page) in state.pages.iter_mut() {
            if *index != page_index {
                page.retain(|id| !seen.contains(id));
            }
        }

        let previous = state.pages.insert(page_index, ids).unwrap_or_default();
        for id in previous {
            if !seen.contains(&id) {
                state.evict_if_detached(&id);
            }
        }

        for entity in entries {
            let id = entity.id.clone();
            match state.slots.entry(id.clone()) {
                Entry::Occupied(mut occupied) => occupied.get_mut().base = entity,
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot::new(entity));
                }
            }
            state.rebase(&id);
        }

        tracing::trace!(page = page_index, len = state.slots.len(), "Applied fetched page");
    }

    /// Apply a page result from the REST collaborator.
    pub fn apply_page(&self, page: FetchPage) {
        let index = page.page;
        self.apply_fetch_page(page.items, index);

        let mut state = self.state.lock();
        if state.pages.keys().next_back() == Some(&index) {
            state.has_more = page.has_more;
        }
    }

    /// Apply a pushed entity.
    ///
    /// A known id has its fields merged in place without moving; an unknown
    /// id is inserted at the head of the first page. Pending optimistic
    /// edits stay applied on top of the merged value.
    pub fn apply_push(&self, entity: Entity) {
        let mut state = self.state.lock();
        let id = entity.id.clone();

        if let Some(slot) = state.slots.get_mut(&id) {
            slot.base.merge_from(&entity);
            let shadowed = !slot.pending.is_empty();
            state.rebase(&id);
            tracing::trace!(id = %id, shadowed, "Merged pushed entity");
            return;
        }

        state.slots.insert(id.clone(), Slot::new(entity));
        let first = state.pages.keys().next().copied().unwrap_or(0);
        state.pages.entry(first).or_default().insert(0, id.clone());
        tracing::trace!(id = %id, page = first, "Inserted pushed entity");
    }

    /// Apply a local edit immediately and return a token to resolve it.
    pub fn apply_optimistic<F>(&self, id: &EntityId, mutator: F) -> Result<OptimisticToken>
    where
        F: Fn(&mut Entity) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();

        let snapshot = match state.slots.get(id) {
            Some(slot) => slot.visible.clone(),
            None => return Err(SyncError::EntryNotFound(id.clone())),
        };

        state.next_token += 1;
        let token_id = TokenId(state.next_token);
        let token = OptimisticToken::new(token_id, snapshot);

        state.pending.insert(
            token_id,
            PendingEdit {
                token: token.clone(),
                mutator: Arc::new(mutator),
            },
        );
        if let Some(slot) = state.slots.get_mut(id) {
            slot.pending.push(token_id);
        }
        state.rebase(id);

        tracing::debug!(id = %id, token = token_id.0, "Applied optimistic edit");
        Ok(token)
    }

    /// Replace the optimistic value with the server's.
    pub fn confirm(&self, token: &OptimisticToken, server_entity: Entity) -> Resolution {
        let mut state = self.state.lock();
        let Some(edit) = Self::take_pending(&mut state, token) else {
            tracing::trace!(token = token.id().0, "Ignoring confirm of resolved token");
            return Resolution::AlreadyResolved;
        };
        edit.token.resolve(TokenState::Confirmed);

        let id = token.entity_id().clone();
        if server_entity.id != id {
            tracing::warn!(expected = %id, got = %server_entity.id, "Confirmed entity id mismatch");
        }
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.base = Entity {
                id: id.clone(),
                fields: server_entity.fields,
            };
        }
        state.rebase(&id);
        state.evict_if_detached(&id);

        tracing::debug!(id = %id, token = token.id().0, "Optimistic edit confirmed");
        Resolution::Confirmed
    }

    /// Undo the optimistic edit.
    pub fn rollback(&self, token: &OptimisticToken) -> Resolution {
        let mut state = self.state.lock();
        let Some(edit) = Self::take_pending(&mut state, token) else {
            tracing::trace!(token = token.id().0, "Ignoring rollback of resolved token");
            return Resolution::AlreadyResolved;
        };
        edit.token.resolve(TokenState::RolledBack);

        let id = token.entity_id().clone();
        state.rebase(&id);
        state.evict_if_detached(&id);

        tracing::debug!(id = %id, token = token.id().0, "Optimistic edit rolled back");
        Resolution::RolledBack
    }

    /// Resolve a token from the outcome of its network round trip: confirm
    /// on success, roll back on failure.
    pub fn settle(&self, token: &OptimisticToken, outcome: Result<Entity>) -> Resolution {
        match outcome {
            Ok(entity) => self.confirm(token, entity),
            Err(e) => {
                let conflict = SyncError::OptimisticConflict {
                    id: token.entity_id().clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(error = %conflict, "Rolling back rejected edit");
                self.rollback(token)
            }
        }
    }

    fn take_pending(state: &mut CacheState, token: &OptimisticToken) -> Option<PendingEdit> {
        if !token.is_pending() {
            return None;
        }
        let edit = state.pending.remove(&token.id())?;
        if let Some(slot) = state.slots.get_mut(token.entity_id()) {
            slot.pending.retain(|id| *id != token.id());
        }
        Some(edit)
    }

    // --- Reads ---

    /// The visible value of an entity.
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.state.lock().slots.get(id).map(|slot| slot.visible.clone())
    }

    /// The visible value and list position of an entity.
    pub fn entry(&self, id: &EntityId) -> Option<CacheEntry> {
        let state = self.state.lock();
        let position = state.ordered_ids().position(|other| other == id)?;
        let entity = state.slots.get(id)?.visible.clone();
        Some(CacheEntry { position, entity })
    }

    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.state.lock().ordered_ids().position(|other| other == id)
    }

    /// Every visible entity in list order.
    pub fn entries(&self) -> Vec<Entity> {
        let state = self.state.lock();
        state
            .ordered_ids()
            .filter_map(|id| state.slots.get(id))
            .map(|slot| slot.visible.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.state.lock().ordered_ids().cloned().collect()
    }

    /// Visible entities of one page.
    pub fn page(&self, page_index: usize) -> Option<Vec<Entity>> {
        let state = self.state.lock();
        let ids = state.pages.get(&page_index)?;
        Some(
            ids.iter()
                .filter_map(|id| state.slots.get(id))
                .map(|slot| slot.visible.clone())
                .collect(),
        )
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().ordered_ids().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the last fetched page reported more results.
    pub fn has_more(&self) -> bool {
        self.state.lock().has_more
    }

    /// Number of unresolved optimistic edits.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, id: &EntityId) -> bool {
        self.state
            .lock()
            .slots
            .get(id)
            .is_some_and(|slot| !slot.pending.is_empty())
    }
}

impl Default for CacheSyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grant(id: &str, title: &str) -> Entity {
        Entity::new(id).with_field("title", title).with_field("saved", false)
    }

    fn ids(engine: &CacheSyncEngine) -> Vec<String> {
        engine.ids().into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn test_pages_keep_relative_order() {
        let engine = CacheSyncEngine::new();
        engine.apply_fetch_page(vec![grant("c", "C"), grant("d", "D")], 2);
        engine.apply_fetch_page(vec![grant("a", "A"), grant("b", "B")], 1);
        assert_eq!(ids(&engine), vec!["a", "b", "c", "d"]);

        engine.apply_fetch_page(vec![grant("b", "B2"), grant("a", "A2")], 1);
        assert_eq!(ids(&engine), vec!["b", "a", "c", "d"]);
        assert_eq!(engine.get(&"a".into()).unwrap().get("title"), Some(&json!("A2")));
    }

    #[test]
    fn test_refetch_moves_id_between_pages() {
        let engine = CacheSyncEngine::new();
        engine.apply_fetch_page(vec![grant("a", "A"), grant("b", "B")], 1);
        engine.apply_fetch_page(vec![grant("b", "B"), grant("c", "C")], 2);

        assert_eq!(ids(&engine), vec!["a", "b", "c"]);
        assert_eq!(engine.page(1).unwrap().len(), 1);
    }

    #[test]
    fn test_refetch_evicts_missing_ids() {
        let engine = CacheSyncEngine::new();
        engine.apply_fetch_page(vec![grant("a", "A"), grant("b", "B")], 1);
        engine.apply_fetch_page(vec![grant("a", "A")], 1);

        assert_eq!(ids(&engine), vec!["a"]);
        assert!(engine.get(&"b".into()).is_none());
    }

    #[test]
    fn test_refetch_keeps_detached_entity_with_pending_edit() {
        let engine = CacheSyncEngine::new();
        engine.apply_fetch_page(vec![grant("a", "A"), grant("b", "B")], 1);
        let token = engine
            .apply_optimistic(&"b".into(), |e| e.set("saved", true))
            .unwrap();

        engine.apply_fetch_page(vec![grant("a", "A")], 1);
        assert_eq!(ids(&engine), vec!["a"]);
        assert_eq!(engine.get(&"b".into()).unwrap().get("saved"), Some(&json!(true)));
        assert!(engine.is_pending(&"b".into()));

        engine.rollback(&token);
        assert!(engine.get(&"b".into()).is_none());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_push_new_id_goes_to_head_of_first_page() {
        let engine = CacheSyncEngine::new();
        engine.apply_fetch_page(vec![grant("a", "A")], 1);
        engine.apply_fetch_page(vec![grant("b", "B")], 2);
        engine.apply_push(grant("z", "Z"));

        assert_eq!(ids(&engine), vec!["z", "a", "b"]);
        assert_eq!(engine.page(1).unwrap()[0].id, EntityId::new("z"));
    }

    #[test]
    fn test_push_into_empty_cache() {
        let engine = CacheSyncEngine::new();
        engine.apply_push(grant("z", "Z"));
        assert_eq!(ids(&engine), vec!["z"]);
    }

    #[test]
    fn test_apply_page_tracks_has_more() {
        let engine = CacheSyncEngine::new();
        engine.apply_page(FetchPage {
            items: vec![grant("a", "A")],
            has_more: true,
            page: 1,
        });
        assert!(engine.has_more());

        engine.apply_page(FetchPage {
            items: vec![grant("b", "B")],
            has_more: false,
            page: 2,
        });
        assert!(!engine.has_more());
    }

    #[test]
    fn test_optimistic_on_missing_entry() {
        let engine = CacheSyncEngine::new();
        let result = engine.apply_optimistic(&"nope".into(), |_| {});
        assert!(matches!(result, Err(SyncError::EntryNotFound(_))));
    }

    #[test]
    fn test_stacked_edits_roll_back_independently() {
        let engine = CacheSyncEngine::new();
        engine.apply_fetch_page(vec![grant("g1", "T")], 1);
        let id = EntityId::new("g1");

        let saved = engine
            .apply_optimistic(&id, |e| e.set("saved", true))
            .unwrap();
        let noted = engine
            .apply_optimistic(&id, |e| e.set("note", "apply by May"))
            .unwrap();

        engine.rollback(&saved);
        let visible = engine.get(&id).unwrap();
        assert_eq!(visible.get("saved"), Some(&json!(false)));
        assert_eq!(visible.get("note"), Some(&json!("apply by May")));
        assert!(noted.is_pending());
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn test_settle_failure_rolls_back() {
        let engine = CacheSyncEngine::new();
        engine.apply_fetch_page(vec![grant("g1", "T")], 1);
        let id = EntityId::new("g1");

        let token = engine.apply_optimistic(&id, |e| e.set("saved", true)).unwrap();
        let resolution = engine.settle(&token, Err(SyncError::Transport("503".into())));

        assert_eq!(resolution, Resolution::RolledBack);
        assert_eq!(engine.get(&id).unwrap(), grant("g1", "T"));
    }
}
