//! Dual-state session management: Working state, Last Stable State, and the
//! pending-key fallback used while asynchronous refreshes are in flight.
//!
//! A session keeps two shallow records keyed by string:
//!
//! - **Working**: the view in-flight computation reads and writes
//! - **LSS** (Last Stable State): the committed view persisted with the
//!   session and snapshotted at every round anchor
//!
//! A set of *pending* keys marks values currently being recomputed by a
//! background job. Prompt construction must never see a half-refreshed
//! value, so [`StateManager::get_for_prompt`] substitutes the LSS value for
//! every pending key. Completing the refresh commits to both records and
//! clears the pending marks in one step.
//!
//! # Examples
//!
//! ```
//! use taleloom::state::StateManager;
//! use serde_json::json;
//!
//! let state = StateManager::new(json!({"mood": "wary"}).as_object().unwrap()
//!     .iter().map(|(k, v)| (k.clone(), v.clone())).collect());
//! state.start_async_update(["mood"]);
//! state.update_working(|w| { w.insert("mood".into(), json!("panicked")); });
//! // prompt reads fall back to the stable value while the refresh runs
//! assert_eq!(state.get_for_prompt()["mood"], json!("wary"));
//! state.complete_async_update([("mood".to_string(), json!("resolute"))]);
//! assert_eq!(state.get_for_prompt()["mood"], json!("resolute"));
//! ```

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

/// A shallow state record.
pub type StateMap = FxHashMap<String, Value>;

struct Inner {
    lss: StateMap,
    working: StateMap,
    pending: FxHashSet<String>,
}

/// Thread-safe Working/LSS state holder for one session.
///
/// All mutations are serialized by one internal lock; every returned map is
/// a clone, so callers never hold references into the shared records.
pub struct StateManager {
    inner: Mutex<Inner>,
}

impl StateManager {
    /// Creates a manager whose Working state starts as a copy of the LSS.
    #[must_use]
    pub fn new(initial: StateMap) -> Self {
        Self {
            inner: Mutex::new(Inner {
                working: initial.clone(),
                lss: initial,
                pending: FxHashSet::default(),
            }),
        }
    }

    /// Returns a copy of the Working state.
    #[must_use]
    pub fn get_working_state(&self) -> StateMap {
        self.inner.lock().working.clone()
    }

    /// Returns a copy of the LSS.
    #[must_use]
    pub fn get_lss(&self) -> StateMap {
        self.inner.lock().lss.clone()
    }

    /// Reads a single key from the Working state.
    #[must_use]
    pub fn read(&self, key: &str) -> Option<Value> {
        self.inner.lock().working.get(key).cloned()
    }

    /// Returns the prompt view: Working, with every pending key overridden
    /// by its LSS value. Pending keys absent from the LSS are omitted.
    #[must_use]
    pub fn get_for_prompt(&self) -> StateMap {
        let inner = self.inner.lock();
        let mut view = inner.working.clone();
        for key in &inner.pending {
            match inner.lss.get(key) {
                Some(stable) => {
                    view.insert(key.clone(), stable.clone());
                }
                None => {
                    view.remove(key);
                }
            }
        }
        view
    }

    /// Applies updates to both Working and LSS. Never touches pending.
    pub fn update_state_sync(&self, updates: impl IntoIterator<Item = (String, Value)>) {
        let mut inner = self.inner.lock();
        for (key, value) in updates {
            inner.working.insert(key.clone(), value.clone());
            inner.lss.insert(key, value);
        }
    }

    /// Marks keys as pending an asynchronous refresh. Idempotent.
    pub fn start_async_update<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.pending.insert(key.into());
        }
    }

    /// Commits an asynchronous refresh: writes to both records and clears
    /// the pending marks for the updated keys, atomically.
    pub fn complete_async_update(&self, updates: impl IntoIterator<Item = (String, Value)>) {
        let mut inner = self.inner.lock();
        for (key, value) in updates {
            inner.working.insert(key.clone(), value.clone());
            inner.lss.insert(key.clone(), value);
            inner.pending.remove(&key);
        }
    }

    /// Abandons an asynchronous refresh: clears the pending marks without
    /// writing anything. Used when a refresh's output is discarded as stale.
    pub fn cancel_async_update<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.pending.remove(key.as_ref());
        }
    }

    /// Mutates the Working state in place without touching the LSS.
    ///
    /// This is the write path for in-flight computation that has not been
    /// committed yet; sync writes go through [`update_state_sync`].
    ///
    /// [`update_state_sync`]: Self::update_state_sync
    pub fn update_working(&self, f: impl FnOnce(&mut StateMap)) {
        f(&mut self.inner.lock().working);
    }

    /// Currently pending keys, sorted for stable reporting.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner.pending.iter().cloned().collect();
        keys.sort();
        keys
    }
}

/// Per-session cache of live [`StateManager`]s.
///
/// Sends and job completions for one session must observe the same manager
/// so pending-key fallback spans the round boundary. Entries are seeded on
/// first use from the stored LSS and dropped when a branch operation resets
/// the session's state line.
#[derive(Default)]
pub struct SessionStateCache {
    inner: Mutex<FxHashMap<String, std::sync::Arc<StateManager>>>,
}

impl SessionStateCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached manager, seeding it with `seed` when absent.
    pub fn get_or_seed(
        &self,
        session_id: &str,
        seed: impl FnOnce() -> StateMap,
    ) -> std::sync::Arc<StateManager> {
        self.inner
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(StateManager::new(seed())))
            .clone()
    }

    /// Returns the cached manager without seeding.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<std::sync::Arc<StateManager>> {
        self.inner.lock().get(session_id).cloned()
    }

    /// Drops the cached manager so the next use reseeds from the store.
    pub fn reset(&self, session_id: &str) {
        self.inner.lock().remove(session_id);
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateManager")
            .field("working_keys", &inner.working.len())
            .field("lss_keys", &inner.lss.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}
