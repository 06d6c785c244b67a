//! Resource ledger for model execution slots.
//!
//! The ledger is the single source of truth for which holder occupies which
//! model slot. All mutation goes through one mutex per ledger, so the
//! check-then-reserve path is atomic. Status reads go to a snapshot that is
//! republished after every mutation and never contend with reservations.

use crate::catalog::{ModelCatalog, ModelCategory};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, warn};

/// Ownership record for one reserved slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSlot {
    /// Model the slot was reserved for.
    pub model: String,
    /// Agent, task, or request holding the slot.
    pub holder_agent_id: String,
    /// Category the slot is charged to.
    pub category: ModelCategory,
    /// Capacity units charged.
    pub cost: u32,
    /// When the slot was reserved.
    pub reserved_at: DateTime<Utc>,
}

/// Answer to an availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    /// Whether a slot could be reserved right now.
    pub available: bool,
    /// Human-readable explanation.
    pub reason: String,
}

/// Per-category usage in a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStatus {
    /// Configured capacity units.
    pub capacity: u32,
    /// Units currently held.
    pub used: u32,
    /// Units still free.
    pub free: u32,
    /// Holders currently charged to this category.
    pub holders: Vec<String>,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Usage per category.
    pub categories: BTreeMap<ModelCategory, CategoryStatus>,
    /// Total number of slots held.
    pub slots_held: usize,
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    model: String,
    holder: String,
}

#[derive(Debug, Default)]
struct LedgerState {
    used: BTreeMap<ModelCategory, u32>,
    slots: HashMap<SlotKey, ExecutionSlot>,
}

/// Tracks per-category capacity and the slots held against it.
pub struct ResourceLedger {
    catalog: ModelCatalog,
    capacity: BTreeMap<ModelCategory, u32>,
    state: Mutex<LedgerState>,
    snapshot: RwLock<Arc<ResourceStatus>>,
}

impl fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLedger")
            .field("capacity", &self.capacity)
            .field("models", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl ResourceLedger {
    /// Creates a ledger over a catalog and a per-category capacity map.
    #[must_use]
    pub fn new(catalog: ModelCatalog, capacity: BTreeMap<ModelCategory, u32>) -> Self {
        let ledger = Self {
            catalog,
            capacity,
            state: Mutex::new(LedgerState::default()),
            snapshot: RwLock::new(Arc::new(ResourceStatus {
                categories: BTreeMap::new(),
                slots_held: 0,
                captured_at: Utc::now(),
            })),
        };
        ledger.publish(&LedgerState::default());
        ledger
    }

    /// Creates a ledger from scheduler configuration.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.catalog(), config.capacity.clone())
    }

    /// The catalog this ledger resolves models against.
    #[must_use]
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Configured capacity of a category (0 if unconfigured).
    #[must_use]
    pub fn capacity_of(&self, category: ModelCategory) -> u32 {
        self.capacity.get(&category).copied().unwrap_or(0)
    }

    /// Checks whether the model's category has room for one more slot.
    pub fn check_execution_availability(&self, model: &str) -> Availability {
        let state = self.lock_state();
        match self.admission_check(&state, model, None) {
            Ok(()) => Availability { available: true, reason: "capacity available".to_string() },
            Err(reason) => Availability { available: false, reason },
        }
    }

    /// Reserves a slot for `agent` on `model`.
    ///
    /// # Returns
    /// `true` if the slot was reserved. On `false` nothing changed.
    pub fn reserve_execution_slot(&self, model: &str, agent: &str) -> bool {
        let mut state = self.lock_state();
        match self.reserve_locked(&mut state, model, agent) {
            Ok(()) => {
                self.publish(&state);
                true
            }
            Err(reason) => {
                debug!(model = %model, agent = %agent, reason = %reason, "Slot reservation refused");
                false
            }
        }
    }

    /// Releases the slot `agent` holds on `model`.
    ///
    /// Releasing a slot that is not held is logged and ignored.
    ///
    /// # Returns
    /// `true` if a slot was released.
    pub fn release_execution_slot(&self, model: &str, agent: &str) -> bool {
        let mut state = self.lock_state();
        let key = SlotKey { model: model.to_string(), holder: agent.to_string() };
        let Some(slot) = state.slots.remove(&key) else {
            warn!(model = %model, agent = %agent, "Release of slot that is not held");
            return false;
        };

        match state.used.get_mut(&slot.category) {
            Some(used) if *used >= slot.cost => *used -= slot.cost,
            other => {
                warn!(
                    category = %slot.category,
                    used = ?other.map(|u| *u),
                    cost = slot.cost,
                    "Ledger usage underflow on release"
                );
                state.used.insert(slot.category, 0);
            }
        }
        debug!(model = %model, agent = %agent, category = %slot.category, "Slot released");
        self.publish(&state);
        true
    }

    /// Whether `agent` currently holds a slot on `model`.
    pub fn holds(&self, model: &str, agent: &str) -> bool {
        let state = self.lock_state();
        state.slots.contains_key(&SlotKey { model: model.to_string(), holder: agent.to_string() })
    }

    /// Picks the largest input-ordered subset of `(agent, model)` pairs that
    /// fits within each category's configured capacity when run together.
    ///
    /// Planning is against total capacity, not current usage, so a plan made
    /// while other work is running still describes what can share a batch.
    /// Pairs with unknown models are never selected.
    pub fn get_compatible_agents_for_parallel_execution(
        &self,
        pairs: &[(String, String)],
    ) -> Vec<(String, String)> {
        let mut budget: BTreeMap<ModelCategory, u32> = self.capacity.clone();
        let mut selected = Vec::new();

        for (agent, model) in pairs {
            let Some(descriptor) = self.catalog.get(model) else {
                debug!(agent = %agent, model = %model, "Skipping unknown model in compatibility check");
                continue;
            };
            let remaining = budget.entry(descriptor.category).or_insert(0);
            if *remaining >= descriptor.concurrency_cost {
                *remaining -= descriptor.concurrency_cost;
                selected.push((agent.clone(), model.clone()));
            }
        }

        selected
    }

    /// Reserves as many `(agent, model)` pairs as live capacity allows, in
    /// input order, under a single lock acquisition.
    ///
    /// # Returns
    /// The pairs that now hold a slot.
    pub fn batch_reserve_slots(&self, pairs: &[(String, String)]) -> Vec<(String, String)> {
        let mut state = self.lock_state();
        let mut reserved = Vec::new();

        for (agent, model) in pairs {
            match self.reserve_locked(&mut state, model, agent) {
                Ok(()) => reserved.push((agent.clone(), model.clone())),
                Err(reason) => {
                    debug!(agent = %agent, model = %model, reason = %reason, "Batch reservation skipped pair");
                }
            }
        }

        if !reserved.is_empty() {
            self.publish(&state);
        }
        reserved
    }

    /// Returns the latest status snapshot without touching the reservation lock.
    pub fn get_resource_status(&self) -> ResourceStatus {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        ResourceStatus::clone(&snapshot)
    }

    /// Reserves a slot and wraps it in a guard that releases on drop.
    ///
    /// # Errors
    /// Returns `AdmissionDenied` with the ledger's reason if no slot is free.
    pub fn try_reserve(self: &Arc<Self>, model: &str, agent: &str) -> Result<SlotGuard> {
        let mut state = self.lock_state();
        self.reserve_locked(&mut state, model, agent)
            .map_err(|reason| SchedulerError::AdmissionDenied { model: model.to_string(), reason })?;
        self.publish(&state);
        drop(state);
        Ok(self.adopt_slot(model, agent))
    }

    /// Wraps a slot already reserved for `agent` in a releasing guard.
    #[must_use]
    pub fn adopt_slot(self: &Arc<Self>, model: &str, agent: &str) -> SlotGuard {
        SlotGuard {
            ledger: Arc::clone(self),
            model: model.to_string(),
            holder: agent.to_string(),
            armed: true,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Ledger lock poisoned, continuing with recovered state");
            poisoned.into_inner()
        })
    }

    fn admission_check(
        &self,
        state: &LedgerState,
        model: &str,
        agent: Option<&str>,
    ) -> std::result::Result<(), String> {
        let Some(descriptor) = self.catalog.get(model) else {
            return Err(format!("model '{model}' is not in the catalog"));
        };
        if let Some(agent) = agent {
            let key = SlotKey { model: model.to_string(), holder: agent.to_string() };
            if state.slots.contains_key(&key) {
                return Err(format!("'{agent}' already holds a slot on '{model}'"));
            }
        }

        let capacity = self.capacity_of(descriptor.category);
        let used = state.used.get(&descriptor.category).copied().unwrap_or(0);
        let free = capacity.saturating_sub(used);
        if free < descriptor.concurrency_cost {
            return Err(format!(
                "category '{}' has {free} of {capacity} units free, '{model}' needs {}",
                descriptor.category, descriptor.concurrency_cost
            ));
        }
        Ok(())
    }

    fn reserve_locked(&self, state: &mut LedgerState, model: &str, agent: &str) -> std::result::Result<(), String> {
        self.admission_check(state, model, Some(agent))?;
        let Some(descriptor) = self.catalog.get(model) else {
            return Err(format!("model '{model}' is not in the catalog"));
        };

        *state.used.entry(descriptor.category).or_insert(0) += descriptor.concurrency_cost;
        state.slots.insert(
            SlotKey { model: model.to_string(), holder: agent.to_string() },
            ExecutionSlot {
                model: model.to_string(),
                holder_agent_id: agent.to_string(),
                category: descriptor.category,
                cost: descriptor.concurrency_cost,
                reserved_at: Utc::now(),
            },
        );
        debug!(model = %model, agent = %agent, category = %descriptor.category, "Slot reserved");
        Ok(())
    }

    fn publish(&self, state: &LedgerState) {
        let mut categories = BTreeMap::new();
        for category in ModelCategory::ALL {
            let capacity = self.capacity_of(category);
            let used = state.used.get(&category).copied().unwrap_or(0);
            let mut holders: Vec<String> = state
                .slots
                .values()
                .filter(|slot| slot.category == category)
                .map(|slot| slot.holder_agent_id.clone())
                .collect();
            holders.sort();
            categories.insert(
                category,
                CategoryStatus { capacity, used, free: capacity.saturating_sub(used), holders },
            );
        }

        let status = ResourceStatus { categories, slots_held: state.slots.len(), captured_at: Utc::now() };
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *snapshot = Arc::new(status);
    }
}

/// A held slot that is released exactly once, when released explicitly or
/// dropped.
#[must_use = "dropping the guard releases the slot immediately"]
pub struct SlotGuard {
    ledger: Arc<ResourceLedger>,
    model: String,
    holder: String,
    armed: bool,
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("model", &self.model)
            .field("holder", &self.holder)
            .field("armed", &self.armed)
            .finish()
    }
}

impl SlotGuard {
    /// Model the slot is held on.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Holder of the slot.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Releases the slot now.
    pub fn release(mut self) -> bool {
        self.armed = false;
        self.ledger.release_execution_slot(&self.model, &self.holder)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.ledger.release_execution_slot(&self.model, &self.holder);
        }
    }
}
