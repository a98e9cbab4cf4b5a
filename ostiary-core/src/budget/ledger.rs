use crate::store::{SharedStore, key_for};
use crate::tools::{ErrorCode, ToolError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Budget limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Limit for tenants without an explicit entry, in cost units
    pub default_limit: u64,

    /// Rolling window after which consumption resets (none = lifetime budget)
    #[serde(with = "humantime_serde")]
    pub window: Option<Duration>,

    /// Per-tenant overrides
    pub tenants: BTreeMap<String, TenantBudgetConfig>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_limit: 10_000,
            window: None,
            tenants: BTreeMap::new(),
        }
    }
}

impl BudgetConfig {
    /// Set a tenant's limit
    pub fn with_tenant_limit(mut self, tenant: impl Into<String>, limit: u64) -> Self {
        self.tenants.insert(
            tenant.into(),
            TenantBudgetConfig {
                limit,
                window: None,
            },
        );
        self
    }

    fn limits_for(&self, tenant: &str) -> (u64, Option<Duration>) {
        match self.tenants.get(tenant) {
            Some(t) => (t.limit, t.window.or(self.window)),
            None => (self.default_limit, self.window),
        }
    }
}

/// Per-tenant budget override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantBudgetConfig {
    /// Limit in cost units
    pub limit: u64,

    /// Window override
    #[serde(default, with = "humantime_serde")]
    pub window: Option<Duration>,
}

/// Persisted per-tenant state
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TenantState {
    limit: u64,
    #[serde(with = "humantime_serde")]
    window: Option<Duration>,
    consumed: u64,
    outstanding: u64,
    window_started: DateTime<Utc>,
    epoch: u64,
}

impl TenantState {
    fn new(limit: u64, window: Option<Duration>) -> Self {
        Self {
            limit,
            window,
            consumed: 0,
            outstanding: 0,
            window_started: Utc::now(),
            epoch: 0,
        }
    }

    fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }

    /// Start a new window if the current one has elapsed
    fn roll_window(&mut self, now: DateTime<Utc>) {
        let Some(window) = self.window else {
            return;
        };
        let elapsed = (now - self.window_started).to_std().unwrap_or_default();
        if elapsed >= window {
            self.consumed = 0;
            self.outstanding = 0;
            self.window_started = now;
            self.epoch += 1;
        }
    }

    fn window_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let window = self.window?;
        let elapsed = (now - self.window_started).to_std().unwrap_or_default();
        Some(window.saturating_sub(elapsed))
    }
}

struct TenantSlot {
    tenant: String,
    state: Mutex<TenantState>,
}

/// Point-in-time view of a tenant's budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    /// Tenant ID
    pub tenant_id: String,
    /// Limit in cost units
    pub limit: u64,
    /// Consumed in the current window (including outstanding reservations)
    pub consumed: u64,
    /// Headroom left
    pub remaining: u64,
    /// Reserved but not yet settled
    pub outstanding: u64,
    /// Current window start
    pub window_started: DateTime<Utc>,
    /// Window length, if any
    #[serde(with = "humantime_serde")]
    pub window: Option<Duration>,
}

/// Outcome of settling a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Cost units charged
    pub charged: u64,
    /// Cost units returned to the tenant
    pub released: u64,
    /// Actual cost exceeded both the reservation and the remaining headroom;
    /// the excess was not charged
    pub overrun: bool,
    /// The reservation belonged to an earlier window and had no effect
    pub stale: bool,
}

/// Per-tenant atomic cost accounting
pub struct BudgetLedger {
    config: BudgetConfig,
    tenants: Mutex<HashMap<String, Arc<TenantSlot>>>,
    store: Option<SharedStore>,
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("config", &self.config)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl BudgetLedger {
    /// Create a process-local ledger
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            tenants: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Persist tenant state to a durable store
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn slot(&self, tenant: &str) -> Arc<TenantSlot> {
        if let Some(slot) = self
            .tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
        {
            return Arc::clone(slot);
        }

        // Store reads happen outside the map lock; a racing first call for
        // the same tenant loads too, and the first insert wins.
        let (limit, window) = self.config.limits_for(tenant);
        let mut state = self
            .load(tenant)
            .unwrap_or_else(|| TenantState::new(limit, window));
        // Configuration wins over whatever limit was persisted
        state.limit = limit;
        state.window = window;

        let mut tenants = self.tenants.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = tenants.entry(tenant.to_string()).or_insert_with(|| {
            Arc::new(TenantSlot {
                tenant: tenant.to_string(),
                state: Mutex::new(state),
            })
        });
        Arc::clone(slot)
    }

    fn load(&self, tenant: &str) -> Option<TenantState> {
        let store = self.store.as_ref()?;
        let key = key_for("budget", tenant);
        match store.get(&key) {
            Ok(Some(value)) => match serde_json::from_value::<TenantState>(value) {
                Ok(mut state) => {
                    // Reservations that were in flight at shutdown stay charged
                    state.outstanding = 0;
                    Some(state)
                }
                Err(e) => {
                    tracing::warn!(tenant, error = %e, "Ignoring unreadable budget state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(tenant, error = %e, "Failed to load budget state");
                None
            }
        }
    }

    /// Atomically check headroom and reserve `estimated_cost`.
    ///
    /// Concurrent reservations for one tenant are linearized; a reservation
    /// that would push consumption past the limit is rejected with
    /// `BUDGET_EXCEEDED`, never clamped.
    pub fn check_and_reserve(
        &self,
        tenant: &str,
        estimated_cost: u64,
    ) -> Result<Reservation, ToolError> {
        let slot = self.slot(tenant);
        let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        state.roll_window(now);

        let within_limit = state
            .consumed
            .checked_add(estimated_cost)
            .is_some_and(|total| total <= state.limit);
        if !within_limit {
            let remaining = state.remaining();
            tracing::warn!(
                tenant,
                estimated_cost,
                remaining,
                limit = state.limit,
                "Budget exceeded"
            );
            let mut error = ToolError::new(
                ErrorCode::BudgetExceeded,
                format!(
                    "Reservation of {} exceeds remaining budget {} of {}",
                    estimated_cost, remaining, state.limit
                ),
            )
            .with_context(serde_json::json!({
                "remaining": remaining,
                "limit": state.limit,
                "requested": estimated_cost,
            }));
            if let Some(retry_after) = state.window_remaining(now) {
                error = error.with_retry_after(retry_after);
            }
            return Err(error);
        }

        state.consumed += estimated_cost;
        state.outstanding += estimated_cost;
        let epoch = state.epoch;
        self.handle().persist(tenant, &state);
        drop(state);

        tracing::debug!(tenant, estimated_cost, "Reserved budget");

        Ok(Reservation {
            id: uuid::Uuid::new_v4(),
            ledger: self.handle(),
            slot,
            amount: estimated_cost,
            epoch,
            done: false,
        })
    }

    /// Current summary for one tenant
    pub fn summary(&self, tenant: &str) -> BudgetSummary {
        let slot = self.slot(tenant);
        let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.roll_window(Utc::now());
        Self::summarize(&slot.tenant, &state)
    }

    /// Summaries for every tenant seen by this ledger (or its store), sorted by tenant
    pub fn summaries(&self) -> Vec<BudgetSummary> {
        if let Some(store) = &self.store {
            match store.scan_prefix("budget/") {
                Ok(entries) => {
                    for (_, value) in entries {
                        if let Some(tenant) = value.get("tenant").and_then(|t| t.as_str()) {
                            self.slot(tenant);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to scan budget state"),
            }
        }

        let slots: Vec<Arc<TenantSlot>> = self
            .tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut summaries: Vec<BudgetSummary> = slots
            .iter()
            .map(|slot| {
                let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.roll_window(Utc::now());
                Self::summarize(&slot.tenant, &state)
            })
            .collect();
        summaries.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        summaries
    }

    fn summarize(tenant: &str, state: &TenantState) -> BudgetSummary {
        BudgetSummary {
            tenant_id: tenant.to_string(),
            limit: state.limit,
            consumed: state.consumed,
            remaining: state.remaining(),
            outstanding: state.outstanding,
            window_started: state.window_started,
            window: state.window,
        }
    }

    fn handle(&self) -> LedgerHandle {
        LedgerHandle {
            store: self.store.clone(),
        }
    }
}

/// What a reservation needs to persist its settlement
#[derive(Clone)]
struct LedgerHandle {
    store: Option<SharedStore>,
}

impl LedgerHandle {
    fn persist(&self, tenant: &str, state: &TenantState) {
        let Some(store) = &self.store else {
            return;
        };
        let mut value = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(tenant, error = %e, "Failed to encode budget state");
                return;
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("tenant".into(), serde_json::Value::String(tenant.to_string()));
        }
        if let Err(e) = store.put(&key_for("budget", tenant), &value) {
            tracing::warn!(tenant, error = %e, "Failed to persist budget state");
        }
    }
}

/// Reserved cost units awaiting settlement.
///
/// Dropping an unsettled reservation releases it in full, so abandoned
/// invocations never leak budget.
#[must_use = "dropping a reservation releases it"]
pub struct Reservation {
    id: uuid::Uuid,
    ledger: LedgerHandle,
    slot: Arc<TenantSlot>,
    amount: u64,
    epoch: u64,
    done: bool,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("tenant", &self.slot.tenant)
            .field("amount", &self.amount)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Reservation {
    /// Reservation ID
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// Tenant the reservation belongs to
    pub fn tenant(&self) -> &str {
        &self.slot.tenant
    }

    /// Reserved amount
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Reconcile against the actual cost.
    ///
    /// The unused portion is released. A cost above the reservation is
    /// charged only if the tenant still has headroom for the excess;
    /// otherwise the excess is reported as an overrun and not charged.
    pub fn settle(mut self, actual: u64) -> Settlement {
        self.done = true;
        self.apply(actual)
    }

    /// Release the whole reservation
    pub fn release(mut self) -> Settlement {
        self.done = true;
        self.apply(0)
    }

    fn apply(&self, actual: u64) -> Settlement {
        let tenant = self.slot.tenant.as_str();
        let mut state = self
            .slot
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.roll_window(Utc::now());

        if state.epoch != self.epoch {
            tracing::debug!(tenant, reservation = %self.id, "Ignoring settlement from an earlier window");
            return Settlement {
                charged: 0,
                released: 0,
                overrun: false,
                stale: true,
            };
        }

        state.outstanding = state.outstanding.saturating_sub(self.amount);

        let settlement = if actual <= self.amount {
            let released = self.amount - actual;
            state.consumed = state.consumed.saturating_sub(released);
            Settlement {
                charged: actual,
                released,
                overrun: false,
                stale: false,
            }
        } else {
            let excess = actual - self.amount;
            if state.remaining() >= excess {
                state.consumed += excess;
                Settlement {
                    charged: actual,
                    released: 0,
                    overrun: false,
                    stale: false,
                }
            } else {
                tracing::warn!(
                    tenant,
                    reserved = self.amount,
                    actual,
                    remaining = state.remaining(),
                    "Actual cost overran reservation and budget"
                );
                Settlement {
                    charged: self.amount,
                    released: 0,
                    overrun: true,
                    stale: false,
                }
            }
        };

        self.ledger.persist(tenant, &state);
        settlement
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            let settlement = self.apply(0);
            tracing::debug!(
                tenant = %self.slot.tenant,
                released = settlement.released,
                "Released abandoned reservation"
            );
        }
    }
}
