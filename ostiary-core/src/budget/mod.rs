//! Per-tenant budget accounting
//!
//! The [`BudgetLedger`] is the only owner of consumed-cost state. Every
//! change goes through `check_and_reserve` (atomic per tenant) and the
//! returned [`Reservation`] guard, which settles against the actual cost or
//! releases on drop. Consumed never exceeds the tenant's limit.
//!
//! The [`AnomalyDetector`] keeps a rolling cost history per tenant and flags
//! costs that deviate sharply from it.

mod anomaly;
mod ledger;

pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyFlag, AnomalyKind};
pub use ledger::{
    BudgetConfig, BudgetLedger, BudgetSummary, Reservation, Settlement, TenantBudgetConfig,
};
