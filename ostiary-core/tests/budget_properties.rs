//! Budget ledger properties: consumption never exceeds the limit

use ostiary_core::budget::{BudgetConfig, BudgetLedger};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Outcome {
    Settle(u64),
    Release,
    Drop,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        (0u64..60).prop_map(Outcome::Settle),
        Just(Outcome::Release),
        Just(Outcome::Drop),
    ]
}

fn ledger(limit: u64) -> BudgetLedger {
    BudgetLedger::new(BudgetConfig {
        default_limit: limit,
        ..Default::default()
    })
}

proptest! {
    #[test]
    fn consumption_stays_within_limit(
        limit in 1u64..200,
        calls in prop::collection::vec((1u64..50, outcome()), 1..40),
    ) {
        let ledger = ledger(limit);
        let mut charged = 0u64;

        for (estimate, outcome) in calls {
            let Ok(reservation) = ledger.check_and_reserve("acme", estimate) else {
                // Rejections never happen while the estimate still fits
                prop_assert!(ledger.summary("acme").consumed + estimate > limit);
                continue;
            };
            match outcome {
                Outcome::Settle(actual) => charged += reservation.settle(actual).charged,
                Outcome::Release => {
                    reservation.release();
                }
                Outcome::Drop => drop(reservation),
            }

            let summary = ledger.summary("acme");
            prop_assert!(summary.consumed <= limit);
            prop_assert_eq!(summary.outstanding, 0);
            prop_assert_eq!(summary.consumed, charged);
            prop_assert_eq!(summary.remaining, limit - summary.consumed);
        }
    }

    #[test]
    fn tenants_are_isolated(
        spend in prop::collection::vec(1u64..20, 1..20),
    ) {
        let ledger = ledger(100);
        for cost in &spend {
            if let Ok(reservation) = ledger.check_and_reserve("acme", *cost) {
                reservation.settle(*cost);
            }
        }
        prop_assert_eq!(ledger.summary("globex").consumed, 0);
        prop_assert!(ledger.check_and_reserve("globex", 100).is_ok());
    }
}

#[test]
fn concurrent_reservations_never_overspend() {
    let ledger = Arc::new(ledger(1_000));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                let mut charged = 0;
                for _ in 0..100 {
                    if let Ok(reservation) = ledger.check_and_reserve("acme", 7) {
                        charged += reservation.settle(7).charged;
                    }
                }
                charged
            })
        })
        .collect();

    let charged: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let summary = ledger.summary("acme");
    assert_eq!(summary.consumed, charged);
    assert!(charged <= 1_000);
    // 142 * 7 = 994; one more would exceed the limit
    assert_eq!(charged, 994);
}
