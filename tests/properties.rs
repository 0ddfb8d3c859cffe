//! Property tests for balance and pricing invariants

use std::sync::Arc;
use std::time::Duration;

use faregate::db::CreateCheckpointInput;
use faregate::services::{EventBus, FareResolver, FareTable, Ledger, LedgerError, StationRegistry};
use faregate::{AccountLimits, FarePolicy, GateDb, Money};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Posting {
    Credit(i64),
    Debit(i64),
}

fn posting() -> impl Strategy<Value = Posting> {
    prop_oneof![
        (1i64..5_000).prop_map(Posting::Credit),
        (1i64..8_000).prop_map(Posting::Debit),
    ]
}

fn fresh_db() -> Arc<GateDb> {
    Arc::new(GateDb::open_in_memory(Duration::from_secs(1)).unwrap())
}

proptest! {
    #[test]
    fn balance_never_goes_negative(postings in prop::collection::vec(posting(), 1..40)) {
        let ledger = Ledger::new(fresh_db(), Arc::new(EventBus::new()), "INR", AccountLimits::default());
        ledger.create_account("rider-1").unwrap();
        let mut model = 0i64;

        for posting in postings {
            let before = ledger.balance("rider-1").unwrap();
            match posting {
                Posting::Credit(minor) => {
                    ledger.credit("rider-1", Money::from_minor(minor), "credit", "P").unwrap();
                    model += minor;
                }
                Posting::Debit(minor) => {
                    match ledger.debit("rider-1", Money::from_minor(minor), "debit", "P") {
                        Ok(entry) => {
                            prop_assert!(model >= minor);
                            model -= minor;
                            prop_assert_eq!(entry.balance_after, Money::from_minor(model));
                        }
                        Err(LedgerError::InsufficientFunds { balance, .. }) => {
                            prop_assert!(model < minor);
                            prop_assert_eq!(balance, before);
                            prop_assert_eq!(ledger.balance("rider-1").unwrap(), before);
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {}", other),
                    }
                }
            }

            let balance = ledger.balance("rider-1").unwrap();
            prop_assert!(!balance.is_negative());
            prop_assert_eq!(balance, Money::from_minor(model));
        }
    }

    #[test]
    fn fares_are_symmetric(distance in 1u32..500, base_minor in 1i64..100_000, stored_forward in any::<bool>()) {
        let db = fresh_db();
        let stations = StationRegistry::new(Arc::clone(&db));
        for code in ["STN-A", "STN-B"] {
            stations
                .create(CreateCheckpointInput { code: code.into(), name: code.into(), city: String::new() })
                .unwrap();
        }

        let (origin, destination) = if stored_forward { ("STN-A", "STN-B") } else { ("STN-B", "STN-A") };
        FareTable::new(Arc::clone(&db), AccountLimits::default().single_transaction_limit)
            .set_rule(origin, destination, distance, Money::from_minor(base_minor))
            .unwrap();

        let policy = FarePolicy::default();
        let resolver = FareResolver::new(db, policy.clone());
        let there = resolver.price("STN-A", "STN-B").unwrap();
        let back = resolver.price("STN-B", "STN-A").unwrap();

        prop_assert_eq!(there.total, back.total);
        prop_assert_eq!(there.distance_km, back.distance_km);
        prop_assert_eq!(Some(there.total), Money::from_minor(base_minor).checked_add(policy.service_charge));

        let same = resolver.price("STN-A", "STN-A").unwrap();
        prop_assert_eq!(Some(same.total), policy.same_checkpoint_base_fare.checked_add(policy.service_charge));
        prop_assert_eq!(same.distance_km, 0);
    }
}
