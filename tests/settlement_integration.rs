//! End-to-end settlement scenarios through the service container

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use faregate::db::{CreateCheckpointInput, JourneyStatus, TransactionDirection};
use faregate::services::{DenialReason, GateDecision, GateEvent, PaymentMethod};
use faregate::{Config, FarePolicy, GateDb, ManualClock, Money, Page, Services};
use tempfile::TempDir;

fn services_with_clock(config: &Config) -> (Services, Arc<ManualClock>) {
    let db = Arc::new(GateDb::open_in_memory(Duration::from_secs(2)).unwrap());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let services = Services::with_clock(db, config, clock.clone());

    for (code, name) in [("STN-A", "Shivaji Nagar"), ("STN-B", "Swargate"), ("STN-X", "Hadapsar")] {
        services
            .stations
            .create(CreateCheckpointInput {
                code: code.into(),
                name: name.into(),
                city: "Pune".into(),
            })
            .unwrap();
    }
    services
        .fare_table
        .set_rule("STN-A", "STN-B", 12, Money::from_major(30))
        .unwrap();
    services
        .fare_table
        .set_rule("STN-A", "STN-X", 18, Money::from_major(30))
        .unwrap();

    (services, clock)
}

fn open_account(services: &Services, rider: &str, major: i64) {
    services.ledger.create_account(rider).unwrap();
    services.ledger.activate(rider).unwrap();
    if major > 0 {
        services
            .ledger
            .top_up(rider, Money::from_major(major), PaymentMethod::Upi, Some("SEED"))
            .unwrap();
    }
}

#[test]
fn test_round_trip_debits_exactly_the_fare() {
    let (services, clock) = services_with_clock(&Config::default());
    open_account(&services, "rider-1", 100);

    let entry = services.gate.entry("rider-1", "STN-A").unwrap();
    assert!(entry.is_allowed());
    let ongoing = services.gate.current_journey("rider-1").unwrap().unwrap();
    assert_eq!(ongoing.status, JourneyStatus::Ongoing);
    assert_eq!(ongoing.origin_name.as_deref(), Some("Shivaji Nagar"));

    clock.advance(chrono::Duration::minutes(42));
    let GateDecision::Allowed(exit) = services.gate.exit("rider-1", "STN-B").unwrap() else {
        panic!("exit denied");
    };

    let fare = exit.fare.clone().unwrap();
    assert_eq!(fare.base_fare, Money::from_major(30));
    assert_eq!(fare.service_charge, Money::from_major(5));
    assert_eq!(fare.penalty, Money::ZERO);
    assert_eq!(fare.total, Money::from_major(35));
    assert_eq!(exit.journey.status, JourneyStatus::Completed);
    assert_eq!(exit.journey.duration_minutes, Some(42));
    assert_eq!(exit.balance, Money::from_major(65));

    let log = services.ledger.transactions("rider-1", Page::first(10)).unwrap();
    let debit = &log.entries[0];
    assert_eq!(debit.direction, TransactionDirection::Debit);
    assert_eq!(debit.amount, Money::from_major(35));
    assert_eq!(debit.reference, exit.journey.id);
    assert_eq!(debit.fare.as_ref(), Some(&fare));
    assert_eq!(debit.fare, exit.journey.fare);

    // Top-ups carry no fare
    assert!(log.entries[1].fare.is_none());

    let history = services.gate.journey_history("rider-1", Page::first(10)).unwrap();
    assert_eq!(history.total, 1);
    assert_eq!(history.journeys[0].id, exit.journey.id);
}

#[test]
fn test_reverse_trip_uses_same_fare() {
    let (services, _clock) = services_with_clock(&Config::default());
    open_account(&services, "rider-1", 100);

    services.gate.entry("rider-1", "STN-B").unwrap();
    let exit = services.gate.exit("rider-1", "stn-a").unwrap();
    assert!(exit.is_allowed());
    assert_eq!(exit.balance(), Money::from_major(65));
}

#[test]
fn test_late_exit_penalty_recorded_separately() {
    let (services, clock) = services_with_clock(&Config::default());
    open_account(&services, "rider-1", 100);

    services.gate.entry("rider-1", "STN-A").unwrap();
    clock.advance(chrono::Duration::minutes(4 * 60 + 1));

    let GateDecision::Allowed(exit) = services.gate.exit("rider-1", "STN-B").unwrap() else {
        panic!("late exit denied");
    };
    let fare = exit.fare.unwrap();
    assert_eq!(fare.base_fare, Money::from_major(30));
    assert_eq!(fare.penalty, Money::from_major(50));
    assert_eq!(fare.total, Money::from_major(85));
    assert_eq!(exit.balance, Money::from_major(15));

    let stored = services.journeys.get(&exit.journey.id).unwrap().unwrap();
    assert_eq!(stored.fare.unwrap().penalty, Money::from_major(50));
}

#[test]
fn test_exit_exactly_at_deadline_has_no_penalty() {
    use chrono::TimeZone;

    let (services, clock) = services_with_clock(&Config::default());
    clock.set(Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap());
    open_account(&services, "rider-1", 100);
    open_account(&services, "rider-2", 100);

    services.gate.entry("rider-1", "STN-A").unwrap();
    services.gate.entry("rider-2", "STN-A").unwrap();
    clock.advance(chrono::Duration::minutes(4 * 60));

    let on_time = services.gate.exit("rider-1", "STN-B").unwrap();
    assert_eq!(on_time.balance(), Money::from_major(65));

    clock.advance(chrono::Duration::milliseconds(1));
    let late = services.gate.exit("rider-2", "STN-B").unwrap();
    assert_eq!(late.balance(), Money::from_major(15));
}

#[test]
fn test_denied_exit_leaves_state_untouched() {
    let (services, _clock) = services_with_clock(&Config::default());
    open_account(&services, "rider-1", 20);
    services.gate.entry("rider-1", "STN-A").unwrap();
    services
        .ledger
        .debit("rider-1", Money::from_major(10), "Snack kiosk", "POS-1")
        .unwrap();

    let before = services.ledger.transactions("rider-1", Page::first(10)).unwrap();
    let decision = services.gate.exit("rider-1", "STN-X").unwrap();

    assert_eq!(decision.reason(), Some(DenialReason::InsufficientFunds));
    assert_eq!(decision.balance(), Money::from_major(10));

    let journey = services.gate.current_journey("rider-1").unwrap().unwrap();
    assert_eq!(journey.status, JourneyStatus::Ongoing);
    assert_eq!(services.ledger.balance("rider-1").unwrap(), Money::from_major(10));
    let after = services.ledger.transactions("rider-1", Page::first(10)).unwrap();
    assert_eq!(after.total, before.total);
}

#[test]
fn test_account_creation_is_idempotent() {
    let (services, _clock) = services_with_clock(&Config::default());

    let first = services.ledger.create_account("rider-1").unwrap();
    let second = services.ledger.create_account("rider-1").unwrap();

    assert_eq!(first, second);
    assert_eq!(second.balance, Money::ZERO);
    assert_eq!(services.db.stats().unwrap().account_count, 1);
}

#[test]
fn test_policy_comes_from_config() {
    let config = Config {
        fares: FarePolicy {
            entry_floor: Money::from_major(50),
            service_charge: Money::from_minor(250),
            ..FarePolicy::default()
        },
        ..Config::default()
    };
    let (services, _clock) = services_with_clock(&config);
    open_account(&services, "rider-1", 40);

    assert_eq!(
        services.gate.entry("rider-1", "STN-A").unwrap().reason(),
        Some(DenialReason::InsufficientFunds)
    );

    let quote = services.fares.price("STN-A", "STN-B").unwrap();
    assert_eq!(quote.total, "32.50".parse::<Money>().unwrap());
}

#[tokio::test]
async fn test_gate_events_reach_subscribers() {
    let (services, _clock) = services_with_clock(&Config::default());
    let mut events = services.events.subscribe();
    open_account(&services, "rider-1", 100);
    services.gate.entry("rider-1", "STN-A").unwrap();

    let mut saw_entry = false;
    while let Ok(event) = events.try_recv() {
        if let GateEvent::GateAllowed { journey_id, charged, .. } = event {
            assert!(journey_id.starts_with("JRN"));
            assert!(charged.is_none());
            saw_entry = true;
        }
    }
    assert!(saw_entry);
}

#[test]
fn test_state_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        storage_dir: temp.path().to_path_buf(),
        ..Config::default()
    };

    {
        let db = Arc::new(GateDb::open(&config.db_path(), config.storage_timeout()).unwrap());
        let services = Services::new(db, &config);
        services
            .stations
            .create(CreateCheckpointInput {
                code: "STN-A".into(),
                name: "Shivaji Nagar".into(),
                city: "Pune".into(),
            })
            .unwrap();
        open_account(&services, "rider-1", 100);
        assert!(services.gate.entry("rider-1", "STN-A").unwrap().is_allowed());
    }

    let db = Arc::new(GateDb::open(&config.db_path(), config.storage_timeout()).unwrap());
    let services = Services::new(db, &config);
    assert!(services.gate.current_journey("rider-1").unwrap().is_some());
    assert_eq!(services.ledger.balance("rider-1").unwrap(), Money::from_major(100));
}

#[test]
fn test_config_file_round_trip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");

    let mut config = Config::default();
    config.fares.late_exit_penalty = Money::from_major(75);
    config.history_page_size = 10;
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.fares, config.fares);
    assert_eq!(loaded.history_page_size, 10);
    assert_eq!(loaded.limits, config.limits);
}
