//! Service layer for faregate
//!
//! Services hold the business rules between callers (the CLI, a gate-event
//! handler) and the repositories in `db/*`. Each one takes the shared
//! [`GateDb`] handle and [`EventBus`] in its constructor.
//!
//! ## Architecture
//!
//! ```text
//! GateOrchestrator (entry / exit decisions)
//!     ↓
//! StationRegistry · FareResolver · Ledger · JourneyLedger
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod fares;
pub mod gate;
pub mod journeys;
pub mod ledger;
pub mod stations;

// Re-exports
pub use events::{spawn_logging_listener, EventBus, EventListener, GateEvent, LoggingEventListener};
pub use fares::{FareError, FareResolver, FareTable, PricedItinerary};
pub use gate::{
    Admission, Denial, DenialReason, GateDecision, GateDirection, GateError, GateOrchestrator, GateStep,
    HistoryPage,
};
pub use journeys::{JourneyError, JourneyLedger};
pub use ledger::{Ledger, LedgerError, PaymentMethod, TransactionPage};
pub use stations::{StationDirectory, StationRegistry};

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::GateDb;

/// Service container for dependency injection
///
/// Holds all services over one shared database handle and event bus.
pub struct Services {
    pub stations: Arc<StationRegistry>,
    pub fares: Arc<FareResolver>,
    pub fare_table: Arc<FareTable>,
    pub ledger: Arc<Ledger>,
    pub journeys: Arc<JourneyLedger>,
    pub gate: Arc<GateOrchestrator>,
    pub events: Arc<EventBus>,
    pub db: Arc<GateDb>,
}

impl Services {
    /// Create all services on the system clock
    pub fn new(db: Arc<GateDb>, config: &Config) -> Self {
        Self::with_clock(db, config, Arc::new(SystemClock))
    }

    /// Create all services on a caller-supplied clock (for testing)
    pub fn with_clock(db: Arc<GateDb>, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let events = Arc::new(EventBus::new());
        let policy = config.fares.clone();

        let stations = Arc::new(StationRegistry::new(db.clone()));
        let fares = Arc::new(FareResolver::new(db.clone(), policy.clone()));
        let ledger = Arc::new(Ledger::new(
            db.clone(),
            events.clone(),
            config.currency.clone(),
            config.limits.clone(),
        ));
        let journeys = Arc::new(JourneyLedger::new(db.clone(), events.clone(), clock.clone(), policy.clone()));
        let gate = Arc::new(GateOrchestrator::new(
            db.clone(),
            stations.clone(),
            fares.clone(),
            ledger.clone(),
            journeys.clone(),
            events.clone(),
            clock,
            policy,
        ));

        Self {
            stations,
            fares,
            fare_table: Arc::new(FareTable::new(db.clone(), config.limits.single_transaction_limit)),
            ledger,
            journeys,
            gate,
            events,
            db,
        }
    }
}
