//! Journey ledger - the one-ongoing-trip-per-rider state machine
//!
//! ```text
//! (none) --start--> ongoing --complete--> completed
//!                      \
//!                       `---cancel----> emergency_cancelled
//! ```
//!
//! Both transitions out of `ongoing` are conditional writes, so when a cancel
//! races a completion exactly one of them lands and the other sees
//! [`JourneyError::NoOngoingJourney`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::FarePolicy;
use crate::db::journeys::{self, Completion, InsertOutcome, NewJourney};
use crate::db::{checkpoints::normalize_code, FareBreakdown, GateDb, Journey, Page};
use crate::error::StorageError;
use crate::money::Money;

use super::events::{EventBus, GateEvent};
use super::fares::PricedItinerary;

#[derive(Error, Debug)]
pub enum JourneyError {
    #[error("Rider already has an ongoing journey {} from {}", .0.id, .0.origin_code)]
    AlreadyOngoing(Box<Journey>),

    #[error("No ongoing journey for rider {0}")]
    NoOngoingJourney(String),

    #[error("Journey not found: {0}")]
    NotFound(String),

    #[error("Fare for journey {0} is out of range")]
    FareOutOfRange(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Human-traceable journey id: `JRN` + unix seconds + 4 hex chars
fn new_journey_id(now: DateTime<Utc>) -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("JRN{}{}", now.timestamp(), &hex[..4])
}

/// Journey ledger service
pub struct JourneyLedger {
    db: Arc<GateDb>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    policy: FarePolicy,
}

impl JourneyLedger {
    pub fn new(db: Arc<GateDb>, events: Arc<EventBus>, clock: Arc<dyn Clock>, policy: FarePolicy) -> Self {
        Self {
            db,
            events,
            clock,
            policy,
        }
    }

    /// Open a journey; refuses if the rider already has one ongoing
    pub fn start_journey(&self, rider_id: &str, origin_code: &str) -> Result<Journey, JourneyError> {
        let origin_code = normalize_code(origin_code);
        let now = self.clock.now_millis();
        let deadline = now + Duration::minutes(self.policy.max_journey_minutes);

        let journey = self.db.with_tx(|tx| -> Result<Journey, JourneyError> {
            // Retry once on id collision
            for _ in 0..2 {
                let id = new_journey_id(now);
                let outcome = journeys::insert_ongoing(
                    tx,
                    &NewJourney {
                        id: &id,
                        rider_id,
                        origin_code: &origin_code,
                        origin_time: now,
                        deadline,
                    },
                )?;

                match outcome {
                    InsertOutcome::Inserted => {
                        return journeys::get_journey(tx, &id)?.ok_or_else(|| {
                            StorageError::Internal("Failed to retrieve started journey".into()).into()
                        });
                    }
                    InsertOutcome::RiderHasOngoing => {
                        let existing = journeys::get_ongoing(tx, rider_id)?.ok_or_else(|| {
                            StorageError::Internal("Ongoing journey vanished inside transaction".into())
                        })?;
                        return Err(JourneyError::AlreadyOngoing(Box::new(existing)));
                    }
                    InsertOutcome::IdTaken => {
                        warn!(journey = %id, "Journey id collision, regenerating");
                    }
                }
            }
            Err(StorageError::Internal("Could not allocate a unique journey id".into()).into())
        })?;

        info!(
            journey = %journey.id,
            rider = %rider_id,
            origin = %journey.origin_code,
            deadline = %journey.deadline,
            "Journey started"
        );
        self.events.emit(GateEvent::JourneyStarted {
            journey_id: journey.id.clone(),
            rider_id: rider_id.to_string(),
            origin_code: journey.origin_code.clone(),
        });

        Ok(journey)
    }

    pub fn get_ongoing(&self, rider_id: &str) -> Result<Option<Journey>, StorageError> {
        self.db.with_conn(|conn| journeys::get_ongoing(conn, rider_id))
    }

    pub fn get(&self, journey_id: &str) -> Result<Option<Journey>, StorageError> {
        self.db.with_conn(|conn| journeys::get_journey(conn, journey_id))
    }

    /// Final fare for a journey ending at `now`, late-exit penalty included
    ///
    /// The penalty applies only strictly after the deadline; `now` must be a
    /// [`Clock::now_millis`] reading.
    pub fn assess(
        &self,
        journey: &Journey,
        itinerary: &PricedItinerary,
        now: DateTime<Utc>,
    ) -> Result<FareBreakdown, JourneyError> {
        let penalty = if now > journey.deadline {
            debug!(journey = %journey.id, deadline = %journey.deadline, "Exit past deadline");
            self.policy.late_exit_penalty
        } else {
            Money::ZERO
        };

        let total = itinerary
            .total
            .checked_add(penalty)
            .ok_or_else(|| JourneyError::FareOutOfRange(journey.id.clone()))?;

        Ok(FareBreakdown {
            origin_code: itinerary.origin_code.clone(),
            destination_code: itinerary.destination_code.clone(),
            distance_km: itinerary.distance_km,
            base_fare: itinerary.base_fare,
            service_charge: itinerary.service_charge,
            penalty,
            total,
        })
    }

    /// Close the rider's ongoing journey with a priced fare (no ledger posting)
    pub fn complete_journey(
        &self,
        rider_id: &str,
        destination_code: &str,
        itinerary: &PricedItinerary,
    ) -> Result<Journey, JourneyError> {
        let destination_code = normalize_code(destination_code);
        let now = self.clock.now_millis();

        let journey = self.db.with_tx(|tx| -> Result<Journey, JourneyError> {
            let ongoing = journeys::get_ongoing(tx, rider_id)?
                .ok_or_else(|| JourneyError::NoOngoingJourney(rider_id.to_string()))?;
            let fare = self.assess(&ongoing, itinerary, now)?;
            Self::complete_in(tx, &ongoing, &destination_code, &fare, now)
        })?;

        self.publish_completed(&journey);
        Ok(journey)
    }

    /// Completion inside a caller-owned transaction
    pub(crate) fn complete_in(
        conn: &Connection,
        journey: &Journey,
        destination_code: &str,
        fare: &FareBreakdown,
        now: DateTime<Utc>,
    ) -> Result<Journey, JourneyError> {
        let duration_minutes = (now - journey.origin_time).num_minutes().max(0);
        let completed = journeys::complete_ongoing(
            conn,
            &journey.id,
            &Completion {
                destination_code,
                destination_time: now,
                duration_minutes,
                fare,
            },
        )?;

        if !completed {
            return Err(JourneyError::NoOngoingJourney(journey.rider_id.clone()));
        }

        Ok(journeys::get_journey(conn, &journey.id)?
            .ok_or_else(|| StorageError::Internal("Failed to retrieve completed journey".into()))?)
    }

    /// Announce a committed completion
    pub(crate) fn publish_completed(&self, journey: &Journey) {
        let (total, penalty) = journey
            .fare
            .as_ref()
            .map(|fare| (fare.total, fare.penalty))
            .unwrap_or_default();

        info!(
            journey = %journey.id,
            rider = %journey.rider_id,
            destination = ?journey.destination_code,
            minutes = ?journey.duration_minutes,
            total = %total,
            penalty = %penalty,
            "Journey completed"
        );
        self.events.emit(GateEvent::JourneyCompleted {
            journey_id: journey.id.clone(),
            rider_id: journey.rider_id.clone(),
            total,
            penalty,
        });
    }

    /// Operator override: ongoing -> emergency_cancelled, no fare
    pub fn cancel(&self, journey_id: &str) -> Result<Journey, JourneyError> {
        let now = self.clock.now_millis();
        let journey = self.db.with_tx(|tx| -> Result<Journey, JourneyError> {
            let journey = journeys::get_journey(tx, journey_id)?
                .ok_or_else(|| JourneyError::NotFound(journey_id.to_string()))?;

            if !journeys::cancel_ongoing(tx, journey_id, now)? {
                return Err(JourneyError::NoOngoingJourney(journey.rider_id));
            }

            Ok(journeys::get_journey(tx, journey_id)?
                .ok_or_else(|| StorageError::Internal("Failed to retrieve cancelled journey".into()))?)
        })?;

        info!(journey = %journey.id, rider = %journey.rider_id, "Journey emergency-cancelled");
        self.events.emit(GateEvent::JourneyCancelled {
            journey_id: journey.id.clone(),
            rider_id: journey.rider_id.clone(),
        });
        Ok(journey)
    }

    /// Emergency exit addressed by rider rather than journey id
    pub fn cancel_for_rider(&self, rider_id: &str) -> Result<Journey, JourneyError> {
        let ongoing = self
            .get_ongoing(rider_id)?
            .ok_or_else(|| JourneyError::NoOngoingJourney(rider_id.to_string()))?;

        match self.cancel(&ongoing.id) {
            Err(JourneyError::NotFound(_)) => Err(JourneyError::NoOngoingJourney(rider_id.to_string())),
            other => other,
        }
    }

    /// Completed journeys, most recent exit first
    pub fn list_completed(&self, rider_id: &str, page: Page) -> Result<Vec<Journey>, StorageError> {
        self.db.with_conn(|conn| journeys::list_completed(conn, rider_id, page))
    }

    pub fn count_completed(&self, rider_id: &str) -> Result<u64, StorageError> {
        self.db.with_conn(|conn| journeys::count_completed(conn, rider_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::JourneyStatus;

    struct Fixture {
        clock: Arc<ManualClock>,
        ledger: JourneyLedger,
    }

    fn fixture() -> Fixture {
        fixture_at(Utc::now())
    }

    fn fixture_at(start: DateTime<Utc>) -> Fixture {
        let db = Arc::new(GateDb::open_in_memory(std::time::Duration::from_secs(1)).unwrap());
        let clock = Arc::new(ManualClock::new(start));
        let ledger = JourneyLedger::new(db, Arc::new(EventBus::new()), clock.clone(), FarePolicy::default());
        Fixture { clock, ledger }
    }

    fn itinerary() -> PricedItinerary {
        PricedItinerary {
            origin_code: "STN-A".into(),
            destination_code: "STN-B".into(),
            distance_km: 12,
            base_fare: Money::from_major(30),
            service_charge: Money::from_major(5),
            total: Money::from_major(35),
        }
    }

    #[test]
    fn test_journey_id_format() {
        let now = Utc::now();
        let id = new_journey_id(now);
        let suffix = &id[3 + now.timestamp().to_string().len()..];

        assert!(id.starts_with(&format!("JRN{}", now.timestamp())));
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_start_sets_deadline_and_refuses_second() {
        let f = fixture();
        let journey = f.ledger.start_journey("rider-1", "stn-a").unwrap();
        assert_eq!(journey.status, JourneyStatus::Ongoing);
        assert_eq!(journey.origin_code, "STN-A");
        assert_eq!(journey.deadline - journey.origin_time, Duration::minutes(240));

        match f.ledger.start_journey("rider-1", "STN-B") {
            Err(JourneyError::AlreadyOngoing(existing)) => assert_eq!(existing.id, journey.id),
            other => panic!("expected AlreadyOngoing, got {other:?}"),
        }
    }

    #[test]
    fn test_complete_on_time_has_no_penalty() {
        let f = fixture();
        f.ledger.start_journey("rider-1", "STN-A").unwrap();
        f.clock.advance(Duration::minutes(25));

        let done = f.ledger.complete_journey("rider-1", "STN-B", &itinerary()).unwrap();
        let fare = done.fare.unwrap();
        assert_eq!(done.status, JourneyStatus::Completed);
        assert_eq!(done.duration_minutes, Some(25));
        assert_eq!(fare.penalty, Money::ZERO);
        assert_eq!(fare.total, Money::from_major(35));
        assert!(f.ledger.get_ongoing("rider-1").unwrap().is_none());
        assert_eq!(f.ledger.count_completed("rider-1").unwrap(), 1);
    }

    #[test]
    fn test_late_exit_penalty_is_separate() {
        let f = fixture();
        f.ledger.start_journey("rider-1", "STN-A").unwrap();
        f.clock.advance(Duration::minutes(241));

        let fare = f
            .ledger
            .complete_journey("rider-1", "STN-B", &itinerary())
            .unwrap()
            .fare
            .unwrap();
        assert_eq!(fare.base_fare, Money::from_major(30));
        assert_eq!(fare.penalty, Money::from_major(50));
        assert_eq!(fare.total, Money::from_major(85));
    }

    #[test]
    fn test_penalty_starts_strictly_after_deadline() {
        use chrono::TimeZone;

        // Sub-millisecond origin time; storage keeps milliseconds only
        let f = fixture_at(Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap());
        f.ledger.start_journey("on-time", "STN-A").unwrap();
        f.ledger.start_journey("late", "STN-A").unwrap();

        f.clock.advance(Duration::minutes(240));
        let at_deadline = f
            .ledger
            .complete_journey("on-time", "STN-B", &itinerary())
            .unwrap()
            .fare
            .unwrap();
        assert_eq!(at_deadline.penalty, Money::ZERO);
        assert_eq!(at_deadline.total, Money::from_major(35));

        f.clock.advance(Duration::milliseconds(1));
        let past_deadline = f
            .ledger
            .complete_journey("late", "STN-B", &itinerary())
            .unwrap()
            .fare
            .unwrap();
        assert_eq!(past_deadline.penalty, Money::from_major(50));
        assert_eq!(past_deadline.total, Money::from_major(85));
    }

    #[test]
    fn test_penalty_overflow_is_an_error() {
        let f = fixture();
        let journey = f.ledger.start_journey("rider-1", "STN-A").unwrap();
        f.clock.advance(Duration::minutes(300));

        let huge = PricedItinerary {
            total: Money::from_minor(i64::MAX - 10),
            ..itinerary()
        };
        assert!(matches!(
            f.ledger.assess(&journey, &huge, f.clock.now_millis()),
            Err(JourneyError::FareOutOfRange(_))
        ));
    }

    #[test]
    fn test_complete_without_ongoing() {
        let f = fixture();
        assert!(matches!(
            f.ledger.complete_journey("rider-1", "STN-B", &itinerary()),
            Err(JourneyError::NoOngoingJourney(_))
        ));
    }

    #[test]
    fn test_cancel_paths() {
        let f = fixture();
        let journey = f.ledger.start_journey("rider-1", "STN-A").unwrap();

        let cancelled = f.ledger.cancel(&journey.id).unwrap();
        assert_eq!(cancelled.status, JourneyStatus::EmergencyCancelled);
        assert!(cancelled.fare.is_none());

        assert!(matches!(f.ledger.cancel(&journey.id), Err(JourneyError::NoOngoingJourney(_))));
        assert!(matches!(f.ledger.cancel("JRN0000"), Err(JourneyError::NotFound(_))));
        assert!(matches!(
            f.ledger.cancel_for_rider("rider-1"),
            Err(JourneyError::NoOngoingJourney(_))
        ));

        // Rider is free to tap in again
        let next = f.ledger.start_journey("rider-1", "STN-B").unwrap();
        assert_eq!(f.ledger.cancel_for_rider("rider-1").unwrap().id, next.id);
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let f = fixture();
        for destination in ["STN-B", "STN-C"] {
            f.ledger.start_journey("rider-1", "STN-A").unwrap();
            f.clock.advance(Duration::minutes(10));
            f.ledger.complete_journey("rider-1", destination, &itinerary()).unwrap();
        }

        let history = f.ledger.list_completed("rider-1", Page::first(10)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].destination_code.as_deref(), Some("STN-C"));
        assert_eq!(history[1].destination_code.as_deref(), Some("STN-B"));
    }
}
