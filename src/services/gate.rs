//! Gate orchestrator - entry and exit decisions
//!
//! A gate event ends in exactly one of three ways:
//!
//! - [`GateDecision::Allowed`]: open the gate
//! - [`GateDecision::Denied`]: keep it closed, with a reason code for the
//!   display and the audit log
//! - [`GateError`]: a storage fault; nothing past the failed step was applied
//!   and `step` says where it stopped
//!
//! Exit settlement (fare debit and journey completion) commits as one
//! storage transaction, so a debit is never recorded against a journey that
//! did not complete.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::FarePolicy;
use crate::db::accounts::LedgerEntry;
use crate::db::{checkpoints::normalize_code, FareBreakdown, GateDb, Journey, Page};
use crate::error::StorageError;
use crate::money::Money;

use super::events::{EventBus, GateEvent};
use super::fares::{FareError, FareResolver};
use super::journeys::{JourneyError, JourneyLedger};
use super::ledger::{Ledger, LedgerError};
use super::stations::StationDirectory;

/// Which side of the trip a gate event is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDirection {
    Entry,
    Exit,
}

/// Business reason a gate stays closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    InvalidCheckpoint,
    InsufficientFunds,
    AlreadyOngoing,
    NoOngoingJourney,
    NoFareConfigured,
    AccountNotFound,
}

impl DenialReason {
    /// Machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCheckpoint => "INVALID_CHECKPOINT",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::AlreadyOngoing => "ALREADY_ONGOING",
            Self::NoOngoingJourney => "NO_ONGOING_JOURNEY",
            Self::NoFareConfigured => "NO_FARE_CONFIGURED",
            Self::AccountNotFound => "ACCOUNT_NOT_FOUND",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An opened gate
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub direction: GateDirection,
    pub checkpoint_code: String,
    /// Ongoing journey after entry, completed journey after exit
    pub journey: Journey,
    /// Settled fare (exit only)
    pub fare: Option<FareBreakdown>,
    pub balance: Money,
    pub decided_at: DateTime<Utc>,
}

/// A gate kept closed
#[derive(Debug, Clone, Serialize)]
pub struct Denial {
    pub direction: GateDirection,
    pub checkpoint_code: String,
    pub reason: DenialReason,
    pub message: String,
    pub balance: Money,
    /// The rider's ongoing journey, when there is one worth pointing staff at
    pub ongoing: Option<Journey>,
    /// The fare the rider could not cover
    pub required: Option<FareBreakdown>,
    pub decided_at: DateTime<Utc>,
}

/// Outcome of one gate event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allowed(Admission),
    Denied(Denial),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    pub fn reason(&self) -> Option<DenialReason> {
        match self {
            Self::Allowed(_) => None,
            Self::Denied(denial) => Some(denial.reason),
        }
    }

    /// Balance reported with the decision (post-debit on an allowed exit)
    pub fn balance(&self) -> Money {
        match self {
            Self::Allowed(admission) => admission.balance,
            Self::Denied(denial) => denial.balance,
        }
    }

    pub fn journey_id(&self) -> Option<&str> {
        match self {
            Self::Allowed(admission) => Some(&admission.journey.id),
            Self::Denied(denial) => denial.ongoing.as_ref().map(|j| j.id.as_str()),
        }
    }
}

/// Workflow step, reported when a fault interrupts a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStep {
    AcquireRiderLock,
    LookupCheckpoint,
    ReadBalance,
    StartJourney,
    FindOngoing,
    PriceTrip,
    /// The settlement transaction itself: connection lock, begin, commit
    Settle,
    Debit,
    CompleteJourney,
    ReadHistory,
}

impl GateStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcquireRiderLock => "acquire_rider_lock",
            Self::LookupCheckpoint => "lookup_checkpoint",
            Self::ReadBalance => "read_balance",
            Self::StartJourney => "start_journey",
            Self::FindOngoing => "find_ongoing",
            Self::PriceTrip => "price_trip",
            Self::Settle => "settle",
            Self::Debit => "debit",
            Self::CompleteJourney => "complete_journey",
            Self::ReadHistory => "read_history",
        }
    }
}

impl fmt::Display for GateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage fault during a gate decision
#[derive(Error, Debug)]
#[error("gate step {step} failed: {source}")]
pub struct GateError {
    pub step: GateStep,
    #[source]
    pub source: StorageError,
}

impl GateError {
    fn at(step: GateStep) -> impl FnOnce(StorageError) -> GateError {
        move |source| GateError { step, source }
    }

    /// True when the caller may retry the whole gate event
    pub fn is_transient(&self) -> bool {
        self.source.is_transient()
    }
}

/// One page of completed journeys
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub journeys: Vec<Journey>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

/// Failure inside the settlement transaction
enum Settlement {
    Denied(DenialReason, String),
    Fault(GateStep, StorageError),
}

impl From<StorageError> for Settlement {
    fn from(err: StorageError) -> Self {
        Settlement::Fault(GateStep::Settle, err)
    }
}

/// Entry/exit decision workflow
pub struct GateOrchestrator {
    db: Arc<GateDb>,
    stations: Arc<dyn StationDirectory>,
    fares: Arc<FareResolver>,
    ledger: Arc<Ledger>,
    journeys: Arc<JourneyLedger>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    policy: FarePolicy,
    rider_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GateOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<GateDb>,
        stations: Arc<dyn StationDirectory>,
        fares: Arc<FareResolver>,
        ledger: Arc<Ledger>,
        journeys: Arc<JourneyLedger>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        policy: FarePolicy,
    ) -> Self {
        Self {
            db,
            stations,
            fares,
            ledger,
            journeys,
            events,
            clock,
            policy,
            rider_locks: DashMap::new(),
        }
    }

    // =========================================================================
    // Entry
    // =========================================================================

    pub fn entry(&self, rider_id: &str, checkpoint_code: &str) -> Result<GateDecision, GateError> {
        let code = normalize_code(checkpoint_code);
        self.with_rider_lock(rider_id, || {
            let decision = self.decide_entry(rider_id, &code);
            self.record(GateDirection::Entry, rider_id, &code, decision)
        })
    }

    fn decide_entry(&self, rider_id: &str, code: &str) -> Result<GateDecision, GateError> {
        let direction = GateDirection::Entry;

        let checkpoint = self
            .stations
            .lookup_checkpoint(code)
            .map_err(GateError::at(GateStep::LookupCheckpoint))?;
        if checkpoint.is_none() {
            let balance = self.balance(rider_id)?;
            return Ok(self.denial(direction, code, DenialReason::InvalidCheckpoint, balance)
                .message(format!("Unknown or inactive checkpoint {}", code))
                .build());
        }

        let balance = self.balance(rider_id)?;
        if balance < self.policy.entry_floor {
            return Ok(self.denial(direction, code, DenialReason::InsufficientFunds, balance)
                .message(format!(
                    "Minimum balance of {} required to enter; current balance {}",
                    self.policy.entry_floor, balance
                ))
                .build());
        }

        match self.journeys.start_journey(rider_id, code) {
            Ok(journey) => Ok(GateDecision::Allowed(Admission {
                direction,
                checkpoint_code: code.to_string(),
                decided_at: journey.origin_time,
                journey,
                fare: None,
                balance,
            })),
            Err(JourneyError::AlreadyOngoing(existing)) => {
                let message = format!(
                    "Journey {} already in progress from {}; exit there first",
                    existing.id,
                    existing.origin_name.as_deref().unwrap_or(&existing.origin_code)
                );
                Ok(self.denial(direction, code, DenialReason::AlreadyOngoing, balance)
                    .message(message)
                    .ongoing(*existing)
                    .build())
            }
            Err(JourneyError::Storage(source)) => Err(GateError {
                step: GateStep::StartJourney,
                source,
            }),
            Err(other) => Err(GateError {
                step: GateStep::StartJourney,
                source: StorageError::Internal(other.to_string()),
            }),
        }
    }

    // =========================================================================
    // Exit
    // =========================================================================

    pub fn exit(&self, rider_id: &str, checkpoint_code: &str) -> Result<GateDecision, GateError> {
        let code = normalize_code(checkpoint_code);
        self.with_rider_lock(rider_id, || {
            let decision = self.decide_exit(rider_id, &code);
            self.record(GateDirection::Exit, rider_id, &code, decision)
        })
    }

    fn decide_exit(&self, rider_id: &str, code: &str) -> Result<GateDecision, GateError> {
        let direction = GateDirection::Exit;

        let Some(journey) = self
            .journeys
            .get_ongoing(rider_id)
            .map_err(GateError::at(GateStep::FindOngoing))?
        else {
            let balance = self.balance(rider_id)?;
            return Ok(self.denial(direction, code, DenialReason::NoOngoingJourney, balance)
                .message("No journey in progress; tap in at an entry gate first".to_string())
                .build());
        };

        let checkpoint = self
            .stations
            .lookup_checkpoint(code)
            .map_err(GateError::at(GateStep::LookupCheckpoint))?;
        if checkpoint.is_none() {
            let balance = self.balance(rider_id)?;
            return Ok(self.denial(direction, code, DenialReason::InvalidCheckpoint, balance)
                .message(format!("Unknown or inactive checkpoint {}", code))
                .ongoing(journey)
                .build());
        }

        let itinerary = match self.fares.price(&journey.origin_code, code) {
            Ok(itinerary) => itinerary,
            Err(FareError::NotFound { origin, destination }) => {
                let balance = self.balance(rider_id)?;
                return Ok(self.denial(direction, code, DenialReason::NoFareConfigured, balance)
                    .message(format!("No fare configured between {} and {}", origin, destination))
                    .ongoing(journey)
                    .build());
            }
            Err(FareError::Storage(source)) => {
                return Err(GateError {
                    step: GateStep::PriceTrip,
                    source,
                })
            }
            Err(other) => {
                return Err(GateError {
                    step: GateStep::PriceTrip,
                    source: StorageError::Internal(other.to_string()),
                })
            }
        };

        // Penalty is assessed before any money moves; both the pre-check and
        // the debit use the adjusted total
        let now = self.clock.now_millis();
        let fare = self
            .journeys
            .assess(&journey, &itinerary, now)
            .map_err(|err| GateError {
                step: GateStep::PriceTrip,
                source: StorageError::Internal(err.to_string()),
            })?;

        let covered = self
            .ledger
            .sufficient_for(rider_id, fare.total)
            .map_err(GateError::at(GateStep::ReadBalance))?;
        if !covered {
            let balance = self.balance(rider_id)?;
            return Ok(self.denial(direction, code, DenialReason::InsufficientFunds, balance)
                .message(format!("Fare {} exceeds balance {}", fare.total, balance))
                .ongoing(journey)
                .required(fare)
                .build());
        }

        match self.settle(&journey, code, &fare, now) {
            Ok((entry, completed)) => {
                if let Some(entry) = &entry {
                    self.ledger.publish(entry);
                }
                self.journeys.publish_completed(&completed);

                let balance = match entry {
                    Some(entry) => entry.balance_after,
                    None => self.balance(rider_id)?,
                };
                Ok(GateDecision::Allowed(Admission {
                    direction,
                    checkpoint_code: code.to_string(),
                    journey: completed,
                    fare: Some(fare),
                    balance,
                    decided_at: now,
                }))
            }
            Err(Settlement::Denied(reason, message)) => {
                let balance = self.balance(rider_id)?;
                let ongoing = self
                    .journeys
                    .get_ongoing(rider_id)
                    .map_err(GateError::at(GateStep::FindOngoing))?;
                let mut denial = self.denial(direction, code, reason, balance).message(message);
                if let Some(ongoing) = ongoing {
                    denial = denial.ongoing(ongoing);
                }
                if reason == DenialReason::InsufficientFunds {
                    denial = denial.required(fare);
                }
                Ok(denial.build())
            }
            Err(Settlement::Fault(step, source)) => Err(GateError { step, source }),
        }
    }

    /// Debit then complete, committed together
    fn settle(
        &self,
        journey: &Journey,
        destination_code: &str,
        fare: &FareBreakdown,
        now: DateTime<Utc>,
    ) -> Result<(Option<LedgerEntry>, Journey), Settlement> {
        let description = format!("Fare {} → {}", journey.origin_code, destination_code);

        self.db.with_tx(|tx| -> Result<(Option<LedgerEntry>, Journey), Settlement> {
            let entry = if fare.total.is_positive() {
                let posted = Ledger::debit_in(
                    tx,
                    &journey.rider_id,
                    fare.total,
                    &description,
                    &journey.id,
                    Some(fare),
                )
                .map_err(|err| match err {
                    LedgerError::InsufficientFunds { balance, required } => Settlement::Denied(
                        DenialReason::InsufficientFunds,
                        format!("Fare {} exceeds balance {}", required, balance),
                    ),
                    LedgerError::AccountNotFound(rider) => Settlement::Denied(
                        DenialReason::AccountNotFound,
                        format!("No ledger account for rider {}", rider),
                    ),
                    LedgerError::Storage(source) => Settlement::Fault(GateStep::Debit, source),
                    other => Settlement::Fault(GateStep::Debit, StorageError::Internal(other.to_string())),
                })?;
                Some(posted)
            } else {
                None
            };

            let completed = JourneyLedger::complete_in(tx, journey, destination_code, fare, now).map_err(|err| match err {
                JourneyError::NoOngoingJourney(_) => Settlement::Denied(
                    DenialReason::NoOngoingJourney,
                    "Journey was closed by another operation".to_string(),
                ),
                JourneyError::Storage(source) => Settlement::Fault(GateStep::CompleteJourney, source),
                other => Settlement::Fault(GateStep::CompleteJourney, StorageError::Internal(other.to_string())),
            })?;

            Ok((entry, completed))
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn current_journey(&self, rider_id: &str) -> Result<Option<Journey>, GateError> {
        self.journeys
            .get_ongoing(rider_id)
            .map_err(GateError::at(GateStep::FindOngoing))
    }

    pub fn journey_history(&self, rider_id: &str, page: Page) -> Result<HistoryPage, GateError> {
        let journeys = self
            .journeys
            .list_completed(rider_id, page)
            .map_err(GateError::at(GateStep::ReadHistory))?;
        let total = self
            .journeys
            .count_completed(rider_id)
            .map_err(GateError::at(GateStep::ReadHistory))?;

        Ok(HistoryPage {
            journeys,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Run `f` holding the rider's lock; the registry entry goes once unused
    fn with_rider_lock<T>(
        &self,
        rider_id: &str,
        f: impl FnOnce() -> Result<T, GateError>,
    ) -> Result<T, GateError> {
        let lock = self.rider_locks.entry(rider_id.to_string()).or_default().clone();

        let result = match lock.try_lock_for(self.db.timeout()) {
            Some(_guard) => f(),
            None => Err(self.lock_timeout(rider_id)),
        };

        drop(lock);
        self.rider_locks
            .remove_if(rider_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn lock_timeout(&self, rider_id: &str) -> GateError {
        GateError {
            step: GateStep::AcquireRiderLock,
            source: StorageError::Timeout(format!(
                "rider {} busy for longer than {:?}",
                rider_id,
                self.db.timeout()
            )),
        }
    }

    fn balance(&self, rider_id: &str) -> Result<Money, GateError> {
        self.ledger
            .balance(rider_id)
            .map_err(GateError::at(GateStep::ReadBalance))
    }

    fn denial(&self, direction: GateDirection, code: &str, reason: DenialReason, balance: Money) -> DenialBuilder {
        DenialBuilder(Denial {
            direction,
            checkpoint_code: code.to_string(),
            reason,
            message: String::new(),
            balance,
            ongoing: None,
            required: None,
            decided_at: self.clock.now_millis(),
        })
    }

    /// Log and publish a finished decision
    fn record(
        &self,
        direction: GateDirection,
        rider_id: &str,
        code: &str,
        decision: Result<GateDecision, GateError>,
    ) -> Result<GateDecision, GateError> {
        match &decision {
            Ok(GateDecision::Allowed(admission)) => {
                info!(
                    direction = ?direction,
                    rider = %rider_id,
                    checkpoint = %code,
                    journey = %admission.journey.id,
                    balance = %admission.balance,
                    "Gate allowed"
                );
                self.events.emit(GateEvent::GateAllowed {
                    direction,
                    rider_id: rider_id.to_string(),
                    checkpoint_code: code.to_string(),
                    journey_id: admission.journey.id.clone(),
                    charged: admission.fare.as_ref().map(|fare| fare.total),
                });
            }
            Ok(GateDecision::Denied(denial)) => {
                warn!(
                    direction = ?direction,
                    rider = %rider_id,
                    checkpoint = %code,
                    reason = %denial.reason,
                    message = %denial.message,
                    "Gate denied"
                );
                self.events.emit(GateEvent::GateDenied {
                    direction,
                    rider_id: rider_id.to_string(),
                    checkpoint_code: code.to_string(),
                    reason: denial.reason,
                });
            }
            Err(err) => {
                error!(
                    direction = ?direction,
                    rider = %rider_id,
                    checkpoint = %code,
                    step = %err.step,
                    transient = err.is_transient(),
                    error = %err.source,
                    "Gate decision failed"
                );
            }
        }
        decision
    }
}

struct DenialBuilder(Denial);

impl DenialBuilder {
    fn message(mut self, message: String) -> Self {
        self.0.message = message;
        self
    }

    fn ongoing(mut self, journey: Journey) -> Self {
        self.0.ongoing = Some(journey);
        self
    }

    fn required(mut self, fare: FareBreakdown) -> Self {
        self.0.required = Some(fare);
        self
    }

    fn build(self) -> GateDecision {
        debug!(reason = %self.0.reason, "Denial built");
        GateDecision::Denied(self.0)
    }
}
