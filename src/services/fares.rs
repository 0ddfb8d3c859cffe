//! Fare resolution and fare table administration
//!
//! [`FareResolver`] only reads. Pricing rules:
//!
//! - codes are compared in canonical upper-case form
//! - origin == destination prices as the configured minimum, distance 0
//! - otherwise the stored (origin, destination) rule, falling back to the
//!   reversed pair, so every route is symmetric
//! - total = base fare + flat service charge, in minor units (exact)

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::FarePolicy;
use crate::db::checkpoints::{self, normalize_code};
use crate::db::fare_rules::{self, FareRule};
use crate::db::{GateDb, Page};
use crate::error::StorageError;
use crate::money::Money;

#[derive(Error, Debug)]
pub enum FareError {
    #[error("No fare configured for route {origin} <-> {destination}")]
    NotFound { origin: String, destination: String },

    #[error("Invalid fare rule: {0}")]
    InvalidRule(String),

    #[error("Fare total out of range for route {origin} -> {destination}")]
    OutOfRange { origin: String, destination: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A priced trip between two checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedItinerary {
    pub origin_code: String,
    pub destination_code: String,
    pub distance_km: u32,
    pub base_fare: Money,
    pub service_charge: Money,
    pub total: Money,
}

impl PricedItinerary {
    fn new(
        origin_code: String,
        destination_code: String,
        distance_km: u32,
        base_fare: Money,
        service_charge: Money,
    ) -> Result<Self, FareError> {
        let Some(total) = base_fare.checked_add(service_charge) else {
            return Err(FareError::OutOfRange {
                origin: origin_code,
                destination: destination_code,
            });
        };

        Ok(Self {
            origin_code,
            destination_code,
            distance_km,
            base_fare,
            service_charge,
            total,
        })
    }
}

/// Read-only pricing over the stored fare rules
pub struct FareResolver {
    db: Arc<GateDb>,
    policy: FarePolicy,
}

impl FareResolver {
    pub fn new(db: Arc<GateDb>, policy: FarePolicy) -> Self {
        Self { db, policy }
    }

    /// Price a trip between two checkpoint codes
    pub fn price(&self, origin: &str, destination: &str) -> Result<PricedItinerary, FareError> {
        let origin = normalize_code(origin);
        let destination = normalize_code(destination);

        if origin == destination {
            debug!(code = %origin, "Same-checkpoint exit, minimum fare");
            return PricedItinerary::new(
                origin,
                destination,
                0,
                self.policy.same_checkpoint_base_fare,
                self.policy.service_charge,
            );
        }

        let rule = self.db.with_conn(|conn| -> Result<Option<FareRule>, StorageError> {
            match fare_rules::find_active(conn, &origin, &destination)? {
                Some(rule) => Ok(Some(rule)),
                None => fare_rules::find_active(conn, &destination, &origin),
            }
        })?;

        let rule = rule.ok_or_else(|| FareError::NotFound {
            origin: origin.clone(),
            destination: destination.clone(),
        })?;

        debug!(
            origin = %origin,
            destination = %destination,
            stored_as = %format!("{}->{}", rule.origin_code, rule.destination_code),
            base_fare = %rule.base_fare,
            "Fare rule resolved"
        );

        PricedItinerary::new(
            origin,
            destination,
            rule.distance_km,
            rule.base_fare,
            self.policy.service_charge,
        )
    }
}

/// Operator-side maintenance of fare rules
pub struct FareTable {
    db: Arc<GateDb>,
    max_base_fare: Money,
}

impl FareTable {
    /// `max_base_fare` caps any single stored fare (normally the account
    /// single-transaction limit)
    pub fn new(db: Arc<GateDb>, max_base_fare: Money) -> Self {
        Self { db, max_base_fare }
    }

    /// Create or update the rule for a directed pair
    pub fn set_rule(
        &self,
        origin: &str,
        destination: &str,
        distance_km: u32,
        base_fare: Money,
    ) -> Result<FareRule, FareError> {
        let origin = normalize_code(origin);
        let destination = normalize_code(destination);

        if origin == destination {
            return Err(FareError::InvalidRule(
                "origin and destination must differ".into(),
            ));
        }
        if distance_km == 0 {
            return Err(FareError::InvalidRule("distance must be positive".into()));
        }
        if !base_fare.is_positive() {
            return Err(FareError::InvalidRule("fare must be positive".into()));
        }
        if base_fare > self.max_base_fare {
            return Err(FareError::InvalidRule(format!(
                "fare {} exceeds the maximum of {}",
                base_fare, self.max_base_fare
            )));
        }

        let rule = self.db.with_tx(|tx| -> Result<FareRule, FareError> {
            for code in [&origin, &destination] {
                if checkpoints::get_active_by_code(tx, code)?.is_none() {
                    return Err(FareError::InvalidRule(format!("checkpoint {} not found", code)));
                }
            }
            Ok(fare_rules::upsert_rule(tx, &origin, &destination, distance_km, base_fare, Utc::now())?)
        })?;

        info!(
            origin = %rule.origin_code,
            destination = %rule.destination_code,
            base_fare = %rule.base_fare,
            "Fare rule saved"
        );
        Ok(rule)
    }

    pub fn list_rules(&self, page: Page) -> Result<Vec<FareRule>, StorageError> {
        self.db.with_conn(|conn| fare_rules::list_rules(conn, page))
    }

    /// Deactivate the rule for a directed pair
    pub fn deactivate_rule(&self, origin: &str, destination: &str) -> Result<bool, StorageError> {
        let origin = normalize_code(origin);
        let destination = normalize_code(destination);
        self.db
            .with_conn(|conn| fare_rules::deactivate_rule(conn, &origin, &destination, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CreateCheckpointInput;
    use std::time::Duration;

    fn setup() -> (FareResolver, FareTable) {
        let db = Arc::new(GateDb::open_in_memory(Duration::from_secs(1)).unwrap());
        db.with_conn(|conn| -> Result<(), StorageError> {
            for code in ["STN-A", "STN-B", "STN-C"] {
                checkpoints::create_checkpoint(
                    conn,
                    &CreateCheckpointInput {
                        code: code.into(),
                        name: code.into(),
                        city: "Pune".into(),
                    },
                    Utc::now(),
                )?;
            }
            Ok(())
        })
        .unwrap();

        (
            FareResolver::new(Arc::clone(&db), FarePolicy::default()),
            FareTable::new(db, Money::from_major(5_000)),
        )
    }

    #[test]
    fn test_stored_direction_prices_base_plus_service() {
        let (resolver, table) = setup();
        table.set_rule("STN-A", "STN-B", 12, Money::from_major(30)).unwrap();

        let priced = resolver.price("stn-a", "STN-B").unwrap();
        assert_eq!(priced.origin_code, "STN-A");
        assert_eq!(priced.distance_km, 12);
        assert_eq!(priced.base_fare, Money::from_major(30));
        assert_eq!(priced.service_charge, Money::from_major(5));
        assert_eq!(priced.total, Money::from_major(35));
    }

    #[test]
    fn test_reverse_direction_reuses_rule() {
        let (resolver, table) = setup();
        table.set_rule("STN-A", "STN-B", 12, Money::from_major(30)).unwrap();

        let back = resolver.price("STN-B", "STN-A").unwrap();
        assert_eq!(back.origin_code, "STN-B");
        assert_eq!(back.destination_code, "STN-A");
        assert_eq!(back.total, Money::from_major(35));
        assert_eq!(back.distance_km, 12);
    }

    #[test]
    fn test_same_checkpoint_ignores_stored_rules() {
        let (resolver, _) = setup();
        let priced = resolver.price("STN-A", "stn-a").unwrap();
        assert_eq!(priced.distance_km, 0);
        assert_eq!(priced.base_fare, Money::from_major(5));
        assert_eq!(priced.total, Money::from_major(10));
    }

    #[test]
    fn test_unconfigured_route_not_found() {
        let (resolver, table) = setup();
        table.set_rule("STN-A", "STN-B", 12, Money::from_major(30)).unwrap();
        assert!(matches!(
            resolver.price("STN-A", "STN-C"),
            Err(FareError::NotFound { .. })
        ));

        assert!(table.deactivate_rule("stn-a", "stn-b").unwrap());
        assert!(matches!(
            resolver.price("STN-A", "STN-B"),
            Err(FareError::NotFound { .. })
        ));
    }

    #[test]
    fn test_set_rule_validation() {
        let (_, table) = setup();
        assert!(matches!(
            table.set_rule("STN-A", "STN-A", 1, Money::from_major(1)),
            Err(FareError::InvalidRule(_))
        ));
        assert!(matches!(
            table.set_rule("STN-A", "STN-B", 0, Money::from_major(1)),
            Err(FareError::InvalidRule(_))
        ));
        assert!(matches!(
            table.set_rule("STN-A", "STN-B", 3, Money::ZERO),
            Err(FareError::InvalidRule(_))
        ));
        assert!(matches!(
            table.set_rule("STN-A", "STN-Z", 3, Money::from_major(1)),
            Err(FareError::InvalidRule(_))
        ));
        assert!(matches!(
            table.set_rule("STN-A", "STN-B", 3, Money::from_minor(i64::MAX - 100)),
            Err(FareError::InvalidRule(_))
        ));
        assert!(table.set_rule("STN-A", "STN-B", 3, Money::from_major(5_000)).is_ok());
    }

    #[test]
    fn test_total_overflow_is_an_error() {
        let (_, table) = setup();
        table.set_rule("STN-A", "STN-B", 3, Money::from_major(30)).unwrap();

        let huge = FarePolicy {
            service_charge: Money::from_minor(i64::MAX - 100),
            ..FarePolicy::default()
        };
        let resolver = FareResolver::new(Arc::clone(&table.db), huge);

        assert!(matches!(
            resolver.price("STN-A", "STN-B"),
            Err(FareError::OutOfRange { .. })
        ));
        assert!(matches!(
            resolver.price("STN-A", "STN-A"),
            Err(FareError::OutOfRange { .. })
        ));
    }
}
