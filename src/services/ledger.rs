//! Ledger service - rider balances and their transaction log
//!
//! A posting (balance change plus log entry) always runs inside one storage
//! transaction, so the balance and the log can never disagree. The gate
//! orchestrator reuses [`Ledger::debit_in`] to put the fare debit and the
//! journey completion in the same transaction.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AccountLimits;
use crate::db::accounts::{self, AccountRow, AccountStatus, LedgerEntry, NewEntry, TransactionDirection};
use crate::db::{FareBreakdown, GateDb, Page};
use crate::error::StorageError;
use crate::money::Money;

use super::events::{EventBus, GateEvent};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("No ledger account for rider {0}")]
    AccountNotFound(String),

    #[error("Insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Money, required: Money },

    #[error("Account for rider {0} is not active")]
    AccountInactive(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How a rider paid for a top-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Upi,
    Netbanking,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Card => "card",
            Self::Upi => "upi",
            Self::Netbanking => "netbanking",
        };
        f.write_str(name)
    }
}

impl FromStr for PaymentMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "card" => Ok(Self::Card),
            "upi" => Ok(Self::Upi),
            "netbanking" => Ok(Self::Netbanking),
            other => Err(LedgerError::InvalidAmount(format!("unknown payment method {}", other))),
        }
    }
}

/// One page of a rider's transaction log
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub entries: Vec<LedgerEntry>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

/// Ledger service
pub struct Ledger {
    db: Arc<GateDb>,
    events: Arc<EventBus>,
    currency: String,
    limits: AccountLimits,
}

impl Ledger {
    pub fn new(db: Arc<GateDb>, events: Arc<EventBus>, currency: impl Into<String>, limits: AccountLimits) -> Self {
        Self {
            db,
            events,
            currency: currency.into(),
            limits,
        }
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Create the rider's account; returns the existing one unchanged if present
    pub fn create_account(&self, rider_id: &str) -> Result<AccountRow, LedgerError> {
        let (inserted, account) = self.db.with_tx(|tx| -> Result<(bool, AccountRow), LedgerError> {
            let inserted = accounts::insert_if_absent(tx, rider_id, &self.currency, &self.limits, Utc::now())?;
            let account = accounts::get_account(tx, rider_id)?
                .ok_or_else(|| StorageError::Internal("Failed to retrieve created account".into()))?;
            Ok((inserted, account))
        })?;

        if inserted {
            info!(rider = %rider_id, account = %account.account_number, "Ledger account created");
            self.events.emit(GateEvent::AccountCreated {
                rider_id: rider_id.to_string(),
                account_number: account.account_number.clone(),
            });
        } else {
            debug!(rider = %rider_id, "Ledger account already exists");
        }

        Ok(account)
    }

    /// Activate the rider's account
    pub fn activate(&self, rider_id: &str) -> Result<AccountRow, LedgerError> {
        let account = self.db.with_tx(|tx| -> Result<AccountRow, LedgerError> {
            if !accounts::activate(tx, rider_id, Utc::now())? {
                return Err(LedgerError::AccountNotFound(rider_id.to_string()));
            }
            Ok(accounts::get_account(tx, rider_id)?
                .ok_or_else(|| StorageError::Internal("Failed to retrieve activated account".into()))?)
        })?;

        info!(rider = %rider_id, "Ledger account activated");
        self.events.emit(GateEvent::AccountActivated {
            rider_id: rider_id.to_string(),
        });
        Ok(account)
    }

    pub fn account(&self, rider_id: &str) -> Result<Option<AccountRow>, StorageError> {
        self.db.with_conn(|conn| accounts::get_account(conn, rider_id))
    }

    /// Current balance; zero when the rider has no account
    pub fn balance(&self, rider_id: &str) -> Result<Money, StorageError> {
        self.db
            .with_conn(|conn| accounts::get_balance(conn, rider_id))
            .map(|balance| balance.unwrap_or(Money::ZERO))
    }

    /// Advisory check; the authoritative one is inside [`Ledger::debit`]
    pub fn sufficient_for(&self, rider_id: &str, amount: Money) -> Result<bool, StorageError> {
        Ok(self.balance(rider_id)? >= amount)
    }

    pub fn transactions(&self, rider_id: &str, page: Page) -> Result<TransactionPage, StorageError> {
        self.db.with_conn(|conn| {
            Ok(TransactionPage {
                entries: accounts::list_entries(conn, rider_id, page)?,
                total: accounts::count_entries(conn, rider_id)?,
                offset: page.offset,
                limit: page.limit,
            })
        })
    }

    // =========================================================================
    // Postings
    // =========================================================================

    /// Debit the rider; fails without side effects if funds are short
    pub fn debit(&self, rider_id: &str, amount: Money, description: &str, reference: &str) -> Result<LedgerEntry, LedgerError> {
        let entry = self
            .db
            .with_tx(|tx| Self::debit_in(tx, rider_id, amount, description, reference, None))?;
        self.publish(&entry);
        Ok(entry)
    }

    /// Credit the rider; fails only if the account does not exist
    pub fn credit(&self, rider_id: &str, amount: Money, description: &str, reference: &str) -> Result<LedgerEntry, LedgerError> {
        let entry = self
            .db
            .with_tx(|tx| Self::credit_in(tx, rider_id, amount, description, reference))?;
        self.publish(&entry);
        Ok(entry)
    }

    /// Rider recharge: active account, amount within the daily limit
    pub fn top_up(
        &self,
        rider_id: &str,
        amount: Money,
        method: PaymentMethod,
        reference: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        let reference = reference
            .map(str::to_string)
            .unwrap_or_else(|| format!("RECHARGE_{}", Utc::now().timestamp()));
        let description = format!("Wallet recharge via {}", method);

        let entry = self.db.with_tx(|tx| -> Result<LedgerEntry, LedgerError> {
            let account = accounts::get_account(tx, rider_id)?
                .ok_or_else(|| LedgerError::AccountNotFound(rider_id.to_string()))?;

            if account.status != AccountStatus::Active {
                return Err(LedgerError::AccountInactive(rider_id.to_string()));
            }
            if amount > account.limits.daily_limit {
                return Err(LedgerError::InvalidAmount(format!(
                    "{} exceeds daily limit of {}",
                    amount, account.limits.daily_limit
                )));
            }

            Self::credit_in(tx, rider_id, amount, &description, &reference)
        })?;

        self.publish(&entry);
        Ok(entry)
    }

    /// Debit inside a caller-owned transaction; a fare debit carries its breakdown
    pub(crate) fn debit_in(
        conn: &Connection,
        rider_id: &str,
        amount: Money,
        description: &str,
        reference: &str,
        fare: Option<&FareBreakdown>,
    ) -> Result<LedgerEntry, LedgerError> {
        ensure_positive(amount)?;
        let now = Utc::now();

        let Some(balance_after) = accounts::apply_debit(conn, rider_id, amount, now)? else {
            return match accounts::get_balance(conn, rider_id)? {
                None => Err(LedgerError::AccountNotFound(rider_id.to_string())),
                Some(balance) => {
                    warn!(rider = %rider_id, balance = %balance, required = %amount, "Debit refused");
                    Err(LedgerError::InsufficientFunds { balance, required: amount })
                }
            };
        };

        Ok(accounts::append_entry(
            conn,
            &NewEntry {
                rider_id,
                direction: TransactionDirection::Debit,
                amount,
                balance_after,
                description,
                reference,
                fare,
                created_at: now,
            },
        )?)
    }

    fn credit_in(
        conn: &Connection,
        rider_id: &str,
        amount: Money,
        description: &str,
        reference: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        ensure_positive(amount)?;
        let now = Utc::now();

        let balance_after = accounts::apply_credit(conn, rider_id, amount, now)?
            .ok_or_else(|| LedgerError::AccountNotFound(rider_id.to_string()))?;

        Ok(accounts::append_entry(
            conn,
            &NewEntry {
                rider_id,
                direction: TransactionDirection::Credit,
                amount,
                balance_after,
                description,
                reference,
                fare: None,
                created_at: now,
            },
        )?)
    }

    /// Announce a committed posting
    pub(crate) fn publish(&self, entry: &LedgerEntry) {
        info!(
            rider = %entry.rider_id,
            direction = entry.direction.as_str(),
            amount = %entry.amount,
            balance = %entry.balance_after,
            "Ledger posting"
        );

        let rider_id = entry.rider_id.clone();
        let reference = entry.reference.clone();
        self.events.emit(match entry.direction {
            TransactionDirection::Credit => GateEvent::AccountCredited {
                rider_id,
                amount: entry.amount,
                balance_after: entry.balance_after,
                reference,
            },
            TransactionDirection::Debit => GateEvent::AccountDebited {
                rider_id,
                amount: entry.amount,
                balance_after: entry.balance_after,
                reference,
            },
        });
    }
}

fn ensure_positive(amount: Money) -> Result<(), LedgerError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(format!("{} is not positive", amount)))
    }
}
