//! Ledger account storage
//!
//! Balances only move through [`apply_debit`] and [`apply_credit`], each a
//! single UPDATE that changes the stored value in place. A debit carries its
//! own sufficiency predicate, so two concurrent debits can never both spend
//! the same funds.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::journeys::FareBreakdown;
use super::{from_db_time, to_db_time, Page};
use crate::config::AccountLimits;
use crate::error::StorageError;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Inactive,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionDirection {
    Credit,
    Debit,
}

impl TransactionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }
}

/// Ledger account row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRow {
    pub rider_id: String,
    pub account_number: String,
    pub balance: Money,
    pub currency: String,
    pub status: AccountStatus,
    pub limits: AccountLimits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl AccountRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let status = match row.get::<_, String>("status")?.as_str() {
            "active" => AccountStatus::Active,
            _ => AccountStatus::Inactive,
        };

        Ok(Self {
            rider_id: row.get("rider_id")?,
            account_number: row.get("account_number")?,
            balance: Money::from_minor(row.get("balance_minor")?),
            currency: row.get("currency")?,
            status,
            limits: AccountLimits {
                daily_limit: Money::from_minor(row.get("daily_limit_minor")?),
                monthly_limit: Money::from_minor(row.get("monthly_limit_minor")?),
                single_transaction_limit: Money::from_minor(row.get("single_transaction_limit_minor")?),
            },
            created_at: from_db_time(&row.get::<_, String>("created_at")?)?,
            updated_at: from_db_time(&row.get::<_, String>("updated_at")?)?,
            activated_at: row
                .get::<_, Option<String>>("activated_at")?
                .as_deref()
                .map(from_db_time)
                .transpose()?,
        })
    }
}

/// One entry of the append-only transaction log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub rider_id: String,
    pub direction: TransactionDirection,
    pub amount: Money,
    pub balance_after: Money,
    pub description: String,
    pub reference: String,
    /// Fare breakdown of the journey a fare debit settled
    pub fare: Option<FareBreakdown>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let direction = match row.get::<_, String>("direction")?.as_str() {
            "debit" => TransactionDirection::Debit,
            _ => TransactionDirection::Credit,
        };

        let fare = row
            .get::<_, Option<String>>("fare_json")?
            .map(|json| serde_json::from_str::<FareBreakdown>(&json))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;

        Ok(Self {
            id: row.get("id")?,
            rider_id: row.get("rider_id")?,
            direction,
            amount: Money::from_minor(row.get("amount_minor")?),
            balance_after: Money::from_minor(row.get("balance_after_minor")?),
            description: row.get("description")?,
            reference: row.get("reference")?,
            fare,
            status: row.get("status")?,
            created_at: from_db_time(&row.get::<_, String>("created_at")?)?,
        })
    }
}

/// Generate a display account number
fn new_account_number() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("WAL{}", &hex[..8])
}

/// Insert a zero-balance inactive account unless one exists; true if inserted
pub fn insert_if_absent(
    conn: &Connection,
    rider_id: &str,
    currency: &str,
    limits: &AccountLimits,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let changed = conn
        .execute(
            "INSERT INTO ledger_accounts (rider_id, account_number, balance_minor, currency, status,
                daily_limit_minor, monthly_limit_minor, single_transaction_limit_minor, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, 'inactive', ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT (rider_id) DO NOTHING",
            params![
                rider_id,
                new_account_number(),
                currency,
                limits.daily_limit.minor(),
                limits.monthly_limit.minor(),
                limits.single_transaction_limit.minor(),
                to_db_time(now),
            ],
        )
        .map_err(|e| StorageError::query("insert account", e))?;

    Ok(changed == 1)
}

/// Get account by rider id
pub fn get_account(conn: &Connection, rider_id: &str) -> Result<Option<AccountRow>, StorageError> {
    conn.query_row(
        "SELECT * FROM ledger_accounts WHERE rider_id = ?",
        params![rider_id],
        |row| AccountRow::from_row(row),
    )
    .optional()
    .map_err(|e| StorageError::query("get account", e))
}

/// Current balance, or None if the rider has no account
pub fn get_balance(conn: &Connection, rider_id: &str) -> Result<Option<Money>, StorageError> {
    conn.query_row(
        "SELECT balance_minor FROM ledger_accounts WHERE rider_id = ?",
        params![rider_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|minor| minor.map(Money::from_minor))
    .map_err(|e| StorageError::query("get balance", e))
}

/// Mark the account active; false if no account exists
pub fn activate(conn: &Connection, rider_id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
    let ts = to_db_time(now);
    let changed = conn
        .execute(
            "UPDATE ledger_accounts
             SET status = 'active', activated_at = COALESCE(activated_at, ?2), updated_at = ?2
             WHERE rider_id = ?1",
            params![rider_id, ts],
        )
        .map_err(|e| StorageError::query("activate account", e))?;

    Ok(changed == 1)
}

/// Decrement the balance if it covers `amount`; returns the new balance
///
/// `None` means either no account or insufficient funds; the caller tells
/// the two apart with [`get_balance`] inside the same transaction.
pub fn apply_debit(
    conn: &Connection,
    rider_id: &str,
    amount: Money,
    now: DateTime<Utc>,
) -> Result<Option<Money>, StorageError> {
    conn.query_row(
        "UPDATE ledger_accounts SET balance_minor = balance_minor - ?2, updated_at = ?3
         WHERE rider_id = ?1 AND balance_minor >= ?2
         RETURNING balance_minor",
        params![rider_id, amount.minor(), to_db_time(now)],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|minor| minor.map(Money::from_minor))
    .map_err(|e| StorageError::query("apply debit", e))
}

/// Increment the balance; returns the new balance, None if no account
pub fn apply_credit(
    conn: &Connection,
    rider_id: &str,
    amount: Money,
    now: DateTime<Utc>,
) -> Result<Option<Money>, StorageError> {
    conn.query_row(
        "UPDATE ledger_accounts SET balance_minor = balance_minor + ?2, updated_at = ?3
         WHERE rider_id = ?1
         RETURNING balance_minor",
        params![rider_id, amount.minor(), to_db_time(now)],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|minor| minor.map(Money::from_minor))
    .map_err(|e| StorageError::query("apply credit", e))
}

/// Fields for a new log entry
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub rider_id: &'a str,
    pub direction: TransactionDirection,
    pub amount: Money,
    pub balance_after: Money,
    pub description: &'a str,
    pub reference: &'a str,
    pub fare: Option<&'a FareBreakdown>,
    pub created_at: DateTime<Utc>,
}

/// Append to the transaction log
pub fn append_entry(conn: &Connection, entry: &NewEntry<'_>) -> Result<LedgerEntry, StorageError> {
    let id = Uuid::new_v4().to_string();
    let fare_json = entry.fare.map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO ledger_transactions (id, rider_id, direction, amount_minor, balance_after_minor,
            description, reference, fare_json, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'completed', ?9)",
        params![
            id,
            entry.rider_id,
            entry.direction.as_str(),
            entry.amount.minor(),
            entry.balance_after.minor(),
            entry.description,
            entry.reference,
            fare_json,
            to_db_time(entry.created_at),
        ],
    )
    .map_err(|e| StorageError::query("append ledger entry", e))?;

    conn.query_row(
        "SELECT * FROM ledger_transactions WHERE id = ?",
        params![id],
        |row| LedgerEntry::from_row(row),
    )
    .map_err(|e| StorageError::query("read ledger entry", e))
}

/// Transaction log for a rider, newest first
pub fn list_entries(conn: &Connection, rider_id: &str, page: Page) -> Result<Vec<LedgerEntry>, StorageError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM ledger_transactions WHERE rider_id = ?
             ORDER BY seq DESC LIMIT ? OFFSET ?",
        )
        .map_err(|e| StorageError::query("prepare list ledger entries", e))?;

    let rows = stmt
        .query_map(params![rider_id, page.limit, page.offset], |row| LedgerEntry::from_row(row))
        .map_err(|e| StorageError::query("list ledger entries", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::query("read ledger entry row", e))
}

/// Number of log entries for a rider
pub fn count_entries(conn: &Connection, rider_id: &str) -> Result<u64, StorageError> {
    conn.query_row(
        "SELECT COUNT(*) FROM ledger_transactions WHERE rider_id = ?",
        params![rider_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as u64)
    .map_err(|e| StorageError::query("count ledger entries", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn conn_with_account(rider: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        insert_if_absent(&conn, rider, "INR", &AccountLimits::default(), Utc::now()).unwrap();
        conn
    }

    #[test]
    fn test_insert_if_absent_keeps_first_account() {
        let conn = conn_with_account("rider-1");
        let first = get_account(&conn, "rider-1").unwrap().unwrap();

        assert!(!insert_if_absent(&conn, "rider-1", "USD", &AccountLimits::default(), Utc::now()).unwrap());
        let again = get_account(&conn, "rider-1").unwrap().unwrap();
        assert_eq!(again.account_number, first.account_number);
        assert_eq!(again.currency, "INR");
        assert_eq!(again.balance, Money::ZERO);
        assert_eq!(again.status, AccountStatus::Inactive);
        assert!(again.account_number.starts_with("WAL"));
        assert_eq!(again.account_number.len(), 11);
    }

    #[test]
    fn test_debit_refuses_overdraft() {
        let conn = conn_with_account("rider-1");
        assert_eq!(
            apply_credit(&conn, "rider-1", Money::from_major(10), Utc::now()).unwrap(),
            Some(Money::from_major(10))
        );

        assert_eq!(apply_debit(&conn, "rider-1", Money::from_major(35), Utc::now()).unwrap(), None);
        assert_eq!(get_balance(&conn, "rider-1").unwrap(), Some(Money::from_major(10)));

        assert_eq!(
            apply_debit(&conn, "rider-1", Money::from_major(10), Utc::now()).unwrap(),
            Some(Money::ZERO)
        );
    }

    #[test]
    fn test_missing_account_reports_none() {
        let conn = conn_with_account("rider-1");
        assert_eq!(get_balance(&conn, "ghost").unwrap(), None);
        assert_eq!(apply_credit(&conn, "ghost", Money::from_major(1), Utc::now()).unwrap(), None);
        assert!(!activate(&conn, "ghost", Utc::now()).unwrap());
    }

    #[test]
    fn test_entries_listed_newest_first() {
        let conn = conn_with_account("rider-1");
        for (i, amount) in [100, 200, 300].into_iter().enumerate() {
            append_entry(
                &conn,
                &NewEntry {
                    rider_id: "rider-1",
                    direction: TransactionDirection::Credit,
                    amount: Money::from_minor(amount),
                    balance_after: Money::from_minor(amount),
                    description: "top up",
                    reference: &format!("REF{}", i),
                    fare: None,
                    created_at: Utc::now(),
                },
            )
            .unwrap();
        }

        let entries = list_entries(&conn, "rider-1", Page::first(2)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reference, "REF2");
        assert_eq!(entries[1].reference, "REF1");
        assert_eq!(count_entries(&conn, "rider-1").unwrap(), 3);
        assert!(entries.iter().all(|e| e.fare.is_none()));
    }

    #[test]
    fn test_fare_breakdown_stored_on_entry() {
        let conn = conn_with_account("rider-1");
        let fare = FareBreakdown {
            origin_code: "STN-A".into(),
            destination_code: "STN-B".into(),
            distance_km: 12,
            base_fare: Money::from_major(30),
            service_charge: Money::from_major(5),
            penalty: Money::from_major(50),
            total: Money::from_major(85),
        };

        let entry = append_entry(
            &conn,
            &NewEntry {
                rider_id: "rider-1",
                direction: TransactionDirection::Debit,
                amount: fare.total,
                balance_after: Money::from_major(15),
                description: "Fare STN-A → STN-B",
                reference: "JRN1700000000ABCD",
                fare: Some(&fare),
                created_at: Utc::now(),
            },
        )
        .unwrap();

        assert_eq!(entry.fare.as_ref(), Some(&fare));
        let listed = list_entries(&conn, "rider-1", Page::first(1)).unwrap();
        assert_eq!(listed[0].fare, Some(fare));
    }
}
