//! Faregate - journey and fare settlement engine for transit gates
//!
//! Decides whether a gate opens for a recognized rider and settles the trip
//! against the rider's prepaid balance. Identity comes from outside (a
//! biometric matcher has already produced the rider id); faregate owns the
//! trip state machine, pricing and the ledger.
//!
//! ## Layout
//!
//! - [`db`] - SQLite repositories and the atomic guards (one ongoing journey
//!   per rider, conditional debits)
//! - [`services`] - fare resolver, ledger, journey ledger, station registry
//!   and the gate orchestrator that composes them
//! - [`money`] - fixed-point currency amounts
//! - [`clock`] - injectable time source
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/faregate/
//! ├── faregate.db      # SQLite database (WAL)
//! └── config.toml      # Configuration
//! ```

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod money;
pub mod services;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AccountLimits, Config, FarePolicy};
pub use db::{GateDb, Page};
pub use error::StorageError;
pub use money::Money;
pub use services::{GateDecision, GateOrchestrator, Services};
