//! Event system for gate and ledger operations
//!
//! Every decision and every balance movement is published on the bus. The
//! logging listener turns the stream into the audit trail; other listeners
//! (gate displays, reconciliation jobs) can subscribe alongside it.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::money::Money;
use crate::services::gate::{DenialReason, GateDirection};

/// Events emitted by services
#[derive(Debug, Clone)]
pub enum GateEvent {
    // Gate decisions
    GateAllowed {
        direction: GateDirection,
        rider_id: String,
        checkpoint_code: String,
        journey_id: String,
        charged: Option<Money>,
    },
    GateDenied {
        direction: GateDirection,
        rider_id: String,
        checkpoint_code: String,
        reason: DenialReason,
    },

    // Journey events
    JourneyStarted {
        journey_id: String,
        rider_id: String,
        origin_code: String,
    },
    JourneyCompleted {
        journey_id: String,
        rider_id: String,
        total: Money,
        penalty: Money,
    },
    JourneyCancelled {
        journey_id: String,
        rider_id: String,
    },

    // Ledger events
    AccountCreated {
        rider_id: String,
        account_number: String,
    },
    AccountActivated {
        rider_id: String,
    },
    AccountCredited {
        rider_id: String,
        amount: Money,
        balance_after: Money,
        reference: String,
    },
    AccountDebited {
        rider_id: String,
        amount: Money,
        balance_after: Money,
        reference: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &GateEvent);
}

/// Event bus for broadcasting gate events
pub struct EventBus {
    sender: broadcast::Sender<GateEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: GateEvent) {
        trace!(event = ?event, "Emitting gate event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &GateEvent) {
        match event {
            GateEvent::GateAllowed {
                direction,
                rider_id,
                checkpoint_code,
                journey_id,
                charged,
            } => {
                info!(
                    direction = ?direction,
                    rider = %rider_id,
                    checkpoint = %checkpoint_code,
                    journey = %journey_id,
                    charged = ?charged.map(|m| m.to_string()),
                    "audit: gate opened"
                );
            }
            GateEvent::GateDenied {
                direction,
                rider_id,
                checkpoint_code,
                reason,
            } => {
                warn!(
                    direction = ?direction,
                    rider = %rider_id,
                    checkpoint = %checkpoint_code,
                    reason = %reason.code(),
                    "audit: gate denied"
                );
            }
            GateEvent::AccountDebited {
                rider_id,
                amount,
                balance_after,
                reference,
            } => {
                info!(
                    rider = %rider_id,
                    amount = %amount,
                    balance = %balance_after,
                    reference = %reference,
                    "audit: debit"
                );
            }
            GateEvent::AccountCredited {
                rider_id,
                amount,
                balance_after,
                reference,
            } => {
                info!(
                    rider = %rider_id,
                    amount = %amount,
                    balance = %balance_after,
                    reference = %reference,
                    "audit: credit"
                );
            }
            GateEvent::JourneyCancelled { journey_id, rider_id } => {
                info!(journey = %journey_id, rider = %rider_id, "audit: journey emergency-cancelled");
            }
            _ => {
                debug!(event = ?event, "Gate event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Audit listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
