//! Domain events published by the cart and payment services.
//!
//! Publishing is best-effort: a closed channel is logged and never
//! fails the operation that produced the event. Downstream learning
//! features subscribe through [`EventSubscriber`].

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the consumer is gone.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "Dropping event");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CartItemAdded {
        user_id: Uuid,
        course_id: Uuid,
    },
    CartItemRemoved {
        user_id: Uuid,
        course_id: Uuid,
    },
    CartCleared {
        user_id: Uuid,
    },
    VoucherApplied {
        user_id: Uuid,
        voucher_id: Uuid,
        total_discount: Decimal,
    },
    PaymentInitiated {
        user_id: Uuid,
        order_id: Uuid,
        gateway_order_id: String,
    },
    PaymentCompleted {
        user_id: Uuid,
        order_id: Uuid,
        gateway_order_id: String,
        course_ids: Vec<Uuid>,
    },
    EnrollmentCreated {
        user_id: Uuid,
        course_id: Uuid,
        enrollment_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CartItemAdded { .. } => "cart_item_added",
            Event::CartItemRemoved { .. } => "cart_item_removed",
            Event::CartCleared { .. } => "cart_cleared",
            Event::VoucherApplied { .. } => "voucher_applied",
            Event::PaymentInitiated { .. } => "payment_initiated",
            Event::PaymentCompleted { .. } => "payment_completed",
            Event::EnrollmentCreated { .. } => "enrollment_created",
        }
    }
}

/// Downstream consumer of domain events.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: &Event) -> Result<(), String>;
}

/// Drains the channel, fanning each event out to every subscriber.
pub async fn process_events(
    mut rx: mpsc::Receiver<Event>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
) {
    info!(subscribers = subscribers.len(), "Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(event = event.name(), "Received event");

        for subscriber in &subscribers {
            if let Err(e) = subscriber.handle(&event).await {
                error!(
                    subscriber = subscriber.name(),
                    event = event.name(),
                    error = %e,
                    "Event subscriber failed"
                );
            }
        }
    }

    info!("Event channel closed, stopping event processing loop");
}

/// Logs every event; the default subscriber when nothing else is wired.
pub struct LoggingSubscriber;

#[async_trait]
impl EventSubscriber for LoggingSubscriber {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, event: &Event) -> Result<(), String> {
        info!(event = event.name(), payload = ?event, "Domain event");
        Ok(())
    }
}
