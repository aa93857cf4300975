use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Domain events, emitted after the owning transaction has committed.
///
/// Delivery is best effort: a full or closed channel never undoes a
/// committed order change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: i32,
        order_number: String,
        inventory_applied: bool,
    },
    OrderUpdated {
        order_id: i32,
        order_number: String,
        inventory_applied: bool,
    },
    OrderDeleted {
        order_id: i32,
        order_number: String,
        deleted_by: String,
    },
    OrderInventoryApplied {
        order_id: i32,
        order_number: String,
        business_date: NaiveDate,
    },
    ReconciliationCompleted {
        run_date: NaiveDate,
        found: usize,
        processed: usize,
        errored: usize,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderUpdated { .. } => "order_updated",
            Event::OrderDeleted { .. } => "order_deleted",
            Event::OrderInventoryApplied { .. } => "order_inventory_applied",
            Event::ReconciliationCompleted { .. } => "reconciliation_completed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends without waiting, logging instead of failing when the channel is
    /// full or closed.
    pub fn publish(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.sender.try_send(event) {
            warn!(event = name, error = %e, "Dropped domain event");
        }
    }
}

/// Drains the channel, logging every event. Returns when all senders are gone.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                inventory_applied,
            }
            | Event::OrderUpdated {
                order_id,
                order_number,
                inventory_applied,
            } => {
                info!(
                    event = event.name(),
                    order_id,
                    order_number = %order_number,
                    inventory_applied,
                    "Order event"
                );
            }
            Event::OrderDeleted {
                order_id,
                order_number,
                deleted_by,
            } => {
                info!(
                    event = event.name(),
                    order_id,
                    order_number = %order_number,
                    deleted_by = %deleted_by,
                    "Order event"
                );
            }
            Event::OrderInventoryApplied {
                order_id,
                order_number,
                business_date,
            } => {
                info!(
                    event = event.name(),
                    order_id,
                    order_number = %order_number,
                    business_date = %business_date,
                    "Deferred inventory applied"
                );
            }
            Event::ReconciliationCompleted {
                run_date,
                found,
                processed,
                errored,
            } => {
                info!(
                    event = event.name(),
                    run_date = %run_date,
                    found,
                    processed,
                    errored,
                    "Reconciliation run completed"
                );
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_in_order() {
        let (sender, mut rx) = EventSender::channel(4);
        sender.publish(Event::OrderCreated {
            order_id: 1,
            order_number: "ORD-20240101-001".into(),
            inventory_applied: true,
        });
        sender
            .send(Event::OrderDeleted {
                order_id: 1,
                order_number: "ORD-20240101-001".into(),
                deleted_by: "clerk".into(),
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "order_created");
        assert_eq!(rx.recv().await.unwrap().name(), "order_deleted");
    }

    #[test]
    fn publish_on_full_channel_does_not_panic() {
        let (sender, _rx) = EventSender::channel(1);
        for id in 0..3 {
            sender.publish(Event::OrderInventoryApplied {
                order_id: id,
                order_number: format!("ORD-20240101-{:03}", id),
                business_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            });
        }
    }
}
