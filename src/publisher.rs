//! Domain event fan-out over NATS.

use tracing::{debug, info, warn};

use crate::domain::events::DomainEvent;

/// Publishes domain events when a NATS connection is configured, otherwise logs them.
/// Failures never propagate to the caller.
#[derive(Clone, Default)]
pub struct EventPublisher {
    client: Option<async_nats::Client>,
}

impl EventPublisher {
    pub fn new(client: Option<async_nats::Client>) -> Self { Self { client } }

    pub fn disabled() -> Self { Self::default() }

    pub async fn connect(url: Option<&str>) -> Self {
        let Some(url) = url else { return Self::disabled() };
        match async_nats::connect(url).await {
            Ok(client) => {
                info!(%url, "connected to NATS");
                Self::new(Some(client))
            }
            Err(e) => {
                warn!(%url, error = %e, "NATS unavailable, events will only be logged");
                Self::disabled()
            }
        }
    }

    pub fn is_connected(&self) -> bool { self.client.is_some() }

    pub async fn publish(&self, event: &DomainEvent) {
        let subject = event.subject();
        let Some(client) = &self.client else {
            debug!(%subject, ?event, "domain event");
            return;
        };
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%subject, error = %e, "failed to encode event");
                return;
            }
        };
        if let Err(e) = client.publish(subject.clone(), payload.into()).await {
            warn!(%subject, error = %e, "failed to publish event");
        }
    }

    pub async fn publish_all(&self, events: impl IntoIterator<Item = DomainEvent>) {
        for event in events {
            self.publish(&event).await;
        }
    }
}
