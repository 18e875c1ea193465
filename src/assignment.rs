//! Order assignment messaging for delivery agents.
//!
//! Typed wrappers over [`ConnectionManager`]: the per-agent assignment and
//! order-status topics, the accept/reject response, and throttled location
//! pings. Responses and pings are never queued; they fail with
//! [`RealtimeError::SendRejected`](crate::RealtimeError::SendRejected) unless
//! the session is connected.

use crate::auth::get_timestamp_ms;
use crate::error::Result;
use crate::types::{
    AssignmentMessage, AssignmentResponse, AssignmentResponseKind, LocationUpdate,
    OrderStatusUpdate,
};
use crate::websocket::{ConnectionManager, InboundMessage, MessageHandler, SubscriptionHandle};
use log::*;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone)]
pub struct OrderAssignmentClient {
    manager: ConnectionManager,
    delivery_agent_id: u64,
}

impl OrderAssignmentClient {
    pub fn new(manager: ConnectionManager, delivery_agent_id: u64) -> Self {
        Self {
            manager,
            delivery_agent_id,
        }
    }

    pub fn delivery_agent_id(&self) -> u64 {
        self.delivery_agent_id
    }

    pub fn assignment_topic(&self) -> String {
        self.manager
            .config()
            .assignment_topic_for(&self.delivery_agent_id.to_string())
    }

    pub fn order_status_topic(&self) -> String {
        self.manager
            .config()
            .order_status_topic_for(&self.delivery_agent_id.to_string())
    }

    /// Delivers every assignment event (REQUEST, ASSIGNED, ...) for this agent.
    /// Payloads that do not decode are logged and dropped.
    pub async fn subscribe_assignments<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(AssignmentMessage) + Send + Sync + 'static,
    {
        let topic = self.assignment_topic();
        self.manager.subscribe(&topic, typed_handler(handler)).await
    }

    pub async fn subscribe_order_status<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(OrderStatusUpdate) + Send + Sync + 'static,
    {
        let topic = self.order_status_topic();
        self.manager.subscribe(&topic, typed_handler(handler)).await
    }

    /// Answers an assignment request.
    pub async fn respond(
        &self,
        order_id: u64,
        response: AssignmentResponseKind,
        message: impl Into<String>,
    ) -> Result<()> {
        let body = AssignmentResponse {
            order_id,
            delivery_agent_id: self.delivery_agent_id,
            response,
            message: message.into(),
        };
        let destination = &self.manager.config().assignment_response_destination;
        self.manager.send(destination, &body).await?;
        info!(
            "Sent {:?} for order {} (agent {})",
            response, order_id, self.delivery_agent_id
        );
        Ok(())
    }

    pub async fn accept(&self, order_id: u64) -> Result<()> {
        self.respond(order_id, AssignmentResponseKind::Accept, "Order accepted")
            .await
    }

    pub async fn reject(&self, order_id: u64, reason: impl Into<String>) -> Result<()> {
        self.respond(order_id, AssignmentResponseKind::Reject, reason)
            .await
    }

    /// A pinger throttled to the configured location interval.
    pub fn location_pinger(&self) -> LocationPinger {
        LocationPinger::new(
            self.manager.clone(),
            self.delivery_agent_id,
            self.manager.config().location_ping_interval(),
        )
    }
}

fn typed_handler<T, F>(handler: F) -> MessageHandler
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(move |msg: InboundMessage| {
        match serde_json::from_value::<T>(msg.body) {
            Ok(payload) => handler(payload),
            Err(e) => warn!("Dropping undecodable message on '{}': {}", msg.topic, e),
        }
    })
}

/// One reading from the location sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            speed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Sent,
    /// Dropped because a ping went out less than one interval ago.
    Throttled,
}

/// Rate-limits location updates to one per interval, however often the
/// sensor fires.
pub struct LocationPinger {
    manager: ConnectionManager,
    delivery_agent_id: u64,
    interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl LocationPinger {
    pub fn new(manager: ConnectionManager, delivery_agent_id: u64, interval: Duration) -> Self {
        Self {
            manager,
            delivery_agent_id,
            interval,
            last_sent: Mutex::new(None),
        }
    }

    /// Sends `fix` for `order_id` unless throttled. A failed send does not
    /// count against the interval.
    pub async fn ping(
        &self,
        order_id: u64,
        order_status: &str,
        fix: LocationFix,
    ) -> Result<PingOutcome> {
        let mut last_sent = self.last_sent.lock().await;
        let now = Instant::now();
        if let Some(previous) = *last_sent {
            if now.duration_since(previous) < self.interval {
                trace!("Location ping for order {} throttled", order_id);
                return Ok(PingOutcome::Throttled);
            }
        }

        let update = LocationUpdate {
            order_id,
            delivery_agent_id: self.delivery_agent_id,
            latitude: fix.latitude,
            longitude: fix.longitude,
            timestamp: get_timestamp_ms(),
            order_status: order_status.to_string(),
            accuracy: fix.accuracy,
            speed: fix.speed,
        };
        self.manager
            .send(&self.manager.config().location_destination, &update)
            .await?;
        *last_sent = Some(now);
        debug!("Location ping sent for order {}", order_id);
        Ok(PingOutcome::Sent)
    }
}
