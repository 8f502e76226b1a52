// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Feeds live subscribers: the SSE strategy endpoint and log observers.
// Events are not persisted; a subscriber sees only what is published after
// it subscribed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use triad_cortex::{CortexEvent, CortexEventPublisher};

use crate::domain::events::PipelineEvent;
use crate::domain::strategy::RequestId;

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DomainEvent {
    Pipeline(PipelineEvent),
    Memory(CortexEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// A receiver that falls more than `capacity` events behind loses the
    /// oldest ones and sees `EventBusError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_pipeline_event(&self, event: PipelineEvent) {
        self.broadcast(DomainEvent::Pipeline(event));
    }

    pub fn publish_memory_event(&self, event: CortexEvent) {
        self.broadcast(DomainEvent::Memory(event));
    }

    fn broadcast(&self, event: DomainEvent) {
        // send() only fails when nobody is subscribed.
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the pipeline events of one request.
    pub fn subscribe_request(&self, request_id: RequestId) -> RequestEventReceiver {
        RequestEventReceiver {
            receiver: self.sender.subscribe(),
            request_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl CortexEventPublisher for EventBus {
    async fn publish(&self, event: CortexEvent) -> anyhow::Result<()> {
        self.publish_memory_event(event);
        Ok(())
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

fn map_try_recv_error(e: broadcast::error::TryRecvError) -> EventBusError {
    match e {
        broadcast::error::TryRecvError::Empty => EventBusError::Empty,
        broadcast::error::TryRecvError::Closed => EventBusError::Closed,
        broadcast::error::TryRecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(map_try_recv_error)
    }
}

/// Receiver for one request's pipeline events (filtered)
pub struct RequestEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    request_id: RequestId,
}

impl RequestEventReceiver {
    /// Receive the next pipeline event for this request.
    /// Events of other requests and memory events are skipped.
    pub async fn recv(&mut self) -> Result<PipelineEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;

            if let DomainEvent::Pipeline(pipeline_event) = event {
                if pipeline_event.request_id() == self.request_id {
                    return Ok(pipeline_event);
                }
            }
        }
    }

    /// Next buffered pipeline event for this request, without waiting.
    pub fn try_recv(&mut self) -> Result<PipelineEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(map_try_recv_error)?;

            if let DomainEvent::Pipeline(pipeline_event) = event {
                if pipeline_event.request_id() == self.request_id {
                    return Ok(pipeline_event);
                }
            }
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
