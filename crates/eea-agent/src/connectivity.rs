//! Broker session management.
//!
//! The connectivity thread owns the transport. It turns broker traffic into
//! inbound events and drains the outbound queue while connected. Only this
//! thread ever talks to the broker.

use eea_core::{AgentConfig, DeviceTopics, InboundEvent, OutboundPublish, Result, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on flushing the transport after a disconnect request
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// What a single transport poll produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectionRefused(String),
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
    Idle,
}

/// Whether the transport took a publish request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    /// The transport's request buffer is full; retry later
    Busy,
}

/// A broker session. Reconnection is driven by calling `poll` again after a
/// disconnect.
pub trait Transport {
    fn poll(&mut self, timeout: Duration) -> TransportEvent;

    fn subscribe(&mut self, topic: &str) -> Result<()>;

    fn publish(&mut self, message: &OutboundPublish) -> Result<PublishOutcome>;

    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct ConnectivityManager<T: Transport> {
    transport: T,
    router: Router,
    topics: DeviceTopics,
    state: LinkState,
    /// Subscriptions not yet accepted by the transport on this connection
    pending_subscriptions: Vec<String>,
    poll_interval: Duration,
    reconnect_interval: Duration,
    running: Arc<AtomicBool>,
}

impl<T: Transport> ConnectivityManager<T> {
    pub fn new(transport: T, config: &AgentConfig, router: Router, running: Arc<AtomicBool>) -> Self {
        Self {
            transport,
            router,
            topics: DeviceTopics::for_config(config),
            state: LinkState::Disconnected,
            pending_subscriptions: Vec::new(),
            poll_interval: config.broker.poll_interval(),
            reconnect_interval: config.broker.reconnect_interval(),
            running,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Poll the broker until the running flag is cleared.
    pub fn run(mut self) {
        info!("Connectivity thread started");
        self.state = LinkState::Connecting;

        while self.running.load(Ordering::SeqCst) {
            self.step();
        }

        self.stop();
        info!("Connectivity thread stopped");
    }

    /// One poll of the transport followed by an outbound drain.
    pub fn step(&mut self) {
        let event = self.transport.poll(self.poll_interval);
        self.handle(event);

        if self.state == LinkState::Connected {
            self.subscribe_pending();
            self.drain_outbound();
        }
    }

    /// Flush what is still queued, then disconnect and let the transport
    /// send the request.
    pub fn stop(&mut self) {
        if self.state == LinkState::Connected {
            let published = self.drain_outbound();
            debug!("Flushed {} messages before disconnecting", published);
        }
        self.transport.disconnect();

        let deadline = Instant::now() + SHUTDOWN_FLUSH_TIMEOUT;
        while Instant::now() < deadline {
            match self.transport.poll(Duration::from_millis(100)) {
                TransportEvent::Disconnected(_) | TransportEvent::ConnectionRefused(_) => break,
                _ => {}
            }
        }
        self.state = LinkState::Disconnected;
    }

    /// Publish queued messages in FIFO order. A message the transport does
    /// not accept goes back to the head of the queue and draining stops.
    pub fn drain_outbound(&mut self) -> usize {
        let outbound = self.router.outbound().clone();
        let mut published = 0;

        while let Some(message) = outbound.pop() {
            match self.transport.publish(&message) {
                Ok(PublishOutcome::Accepted) => {
                    debug!(topic = %message.topic, qos = message.qos.level(), "Published");
                    published += 1;
                }
                Ok(PublishOutcome::Busy) => {
                    debug!("Transport busy, {} messages left queued", outbound.len() + 1);
                    outbound.push_front(message);
                    break;
                }
                Err(e) => {
                    warn!("Publish to {} failed, keeping it queued: {}", message.topic, e);
                    outbound.push_front(message);
                    break;
                }
            }
        }
        published
    }

    fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::ConnectionRefused(reason) => {
                error!("Broker refused connection: {}", reason);
                self.on_disconnected();
            }
            TransportEvent::Disconnected(reason) => {
                warn!("Broker connection lost: {}", reason);
                self.on_disconnected();
            }
            TransportEvent::Message { topic, payload } => {
                debug!(%topic, bytes = payload.len(), "Message received");
                self.router.notify(self.topics.classify(topic, payload));
            }
            TransportEvent::Idle => {}
        }
    }

    fn on_connected(&mut self) {
        self.pending_subscriptions = self
            .topics
            .subscriptions()
            .iter()
            .map(|topic| topic.to_string())
            .collect();
        self.subscribe_pending();
        self.state = LinkState::Connected;
        info!("Connected to broker");
        self.router.notify(InboundEvent::ConnectivityChanged { connected: true });
    }

    /// Retry every subscription the transport has not accepted yet.
    fn subscribe_pending(&mut self) {
        let transport = &mut self.transport;
        self.pending_subscriptions
            .retain(|topic| match transport.subscribe(topic) {
                Ok(()) => {
                    debug!(%topic, "Subscribed");
                    false
                }
                Err(e) => {
                    warn!("Could not subscribe to {}, retrying: {}", topic, e);
                    true
                }
            });
    }

    fn on_disconnected(&mut self) {
        if self.state == LinkState::Connected {
            self.router.notify(InboundEvent::ConnectivityChanged { connected: false });
        }
        self.state = LinkState::Disconnected;

        info!("Reconnecting in {:?}", self.reconnect_interval);
        self.wait_before_reconnect();
        self.state = LinkState::Connecting;
    }

    /// Sleep out the reconnect interval, waking early on shutdown.
    fn wait_before_reconnect(&self) {
        let deadline = Instant::now() + self.reconnect_interval;
        let slice = Duration::from_millis(100);

        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}
