//! Message and buffer types exchanged between the agent's threads.

use crate::config::AgentConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bundle identifier reported when no bundle has ever been loaded
pub const NULL_BUNDLE_ID: &str = "nullVersion";

/// Service name reported in the hello message
pub const SERVICE_NAME: &str = "embeddedWorkflowAgent";

/// MQTT delivery assurance requested by the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Map the raw guest value. Anything other than 0 or 1 asks for exactly-once.
    pub fn from_guest(value: i32) -> Self {
        match value {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// A publish request queued for the connectivity thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
}

impl OutboundPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }
}

/// An event consumed by the guest host thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Broker connectivity changed
    ConnectivityChanged { connected: bool },
    /// A new bundle arrived on the bundle-delivery topic
    BundleReceived { bytes: Vec<u8> },
    /// Any other message addressed to the guest
    GuestMessage { topic: String, payload: Vec<u8> },
    /// Fire the guest's direct triggers matching `trigger_id`
    DirectTrigger { trigger_id: String, payload: String },
    /// Log the agent's current status
    StatusRequested,
    /// Shut the guest down and stop the host loop
    Shutdown,
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::ConnectivityChanged { .. } => "connectivity_changed",
            InboundEvent::BundleReceived { .. } => "bundle_received",
            InboundEvent::GuestMessage { .. } => "guest_message",
            InboundEvent::DirectTrigger { .. } => "direct_trigger",
            InboundEvent::StatusRequested => "status_requested",
            InboundEvent::Shutdown => "shutdown",
        }
    }
}

/// A guest-owned buffer the host may write into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub offset: u32,
    pub capacity: u32,
}

impl MemoryRegion {
    pub fn new(offset: u32, capacity: u32) -> Self {
        Self { offset, capacity }
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.offset, self.capacity)
    }
}

/// The topic and payload buffers registered by `eea_set_message_buffers`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageBuffers {
    pub topic: MemoryRegion,
    pub payload: MemoryRegion,
}

/// Per-device MQTT topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub command: String,
    pub to_agent: String,
    pub bundle: String,
    pub hello: String,
}

impl DeviceTopics {
    pub fn new(base_topic: &str, device_id: &str) -> Self {
        let prefix = format!("{}/{}", base_topic, device_id);
        Self {
            command: format!("{}/command", prefix),
            to_agent: format!("{}/toAgent/#", prefix),
            bundle: format!("{}/toAgent/flows", prefix),
            hello: format!("{}/fromAgent/hello", prefix),
        }
    }

    pub fn for_config(config: &AgentConfig) -> Self {
        Self::new(&config.base_topic, &config.device_id)
    }

    /// Topics to subscribe to after every connect
    pub fn subscriptions(&self) -> [&str; 2] {
        [&self.command, &self.to_agent]
    }

    /// Turn a received broker message into the event the guest host expects.
    pub fn classify(&self, topic: String, payload: Vec<u8>) -> InboundEvent {
        if topic == self.bundle {
            InboundEvent::BundleReceived { bytes: payload }
        } else {
            InboundEvent::GuestMessage { topic, payload }
        }
    }
}

/// Startup notification sent on every bundle (re)load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub service: String,
    pub version: String,
    pub bundle: String,
    #[serde(rename = "compilerOptions")]
    pub compiler_options: CompilerOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerOptions {
    #[serde(rename = "traceLevel")]
    pub trace_level: i32,
    #[serde(rename = "exportMemory")]
    pub export_memory: bool,
}

impl HelloMessage {
    pub fn new(config: &AgentConfig, bundle_id: &str) -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            version: config.guest.version.clone(),
            bundle: bundle_id.to_string(),
            compiler_options: CompilerOptions {
                trace_level: config.guest.trace_level,
                export_memory: config.guest.export_memory,
            },
        }
    }

    /// Build the publish request carrying this hello
    pub fn to_publish(&self, topics: &DeviceTopics) -> crate::Result<OutboundPublish> {
        Ok(OutboundPublish::new(
            topics.hello.clone(),
            serde_json::to_string(self)?,
            QoS::AtLeastOnce,
        ))
    }
}
