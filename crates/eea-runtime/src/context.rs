//! Host-side state for one guest instance.

use eea_core::{BundleStore, LatestReading, MessageBuffers, Router};
use std::sync::Arc;

/// State owned by the guest host thread and handed to every host function
/// call by reference. One context exists per guest instance; a hot-swap
/// builds a fresh one so buffer registrations never leak across bundles.
#[derive(Debug)]
pub struct HostContext {
    device_id: String,
    bundle_id: Option<String>,
    router: Router,
    store: BundleStore,
    buffers: Option<MessageBuffers>,
    sensor: Option<Arc<LatestReading>>,
}

impl HostContext {
    pub fn new(device_id: impl Into<String>, router: Router, store: BundleStore) -> Self {
        Self {
            device_id: device_id.into(),
            bundle_id: None,
            router,
            store,
            buffers: None,
            sensor: None,
        }
    }

    pub fn with_sensor(mut self, sensor: Arc<LatestReading>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Bundle id as reported by the guest, once known
    pub fn bundle_id(&self) -> Option<&str> {
        self.bundle_id.as_deref()
    }

    pub fn set_bundle_id(&mut self, bundle_id: impl Into<String>) {
        self.bundle_id = Some(bundle_id.into());
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    /// The topic/payload buffers, or `None` until the guest registered them
    pub fn message_buffers(&self) -> Option<MessageBuffers> {
        self.buffers
    }

    pub fn set_message_buffers(&mut self, buffers: MessageBuffers) {
        self.buffers = Some(buffers);
    }

    pub fn sensor(&self) -> Option<&Arc<LatestReading>> {
        self.sensor.as_ref()
    }
}
