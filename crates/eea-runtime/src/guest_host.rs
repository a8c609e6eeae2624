//! Guest lifecycle and pump loop.
//!
//! The guest host owns at most one live guest instance and is the only
//! consumer of the inbound queue. Everything here runs on a single thread:
//! the guest never executes concurrently with itself, and a guest that is
//! being torn down is taken out of `self.guest` before its shutdown entry
//! point runs, so no later event can reach it.

use crate::context::HostContext;
use crate::memory::{decode_int, decode_string, encode_string, IntWidth};
use crate::sandbox::{GuestInstance, GuestValue, Sandbox};
use eea_core::{
    AgentConfig, BundleStore, DeviceTopics, Error, HelloMessage, InboundEvent, LatestReading,
    Result, Router, NULL_BUNDLE_ID,
};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

/// Names of the guest's exported entry points and globals
pub mod exports {
    pub const INIT: &str = "eea_init";
    pub const LOOP: &str = "eea_loop";
    pub const SHUTDOWN: &str = "eea_shutdown";
    pub const SET_CONNECTION_STATUS: &str = "eea_set_connection_status";
    pub const MESSAGE_RECEIVED: &str = "eea_message_received";
    pub const DIRECT_TRIGGER: &str = "eea_direct_trigger";
    pub const CONFIG_SET_TRACE_LEVEL: &str = "eea_config_set_trace_level";
    pub const CONFIG_SET_STORAGE_SIZE: &str = "eea_config_set_storage_size";
    pub const CONFIG_SET_STORAGE_INTERVAL: &str = "eea_config_set_storage_interval";
    pub const BUNDLE_IDENTIFIER: &str = "BUNDLE_IDENTIFIER";
    pub const BUNDLE_IDENTIFIER_LENGTH: &str = "BUNDLE_IDENTIFIER_LENGTH";

    /// Exports a bundle must provide to be loaded
    pub const REQUIRED: &[&str] = &[
        INIT,
        LOOP,
        SHUTDOWN,
        SET_CONNECTION_STATUS,
        MESSAGE_RECEIVED,
        CONFIG_SET_TRACE_LEVEL,
        CONFIG_SET_STORAGE_SIZE,
        CONFIG_SET_STORAGE_INTERVAL,
        BUNDLE_IDENTIFIER,
        BUNDLE_IDENTIFIER_LENGTH,
    ];
}

/// Lifecycle state of the guest slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestState {
    Unloaded,
    Loading,
    Running,
    Unloading,
    ShuttingDown,
}

/// Whether the host loop should keep going after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

struct LoadedGuest<I> {
    instance: I,
    bundle_id: String,
}

/// Owner of the single live guest instance
pub struct GuestHost<S: Sandbox> {
    sandbox: S,
    config: Arc<AgentConfig>,
    store: BundleStore,
    router: Router,
    topics: DeviceTopics,
    sensor: Option<Arc<LatestReading>>,
    guest: Option<LoadedGuest<S::Instance>>,
    state: GuestState,
    connected: bool,
}

impl<S: Sandbox> GuestHost<S> {
    pub fn new(sandbox: S, config: Arc<AgentConfig>, router: Router) -> Self {
        Self {
            sandbox,
            store: BundleStore::from_config(&config.guest),
            topics: DeviceTopics::for_config(&config),
            config,
            router,
            sensor: None,
            guest: None,
            state: GuestState::Unloaded,
            connected: false,
        }
    }

    /// Expose a sensor slot to guests through `eea_fn_read_sensor`
    pub fn with_sensor(mut self, sensor: Arc<LatestReading>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn state(&self) -> GuestState {
        self.state
    }

    /// Identifier reported by the running guest
    pub fn bundle_id(&self) -> Option<&str> {
        self.guest.as_ref().map(|g| g.bundle_id.as_str())
    }

    /// Last connectivity state seen by the host
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn guest_mut(&mut self) -> Option<&mut S::Instance> {
        self.guest.as_mut().map(|g| &mut g.instance)
    }

    /// Load the persisted bundle, if any. Used once at startup.
    pub fn restore(&mut self) {
        match self.store.load_bundle() {
            Ok(Some(bundle)) => {
                info!("Loading persisted bundle ({} bytes)", bundle.len());
                // Failures are logged by activate and leave the host unloaded.
                let _ = self.activate(&bundle);
            }
            Ok(None) => {
                info!("No bundle persisted at {:?}", self.store.bundle_path());
                self.send_hello(NULL_BUNDLE_ID);
            }
            Err(e) => {
                error!("Could not read persisted bundle, starting without one: {}", e);
                self.send_hello(NULL_BUNDLE_ID);
            }
        }
    }

    /// Shut the running guest down (if any), persist `bundle`, then
    /// instantiate and initialise it.
    ///
    /// The bundle is written to durable storage before loading, so a crash
    /// during the load still leaves it recoverable on restart.
    #[instrument(skip_all, fields(bytes = bundle.len()))]
    pub fn load(&mut self, bundle: &[u8]) -> Result<()> {
        self.unload();
        if let Err(e) = self.store.save_bundle(bundle) {
            error!("Could not persist bundle, loading it anyway: {}", e);
        }
        self.activate(bundle)
    }

    /// Hot-swap the running guest for `bundle`.
    pub fn replace(&mut self, bundle: &[u8]) -> Result<()> {
        self.load(bundle)
    }

    /// Shut the running guest down before process exit.
    pub fn shutdown(&mut self) {
        if let Some(mut guest) = self.guest.take() {
            self.state = GuestState::ShuttingDown;
            info!(bundle_id = %guest.bundle_id, "Shutting down guest");
            call_logged(&mut guest.instance, exports::SHUTDOWN, &[]);
        }
        self.state = GuestState::Unloaded;
    }

    /// Run one guest tick. Does nothing while unloaded.
    pub fn pump(&mut self, now_millis: i64) {
        if let Some(guest) = self.guest.as_mut() {
            call_logged(&mut guest.instance, exports::LOOP, &[GuestValue::I64(now_millis)]);
        }
    }

    /// Translate one inbound event into guest calls.
    pub fn deliver(&mut self, event: InboundEvent) -> Flow {
        match event {
            InboundEvent::ConnectivityChanged { connected } => {
                self.connected = connected;
                if let Some(guest) = self.guest.as_mut() {
                    call_logged(
                        &mut guest.instance,
                        exports::SET_CONNECTION_STATUS,
                        &[GuestValue::I32(connected as i32)],
                    );
                }
            }
            InboundEvent::BundleReceived { bytes } => {
                info!("Received new bundle ({} bytes)", bytes.len());
                // Failures are logged by activate and leave the host unloaded.
                let _ = self.replace(&bytes);
            }
            InboundEvent::GuestMessage { topic, payload } => match String::from_utf8(payload) {
                Ok(payload) => self.send_to_buffers(exports::MESSAGE_RECEIVED, &topic, &payload),
                Err(e) => warn!("Dropping message on {}: payload is not UTF-8: {}", topic, e),
            },
            InboundEvent::DirectTrigger { trigger_id, payload } => {
                self.send_to_buffers(exports::DIRECT_TRIGGER, &trigger_id, &payload)
            }
            InboundEvent::StatusRequested => self.log_status(),
            InboundEvent::Shutdown => {
                self.shutdown();
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Deliver every queued inbound event without blocking.
    pub fn drain_inbound(&mut self) -> Flow {
        while let Some(event) = self.router.inbound().pop() {
            trace!(kind = event.kind(), "Delivering inbound event");
            if self.deliver(event) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Restore the persisted bundle and pump the guest until shutdown.
    pub fn run(mut self) {
        self.restore();
        let interval = self.config.guest.pump_interval();

        loop {
            if self.drain_inbound() == Flow::Stop {
                info!("Guest host stopped");
                return;
            }
            self.pump(chrono::Utc::now().timestamp_millis());
            std::thread::sleep(interval);
        }
    }

    fn unload(&mut self) {
        if let Some(mut guest) = self.guest.take() {
            self.state = GuestState::Unloading;
            info!(bundle_id = %guest.bundle_id, "Shutting down guest for replacement");
            call_logged(&mut guest.instance, exports::SHUTDOWN, &[]);
            drop(guest);
            self.state = GuestState::Unloaded;
        }
    }

    fn activate(&mut self, bundle: &[u8]) -> Result<()> {
        self.unload();
        self.state = GuestState::Loading;
        match self.instantiate(bundle) {
            Ok(guest) => {
                info!(bundle_id = %guest.bundle_id, "Guest running");
                self.send_hello(&guest.bundle_id);
                self.guest = Some(guest);
                self.state = GuestState::Running;
                Ok(())
            }
            Err(e) => {
                error!("Failed to load bundle: {}", e);
                self.state = GuestState::Unloaded;
                self.send_hello(NULL_BUNDLE_ID);
                Err(e)
            }
        }
    }

    fn instantiate(&self, bundle: &[u8]) -> Result<LoadedGuest<S::Instance>> {
        let mut context = HostContext::new(
            self.config.device_id.clone(),
            self.router.clone(),
            self.store.clone(),
        );
        if let Some(sensor) = &self.sensor {
            context = context.with_sensor(sensor.clone());
        }

        let mut instance = self.sandbox.instantiate(bundle, context)?;
        if let Some(missing) = exports::REQUIRED.iter().find(|name| !instance.has_export(name)) {
            return Err(Error::MissingExport(missing.to_string()));
        }

        let guest = &self.config.guest;
        let configuration = [
            (exports::CONFIG_SET_TRACE_LEVEL, guest.trace_level),
            (exports::CONFIG_SET_STORAGE_SIZE, guest.storage_size),
            (exports::CONFIG_SET_STORAGE_INTERVAL, guest.storage_interval_ms),
            (exports::SET_CONNECTION_STATUS, self.connected as i32),
        ];
        for (entry, value) in configuration {
            let code = instance.call(entry, &[GuestValue::I32(value)])?;
            if code != 0 {
                warn!("{} returned guest error-code {}", entry, code);
            }
        }

        let code = instance.call(exports::INIT, &[])?;
        if code != 0 {
            return Err(Error::InvalidState(format!(
                "{} returned guest error-code {}",
                exports::INIT,
                code
            )));
        }

        let bundle_id = read_bundle_id(&mut instance)?;
        instance.context_mut().set_bundle_id(bundle_id.clone());
        Ok(LoadedGuest { instance, bundle_id })
    }

    fn send_to_buffers(&mut self, entry: &str, topic: &str, payload: &str) {
        let Some(guest) = self.guest.as_mut() else {
            debug!("No guest loaded, dropping {} for {}", entry, topic);
            return;
        };
        if !guest.instance.has_export(entry) {
            warn!("Guest does not export {}, dropping {}", entry, topic);
            return;
        }
        let Some(buffers) = guest.instance.context().message_buffers() else {
            warn!("Message buffers not registered, dropping {} for {}", entry, topic);
            return;
        };

        let lengths = guest.instance.memory_mut().and_then(|memory| {
            let topic_len =
                encode_string(memory, topic, buffers.topic.offset, buffers.topic.capacity, None)?;
            let payload_len =
                encode_string(memory, payload, buffers.payload.offset, buffers.payload.capacity, None)?;
            Ok((topic_len, payload_len))
        });

        match lengths {
            Ok((topic_len, payload_len)) => call_logged(
                &mut guest.instance,
                entry,
                &[GuestValue::I32(topic_len as i32), GuestValue::I32(payload_len as i32)],
            ),
            Err(e) => warn!("Dropping {} for {}: {}", entry, topic, e),
        }
    }

    fn send_hello(&self, bundle_id: &str) {
        match HelloMessage::new(&self.config, bundle_id).to_publish(&self.topics) {
            Ok(message) => {
                debug!(bundle_id, "Queued hello message");
                self.router.publish(message);
            }
            Err(e) => error!("Could not encode hello message: {}", e),
        }
    }

    fn log_status(&self) {
        let config = &self.config;
        info!(
            version = %config.guest.version,
            device_id = %config.device_id,
            broker = %format!("{}:{}", config.broker.host, config.broker.port),
            base_topic = %config.base_topic,
            connected = self.connected,
            bundle_id = self.bundle_id().unwrap_or(NULL_BUNDLE_ID),
            state = ?self.state,
            pump_interval_ms = config.guest.pump_interval_ms,
            trace_level = config.guest.trace_level,
            memory_pages = config.guest.memory_pages,
            bundle_path = ?config.guest.bundle_path,
            storage_path = ?config.guest.storage_path,
            "Agent status"
        );
    }
}

/// Read the identifier the bundle was compiled with. `BUNDLE_IDENTIFIER`
/// points at the UTF-8 bytes and `BUNDLE_IDENTIFIER_LENGTH` at a one-byte
/// length.
fn read_bundle_id<I: GuestInstance>(instance: &mut I) -> Result<String> {
    let str_ptr = instance.global_i32(exports::BUNDLE_IDENTIFIER)? as u32;
    let len_ptr = instance.global_i32(exports::BUNDLE_IDENTIFIER_LENGTH)? as u32;
    let memory = instance.memory_mut()?;
    let len = decode_int(memory, len_ptr, IntWidth::U8)? as u32;
    decode_string(memory, str_ptr, len)
}

fn call_logged<I: GuestInstance>(instance: &mut I, entry: &str, args: &[GuestValue]) {
    match instance.call(entry, args) {
        Ok(0) => {}
        Ok(code) => warn!("{} returned guest error-code {}", entry, code),
        Err(e) => error!("{} failed: {}", entry, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<String>>>);

    impl CallLog {
        fn push(&self, entry: String) {
            self.0.lock().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }

        fn clear(&self) {
            self.0.lock().clear();
        }
    }

    /// Sandbox whose bundles are `<bundle id>[:flag,...]` strings
    struct ScriptedSandbox {
        log: CallLog,
    }

    struct ScriptedInstance {
        log: CallLog,
        bundle_id: String,
        context: HostContext,
        memory: Vec<u8>,
        init_code: i32,
        register_buffers: bool,
        direct_trigger: bool,
    }

    impl Sandbox for ScriptedSandbox {
        type Instance = ScriptedInstance;

        fn instantiate(&self, bundle: &[u8], context: HostContext) -> Result<ScriptedInstance> {
            let script = std::str::from_utf8(bundle)
                .map_err(|_| Error::Wasm("not a scripted bundle".into()))?;
            let persisted = context.store().load_bundle().ok().flatten().as_deref() == Some(bundle);
            self.log.push(format!("instantiate {} persisted={}", script, persisted));

            let (bundle_id, flags) = script.split_once(':').unwrap_or((script, ""));
            if bundle_id == "broken" {
                return Err(Error::Wasm("invalid module".into()));
            }

            let mut memory = vec![0u8; 4096];
            memory[0] = bundle_id.len() as u8;
            memory[16..16 + bundle_id.len()].copy_from_slice(bundle_id.as_bytes());

            Ok(ScriptedInstance {
                log: self.log.clone(),
                bundle_id: bundle_id.to_string(),
                context,
                memory,
                init_code: if flags.contains("init-fails") { 1 } else { 0 },
                register_buffers: !flags.contains("no-buffers"),
                direct_trigger: flags.contains("direct"),
            })
        }
    }

    impl GuestInstance for ScriptedInstance {
        fn call(&mut self, entry: &str, args: &[GuestValue]) -> Result<i32> {
            let args: Vec<String> = args
                .iter()
                .map(|arg| match arg {
                    GuestValue::I32(v) => v.to_string(),
                    GuestValue::I64(v) => v.to_string(),
                })
                .collect();
            self.log.push(format!("{}.{}({})", self.bundle_id, entry, args.join(",")));

            if entry == exports::INIT {
                if self.register_buffers {
                    self.context.register_message_buffers(100, 32, 200, 64);
                }
                return Ok(self.init_code);
            }
            Ok(0)
        }

        fn has_export(&mut self, name: &str) -> bool {
            name != exports::DIRECT_TRIGGER || self.direct_trigger
        }

        fn global_i32(&mut self, name: &str) -> Result<i32> {
            match name {
                exports::BUNDLE_IDENTIFIER => Ok(16),
                exports::BUNDLE_IDENTIFIER_LENGTH => Ok(0),
                _ => Err(Error::MissingExport(name.to_string())),
            }
        }

        fn memory_mut(&mut self) -> Result<&mut [u8]> {
            Ok(&mut self.memory)
        }

        fn context(&self) -> &HostContext {
            &self.context
        }

        fn context_mut(&mut self) -> &mut HostContext {
            &mut self.context
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Arc<AgentConfig> {
        let mut config = AgentConfig {
            device_id: "dev1".into(),
            access_key: "key".into(),
            access_secret: "secret".into(),
            ..AgentConfig::default()
        };
        config.guest.bundle_path = dir.path().join("bundle.wasm");
        config.guest.storage_path = dir.path().join("storage.json");
        Arc::new(config)
    }

    fn scripted_host(dir: &tempfile::TempDir) -> (GuestHost<ScriptedSandbox>, Router, CallLog) {
        let log = CallLog::default();
        let router = Router::new();
        let host = GuestHost::new(
            ScriptedSandbox { log: log.clone() },
            test_config(dir),
            router.clone(),
        );
        (host, router, log)
    }

    fn hello_bundles(router: &Router) -> Vec<String> {
        std::iter::from_fn(|| router.outbound().pop())
            .filter(|m| m.topic == "losant/dev1/fromAgent/hello")
            .map(|m| {
                let value: serde_json::Value = serde_json::from_str(&m.payload).unwrap();
                value["bundle"].as_str().unwrap().to_string()
            })
            .collect()
    }

    fn message(topic: &str, payload: &str) -> InboundEvent {
        InboundEvent::GuestMessage {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_restore_without_bundle_sends_null_hello() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, router, log) = scripted_host(&dir);

        host.restore();

        assert_eq!(host.state(), GuestState::Unloaded);
        assert!(log.entries().is_empty());
        assert_eq!(hello_bundles(&router), vec!["nullVersion"]);
    }

    #[test]
    fn test_load_configures_and_initialises() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, router, log) = scripted_host(&dir);

        host.load(b"b1").unwrap();

        assert_eq!(
            log.entries(),
            vec![
                "instantiate b1 persisted=true",
                "b1.eea_config_set_trace_level(2)",
                "b1.eea_config_set_storage_size(32768)",
                "b1.eea_config_set_storage_interval(30000)",
                "b1.eea_set_connection_status(0)",
                "b1.eea_init()",
            ]
        );
        assert_eq!(host.state(), GuestState::Running);
        assert_eq!(host.bundle_id(), Some("b1"));
        assert_eq!(host.guest_mut().unwrap().context().bundle_id(), Some("b1"));
        assert_eq!(hello_bundles(&router), vec!["b1"]);
    }

    #[test]
    fn test_bundle_received_shuts_down_then_persists_then_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, router, log) = scripted_host(&dir);
        host.load(b"b1").unwrap();
        log.clear();

        let flow = host.deliver(InboundEvent::BundleReceived { bytes: b"b2".to_vec() });

        assert_eq!(flow, Flow::Continue);
        let entries = log.entries();
        assert_eq!(entries[0], "b1.eea_shutdown()");
        assert_eq!(entries[1], "instantiate b2 persisted=true");
        assert_eq!(entries.last().unwrap(), "b2.eea_init()");
        assert!(!entries.iter().skip(1).any(|e| e.starts_with("b1.")));
        assert_eq!(host.bundle_id(), Some("b2"));
        assert_eq!(hello_bundles(&router), vec!["b1", "b2"]);
    }

    #[test]
    fn test_failed_load_leaves_host_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, router, log) = scripted_host(&dir);
        host.load(b"b1").unwrap();
        log.clear();

        host.deliver(InboundEvent::BundleReceived { bytes: b"broken".to_vec() });
        assert_eq!(host.state(), GuestState::Unloaded);
        assert_eq!(host.bundle_id(), None);

        host.deliver(message("losant/dev1/command", "{}"));
        host.deliver(InboundEvent::ConnectivityChanged { connected: true });
        host.pump(1);

        assert_eq!(
            log.entries(),
            vec!["b1.eea_shutdown()", "instantiate broken persisted=true"]
        );
        assert_eq!(hello_bundles(&router), vec!["b1", "nullVersion"]);

        // The newest bundle is what a restart would pick up.
        let store = BundleStore::from_config(&test_config(&dir).guest);
        assert_eq!(store.load_bundle().unwrap().unwrap(), b"broken");
    }

    #[test]
    fn test_load_over_running_guest_shuts_it_down() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _router, log) = scripted_host(&dir);
        host.load(b"b1").unwrap();
        log.clear();

        assert!(host.load(b"broken").is_err());
        host.pump(9);

        assert_eq!(host.state(), GuestState::Unloaded);
        assert_eq!(host.bundle_id(), None);
        assert_eq!(
            log.entries(),
            vec!["b1.eea_shutdown()", "instantiate broken persisted=true"]
        );

        host.load(b"b2").unwrap();
        log.clear();
        host.load(b"b3").unwrap();
        assert_eq!(log.entries()[0], "b2.eea_shutdown()");
        assert_eq!(host.bundle_id(), Some("b3"));
    }

    #[test]
    fn test_init_error_code_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _router, _log) = scripted_host(&dir);

        let result = host.load(b"b1:init-fails");

        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(host.state(), GuestState::Unloaded);
    }

    #[test]
    fn test_restart_restores_persisted_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut first, _router, _log) = scripted_host(&dir);
        first.load(b"b7").unwrap();
        drop(first);

        let (mut restarted, router, log) = scripted_host(&dir);
        restarted.restore();

        assert_eq!(log.entries()[0], "instantiate b7 persisted=true");
        assert_eq!(restarted.bundle_id(), Some("b7"));
        assert_eq!(hello_bundles(&router), vec!["b7"]);
    }

    #[test]
    fn test_message_marshaled_into_registered_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _router, log) = scripted_host(&dir);
        host.load(b"b1").unwrap();

        host.deliver(message("losant/dev1/command", "{\"x\":1}"));

        assert_eq!(log.entries().last().unwrap(), "b1.eea_message_received(19,7)");
        let memory = host.guest_mut().unwrap().memory_mut().unwrap();
        assert_eq!(decode_string(memory, 100, 19).unwrap(), "losant/dev1/command");
        assert_eq!(decode_string(memory, 200, 7).unwrap(), "{\"x\":1}");
    }

    #[test]
    fn test_messages_dropped_until_buffers_registered() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _router, log) = scripted_host(&dir);
        host.load(b"b1:no-buffers").unwrap();
        log.clear();

        host.deliver(message("losant/dev1/command", "{}"));

        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_oversized_or_malformed_payload_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _router, log) = scripted_host(&dir);
        host.load(b"b1").unwrap();
        log.clear();

        host.deliver(message("t", &"x".repeat(65)));
        host.deliver(InboundEvent::GuestMessage {
            topic: "t".into(),
            payload: vec![0xff, 0xfe],
        });

        assert!(log.entries().is_empty());
        let memory = host.guest_mut().unwrap().memory_mut().unwrap();
        assert!(memory[200..265].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_connectivity_is_applied_to_new_guests() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _router, log) = scripted_host(&dir);

        host.deliver(InboundEvent::ConnectivityChanged { connected: true });
        assert!(log.entries().is_empty());
        assert!(host.is_connected());

        host.load(b"b1").unwrap();
        assert!(log.entries().contains(&"b1.eea_set_connection_status(1)".to_string()));

        host.deliver(InboundEvent::ConnectivityChanged { connected: false });
        assert_eq!(log.entries().last().unwrap(), "b1.eea_set_connection_status(0)");
    }

    #[test]
    fn test_pump_only_runs_loaded_guest() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _router, log) = scripted_host(&dir);

        host.pump(5);
        assert!(log.entries().is_empty());

        host.load(b"b1").unwrap();
        host.pump(42);
        assert_eq!(log.entries().last().unwrap(), "b1.eea_loop(42)");
    }

    #[test]
    fn test_drain_delivers_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, router, log) = scripted_host(&dir);
        host.load(b"b1").unwrap();
        log.clear();

        router.notify(message("a", "1"));
        router.notify(message("bb", "1"));
        router.notify(message("ccc", "1"));

        assert_eq!(host.drain_inbound(), Flow::Continue);
        assert_eq!(
            log.entries(),
            vec![
                "b1.eea_message_received(1,1)",
                "b1.eea_message_received(2,1)",
                "b1.eea_message_received(3,1)",
            ]
        );
        assert!(router.inbound().is_empty());
    }

    #[test]
    fn test_shutdown_event_stops_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, router, log) = scripted_host(&dir);
        host.load(b"b1").unwrap();
        log.clear();

        router.notify(message("a", "1"));
        router.notify(InboundEvent::Shutdown);
        router.notify(message("bb", "1"));

        assert_eq!(host.drain_inbound(), Flow::Stop);
        assert_eq!(
            log.entries(),
            vec!["b1.eea_message_received(1,1)", "b1.eea_shutdown()"]
        );
        assert_eq!(host.state(), GuestState::Unloaded);
        assert_eq!(router.inbound().len(), 1);
    }

    #[test]
    fn test_direct_trigger_needs_export() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _router, log) = scripted_host(&dir);
        let trigger = InboundEvent::DirectTrigger {
            trigger_id: "myId".into(),
            payload: "{}".into(),
        };

        host.load(b"b1").unwrap();
        log.clear();
        host.deliver(trigger.clone());
        assert!(log.entries().is_empty());

        host.replace(b"b2:direct").unwrap();
        host.deliver(trigger);
        assert_eq!(log.entries().last().unwrap(), "b2.eea_direct_trigger(4,2)");
    }

    #[cfg(feature = "wasmtime")]
    mod wasmtime_guest {
        use super::*;
        use crate::{Runtime, RuntimeConfig};
        use eea_core::QoS;

        const ECHO_WAT: &str = r##"
            (module
              (import "env" "memory" (memory 1))
              (import "env" "eea_set_message_buffers" (func $set_buffers (param i32 i32 i32 i32) (result i32)))
              (import "env" "eea_send_message" (func $send (param i32 i32 i32 i32 i32) (result i32)))
              (import "env" "eea_storage_save" (func $save (param i32 i32) (result i32)))
              (import "env" "eea_trace" (func $trace (param i32 i32 i32) (result i32)))
              (global $connected (mut i32) (i32.const 0))
              (global (export "BUNDLE_IDENTIFIER") i32 (i32.const 16))
              (global (export "BUNDLE_IDENTIFIER_LENGTH") i32 (i32.const 8))
              (data (i32.const 8) "\09")
              (data (i32.const 16) "echo-v1.0")
              (data (i32.const 64) "{\"saved\":true}")
              (data (i32.const 96) "init")
              (func (export "eea_config_set_trace_level") (param i32) (result i32) (i32.const 0))
              (func (export "eea_config_set_storage_size") (param i32) (result i32) (i32.const 0))
              (func (export "eea_config_set_storage_interval") (param i32) (result i32) (i32.const 0))
              (func (export "eea_set_connection_status") (param i32) (result i32)
                (global.set $connected (local.get 0))
                (i32.const 0))
              (func (export "eea_init") (result i32)
                (drop (call $set_buffers (i32.const 1024) (i32.const 128) (i32.const 2048) (i32.const 512)))
                (drop (call $trace (i32.const 96) (i32.const 4) (i32.const 2)))
                (i32.const 0))
              (func (export "eea_loop") (param i64) (result i32) (i32.const 0))
              (func (export "eea_message_received") (param i32 i32) (result i32)
                (call $send (i32.const 1024) (local.get 0) (i32.const 2048) (local.get 1) (i32.const 1)))
              (func (export "eea_shutdown") (result i32)
                (call $save (i32.const 64) (i32.const 14)))
              (export "connected" (global $connected)))
        "##;

        fn wasm_host(dir: &tempfile::TempDir) -> (GuestHost<Runtime>, Router) {
            let config = test_config(dir);
            let runtime = Runtime::new(RuntimeConfig::from(&config.guest)).unwrap();
            let router = Router::new();
            (GuestHost::new(runtime, config, router.clone()), router)
        }

        #[test]
        fn test_echo_guest_round_trip() {
            let dir = tempfile::tempdir().unwrap();
            let (mut host, router) = wasm_host(&dir);

            host.load(ECHO_WAT.as_bytes()).unwrap();
            assert_eq!(host.bundle_id(), Some("echo-v1.0"));
            assert_eq!(hello_bundles(&router), vec!["echo-v1.0"]);

            host.deliver(InboundEvent::ConnectivityChanged { connected: true });
            assert_eq!(host.guest_mut().unwrap().global_i32("connected").unwrap(), 1);

            host.deliver(message("losant/dev1/command", "{\"name\":\"go\"}"));
            let echoed = router.outbound().pop().unwrap();
            assert_eq!(echoed.topic, "losant/dev1/command");
            assert_eq!(echoed.payload, "{\"name\":\"go\"}");
            assert_eq!(echoed.qos, QoS::AtLeastOnce);

            host.pump(chrono::Utc::now().timestamp_millis());
            assert!(router.outbound().is_empty());
        }

        #[test]
        fn test_hot_swap_saves_storage_on_shutdown() {
            let dir = tempfile::tempdir().unwrap();
            let (mut host, router) = wasm_host(&dir);
            host.load(ECHO_WAT.as_bytes()).unwrap();

            host.deliver(InboundEvent::BundleReceived {
                bytes: ECHO_WAT.as_bytes().to_vec(),
            });

            assert_eq!(host.state(), GuestState::Running);
            assert_eq!(hello_bundles(&router), vec!["echo-v1.0", "echo-v1.0"]);
            let store = BundleStore::from_config(&test_config(&dir).guest);
            assert_eq!(store.read_storage().unwrap().as_deref(), Some("{\"saved\":true}"));
        }

        #[test]
        fn test_bundle_without_required_exports_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let (mut host, _router) = wasm_host(&dir);

            let result = host.load(b"(module (import \"env\" \"memory\" (memory 1)))");

            assert!(matches!(result, Err(Error::MissingExport(_))));
            assert_eq!(host.state(), GuestState::Unloaded);
        }
    }
}
