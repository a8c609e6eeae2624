//! Host runtime for sandboxed workflow bundles.
//!
//! This crate provides the execution environment for guest bundles, including:
//! - Memory ABI helpers for crossing the host/guest boundary
//! - Host function implementations (the guest ABI)
//! - The guest host lifecycle and pump loop
//! - A wasmtime-backed sandbox with optional fuel limits

pub mod context;
pub mod guest_host;
pub mod host_functions;
#[cfg(feature = "wasmtime")]
pub mod instance;
pub mod memory;
pub mod sandbox;

pub use context::HostContext;
pub use guest_host::{GuestHost, GuestState};
pub use sandbox::{GuestInstance, GuestValue, Sandbox};

use eea_core::GuestConfig;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum fuel per guest call, unlimited when unset
    pub max_fuel: Option<u64>,
    /// Initial pages of the imported `env.memory`
    pub memory_pages: u32,
    /// Use the guest's exported memory instead of importing one
    pub export_memory: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_fuel: None,
            memory_pages: 5,
            export_memory: false,
        }
    }
}

impl From<&GuestConfig> for RuntimeConfig {
    fn from(config: &GuestConfig) -> Self {
        Self {
            max_fuel: config.max_fuel_per_call,
            memory_pages: config.memory_pages,
            export_memory: config.export_memory,
        }
    }
}

#[cfg(feature = "wasmtime")]
pub use self::wasmtime_runtime::Runtime;

/// The sandbox engine selected at build time
#[cfg(feature = "wasmtime")]
pub type DefaultSandbox = Runtime;

#[cfg(feature = "wasmtime")]
mod wasmtime_runtime {
    use super::RuntimeConfig;
    use crate::context::HostContext;
    use crate::instance::WasmtimeInstance;
    use crate::sandbox::Sandbox;
    use eea_core::{Error, Result};
    use wasmtime::{Config, Engine};

    /// The WASM runtime manager
    pub struct Runtime {
        engine: Engine,
        config: RuntimeConfig,
    }

    impl Runtime {
        pub fn new(config: RuntimeConfig) -> Result<Self> {
            let mut wasm_config = Config::new();
            wasm_config.consume_fuel(config.max_fuel.is_some());
            wasm_config.max_wasm_stack(512 * 1024); // 512 KiB stack

            let engine = Engine::new(&wasm_config)
                .map_err(|e| Error::Wasm(format!("Failed to create engine: {}", e)))?;

            Ok(Self { engine, config })
        }
    }

    impl Sandbox for Runtime {
        type Instance = WasmtimeInstance;

        fn instantiate(&self, bundle: &[u8], context: HostContext) -> Result<WasmtimeInstance> {
            WasmtimeInstance::new(&self.engine, bundle, context, self.config.clone())
        }
    }

}
