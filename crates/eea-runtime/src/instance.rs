//! Guest instance management on wasmtime.

use crate::context::HostContext;
use crate::host_functions::{self, IMPORT_MODULE};
use crate::sandbox::{GuestInstance, GuestValue};
use crate::RuntimeConfig;
use eea_core::{Error, Result};
use wasmtime::*;

/// Store data for a wasmtime guest
pub struct HostState {
    pub context: HostContext,
    /// Linear memory the host functions operate on, once known
    pub memory: Option<Memory>,
}

/// A running guest instance
pub struct WasmtimeInstance {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    config: RuntimeConfig,
}

impl WasmtimeInstance {
    pub fn new(
        engine: &Engine,
        wasm_bytes: &[u8],
        context: HostContext,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let module = Module::new(engine, wasm_bytes)
            .map_err(|e| Error::Wasm(format!("Failed to compile module: {}", e)))?;

        let mut linker = Linker::new(engine);
        host_functions::add_to_linker(&mut linker)
            .map_err(|e| Error::Wasm(format!("Failed to add host functions: {}", e)))?;

        let mut store = Store::new(
            engine,
            HostState {
                context,
                memory: None,
            },
        );

        let imported_memory = if config.export_memory {
            None
        } else {
            let memory = Memory::new(&mut store, MemoryType::new(config.memory_pages, None))
                .map_err(|e| Error::Wasm(format!("Failed to create memory: {}", e)))?;
            linker
                .define(&store, IMPORT_MODULE, "memory", memory)
                .map_err(|e| Error::Wasm(format!("Failed to define memory: {}", e)))?;
            Some(memory)
        };
        store.data_mut().memory = imported_memory;

        if let Some(fuel) = config.max_fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| Error::Wasm(format!("Failed to set fuel: {}", e)))?;
        }

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| Error::Wasm(format!("Failed to instantiate: {}", e)))?;

        let memory = match imported_memory {
            Some(memory) => memory,
            None => instance
                .get_memory(&mut store, "memory")
                .ok_or_else(|| Error::MissingExport("memory".to_string()))?,
        };
        store.data_mut().memory = Some(memory);

        Ok(Self {
            store,
            instance,
            memory,
            config,
        })
    }

    fn refuel(&mut self) -> Result<()> {
        if let Some(fuel) = self.config.max_fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| Error::Wasm(format!("Failed to set fuel: {}", e)))?;
        }
        Ok(())
    }

    /// Fuel consumed by the last guest call, if metering is on
    pub fn fuel_consumed(&self) -> Option<u64> {
        let max = self.config.max_fuel?;
        Some(max - self.store.get_fuel().unwrap_or(0))
    }
}

impl GuestInstance for WasmtimeInstance {
    fn call(&mut self, entry: &str, args: &[GuestValue]) -> Result<i32> {
        let func = self
            .instance
            .get_func(&mut self.store, entry)
            .ok_or_else(|| Error::MissingExport(entry.to_string()))?;

        // Reset fuel for this call
        self.refuel()?;

        let params: Vec<Val> = args
            .iter()
            .map(|arg| match *arg {
                GuestValue::I32(v) => Val::I32(v),
                GuestValue::I64(v) => Val::I64(v),
            })
            .collect();
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];

        func.call(&mut self.store, &params, &mut results).map_err(|e| {
            // Check if we ran out of fuel
            if let Some(trap) = e.downcast_ref::<Trap>() {
                if matches!(trap, Trap::OutOfFuel) {
                    return Error::ResourceExhausted(format!("{} ran out of fuel", entry));
                }
            }
            Error::Wasm(format!("{} failed: {}", entry, e))
        })?;

        if let Some(consumed) = self.fuel_consumed() {
            tracing::trace!("{} consumed {} fuel", entry, consumed);
        }

        Ok(results.first().and_then(Val::i32).unwrap_or(0))
    }

    fn has_export(&mut self, name: &str) -> bool {
        self.instance.get_export(&mut self.store, name).is_some()
    }

    fn global_i32(&mut self, name: &str) -> Result<i32> {
        let global = self
            .instance
            .get_global(&mut self.store, name)
            .ok_or_else(|| Error::MissingExport(name.to_string()))?;
        global
            .get(&mut self.store)
            .i32()
            .ok_or_else(|| Error::Wasm(format!("global {} is not an i32", name)))
    }

    fn memory_mut(&mut self) -> Result<&mut [u8]> {
        Ok(self.memory.data_mut(&mut self.store))
    }

    fn context(&self) -> &HostContext {
        &self.store.data().context
    }

    fn context_mut(&mut self) -> &mut HostContext {
        &mut self.store.data_mut().context
    }
}
