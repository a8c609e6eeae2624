//! Host function implementations for the guest ABI.
//!
//! Every capability takes only integers and guest memory offsets and returns
//! an integer status. The guest has no error path for host calls, so boundary
//! violations and I/O failures are logged and the call still reports
//! [`STATUS_OK`].

use crate::context::HostContext;
use crate::memory::{decode_string, encode_int, encode_string, IntWidth, LengthSlot};
use eea_core::{MemoryRegion, MessageBuffers, OutboundPublish, QoS};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The only status the host functions report
pub const STATUS_OK: i32 = 0;

/// Import module every host function is registered under
pub const IMPORT_MODULE: &str = "env";

impl HostContext {
    /// `eea_trace(ptr, len, level)`
    pub fn trace(&self, memory: &[u8], ptr: i32, len: i32, level: i32) -> i32 {
        let message = match decode_string(memory, ptr as u32, len as u32) {
            Ok(message) => message,
            Err(e) => {
                warn!("eea_trace: unreadable message: {}", e);
                return STATUS_OK;
            }
        };

        let bundle = self.bundle_id().unwrap_or("-");
        match level {
            1 => error!(target: "guest", bundle, "{}", message),
            2 => info!(target: "guest", bundle, "{}", message),
            _ => debug!(target: "guest", bundle, level, "{}", message),
        }
        STATUS_OK
    }

    /// `eea_send_message(topic_ptr, topic_len, payload_ptr, payload_len, qos)`
    pub fn send_message(
        &self,
        memory: &[u8],
        topic_ptr: i32,
        topic_len: i32,
        payload_ptr: i32,
        payload_len: i32,
        qos: i32,
    ) -> i32 {
        let decoded = decode_string(memory, topic_ptr as u32, topic_len as u32).and_then(|topic| {
            decode_string(memory, payload_ptr as u32, payload_len as u32).map(|p| (topic, p))
        });

        match decoded {
            Ok((topic, payload)) => {
                debug!("Guest queued message for {:?}", topic);
                self.router()
                    .publish(OutboundPublish::new(topic, payload, QoS::from_guest(qos)));
            }
            Err(e) => warn!("eea_send_message: dropping message: {}", e),
        }
        STATUS_OK
    }

    /// `eea_storage_save(ptr, len)`
    pub fn storage_save(&self, memory: &[u8], ptr: i32, len: i32) -> i32 {
        match decode_string(memory, ptr as u32, len as u32) {
            Ok(blob) => {
                if let Err(e) = self.store().save_storage(&blob) {
                    error!("eea_storage_save: could not persist storage: {}", e);
                }
            }
            Err(e) => warn!("eea_storage_save: unreadable storage values: {}", e),
        }
        STATUS_OK
    }

    /// `eea_storage_read(out_ptr, buffer_len, out_len_ptr)`
    ///
    /// Writes nothing when no blob is stored, the blob is empty, or it does
    /// not fit the guest's buffer.
    pub fn storage_read(&self, memory: &mut [u8], out_ptr: i32, buffer_len: i32, out_len_ptr: i32) -> i32 {
        let blob = match self.store().read_storage() {
            Ok(Some(blob)) if !blob.is_empty() => blob,
            Ok(_) => {
                debug!("eea_storage_read: no persisted storage");
                return STATUS_OK;
            }
            Err(e) => {
                error!("eea_storage_read: treating storage as empty: {}", e);
                return STATUS_OK;
            }
        };

        write_string(
            "eea_storage_read",
            memory,
            &blob,
            out_ptr,
            buffer_len,
            LengthSlot::new(out_len_ptr as u32, IntWidth::U32),
        );
        STATUS_OK
    }

    /// `eea_sleep(millis)`: blocks the guest host thread, stalling the guest
    /// and all inbound event processing for the duration.
    pub fn sleep(&self, millis: i32) -> i32 {
        std::thread::sleep(Duration::from_millis(millis.max(0) as u64));
        STATUS_OK
    }

    /// `eea_get_device_id(out_ptr, buffer_len, out_len_ptr)`, one-byte length
    pub fn get_device_id(&self, memory: &mut [u8], out_ptr: i32, buffer_len: i32, out_len_ptr: i32) -> i32 {
        write_string(
            "eea_get_device_id",
            memory,
            self.device_id(),
            out_ptr,
            buffer_len,
            LengthSlot::new(out_len_ptr as u32, IntWidth::U8),
        );
        STATUS_OK
    }

    /// `eea_get_time(out_ptr)`: milliseconds since the epoch as a u64
    pub fn get_time(&self, memory: &mut [u8], out_ptr: i32) -> i32 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        if let Err(e) = encode_int(memory, out_ptr as u32, IntWidth::U64, now) {
            warn!("eea_get_time: {}", e);
        }
        STATUS_OK
    }

    /// `eea_set_message_buffers(topic_ptr, topic_len, payload_ptr, payload_len)`
    pub fn register_message_buffers(
        &mut self,
        topic_ptr: i32,
        topic_len: i32,
        payload_ptr: i32,
        payload_len: i32,
    ) -> i32 {
        let buffers = MessageBuffers {
            topic: MemoryRegion::new(topic_ptr as u32, topic_len as u32),
            payload: MemoryRegion::new(payload_ptr as u32, payload_len as u32),
        };
        debug!(topic = %buffers.topic, payload = %buffers.payload, "Guest registered message buffers");
        self.set_message_buffers(buffers);
        STATUS_OK
    }

    /// `eea_fn_read_sensor(out_ptr, buffer_len, out_len_ptr)`: latest sensor
    /// reading with a u32 length; nothing is written without a reading.
    pub fn read_sensor(&self, memory: &mut [u8], out_ptr: i32, buffer_len: i32, out_len_ptr: i32) -> i32 {
        let Some(reading) = self.sensor().and_then(|slot| slot.get()) else {
            debug!("eea_fn_read_sensor: no reading available");
            return STATUS_OK;
        };

        write_string(
            "eea_fn_read_sensor",
            memory,
            &reading,
            out_ptr,
            buffer_len,
            LengthSlot::new(out_len_ptr as u32, IntWidth::U32),
        );
        STATUS_OK
    }
}

fn write_string(func: &str, memory: &mut [u8], text: &str, ptr: i32, capacity: i32, slot: LengthSlot) {
    if capacity < 0 {
        warn!("{}: negative buffer length {}", func, capacity);
        return;
    }
    if let Err(e) = encode_string(memory, text, ptr as u32, capacity as u32, Some(slot)) {
        warn!("{}: nothing written: {}", func, e);
    }
}

#[cfg(feature = "wasmtime")]
pub use self::wasmtime_imports::add_to_linker;

#[cfg(feature = "wasmtime")]
mod wasmtime_imports {
    use super::{IMPORT_MODULE, STATUS_OK};
    use crate::context::HostContext;
    use crate::instance::HostState;
    use tracing::warn;
    use wasmtime::{Caller, Extern, Linker};

    /// Run `f` against the calling instance's linear memory.
    fn with_memory(
        caller: &mut Caller<'_, HostState>,
        f: impl FnOnce(&mut [u8], &mut HostContext) -> i32,
    ) -> i32 {
        let memory = caller.data().memory;
        let memory = memory.or_else(|| caller.get_export("memory").and_then(Extern::into_memory));
        match memory {
            Some(memory) => {
                let (data, state) = memory.data_and_store_mut(&mut *caller);
                f(data, &mut state.context)
            }
            None => {
                warn!("Host function called before guest memory was available");
                STATUS_OK
            }
        }
    }

    /// Add host function imports to a linker
    pub fn add_to_linker(linker: &mut Linker<HostState>) -> Result<(), anyhow::Error> {
        // eea_trace: (ptr: i32, len: i32, level: i32) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_trace",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, level: i32| {
                with_memory(&mut caller, |memory, ctx| ctx.trace(memory, ptr, len, level))
            },
        )?;

        // eea_send_message: (topic_ptr, topic_len, payload_ptr, payload_len, qos) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_send_message",
            |mut caller: Caller<'_, HostState>,
             topic_ptr: i32,
             topic_len: i32,
             payload_ptr: i32,
             payload_len: i32,
             qos: i32| {
                with_memory(&mut caller, |memory, ctx| {
                    ctx.send_message(memory, topic_ptr, topic_len, payload_ptr, payload_len, qos)
                })
            },
        )?;

        // eea_storage_save: (ptr: i32, len: i32) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_storage_save",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                with_memory(&mut caller, |memory, ctx| ctx.storage_save(memory, ptr, len))
            },
        )?;

        // eea_storage_read: (out_ptr, buffer_len, out_len_ptr) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_storage_read",
            |mut caller: Caller<'_, HostState>, out_ptr: i32, buffer_len: i32, out_len_ptr: i32| {
                with_memory(&mut caller, |memory, ctx| {
                    ctx.storage_read(memory, out_ptr, buffer_len, out_len_ptr)
                })
            },
        )?;

        // eea_sleep: (millis: i32) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_sleep",
            |caller: Caller<'_, HostState>, millis: i32| caller.data().context.sleep(millis),
        )?;

        // eea_get_device_id: (out_ptr, buffer_len, out_len_ptr) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_get_device_id",
            |mut caller: Caller<'_, HostState>, out_ptr: i32, buffer_len: i32, out_len_ptr: i32| {
                with_memory(&mut caller, |memory, ctx| {
                    ctx.get_device_id(memory, out_ptr, buffer_len, out_len_ptr)
                })
            },
        )?;

        // eea_get_time: (out_ptr: i32) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_get_time",
            |mut caller: Caller<'_, HostState>, out_ptr: i32| {
                with_memory(&mut caller, |memory, ctx| ctx.get_time(memory, out_ptr))
            },
        )?;

        // eea_set_message_buffers: (topic_ptr, topic_len, payload_ptr, payload_len) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_set_message_buffers",
            |mut caller: Caller<'_, HostState>,
             topic_ptr: i32,
             topic_len: i32,
             payload_ptr: i32,
             payload_len: i32| {
                caller
                    .data_mut()
                    .context
                    .register_message_buffers(topic_ptr, topic_len, payload_ptr, payload_len)
            },
        )?;

        // eea_fn_read_sensor: (out_ptr, buffer_len, out_len_ptr) -> i32
        linker.func_wrap(
            IMPORT_MODULE,
            "eea_fn_read_sensor",
            |mut caller: Caller<'_, HostState>, out_ptr: i32, buffer_len: i32, out_len_ptr: i32| {
                with_memory(&mut caller, |memory, ctx| {
                    ctx.read_sensor(memory, out_ptr, buffer_len, out_len_ptr)
                })
            },
        )?;

        Ok(())
    }
}
