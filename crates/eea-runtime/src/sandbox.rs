//! The seam between the guest host and the bytecode engine.
//!
//! The guest host only needs to compile and instantiate a bundle, call its
//! exported entry points and reach its linear memory. The concrete engine is
//! chosen at build time through cargo features; see [`crate::DefaultSandbox`].

use crate::context::HostContext;
use eea_core::Result;

/// Argument passed to a guest entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestValue {
    I32(i32),
    I64(i64),
}

/// A live, instantiated guest
pub trait GuestInstance {
    /// Call an exported function, returning its i32 result (0 if it returns nothing).
    fn call(&mut self, entry: &str, args: &[GuestValue]) -> Result<i32>;

    /// Whether the guest exports `name`
    fn has_export(&mut self, name: &str) -> bool;

    /// Value of an exported i32 global
    fn global_i32(&mut self, name: &str) -> Result<i32>;

    /// The guest's linear memory, sized as it currently is
    fn memory_mut(&mut self) -> Result<&mut [u8]>;

    fn context(&self) -> &HostContext;

    fn context_mut(&mut self) -> &mut HostContext;
}

/// A bytecode engine able to turn bundles into guest instances
pub trait Sandbox {
    type Instance: GuestInstance;

    /// Compile `bundle`, wire the host functions against `context` and
    /// instantiate it. Nothing is retained on failure.
    fn instantiate(&self, bundle: &[u8], context: HostContext) -> Result<Self::Instance>;
}
