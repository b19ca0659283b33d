//! luabridge - host bindings for an embedded Lua runtime
//!
//! The crate wraps a native Lua 5.4 instance behind a stack-level API
//! ([`State`]), converts between stack slots and dynamically-typed host values
//! ([`Value`]), and lets scripts call host functions and read or write fields
//! of host objects through native callbacks.

pub mod config;
pub mod error;
pub mod logging;
mod marshal;
pub mod registry;
pub mod state;
pub mod trampoline;
pub mod value;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use registry::{Handle, Registry, SyncRegistry};
pub use state::{Kind, Lua, MULTRET, State, Status};
pub use value::{DynamicAccess, Function, HostObject, Invoke, Key, Map, Object, Value};
