//! Purpose: Define the public Rust API boundary for the prediction relay.
//! Exports: Adapter entry points, the `ScriptRunner` capability, and error types.
//! Role: Single public path to the core modules used by the binary and integration tests.
//! Invariants: Core modules stay private; this module only re-exports.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::adapter::{
    FailureCause, INVALID_RESPONSE_MESSAGE, Reply, handle, request_payload,
};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::runner::{
    Captured, DEFAULT_COMMAND, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_MS, ProcessRunner,
    ScriptRunner, validate_script_settings,
};
