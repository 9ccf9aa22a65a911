//! Error taxonomy for the context engine.
//!
//! Configuration problems are reported as values from
//! [`Engine::configure`](crate::Engine::configure). Failures that occur deep
//! inside a context switch, where no caller can receive a `Result`, go
//! through [`fatal`], which logs and aborts the process.

use std::any::Any;

use thiserror::Error;

/// Errors surfaced by the context engine.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Invalid or inconsistent configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The requested switching backend does not exist on this host.
    #[error("context backend '{backend}' is not available on {arch}-{os}")]
    UnsupportedBackend {
        backend: &'static str,
        arch: &'static str,
        os: &'static str,
    },

    /// Parallel execution was requested but cannot be provided.
    #[error("parallel execution requested with {requested} workers but {reason}")]
    NoThreadSupport { requested: usize, reason: String },

    /// A stack region could not be mapped.
    #[error("out of memory while allocating a {size}-byte context stack")]
    OutOfMemory { size: usize },

    /// An architecture-specific primitive was reached on a host it does not
    /// support.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// An OS call failed.
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ContextError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ContextError::Configuration(msg.into())
    }

    /// Capture `errno` after a failed libc call.
    pub(crate) fn last_os(call: &'static str) -> Self {
        ContextError::Os {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Log `err` and abort the process.
///
/// Used on paths that run on a logical thread's stack, where unwinding back
/// to a caller is impossible.
#[cold]
pub fn fatal(err: ContextError) -> ! {
    tracing::error!(%err, "fatal context engine error");
    eprintln!("scx_contexts: fatal: {err}");
    std::process::abort()
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
