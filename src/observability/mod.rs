//! Observability for the bridge
//!
//! Structured logging only; the library emits tracing events and binaries
//! choose the subscriber.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{auth_span, mqtt_span};
