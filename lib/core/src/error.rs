//! Error handling foundation for cadence.
//!
//! This module provides only the `Result` type alias using rootcause.
//! Each crate defines its own domain-specific error types in its own error
//! module; this alias wraps them in a `Report` so callers can attach context
//! as errors propagate out of the engine.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
