//! Error handling for decode operations
//!
//! This module re-exports the error types used throughout the crate.
//! The error enum itself lives in `common` next to the types it guards;
//! it uses thiserror and covers every corruption class the format can
//! surface.

pub use crate::common::OozError;
pub use crate::common::Result;
