//! Common types and abstractions
//!
//! This module defines the core types used throughout the crate:
//! - Address: relay endpoint representation
//! - Error: unified error types

mod address;

pub use address::Address;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
