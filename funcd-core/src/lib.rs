//! Core types shared across every funcd node role: the catalog models,
//! the error taxonomy, id generation, slot keys and the metrics registry.

pub mod error;
pub mod id;
pub mod metrics;
pub mod models;
pub mod slot_key;

pub use error::{Error, Result};
pub use slot_key::SlotKey;
