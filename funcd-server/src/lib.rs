//! The funcd server: one binary, five roles. Everything here is wiring:
//! option parsing, role construction, the HTTP surfaces, and the
//! shutdown tree. The engine lives in the library crates.

pub mod api;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod node;
pub mod otel;
