//! Data models for the chimedb connection layer.
//!
//! - `connection` - DatabaseSettings, TunnelSettings, PortSpec
//! - `value` - Backend, Value, Row

pub mod connection;
pub mod value;

pub use connection::{DatabaseSettings, PortSpec, TunnelSettings};
pub use value::{Backend, Row, Value};
