//! Message bus capability consumed by the telemetry engine.
//!
//! The engine never speaks a wire protocol itself. It connects, subscribes,
//! unsubscribes, drains and closes through the traits in [`client`]. The
//! [`memory`] module provides an in-process broker implementing them, used by
//! the CLI's simulated feed and throughout the tests.

pub mod client;
pub mod error;
pub mod memory;

pub use client::{
    BusConnection, BusConnector, BusMessage, BusSubscription, ConnectOptions, MessageHandler,
};
pub use error::BusError;
pub use memory::MemoryBus;
