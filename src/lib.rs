//! Acquires, decodes, and distributes telemetry from a Daly D2-Modbus
//! Battery Management System over Bluetooth Low Energy.
//!
//! The pipeline: [`transport`] owns the BLE link, [`codec`] encodes
//! requests and decodes D2-Modbus responses, [`scheduler`] drives one
//! acquisition per poll interval, [`alerts`] derives threshold-based
//! events from each reading, and [`sinks`] fans both out to a durable
//! store, a cache, a pub/sub bus, and the [`hub`]'s live WebSocket
//! subscribers. [`query`] and [`api`] expose the read side over HTTP.

pub mod alerts;
pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod hub;
pub mod model;
pub mod query;
pub mod scheduler;
pub mod sinks;
pub mod transport;
