//! Neo BACnet - asynchronous BACnet/IP client
//!
//! This crate provides:
//! - Confirmed request correlation with per-destination invoke-ids, timeouts and retries
//! - Broadcast discovery (Who-Is / I-Am) collected into bounded-time result sets
//! - A concurrently updated directory of remote devices, objects and cached property values
//! - COV and event notification listeners
//! - A pluggable codec and transport boundary, with BACnet/IP and in-memory transports

// Caller-facing facade
pub mod client;

// Configuration (figment: defaults, TOML, environment)
pub mod config;

// Error types
pub mod error;

// Service futures and timeout policies
pub mod future;
pub mod policy;

// Dispatch core
pub mod collector;
pub mod dispatcher;
mod pending;

// Remote directory and notification listeners
pub mod directory;
pub mod listener;

// Local device object
pub mod local_device;

// Wire boundary
pub mod codec;
pub mod transport;

// Shared data types
pub mod types;

pub use client::Client;
pub use config::{ClientConfig, DeviceConfig};
pub use directory::{Directory, RemoteDeviceEntry, RemoteObjectEntry};
pub use dispatcher::Dispatcher;
pub use error::{ServiceError, ServiceResult};
pub use future::{FutureState, ServiceFuture};
pub use listener::{NotificationFilter, SubscriptionId};
pub use policy::{Backoff, TimeoutPolicy};
pub use types::{
    DeviceAddress, DeviceAnnouncement, Destination, Notification, ObjectId, ObjectType, PropertyId,
    PropertyValue,
};
