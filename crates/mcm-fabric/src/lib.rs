//! Fabric provider abstraction for the media-proxy data plane.
//!
//! Connections move frames through a provider-neutral seam: a [`Fabric`]
//! opens [`Device`]s keyed by PCI port, a device creates directional
//! [`Endpoint`]s, and an endpoint registers one memory region, posts work by
//! slot index, and yields completions in batches.
//!
//! # Architecture
//!
//! - [`config`]: endpoint configuration and the CQ polling constants.
//! - [`device`]: the `Fabric`/`Device` traits and the per-port
//!   [`DeviceRegistry`] that shares a live device between connections.
//! - [`endpoint`]: the `Endpoint` trait, region descriptor, and CQ entry.
//! - [`udp`]: a UDP-backed software provider for hosts without RDMA
//!   hardware.
//! - [`testing`]: a scriptable in-memory provider for tests.

pub mod config;
pub mod device;
pub mod endpoint;
pub mod testing;
pub mod udp;

pub use config::{Direction, EndpointConfig, CQ_BATCH_SIZE, DEFAULT_POLL_TIMEOUT, PAGE_SIZE};
pub use device::{Device, DeviceRegistry, Fabric};
pub use endpoint::{CqEntry, Endpoint, RegionDesc};
pub use udp::UdpFabric;
