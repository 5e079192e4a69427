//! Deterministic simulation harness for trust core testing.
//!
//! In-memory implementations of the Environment, Transport, BackupTransport
//! and CryptoStore traits for deterministic, reproducible testing of several
//! devices talking to each other under injected faults.
//!
//! # Cluster
//!
//! [`TestCluster`] wires a [`Machine`](trustcore_core::Machine) per device to
//! one [`SimNetwork`] and one [`MemoryBackupServer`], and pumps queued
//! to-device payloads until the network is quiet.
//!
//! # Fault injection
//!
//! - [`SimNetwork`]: unreachable devices, transient send failures, silent loss
//! - [`ChaoticStore`]: failing writes, after a count or at random
//! - [`MemoryBackupServer`]: failing uploads, replaced backup versions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backup_server;
pub mod chaotic_store;
pub mod cluster;
pub mod sim_env;
pub mod sim_transport;

pub use backup_server::MemoryBackupServer;
pub use chaotic_store::ChaoticStore;
pub use cluster::{DeliveryReport, SimDevice, SimMachine, TestCluster};
pub use sim_env::SimEnv;
pub use sim_transport::{Envelope, RoomEvent, SimNetwork, SimTransport};
