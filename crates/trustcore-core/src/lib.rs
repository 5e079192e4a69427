//! Trustcore
//!
//! End-to-end encryption trust core for a federated messaging client:
//! per-room group sessions, interactive device verification, and encrypted
//! key backup with recovery.
//!
//! # Architecture
//!
//! Components are leaf-first. Each owns its state and serializes mutation
//! per scope (room, verification transaction, peer device); scopes proceed
//! in parallel and no scope lock is held across a network round-trip.
//!
//! ```text
//! GroupSessionManager ──► DirectSessionCodec ◄── VerificationEngine
//!        ▲    │                                        │
//!        │    └──── trust gates sharing ◄── DeviceKeyStore ◄─┘ (verified)
//!        │
//! KeyBackupManager (backs up inbound sessions, restores them)
//! ```
//!
//! # Components
//!
//! - [`DeviceKeyStore`]: own identity keys, one-time keys, peer devices and
//!   their trust
//! - [`DirectSessionCodec`]: pairwise channels with sender and recipient
//!   binding
//! - [`GroupSessionManager`]: outbound session rotation and sharing, inbound
//!   sessions, key requests
//! - [`VerificationEngine`]: SAS and QR verification
//! - [`KeyBackupManager`]: recovery keys, passphrase keys, backup upload and
//!   restore
//! - [`Machine`]: all of the above for one device, with to-device routing
//!
//! # Collaborators
//!
//! The crate performs no I/O of its own. Storage goes through
//! [`CryptoStore`], network delivery through [`Transport`] and
//! [`BackupTransport`], primitives through [`CryptoPrimitives`], and time and
//! randomness through [`Environment`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backup;
pub mod codec;
pub mod config;
pub mod devices;
pub mod direct;
pub mod env;
mod error;
pub mod group;
pub mod ids;
mod machine;
pub mod messages;
pub mod ratchet;
mod scope;
pub mod store;
mod system_env;
mod transcript;
pub mod transport;
pub mod verification;

pub use backup::{BackupError, BackupState, KeyBackupManager, RecoveryKey};
pub use config::MachineConfig;
pub use devices::{DeviceIdentity, DeviceKeyStore, LocalAccount, TrustState};
pub use direct::DirectSessionCodec;
pub use env::Environment;
pub use error::MachineError;
pub use group::GroupSessionManager;
pub use ids::{DeviceAddress, DeviceId, RoomId, UserId};
pub use machine::Machine;
pub use store::{CryptoStore, MemoryStore};
pub use system_env::SystemEnv;
pub use transport::{BackupTransport, Transport, TransportError};
pub use trustcore_crypto::{CryptoPrimitives, RustCryptoPrimitives};
pub use verification::{VerificationEngine, VerificationError};
