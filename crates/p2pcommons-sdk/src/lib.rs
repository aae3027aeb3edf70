#![warn(missing_docs)]

//! p2pcommons SDK: the module engine over drives, a local index and a swarm.
//!
//! [`Engine`] is the entry point. It creates and updates modules, registers
//! content in profiles, follows profiles and resolves modules it does not
//! hold through a [`SwarmNetworker`].

pub mod cache;
pub mod cli;
pub mod config;
pub mod drive;
pub mod engine;
pub mod error;
pub mod events;
pub mod keys;
pub mod mutate;
pub mod resolve;
pub mod swarm;

pub use config::{EngineConfig, Settings};
pub use drive::{Drive, DriveStore, LogDrive, LogDriveStore};
pub use engine::{Engine, ModuleView};
pub use error::{DriveError, Result, SdkError, SwarmError};
pub use events::{EngineEvent, EventBus};
pub use keys::KeyPair;
pub use mutate::MergePolicy;
pub use swarm::{MemoryNetwork, MemorySwarm, SwarmNetworker};
pub use tokio_util::sync::CancellationToken;
