#![warn(missing_docs)]

//! p2pcommons metadata: module records, field and cross-module validation,
//! flat/nested normalisation, the binary storage codec and the local index.

pub mod codec;
pub mod cross;
pub mod error;
pub mod index;
pub mod kvstore;
pub mod normalize;
pub mod types;
pub mod url;
pub mod validate;

pub use error::{
    CodecError, EBusyError, InvalidKeyError, MetaError, MissingParam, TypeError, ValidationCode,
    ValidationError,
};
pub use index::{IndexField, JoinOptions, LocalIndex, SeedEntry};
pub use kvstore::{BatchOp, KvStore, MemoryKvStore, SledKvStore};
pub use types::{
    ContentFields, DiscoveryKey, FlatRecord, HyperKey, Link, Links, ModuleKind, ModuleRecord,
    ModuleType, ProfileFields, StorageEnvelope, VersionedKey,
};
