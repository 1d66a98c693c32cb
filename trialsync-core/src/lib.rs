//! trialsync core library: domain types, configuration, errors.
//!
//! - [`types`]: identifiers, trial keys, feed records
//! - [`config`]: [`SyncConfig`] load / save
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{RelocateConfig, SyncConfig};
pub use error::ConfigError;
pub use types::{
    ConcurrencyToken, NctId, RegistryId, TrialKey, TrialStatus, TrialStatusRecord,
};
