//! SiteGate core library: domain types, block-state evaluation, site store, config, errors.
//!
//! - [`types`]: [`Domain`], [`SiteRecord`], [`SiteState`], [`SiteStatus`]
//! - [`evaluator`]: pure "is this domain blocked right now" logic
//! - [`store`]: atomic JSON key-value store under `~/.sitegate/`
//! - [`config`]: `config.yaml` loading
//! - [`error`]: [`StoreError`], [`DomainError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod evaluator;
pub mod store;
pub mod types;

pub use config::{GateConfig, LogFormat};
pub use error::{ConfigError, DomainError, StoreError};
pub use types::{Domain, SiteRecord, SiteState, SiteStatus, StoredSites};
