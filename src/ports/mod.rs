//! Ports (traits) for the vault's collaborators
//!
//! These traits define the capabilities the vault core depends on. They
//! represent ports in hexagonal architecture - the core depends on these
//! abstractions, not on a particular device, filesystem or clock.

mod entropy_source;
mod hardware_root;
mod key_store;
mod lifecycle;
mod log_store;


pub use entropy_source::EntropySource;
pub use hardware_root::{HardwareRoot, SHUTDOWN_REGISTER};
pub use key_store::{KeyRecord, KeyStore};
pub use lifecycle::{AuditSink, ChainSigner, Clock, DestructiveAction, ShutdownHook, Terminator};
pub use log_store::LogStore;
