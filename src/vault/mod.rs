//! Vault core: key lifecycle, audit log, failsafe and their coordinator

mod background;
mod coordinator;
mod failsafe;
mod key_manager;
mod shutdown;
mod tamper_log;

pub use background::BackgroundTasks;
pub use coordinator::{Collaborators, VaultCoordinator, VaultStatus};
pub use failsafe::{FailsafeMonitor, FailsafeState, HeartbeatState};
pub use key_manager::KeyLifecycleManager;
pub use shutdown::{shutdown_measurement, ShutdownSequence, EMERGENCY_EXIT_CODE};
pub use tamper_log::{verify_chain, verify_chain_from, TamperEvidentLog};
