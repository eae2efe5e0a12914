//! Adapters - concrete implementations of ports (traits)

mod emulated_root;
mod entropy;
mod file_key_store;
mod file_log_store;
mod hardware;
mod memory;
mod system;

#[cfg(test)]
pub mod fakes;

// Re-export for convenience
pub use emulated_root::{EmulatedRoot, REGISTER_COUNT};
pub use entropy::{EntropyPool, OsEntropy, ThreadRngEntropy};
pub use file_key_store::FileKeyStore;
pub use file_log_store::FileLogStore;
pub use hardware::{HardwareCapability, TimedHardware};
pub use memory::{MemoryKeyStore, MemoryLogStore};
pub use system::{KeyStoreShredder, ManualClock, ProcessExit, SystemClock};
