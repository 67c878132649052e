//! Process lifecycle: coordinated shutdown signalling.

pub mod shutdown;

pub use shutdown::Shutdown;
