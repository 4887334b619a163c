//! Remote session and transfer engine: an interactive PTY shell with command
//! capture and telemetry, a serialized filesystem task queue backed by a
//! directory-tree cache, and a bounded pool of file transfers.

pub mod archive;
pub mod capture;
pub mod config;
pub mod error;
pub mod fs_queue;
pub mod identity;
pub mod logger;
pub mod model;
pub mod paths;
pub mod proxy;
pub mod remote;
pub mod shell;
pub mod ssh;
pub mod telemetry;
pub mod transfer;
pub mod tree;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::SessionError;
pub use fs_queue::{FsEvent, FsQueue, FsTask};
pub use model::SessionDescriptor;
pub use shell::{ShellEvent, ShellMode, ShellSession};
pub use transfer::{TransferEngine, TransferEvent, TransferRequest};
