//! Yurt LXD client core
//!
//! Manages system containers served by an LXD daemon running inside the
//! yurt VM. The daemon is reached over a forwarded TCP port; long-running
//! work (image downloads, state changes) is tracked through the daemon's
//! background operations.
//!
//! # Example
//!
//! ```no_run
//! use yurt_lxd::{ClientHandle, Orchestrator};
//!
//! let api = ClientHandle::new(4242);
//! let orchestrator = Orchestrator::new(&api, api.port());
//!
//! orchestrator.launch("images", "alpine/3.12", "web")?;
//! for record in orchestrator.list()? {
//!     println!("{} {} {}", record.name, record.status, record.ip_address);
//! }
//! orchestrator.stop(&["web".to_string()], false)?;
//! # Ok::<(), yurt_lxd::Error>(())
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod images;
pub mod instance;
pub mod lxd;
pub mod network;
pub mod orchestrator;
pub mod retry;
pub mod vm;

pub use bootstrap::ResourceBootstrap;
pub use config::{ConfigStore, JsonConfigStore, Key, MemoryConfigStore, YurtConfig};
pub use error::{Error, Result};
pub use images::ImageRecord;
pub use instance::{Instance, InstanceRecord, Remote};
pub use lxd::{CancelToken, ClientHandle, DaemonApi, FollowerConfig, LxdClient};
pub use orchestrator::{Orchestrator, TerminalAttach};
pub use vm::{SshShell, VmShell};
