//! rqd - render-host agent.
//!
//! Runs on every render node. It describes the host to the dispatcher,
//! books cores, threads and GPUs for frames, launches and supervises frame
//! processes, samples their memory and CPU use, and yields the host to an
//! interactive user (NIMBY).

pub mod agent;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod ledger;
pub mod machine;
pub mod nimby;
pub mod privileges;
pub mod process;
pub mod rss;
pub mod supervisor;
pub mod timer;
pub mod util;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
