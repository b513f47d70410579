pub mod config;
pub mod hunt;
pub mod rest;
pub mod runner;

pub use config::{derive_ws_base, ClientConfig, DEFAULT_API_BASE};
pub use hunt::{HuntRunError, HuntRunner};
pub use rest::{ApiError, HuntApi, JobApi, RestClient, SnapshotSource};
pub use runner::{run_watch, WatchCommand, WatchDriver, WatchEvent, WatchOptions};
