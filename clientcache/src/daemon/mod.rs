//! The cache daemon: lifecycle, refresh loops and the local query surface.

pub mod api;
mod config;
mod options;
mod server;
mod ticker;

pub use config::{
    DEFAULT_RANDOMIZATION_FACTOR, DEFAULT_RECHECK_SUPPORT_INTERVAL, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_SHUTDOWN_GRACE, DaemonConfig,
};
pub use options::Options;
pub use server::{CacheServer, DaemonState};
pub use ticker::{TickerConfig, jitter_bounds, jittered, run_ticker};
