//! ynotv EPG engine
//!
//! Guide data acquisition for the ynotv IPTV player: XMLTV parsing, a
//! persistent schedule cache, multi-source fetching and background prefetch
//! with progress reporting.

pub mod config;
pub mod epg;
pub mod store;

pub use config::EpgConfig;
pub use epg::{Channel, EpgError, EpgService, ProgressSnapshot, ScheduleEntry};
pub use store::{KeyValueStore, MemoryStore, SqliteStore, StoreError};

/// Initialize logging for EPG operations
///
/// When debug_logging is false, HTTP client internals are suppressed
pub fn init_logging(debug_logging: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if debug_logging {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info,reqwest=warn,hyper=warn")
    };

    let subscriber = fmt()
        .with_target(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(filter)
        .finish();

    // Already installed by the host process
    let _ = tracing::subscriber::set_global_default(subscriber);
}
