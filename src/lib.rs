pub mod config;
pub mod dump;
pub mod logging;
pub mod manager;
pub mod proxy;
pub mod session;

pub use config::{parse_settings, Cli, ConfigError, DumpMode, Endpoint, ProxyConfig, Settings};
pub use manager::ProxyManager;
pub use proxy::{Proxy, ProxyStats};
pub use session::{new_session_id, Session, SessionConfig, SessionInfo, Status};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the inner state if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
