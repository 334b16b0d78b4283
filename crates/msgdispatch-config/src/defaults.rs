use camino::Utf8PathBuf;
use std::env;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

use crate::endpoint::ServiceEndpoint;

/// Default cap on concurrently running handlers.
pub const DEFAULT_MAX_CONCURRENCY: usize = 128;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default cap on concurrently running handlers.
pub fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

/// Default log filter expression used by the binaries.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Computes the default service socket: a per-user runtime directory when the
/// platform provides one, otherwise a uid-namespaced directory under the
/// system temporary directory.
pub fn default_service_endpoint() -> ServiceEndpoint {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("msgdispatch");
    if apply_namespace {
        base.push(user_namespace());
    }

    ServiceEndpoint::path(base.join("msgdispatch.sock"))
}

fn runtime_base_directory() -> Option<Utf8PathBuf> {
    #[cfg(unix)]
    {
        runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
    }

    #[cfg(not(unix))]
    {
        None
    }
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn user_namespace() -> String {
    "shared".to_owned()
}
