pub mod backoff;

pub use backoff::RetryPolicy;

/// `{hostname}:{pid}:{timestamp}` tag identifying this worker on lease
/// keys.
pub(crate) fn worker_tag() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into());
    format!(
        "{host}:{}:{}",
        std::process::id(),
        chrono::Utc::now().timestamp()
    )
}
