pub mod api;
pub mod config;
pub mod dispatcher;
pub mod init;
pub mod job;
pub mod ledger;
pub mod prompts;
pub mod store;
pub mod worker;

pub(crate) fn logv(tag: &str, message: &str) {
    eprintln!("[{}] {}", tag, message);
}

pub(crate) fn logi(message: impl AsRef<str>) {
    logv("INFO", message.as_ref());
}

pub(crate) fn logok(message: impl AsRef<str>) {
    logv("OK", message.as_ref());
}

pub(crate) fn logw(message: impl AsRef<str>) {
    logv("WARN", message.as_ref());
}

pub(crate) fn loge(message: impl AsRef<str>) {
    logv("ERROR", message.as_ref());
}

/// Installs the stderr `tracing` subscriber shared by both binaries.
///
/// `RUST_LOG` overrides the default `warn` filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
