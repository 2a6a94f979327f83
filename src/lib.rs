use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod executor;
pub mod rbac;
pub mod sandbox;
pub mod service;
pub mod shutdown;
pub mod tls;

pub mod pb {
    tonic::include_proto!("jes");
}

pub use pb::scheduler_server::SchedulerServer;
pub use service::SchedulerService;

/// Initialize tracing with a compact formatter.
///
/// # Arguments
/// * `default_filter` - Default filter level (e.g., "info", "jes=debug")
/// * `use_stderr` - If true, log to stderr instead of stdout (useful for the
///   client, whose stdout carries job output)
///
/// # Panics
/// Panics if tracing has already been initialized
pub fn init_tracing(default_filter: &str, use_stderr: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if use_stderr {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact())
            .init();
    }
}
