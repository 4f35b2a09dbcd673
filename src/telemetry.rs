use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

/// Installs the global tracing subscriber, filtered by `LEASEMQ_LOG`.
///
/// Debug builds log human-readable output; release builds log JSON lines.
pub fn init() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("LEASEMQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
