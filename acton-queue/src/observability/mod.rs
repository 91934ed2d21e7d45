//! Logging setup.
//!
//! The library only emits `tracing` events. Binaries call [`init`] once to
//! install a subscriber.

use crate::config::{LogFormat, ObservabilitySettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured filter.
///
/// # Errors
///
/// Returns an error if the configured filter does not parse or a global
/// subscriber is already installed.
///
/// # Example
///
/// ```rust,no_run
/// use acton_queue::{config::ObservabilitySettings, observability};
///
/// # fn main() -> anyhow::Result<()> {
/// observability::init(&ObservabilitySettings::default())?;
/// tracing::info!("Queue worker started");
/// # Ok(())
/// # }
/// ```
pub fn init(settings: &ObservabilitySettings) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.filter)?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match settings.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()?,
        LogFormat::Compact => registry.with(tracing_subscriber::fmt::layer().compact()).try_init()?,
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
    }

    Ok(())
}
