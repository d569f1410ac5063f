use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

pub(crate) fn style_root() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Spinner for a single running task.
pub(crate) fn style_task() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::default_spinner().template("  {spinner:.blue} {msg} [{elapsed}]")
}

/// Installs a `tracing` subscriber that prints log lines above the progress
/// bars. The filter is read from `RUST_LOG` and defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}
