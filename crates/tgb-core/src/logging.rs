use crate::Result;

/// Initialize logging/tracing for a `tgb` process.
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,tgb=info,tgb_core=info,tgb_gateway=info,{service_name}=info"
        ))
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}
