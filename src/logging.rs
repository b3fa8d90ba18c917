use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "labeling_line=debug"
    } else {
        "labeling_line=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init(false);
        init(true);
        tracing::info!("logging initialised twice");
    }
}
