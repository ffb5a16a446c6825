/// Where the logging output should go.
#[derive(Clone, Copy)]
pub enum Output {
    Stdout,
    Stderr,
}

/// Initialize the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter directive.
pub fn init(default_directive: &str, output: Output) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    let base = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false);

    match output {
        Output::Stdout => base.init(),
        Output::Stderr => base.with_writer(std::io::stderr).init(),
    }

    std::panic::set_hook(Box::new(|info| {
        tracing::error!("panic: {info}");
    }));

    Ok(())
}

/// Like `init`, but does not panic when a subscriber is already installed.
/// For use in tests where many cases race to initialize.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
