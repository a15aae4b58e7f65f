use anyhow::Context;
use spamsweep::app::App;
use spamsweep::cli::Cli;
use spamsweep::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::from_args();

    // Handle schema generation early exit
    if App::maybe_print_schema(&cli)? {
        return Ok(());
    }

    // Configuration errors halt before any file is touched
    let config = App::load_config(&cli).context("invalid configuration")?;

    // Keep the guard alive so the file writer flushes on exit
    let guard = setup_logging(&cli, &config);

    let code = App::run(&cli, &config).await?;
    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Set up tracing with stderr output and a daily log file in the logs directory.
fn setup_logging(
    cli: &Cli,
    config: &Config,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_color);

    let log_dir = &config.directories.logs;
    if std::fs::create_dir_all(log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::daily(log_dir, "spamsweep.log");
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        None
    }
}
