//! telepresence CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use telepresence::{config, report, session, ui, Cli, Error, Settings};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // User-facing status goes through ui; tracing is diagnostics on stderr.
    let filter = if cli.verbose {
        EnvFilter::new("telepresence=debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = match Settings::resolve(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            ui::print_error(&err.to_string());
            std::process::exit(1);
        }
    };
    let log_path = settings.logfile.clone();

    match session::run(settings).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let code = match err.downcast_ref::<Error>() {
                Some(domain) if !domain.is_unexpected() => {
                    ui::print_error(&domain.to_string());
                    domain.exit_code()
                }
                _ => {
                    eprintln!(
                        "{}",
                        report::render(&err, &config::tool_version(), log_path.as_deref())
                    );
                    1
                }
            };
            std::process::exit(code);
        }
    }
}
