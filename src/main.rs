use clap::Parser;
use tracing_subscriber::EnvFilter;

use avitolog::app::Cli;

const LOG_ENV: &str = "AVITOLOG_LOG";

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(err) = avitolog::run(cli) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
