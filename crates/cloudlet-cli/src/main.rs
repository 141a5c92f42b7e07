mod cli;
mod cmd;
mod format;
mod progress;

use std::path::Path;

use clap::Parser;

use cloudlet_core::config::CloudletConfig;

use cli::Cli;
use progress::ProgressAwareStderr;

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(ProgressAwareStderr)
        .init();

    let config = match CloudletConfig::resolve(cli.config.as_deref().map(Path::new)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = cmd::dispatch(&cli.command, &config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
