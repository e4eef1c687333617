use std::sync::Arc;

use flamecast::{config::Config, server, ArgParse};

use arg::{Args, ParseError, ParseKind};
use tracing::warn;

fn parse_args() -> ArgParse {
    let args = Vec::from_iter(std::env::args());
    let mut args: Vec<&str> = args.iter().map(AsRef::as_ref).collect::<Vec<_>>();
    args.remove(0);
    match ArgParse::from_args(args) {
        Ok(v) => v,
        Err(e) => {
            if let ParseKind::Top(ParseError::HelpRequested(help)) = e {
                eprintln!("{}", help);
                std::process::exit(1);
            }
            eprintln!("Error parsing cmd line args: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(config: &Config) {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file);

    match file {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_max_level(config.log_level)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_max_level(config.log_level)
                .init();
            warn!(
                "cannot open log file {}: {}, logging to stderr",
                config.log_file, e
            );
        }
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    let config_file = match args.config_file {
        Some(v) => v,
        None => {
            eprintln!("Usage: flamecast -c <config-file>");
            std::process::exit(1);
        }
    };

    let config = match Config::load(&config_file) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Error loading configuration from {}: {}", config_file, e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    server::run(config).await;
}
