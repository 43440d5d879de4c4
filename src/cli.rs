use crate::config::Config;
use crate::provider::MajorityService;
use crate::{logger, server};
use clap::{Arg, ArgAction, Command};
use slog::info;
use std::net::SocketAddr;
use tokio::sync::watch;

pub const CONFIG: &str = "config";

pub fn app() -> Command {
    Command::new("harbor")
        .author("Sigma Prime <contact@sigmaprime.io>")
        .about(
            "Checkpoint-sync provider: serves majority-agreed finalized checkpoint bundles \
             sourced from a pool of trusted upstream beacon nodes.",
        )
        .arg(
            Arg::new(CONFIG)
                .long(CONFIG)
                .value_name("PATH_TO_CONFIG")
                .help("Path to configuration file")
                .action(ArgAction::Set),
        )
}

pub async fn run() -> Result<(), String> {
    let matches = app().get_matches();

    let config = match matches.get_one::<String>(CONFIG) {
        Some(path) => Config::load_from_file(path.to_string())?,
        None => Config::default(),
    };

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| format!("Invalid listen address {}: {}", config.listen_addr, e))?;

    let log = logger::build_logger(&config.log_level)?;

    let service = MajorityService::new(config.provider, log.clone())
        .map_err(|e| format!("Failed to start provider: {}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    service.start(shutdown_rx.clone());

    let server = tokio::spawn(server::serve(
        service,
        listen_addr,
        shutdown_rx,
        log.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for shutdown signal: {}", e))?;

    info!(log, "Shutting down");
    let _ = shutdown_tx.send(());
    let _ = server.await;

    Ok(())
}
