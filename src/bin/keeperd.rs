//! Process entry point: loads configuration, recovers local state, joins the cluster, and serves
//! clients until asked to stop.
//!
//! Exit codes (`SPEC_FULL.md` §6.4): `0` clean shutdown, `1` fatal startup failure, `2`
//! operator-requested abort.

use std::env;
use std::sync::Arc;

use keeperd::pipeline::{self, SynthSessionIds};
use keeperd::raft_adapter::RaftAdapter;
use keeperd::server::{Server, ServerContext, ServerState};
use keeperd::Config;

fn main() {
    let config_path = match env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: keeperd <config.toml>");
            std::process::exit(1);
        }
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    let adapter = match RaftAdapter::open(&config) {
        Ok(adapter) => adapter,
        Err(e) => {
            tracing::error!(error = %e, "fatal error recovering local state");
            std::process::exit(1);
        }
    };

    let connection_directory = pipeline::new_connection_directory();
    let synth_session_ids = Arc::new(SynthSessionIds::new());

    let cluster = match keeperd::cluster::start(&config, adapter, connection_directory.clone()) {
        Ok(cluster) => cluster,
        Err(e) => {
            tracing::error!(error = %e, "fatal error starting cluster transport");
            std::process::exit(1);
        }
    };

    keeperd::forwarder::start_server(
        cluster.forwarder_incoming,
        cluster.write_sink.clone(),
        cluster.store.clone(),
    );

    keeperd::session_manager::start(
        &config,
        cluster.store.clone(),
        Arc::clone(&cluster.role),
        cluster.write_sink.clone(),
        cluster.forwarder.clone(),
        connection_directory.clone(),
    );

    let ctx = ServerContext::new(
        &config,
        cluster.store.clone(),
        cluster.write_sink.clone(),
        Arc::clone(&cluster.role),
        connection_directory,
        synth_session_ids,
    );

    let server = Server::new(config.server.endpoint.clone(), ctx);
    match server.start() {
        Some(ServerState::Started) => {
            tracing::info!(
                id = config.server.my_id,
                endpoint = %config.server.endpoint,
                "keeperd started"
            );
        }
        other => {
            tracing::error!(?other, "client server failed to start");
            std::process::exit(1);
        }
    }

    wait_for_shutdown_signal();

    tracing::info!("shutdown requested, stopping client server");
    match server.stop() {
        Some(ServerState::Stopped) => std::process::exit(0),
        _ => std::process::exit(2),
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Blocks until the process receives `SIGINT`/`SIGTERM`, so `main` can drive an orderly
/// `server.stop()` instead of the socket just vanishing under connected clients.
fn wait_for_shutdown_signal() {
    let (tx, rx) = crossbeam_channel::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        tracing::warn!(error = %e, "failed to install signal handler, waiting forever");
    }
    let _ = rx.recv();
}
