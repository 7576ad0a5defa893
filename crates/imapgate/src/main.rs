/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use imapgate::{
    auth::AuthClient,
    config,
    core::GateSessionManager,
    listener::Server,
    master::{Master, TcpMaster},
    registry::Clients,
    ImapGate,
};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imapgate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/imapgate.toml".to_string());
    let config = config::read_config(PathBuf::from(&config_path))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gate = ImapGate::init(&config);
    let clients = Clients::new(
        config.limits.max_logging_users,
        Duration::from_secs(config.server.login_idle_timeout),
    );
    clients.clone().spawn_idle_sweep(shutdown_rx.clone());

    let auth = AuthClient::spawn(
        config.auth.socket.clone(),
        Duration::from_secs(config.auth.request_timeout),
        shutdown_rx.clone(),
    );
    let master: Arc<dyn Master> = Arc::new(TcpMaster::new(
        config
            .master
            .backend
            .parse()
            .context("Invalid master.backend address")?,
    ));

    let acceptor = config
        .tls
        .as_ref()
        .map(config::build_tls_acceptor)
        .transpose()?;

    let manager = GateSessionManager::new(gate, clients.clone(), auth, master);

    Server {
        id: "imap".to_string(),
        addr: config
            .server
            .listen
            .parse()
            .context("Invalid server.listen address")?,
        is_tls_implicit: false,
    }
    .spawn(acceptor.clone(), manager.clone(), shutdown_rx.clone())
    .await?;

    if let Some(listen_tls) = &config.server.listen_tls {
        anyhow::ensure!(
            acceptor.is_some(),
            "server.listen_tls requires tls.cert and tls.key"
        );
        Server {
            id: "imaps".to_string(),
            addr: listen_tls
                .parse()
                .context("Invalid server.listen_tls address")?,
            is_tls_implicit: true,
        }
        .spawn(acceptor, manager, shutdown_rx.clone())
        .await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down.");

    clients.shutdown_all();
    let _ = shutdown_tx.send(true);

    // Give sessions a moment to drain before the process exits.
    tokio::time::sleep(Duration::from_secs(1)).await;

    Ok(())
}
