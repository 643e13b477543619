// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{io, sync::Arc};

use {
    log::{info, warn},
    tokio::sync::mpsc,
};

use crate::{
    cluster::Cluster,
    commands::{Handle, HandledResult},
    config::{Config, Polling, Ssh},
    engine::StatusEngine,
    notify::Change,
    remote::ssh::SshExecutor,
    LogStream,
};

pub mod http;

/// An object that is passed to the cluster, the engine and every channel, holding the settings
/// and output stream they share.
#[derive(Debug)]
pub struct WatchContext {
    pub out_stream: LogStream,
    pub verbose: bool,
    pub polling: Polling,
    pub ssh: Ssh,
}

impl WatchContext {
    pub fn new(config: &Config, verbose: bool) -> Self {
        WatchContext {
            out_stream: LogStream::new_stdout(),
            verbose,
            polling: config.polling.clone(),
            ssh: config.ssh.clone(),
        }
    }

    /// Write a status-change line, if running verbosely.
    pub fn status_line(&self, line: &str) {
        if !self.verbose {
            return;
        }
        if let Err(e) = self.out_stream.writeln(line) {
            warn!("could not write status line: {e}");
        }
    }
}

/// Get a unix socket listener from a given socket path.
///
/// To avoid clobbering an already-in-use unix socket, a connection is attempted to an existing
/// unix socket first. If this fails, a new socket listener can be returned, since an existing
/// in-use socket was determined to be absent at the given location.
async fn prepare_unix_socket(addr: &str) -> io::Result<tokio::net::UnixListener> {
    // Check for existing socket in use
    match tokio::net::UnixStream::connect(addr).await {
        Ok(_) => {
            eprintln!("Address already in use: {addr}");
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            eprintln!("Unexpected error while preparing unix socket '{addr}': {e}");
            return Err(e);
        }
    };
    match std::fs::remove_file(addr) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            eprintln!("error removing old socket: {e}");
            return Err(e);
        }
    };
    // Create new socket
    match tokio::net::UnixListener::bind(addr) {
        Ok(l) => Ok(l),
        Err(e) => {
            eprintln!("error binding to socket '{addr}': {e}");
            Err(e)
        }
    }
}

/// Render a change as the line printed for it. `None` for changes only shown in verbose mode.
pub fn describe_change(cluster: &Cluster, change: &Change) -> Option<String> {
    match change {
        Change::ClusterStatus { dc } => Some(format!(
            "cluster status changed, DC {}",
            dc.as_deref().unwrap_or("unknown")
        )),
        Change::DrbdStatus => Some("DRBD status changed".to_string()),
        Change::Host { host } => {
            let host = cluster.get_host(host)?;
            let online = cluster.lock_cluster_status().is_online_node(host.name());
            Some(format!(
                "{host}: {}, cluster manager {}, DRBD {}",
                host.connection(),
                match online {
                    Some(true) => "online",
                    Some(false) => "offline",
                    None => "unknown",
                },
                if host.drbd_status_ok() { "ok" } else { "not ok" },
            ))
        }
        Change::Loaded { .. } if !cluster.context.verbose => None,
        Change::Loaded { host, subsystem } => Some(format!("{host}: {subsystem} loaded")),
    }
}

/// Drain the change queue, printing a line for every change, until all senders are gone.
async fn report_changes(cluster: Arc<Cluster>, mut changes: mpsc::UnboundedReceiver<Change>) {
    while let Some(change) = changes.recv().await {
        let Some(line) = describe_change(&cluster, &change) else {
            continue;
        };
        if let Err(e) = cluster.context.out_stream.writeln(&line) {
            warn!("could not write status line: {e}");
        }
    }
}

/// The status watch daemon.
///
/// This runs three things at once:
///
/// - The status engine, with four channels per host polling the cluster.
///
/// - A consumer of the engine's change queue, printing what changed.
///
/// - Unless `socket` is `None`, a server answering status queries on that unix socket.
///
/// Ctrl-C stops every channel and waits for them to finish before returning.
pub fn main(cluster: Cluster, socket: Option<String>) -> HandledResult<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Could not launch watch runtime: {e}"))?;

    rt.block_on(async {
        let listener = match &socket {
            Some(addr) => {
                let listener = prepare_unix_socket(addr).await.handle_err(|_| {})?;
                info!("listening on socket '{addr}'");
                Some(listener)
            }
            None => None,
        };

        let cluster = Arc::new(cluster);
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(SshExecutor::new(cluster.context.ssh.clone()));
        let engine = StatusEngine::new(Arc::clone(&cluster), executor, Arc::new(changes_tx));
        engine.start_all();

        let server = async {
            match listener {
                Some(listener) => http::server_main(listener, Arc::clone(&cluster)).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = report_changes(Arc::clone(&cluster), changes_rx) => {},
            _ = server => {},
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("could not wait for Ctrl-C: {e}");
                }
            }
        }

        info!("stopping all channels");
        engine.stop_all().await;
        HandledResult::Ok(())
    })
}
