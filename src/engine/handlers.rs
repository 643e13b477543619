// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The subsystem-specific halves of the host status channels. Each handler parses its command's
//! output and writes the result into the host and the cluster's stores, then says what changed.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use {
    chrono::Local,
    log::{debug, warn},
    tokio_util::sync::CancellationToken,
};

use crate::{
    channel::{Channel, ChannelHandle, Exit, StatusHandler, Subsystem},
    cluster::Cluster,
    host::{CommLayer, ConnectionState, Host},
    notify::{Change, Notifier},
    parser::{CrmFrame, CrmFrames, DrbdLines, DrbdMessage, InfoBlock, InfoBlocks},
    remote::{Executor, KILLED_BY_REQUEST, KILLED_SIGTERM},
};

/// What every handler needs: where to write, and whom to tell.
#[derive(Clone)]
pub struct Target {
    pub cluster: Arc<Cluster>,
    pub host: Arc<Host>,
    pub notifier: Arc<dyn Notifier>,
}

impl Target {
    fn host_changed(&self, changed: bool) {
        if changed {
            self.notifier.notify_changed(Change::Host {
                host: self.host.name().to_string(),
            });
        }
    }

    fn loaded(&self, subsystem: Subsystem) {
        self.notifier.notify_changed(Change::Loaded {
            host: self.host.name().to_string(),
            subsystem,
        });
    }
}

/// Start the channel for one subsystem of a host, with the handler that subsystem needs.
pub fn start_channel(
    target: Target,
    subsystem: Subsystem,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
) -> ChannelHandle {
    let host = Arc::clone(&target.host);
    let polling = target.cluster.context.polling.clone();
    match subsystem {
        Subsystem::Ping => Channel::start(
            host,
            subsystem,
            executor,
            polling.clone(),
            PingHandler::new(target, polling.ping_timeout()),
            cancel,
        ),
        Subsystem::ServerInfo => Channel::start(
            host,
            subsystem,
            executor,
            polling,
            ServerInfoHandler::new(target),
            cancel,
        ),
        Subsystem::CrmStatus => Channel::start(
            host,
            subsystem,
            executor,
            polling,
            CrmHandler::new(target),
            cancel,
        ),
        Subsystem::DrbdStatus => Channel::start(
            host,
            subsystem,
            executor,
            polling,
            DrbdHandler::new(target),
            cancel,
        ),
    }
}

pub struct PingHandler {
    target: Target,
    timeout: Duration,
}

impl PingHandler {
    pub fn new(target: Target, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    fn set_connection(&self, state: ConnectionState) {
        let changed = self.target.host.set_connection(state);
        if changed {
            self.target
                .cluster
                .context
                .status_line(&format!("{}: {state}", self.target.host));
        }
        self.target.host_changed(changed);
    }
}

impl StatusHandler for PingHandler {
    fn chunk(&mut self, _text: &str) -> bool {
        self.target.host.record_ping();
        self.set_connection(ConnectionState::Connected);
        true
    }

    fn done(&mut self, exit: Exit) {
        if exit.cancelled || exit.code == 0 {
            return;
        }
        if exit.connection_lost() {
            self.set_connection(ConnectionState::Disconnected);
        } else {
            self.set_connection(ConnectionState::Failed);
        }
    }

    fn loaded(&mut self) {
        self.target.loaded(Subsystem::Ping);
    }

    fn idle_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn idle(&mut self) {
        debug!("no ping from {} for {:?}", self.target.host, self.timeout);
        self.set_connection(ConnectionState::Disconnected);
    }
}

pub struct ServerInfoHandler {
    target: Target,
    blocks: InfoBlocks,
}

impl ServerInfoHandler {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            blocks: InfoBlocks::new(&["hw", "vm"]),
        }
    }

    fn apply_hw(&self, block: &InfoBlock) -> bool {
        let mut comm = CommLayer::default();
        let mut hardware = BTreeMap::new();

        for line in block.body.lines() {
            let Some((key, value)) = line.trim().split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            let layer = match key {
                "hb" => &mut comm.heartbeat,
                "cs" => &mut comm.corosync,
                "ais" => &mut comm.openais,
                _ => {
                    hardware.insert(key.to_string(), value.to_string());
                    continue;
                }
            };
            match value {
                "running" => *layer = true,
                "stopping" => {
                    *layer = true;
                    comm.stopping = true;
                }
                "starting" => comm.starting = true,
                "stopped" => {}
                other => debug!("unknown comm layer state '{other}' for {key}"),
            }
        }

        self.target.host.update_info(comm, hardware)
    }

    fn apply_vm(&self, block: &InfoBlock) -> bool {
        let vms = block
            .body
            .lines()
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                Some((words.next()?.to_string(), words.next()?.to_string()))
            })
            .collect();
        self.target.host.set_vms(vms)
    }
}

impl StatusHandler for ServerInfoHandler {
    fn restart(&mut self) {
        self.blocks.clear();
    }

    fn chunk(&mut self, text: &str) -> bool {
        let blocks = self.blocks.push(text);
        let mut changed = false;
        for block in blocks.iter() {
            changed |= match block.tag {
                "hw" => self.apply_hw(block),
                "vm" => self.apply_vm(block),
                _ => false,
            };
        }
        self.target.host_changed(changed);
        !blocks.is_empty()
    }

    fn done(&mut self, exit: Exit) {
        if !exit.cancelled && exit.connection_lost() {
            let changed = self.target.host.set_connection(ConnectionState::Disconnected);
            self.target.host_changed(changed);
        }
    }

    fn loaded(&mut self) {
        self.target.loaded(Subsystem::ServerInfo);
    }
}

pub struct CrmHandler {
    target: Target,
    frames: CrmFrames,
}

impl CrmHandler {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            frames: CrmFrames::new(),
        }
    }

    /// The cluster manager on this host is not usable.
    fn set_offline(&self) {
        let host = &self.target.host;
        let online_changed = self
            .target
            .cluster
            .lock_cluster_status()
            .set_online_node(host.name(), false);
        let flag_changed = host.set_crm_status(false);
        if flag_changed {
            self.target
                .cluster
                .context
                .status_line(&format!("{host}: cluster manager offline"));
        }
        self.target.host_changed(online_changed || flag_changed);
    }

    fn apply(&self, frame: &str) {
        let host = &self.target.host;
        let (result, online, dc) = {
            let mut status = self.target.cluster.lock_cluster_status();
            let result = status.parse_status(frame);
            (
                result,
                status.is_online_node(host.name()) == Some(true),
                status.dc().map(str::to_string),
            )
        };

        match result {
            Ok(changed) => {
                let flag_changed = host.set_crm_status(online);
                if changed {
                    self.target
                        .notifier
                        .notify_changed(Change::ClusterStatus { dc });
                }
                self.target.host_changed(flag_changed);
            }
            Err(e) => warn!("discarding cluster status from {host}: {e}"),
        }
    }
}

impl StatusHandler for CrmHandler {
    fn restart(&mut self) {
        self.frames.clear();
    }

    fn chunk(&mut self, text: &str) -> bool {
        match self.frames.push(text) {
            Some(CrmFrame::Error) => {
                debug!("cluster status command failed on {}", self.target.host);
                self.set_offline();
                true
            }
            Some(CrmFrame::Status(frame)) => {
                self.apply(&frame);
                true
            }
            None => false,
        }
    }

    fn done(&mut self, exit: Exit) {
        // Killed while stopping: the host's state is whatever it was.
        if exit.cancelled || exit.code == 0 {
            return;
        }
        self.set_offline();
    }

    fn loaded(&mut self) {
        self.target.loaded(Subsystem::CrmStatus);
    }
}

pub struct DrbdHandler {
    target: Target,
    lines: DrbdLines,
    /// A previous run has ended, so whatever it reported is about to be replayed.
    reconnecting: bool,
}

impl DrbdHandler {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            lines: DrbdLines::new(),
            reconnecting: false,
        }
    }

    /// Drop this host's transient DRBD state so the new run rebuilds it from scratch. Returns
    /// whether the store changed.
    fn forget_host(&self) -> bool {
        let host = &self.target.host;
        let _drbd = host.lock_drbd();
        let changed = self
            .target
            .cluster
            .lock_drbd_status()
            .forget_host(host.name());
        changed
    }

    /// Apply one config or event line. Locks the host's DRBD sub-state, then the store. Returns
    /// (store changed, host flag changed).
    fn apply(&self, message: &DrbdMessage) -> (bool, bool) {
        let host = &self.target.host;
        let mut drbd = host.lock_drbd();

        let result = {
            let mut store = self.target.cluster.lock_drbd_status();
            match message {
                DrbdMessage::Config(line) => store.apply_config(line),
                DrbdMessage::Event(line) => store.apply_event(host.name(), line),
                DrbdMessage::NoManager => Ok(false),
            }
        };

        match result {
            Ok(changed) => {
                let flag_changed = !drbd.status_ok;
                drbd.status_ok = true;
                if let DrbdMessage::Event(_) = message {
                    drbd.events += 1;
                    drbd.last_event = Some(Local::now());
                }
                (changed, flag_changed)
            }
            Err(e) => {
                debug!("ignoring DRBD line from {host}: {e}");
                (false, false)
            }
        }
    }
}

impl StatusHandler for DrbdHandler {
    fn restart(&mut self) {
        self.lines.clear();
        if self.reconnecting && self.forget_host() {
            self.target.notifier.notify_changed(Change::DrbdStatus);
        }
        self.reconnecting = true;
    }

    fn chunk(&mut self, text: &str) -> bool {
        let messages = self.lines.push(text);
        let (mut store_changed, mut host_changed) = (false, false);

        for message in messages.iter() {
            if let DrbdMessage::NoManager = message {
                host_changed |= self.target.host.set_drbd_status(false);
                continue;
            }
            let (store, flag) = self.apply(message);
            store_changed |= store;
            host_changed |= flag;
        }

        if store_changed {
            self.target.notifier.notify_changed(Change::DrbdStatus);
        }
        self.target.host_changed(host_changed);
        !messages.is_empty()
    }

    fn done(&mut self, exit: Exit) {
        // Unlike the other channels, the DRBD event helper's own "killed" exit codes count as an
        // intentional stop even when this side did not ask for it.
        if exit.cancelled || exit.code == KILLED_SIGTERM || exit.code == KILLED_BY_REQUEST {
            debug!(
                "DRBD status on {} stopped with {}",
                self.target.host, exit.code
            );
            return;
        }
        if exit.code == 0 {
            return;
        }
        let changed = self.target.host.set_drbd_status(false);
        self.target.host_changed(changed);
    }

    fn loaded(&mut self) {
        self.target.loaded(Subsystem::DrbdStatus);
    }
}
