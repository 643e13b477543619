// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Mutex, MutexGuard},
};

use {
    chrono::{DateTime, Local},
    serde::Serialize,
};

mod locks;
pub use locks::HostsDrbdGuard;

#[derive(Debug, Clone)]
struct HostAddress {
    name: String,
    port: u16,
}

/// Whether the transport to a host is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    /// The connectivity command ran but failed for a reason other than a lost connection.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ConnectionState::Connected => "connected",
                ConnectionState::Disconnected => "disconnected",
                ConnectionState::Failed => "failed",
            }
        )
    }
}

/// State of the cluster communication stack (Heartbeat, Corosync or OpenAIS) on a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommLayer {
    pub heartbeat: bool,
    pub corosync: bool,
    pub openais: bool,
    pub starting: bool,
    pub stopping: bool,
}

impl CommLayer {
    pub fn is_running(&self) -> bool {
        self.heartbeat || self.corosync || self.openais
    }
}

/// Per-host flags fed by the CRM status and server-info channels.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStatus {
    /// The last CRM status frame from this host parsed and reported it online.
    pub crm_status_ok: bool,
    /// The comm layer as the last `hw` block reported it.
    pub comm_layer: CommLayer,
    /// Set by callers while a start or stop they issued is in flight. Kept apart from
    /// `comm_layer` so that `hw` refreshes do not clear them.
    pub comm_starting: bool,
    pub comm_stopping: bool,
    /// Free-form `key:value` hardware facts from the `hw` info block.
    pub hardware: BTreeMap<String, String>,
    pub last_ping: Option<DateTime<Local>>,
    pub info_updated: Option<DateTime<Local>>,
}

/// Per-host DRBD sub-state. Guarded by its own lock; see `HostsDrbdGuard` for taking several at
/// once.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostDrbd {
    /// The DRBD status channel on this host delivers usable output.
    pub status_ok: bool,
    pub events: u64,
    pub last_event: Option<DateTime<Local>>,
}

/// Virtual machines reported by the host's `vm` info block, name to state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostVms {
    pub vms: BTreeMap<String, String>,
    pub updated: Option<DateTime<Local>>,
}

/// A machine in the cluster, and everything the polling channels have learned about it.
#[derive(Debug)]
pub struct Host {
    address: HostAddress,
    connection: Mutex<ConnectionState>,
    status: Mutex<HostStatus>,
    drbd: Mutex<HostDrbd>,
    vms: Mutex<HostVms>,
}

impl Host {
    pub fn new(name: &str, port: Option<u16>) -> Self {
        Host {
            address: HostAddress {
                name: name.to_string(),
                port: match port {
                    Some(p) => p,
                    None => crate::default_ssh_port(),
                },
            },
            connection: Mutex::new(ConnectionState::Disconnected),
            status: Mutex::new(HostStatus::default()),
            drbd: Mutex::new(HostDrbd::default()),
            vms: Mutex::new(HostVms::default()),
        }
    }

    /// Create a Host object from a given config::Host object.
    pub fn from_config(config: &crate::config::Host) -> Result<Self, crate::config::ConfigError> {
        let (name, port) = config.name_and_port()?;
        Ok(Host::new(name, port))
    }

    pub fn name(&self) -> &str {
        &self.address.name
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.name(), self.port())
    }

    pub fn connection(&self) -> ConnectionState {
        *self.connection.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.connection() == ConnectionState::Connected
    }

    /// Returns whether the state changed.
    pub fn set_connection(&self, state: ConnectionState) -> bool {
        let mut connection = self.connection.lock().unwrap();
        let changed = *connection != state;
        *connection = state;
        changed
    }

    pub fn status(&self) -> HostStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn crm_status_ok(&self) -> bool {
        self.status.lock().unwrap().crm_status_ok
    }

    /// Returns whether the flag changed.
    pub fn set_crm_status(&self, ok: bool) -> bool {
        let mut status = self.status.lock().unwrap();
        let changed = status.crm_status_ok != ok;
        status.crm_status_ok = ok;
        changed
    }

    /// The reported comm layer, with the caller-set starting/stopping flags folded in.
    pub fn comm_layer(&self) -> CommLayer {
        let status = self.status.lock().unwrap();
        let mut comm = status.comm_layer;
        comm.starting |= status.comm_starting;
        comm.stopping |= status.comm_stopping;
        comm
    }

    pub fn set_comm_layer(&self, comm_layer: CommLayer) -> bool {
        let mut status = self.status.lock().unwrap();
        let changed = status.comm_layer != comm_layer;
        status.comm_layer = comm_layer;
        changed
    }

    /// Mark the comm layer as being started, e.g. while a start command issued elsewhere is still
    /// running.
    pub fn set_comm_layer_starting(&self, starting: bool) {
        self.status.lock().unwrap().comm_starting = starting;
    }

    pub fn set_comm_layer_stopping(&self, stopping: bool) {
        self.status.lock().unwrap().comm_stopping = stopping;
    }

    pub fn record_ping(&self) {
        self.status.lock().unwrap().last_ping = Some(Local::now());
    }

    /// Replace the hardware facts and reported comm layer state from a freshly parsed `hw` block.
    /// Caller-set starting/stopping flags are left alone. Returns whether anything visible
    /// changed.
    pub fn update_info(&self, comm_layer: CommLayer, hardware: BTreeMap<String, String>) -> bool {
        let mut status = self.status.lock().unwrap();
        let changed = status.comm_layer != comm_layer || status.hardware != hardware;
        status.comm_layer = comm_layer;
        status.hardware = hardware;
        status.info_updated = Some(Local::now());
        changed
    }

    /// Lock this host's DRBD sub-state. When more than one host must be locked, use
    /// `Cluster::lock_hosts_drbd` so that the locks are taken in host order.
    pub fn lock_drbd(&self) -> MutexGuard<'_, HostDrbd> {
        self.drbd.lock().unwrap()
    }

    pub fn drbd_status_ok(&self) -> bool {
        self.lock_drbd().status_ok
    }

    pub fn set_drbd_status(&self, ok: bool) -> bool {
        let mut drbd = self.lock_drbd();
        let changed = drbd.status_ok != ok;
        drbd.status_ok = ok;
        changed
    }

    pub fn lock_vms(&self) -> MutexGuard<'_, HostVms> {
        self.vms.lock().unwrap()
    }

    /// Replace the VM table. Returns whether it differs from the previous one.
    pub fn set_vms(&self, vms: BTreeMap<String, String>) -> bool {
        let mut current = self.lock_vms();
        let changed = current.vms != vms;
        current.vms = vms;
        current.updated = Some(Local::now());
        changed
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
