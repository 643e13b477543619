// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    config::{Config, ConfigError},
    crm::{ClusterStatus, DcSelection},
    drbd::DrbdStatus,
    host::{Host, HostDrbd, HostsDrbdGuard},
    manager::WatchContext,
};

/// Cluster is the in-memory model of everything known about a cluster: its hosts, in the order
/// they were configured, and the two status stores the polling channels feed.
///
/// Each store sits behind one coarse lock. Hold it for a single logical update and never across
/// an await point. When a host's DRBD sub-state and the DRBD store must both be locked, the host
/// lock comes first.
#[derive(Debug)]
pub struct Cluster {
    name: String,
    hosts: Vec<Arc<Host>>,
    cluster_status: Mutex<ClusterStatus>,
    drbd_status: Mutex<DrbdStatus>,
    /// A reference to the shared context which contains the verbose output stream and the polling
    /// and ssh settings.
    pub context: Arc<WatchContext>,
}

/// A copy of the DRBD state of the whole cluster, taken under all the DRBD locks at once.
#[derive(Debug, Clone)]
pub struct DrbdSnapshot {
    pub hosts: Vec<(String, HostDrbd)>,
    pub status: DrbdStatus,
}

impl Cluster {
    pub fn from_config(config: &Config, context: Arc<WatchContext>) -> Result<Self, ConfigError> {
        config.validate()?;
        let hosts = config
            .hosts
            .iter()
            .map(|host| Host::from_config(host).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::with_hosts(&config.name, hosts, context))
    }

    pub fn with_hosts(name: &str, hosts: Vec<Arc<Host>>, context: Arc<WatchContext>) -> Self {
        Cluster {
            name: name.to_string(),
            hosts,
            cluster_status: Mutex::new(ClusterStatus::new()),
            drbd_status: Mutex::new(DrbdStatus::new()),
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn get_host(&self, name: &str) -> Option<&Arc<Host>> {
        self.hosts.iter().find(|host| host.name() == name)
    }

    pub fn lock_cluster_status(&self) -> MutexGuard<'_, ClusterStatus> {
        self.cluster_status.lock().unwrap()
    }

    pub fn lock_drbd_status(&self) -> MutexGuard<'_, DrbdStatus> {
        self.drbd_status.lock().unwrap()
    }

    /// Lock the DRBD sub-state of every host, in host order.
    pub fn lock_hosts_drbd(&self) -> HostsDrbdGuard<'_> {
        HostsDrbdGuard::lock(&self.hosts)
    }

    pub fn drbd_snapshot(&self) -> DrbdSnapshot {
        let hosts = self.lock_hosts_drbd();
        let status = self.lock_drbd_status();
        DrbdSnapshot {
            hosts: hosts
                .iter()
                .map(|(name, drbd)| (name.to_string(), drbd.clone()))
                .collect(),
            status: status.clone(),
        }
    }

    /// The host cluster manager commands should go to right now.
    pub fn dc_host(&self) -> Option<DcSelection> {
        self.lock_cluster_status().select_dc(&self.hosts)
    }

    /// One line per host plus the configured cluster name, for `validate`.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "cluster '{}' with {} hosts",
            self.name,
            self.hosts.len()
        )];
        lines.extend(self.hosts.iter().map(|host| format!("  {}", host.address())));
        lines
    }
}
