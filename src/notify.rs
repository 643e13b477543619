// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Telling whoever displays the cluster that something visible changed.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::channel::Subsystem;

/// What changed. Consumers re-read the stores for the details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    /// The cluster status store changed: DC, resources, or resource states.
    ClusterStatus { dc: Option<String> },
    /// The DRBD status store changed.
    DrbdStatus,
    /// A per-host flag changed (connection, CRM or DRBD status ok, comm layer, VMs).
    Host { host: String },
    /// A channel delivered its first output (or finished) for the first time.
    Loaded { host: String, subsystem: Subsystem },
}

/// Receives change notifications. Called from the polling tasks, so implementations must return
/// quickly and never block.
pub trait Notifier: Send + Sync {
    fn notify_changed(&self, change: Change);
}

impl Notifier for mpsc::UnboundedSender<Change> {
    fn notify_changed(&self, change: Change) {
        // The consumer has gone away during shutdown.
        let _ = self.send(change);
    }
}
