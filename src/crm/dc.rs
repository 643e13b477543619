// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use log::debug;

use crate::host::Host;

use super::ClusterStatus;

/// The host cluster manager commands should be sent to.
#[derive(Debug, Clone)]
pub struct DcSelection {
    pub host: Arc<Host>,
    /// The host is the DC the cluster manager itself reported, and it looks healthy. When false
    /// the host is only a best-effort target and commands sent to it may well fail.
    pub confirmed: bool,
}

impl ClusterStatus {
    /// Pick the host to issue cluster manager commands against.
    ///
    /// The reported DC wins if it is healthy. Otherwise the hosts are scanned round-robin,
    /// starting after the one picked last time, for a connected host running a comm layer. If
    /// none qualifies the first host is returned anyway. Returns `None` only for an empty host
    /// list.
    pub fn select_dc(&mut self, hosts: &[Arc<Host>]) -> Option<DcSelection> {
        let first = hosts.first()?;

        let selection = match self.confirmed_dc(hosts) {
            Some(host) => {
                self.dc_reported_by_crm = Some(host.name().to_string());
                DcSelection {
                    host,
                    confirmed: true,
                }
            }
            None => {
                self.dc_reported_by_crm = None;
                let host = self.round_robin(hosts).unwrap_or_else(|| {
                    debug!("no usable DC candidate, defaulting to {first}");
                    Arc::clone(first)
                });
                DcSelection {
                    host,
                    confirmed: false,
                }
            }
        };

        self.last_detected_dc = Some(selection.host.name().to_string());
        Some(selection)
    }

    fn confirmed_dc(&self, hosts: &[Arc<Host>]) -> Option<Arc<Host>> {
        let dc = self.dc.as_deref()?;
        hosts
            .iter()
            .find(|host| {
                if host.name() != dc || !host.crm_status_ok() {
                    return false;
                }
                let comm = host.comm_layer();
                !comm.starting && !comm.stopping && comm.is_running()
            })
            .cloned()
    }

    fn round_robin(&self, hosts: &[Arc<Host>]) -> Option<Arc<Host>> {
        let start = self
            .last_detected_dc
            .as_deref()
            .and_then(|last| hosts.iter().position(|host| host.name() == last))
            .map_or(0, |index| index + 1);

        (0..hosts.len())
            .map(|offset| &hosts[(start + offset) % hosts.len()])
            .find(|host| host.is_connected() && host.comm_layer().is_running())
            .cloned()
    }
}
