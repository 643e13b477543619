// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The DRBD status store and the parser for the lines of the DRBD status stream.
//!
//! Two kinds of line feed the store. `drbd` lines describe configuration: which device and which
//! backing disk a resource volume uses on each host. `event` lines are state transitions as seen
//! by the host the stream comes from: resource roles, disk states, connection states and
//! replication progress towards each peer.

use std::{collections::BTreeMap, error::Error, fmt};

use serde::Serialize;

#[derive(Debug, PartialEq)]
pub struct ParseError {
    pub line: String,
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: '{}'", self.reason, self.line)
    }
}

impl Error for ParseError {}

/// Replication state of one volume towards one peer, as seen from one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerDevice {
    pub replication: Option<String>,
    pub peer_disk: Option<String>,
    /// Resync progress in percent.
    pub done: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrbdVolume {
    pub device: Option<String>,
    /// Backing disk path on each host.
    pub disks: BTreeMap<String, String>,
    /// Local disk state reported by each host.
    pub disk_states: BTreeMap<String, String>,
    /// Reporting host, then peer.
    pub peers: BTreeMap<String, BTreeMap<String, PeerDevice>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrbdResource {
    /// Role of the resource on each host, e.g. `Primary` or `Secondary`.
    pub roles: BTreeMap<String, String>,
    /// Reporting host, then peer, to connection state.
    pub connections: BTreeMap<String, BTreeMap<String, String>>,
    pub volumes: BTreeMap<u32, DrbdVolume>,
}

impl DrbdResource {
    fn forget_host(&mut self, host: &str) -> bool {
        let mut changed = self.roles.remove(host).is_some();
        changed |= self.connections.remove(host).is_some();
        for volume in self.volumes.values_mut() {
            changed |= volume.disk_states.remove(host).is_some();
            changed |= volume.peers.remove(host).is_some();
        }
        changed
    }
}

/// What the DRBD status streams of all hosts report. Like `ClusterStatus`, it does no locking of
/// its own; it lives behind the `Cluster`'s DRBD store lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrbdStatus {
    resources: BTreeMap<String, DrbdResource>,
}

/// The `key:value` words of a line.
fn fields<'a>(words: impl Iterator<Item = &'a str>) -> BTreeMap<&'a str, &'a str> {
    words.filter_map(|word| word.split_once(':')).collect()
}

/// Set `slot` to `value`, returning whether it changed.
fn update<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

impl DrbdStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resources(&self) -> &BTreeMap<String, DrbdResource> {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&DrbdResource> {
        self.resources.get(name)
    }

    /// Drop everything `host` reported about roles, connections, disk states and peer devices,
    /// before its stream is replayed from scratch. Device and disk mappings stay. Returns whether
    /// anything was removed.
    pub fn forget_host(&mut self, host: &str) -> bool {
        let mut changed = false;
        for resource in self.resources.values_mut() {
            changed |= resource.forget_host(host);
        }
        changed
    }

    pub fn device(&self, resource: &str, volume: u32) -> Option<&str> {
        self.resources
            .get(resource)?
            .volumes
            .get(&volume)?
            .device
            .as_deref()
    }

    pub fn disk(&self, resource: &str, volume: u32, host: &str) -> Option<&str> {
        self.resources
            .get(resource)?
            .volumes
            .get(&volume)?
            .disks
            .get(host)
            .map(String::as_str)
    }

    pub fn role(&self, resource: &str, host: &str) -> Option<&str> {
        self.resources
            .get(resource)?
            .roles
            .get(host)
            .map(String::as_str)
    }

    /// Apply the `<resource> <volume> device:<path> [host:<host> disk:<path>]` part of a `drbd`
    /// line. Mappings are only ever added or overwritten. Returns whether anything changed.
    pub fn apply_config(&mut self, line: &str) -> Result<bool, ParseError> {
        let error = |reason: &str| ParseError {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let mut words = line.split_whitespace();
        let name = words.next().ok_or_else(|| error("missing resource name"))?;
        let volume = words
            .next()
            .ok_or_else(|| error("missing volume"))?
            .parse::<u32>()
            .map_err(|_| error("volume is not a number"))?;
        let fields = fields(words);
        let device = fields
            .get("device")
            .ok_or_else(|| error("missing device"))?;
        let disk = match (fields.get("host"), fields.get("disk")) {
            (Some(host), Some(disk)) => Some((*host, *disk)),
            (None, None) => None,
            _ => return Err(error("host and disk must be given together")),
        };

        let volume = self
            .resources
            .entry(name.to_string())
            .or_default()
            .volumes
            .entry(volume)
            .or_default();
        let mut changed = update(&mut volume.device, Some(device.to_string()));
        if let Some((host, disk)) = disk {
            changed |= volume.disks.insert(host.to_string(), disk.to_string()).as_deref() != Some(disk);
        }
        Ok(changed)
    }

    /// Apply the `<type> <object> name:<resource> key:value...` part of an `event` line reported
    /// by `host`. Returns whether anything changed.
    pub fn apply_event(&mut self, host: &str, line: &str) -> Result<bool, ParseError> {
        let error = |reason: &str| ParseError {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let mut words = line.split_whitespace();
        let kind = words.next().ok_or_else(|| error("missing event type"))?;
        if !matches!(kind, "exists" | "create" | "change" | "destroy") {
            return Err(error("unknown event type"));
        }
        let object = words.next().ok_or_else(|| error("missing object"))?;
        if object == "-" {
            // End of the initial state dump.
            return Ok(false);
        }
        let fields = fields(words);
        let name = *fields
            .get("name")
            .ok_or_else(|| error("missing resource name"))?;
        let volume = match fields.get("volume") {
            Some(v) => Some(v.parse::<u32>().map_err(|_| error("volume is not a number"))?),
            None => None,
        };
        let peer = fields.get("conn-name").copied();

        if kind == "destroy" {
            return Ok(self.destroy(host, object, name, volume, peer));
        }

        let resource = self.resources.entry(name.to_string()).or_default();
        let changed = match object {
            "resource" => match fields.get("role") {
                Some(role) => {
                    resource.roles.insert(host.to_string(), role.to_string()).as_deref() != Some(*role)
                }
                None => false,
            },
            "device" => {
                let volume = volume.ok_or_else(|| error("device event without volume"))?;
                let volume = resource.volumes.entry(volume).or_default();
                match fields.get("disk") {
                    Some(disk) => {
                        volume.disk_states.insert(host.to_string(), disk.to_string()).as_deref()
                            != Some(*disk)
                    }
                    None => false,
                }
            }
            "connection" => {
                let peer = peer.ok_or_else(|| error("connection event without conn-name"))?;
                match fields.get("connection") {
                    Some(state) => {
                        resource
                            .connections
                            .entry(host.to_string())
                            .or_default()
                            .insert(peer.to_string(), state.to_string())
                            .as_deref()
                            != Some(*state)
                    }
                    None => false,
                }
            }
            "peer-device" => {
                let volume = volume.ok_or_else(|| error("peer-device event without volume"))?;
                let peer = peer.ok_or_else(|| error("peer-device event without conn-name"))?;
                let done = match fields.get("done") {
                    Some(done) => Some(done.parse::<f32>().map_err(|_| error("bad done percentage"))?),
                    None => None,
                };
                let device = resource
                    .volumes
                    .entry(volume)
                    .or_default()
                    .peers
                    .entry(host.to_string())
                    .or_default()
                    .entry(peer.to_string())
                    .or_default();
                let mut changed = false;
                if let Some(replication) = fields.get("replication") {
                    changed |= update(&mut device.replication, Some(replication.to_string()));
                }
                if let Some(peer_disk) = fields.get("peer-disk") {
                    changed |= update(&mut device.peer_disk, Some(peer_disk.to_string()));
                }
                if done.is_some() {
                    changed |= update(&mut device.done, done);
                }
                changed
            }
            _ => return Err(error("unknown event object")),
        };
        Ok(changed)
    }

    /// Forget the transient state a `destroy` event names. Device and disk mappings stay.
    fn destroy(
        &mut self,
        host: &str,
        object: &str,
        name: &str,
        volume: Option<u32>,
        peer: Option<&str>,
    ) -> bool {
        let Some(resource) = self.resources.get_mut(name) else {
            return false;
        };
        match (object, volume, peer) {
            ("resource", _, _) => resource.forget_host(host),
            ("device", Some(volume), _) => resource
                .volumes
                .get_mut(&volume)
                .map(|v| {
                    let disk = v.disk_states.remove(host).is_some();
                    v.peers.remove(host).is_some() || disk
                })
                .unwrap_or(false),
            ("connection", _, Some(peer)) => {
                let mut changed = resource
                    .connections
                    .get_mut(host)
                    .is_some_and(|peers| peers.remove(peer).is_some());
                for v in resource.volumes.values_mut() {
                    if let Some(peers) = v.peers.get_mut(host) {
                        changed |= peers.remove(peer).is_some();
                    }
                }
                changed
            }
            ("peer-device", Some(volume), Some(peer)) => resource
                .volumes
                .get_mut(&volume)
                .and_then(|v| v.peers.get_mut(host))
                .is_some_and(|peers| peers.remove(peer).is_some()),
            _ => false,
        }
    }
}
