// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The cluster status store: what the cluster resource manager reports about the cluster.

use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    fmt,
    str::FromStr,
};

use serde::Serialize;

use crate::parser::{CRM_DONE, CRM_START};

mod dc;
pub use dc::DcSelection;

/// A resource agent identifier, e.g. `ocf:heartbeat:IPaddr2` or `stonith:fence_ipmilan`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceAgent {
    pub class: String,
    pub provider: Option<String>,
    pub kind: String,
}

impl FromStr for ResourceAgent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let agent = match parts.as_slice() {
            [_, "", _] => return Err(format!("resource agent '{s}' has an empty provider")),
            [class, provider, kind] => ResourceAgent {
                class: class.to_string(),
                provider: Some(provider.to_string()),
                kind: kind.to_string(),
            },
            [class, kind] => ResourceAgent {
                class: class.to_string(),
                provider: None,
                kind: kind.to_string(),
            },
            _ => return Err(format!("malformed resource agent '{s}'")),
        };
        if agent.class.is_empty() || agent.kind.is_empty() {
            return Err(format!("malformed resource agent '{s}'"));
        }
        Ok(agent)
    }
}

impl fmt::Display for ResourceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{}:{}:{}", self.class, provider, self.kind),
            None => write!(f, "{}:{}", self.class, self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub name: String,
    pub parameters: BTreeMap<String, String>,
}

/// A configured resource, as reported in a CRM status frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceConfig {
    pub agent: ResourceAgent,
    pub parameters: BTreeMap<String, String>,
    pub operations: Vec<Operation>,
}

/// The operational state of a resource on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceState {
    Started,
    Stopped,
    Failed,
    Master,
    Slave,
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "started" => ResourceState::Started,
            "stopped" => ResourceState::Stopped,
            "failed" => ResourceState::Failed,
            "master" => ResourceState::Master,
            "slave" => ResourceState::Slave,
            other => return Err(format!("unknown resource state '{other}'")),
        })
    }
}

/// A CRM status frame that could not be parsed.
#[derive(Debug, PartialEq)]
pub struct ParseError {
    /// 1-based line number within the frame.
    pub line: usize,
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

impl Error for ParseError {}

/// Everything a single CRM status frame says. Built completely before any of it is applied to
/// the store.
#[derive(Debug, Default)]
struct CrmSnapshot {
    dc: Option<String>,
    nodes: BTreeMap<String, bool>,
    resources: BTreeMap<String, ResourceConfig>,
    resource_states: BTreeMap<String, BTreeMap<String, ResourceState>>,
}

impl CrmSnapshot {
    fn parse(frame: &str) -> Result<Self, ParseError> {
        let mut snapshot = CrmSnapshot::default();

        for (index, line) in frame.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line == CRM_START || line == CRM_DONE {
                continue;
            }
            snapshot
                .parse_line(line)
                .map_err(|reason| ParseError {
                    line: index + 1,
                    reason,
                })?;
        }

        Ok(snapshot)
    }

    fn parse_line(&mut self, line: &str) -> Result<(), String> {
        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or_default();
        let mut next = |what: &str| {
            words
                .next()
                .map(str::to_string)
                .ok_or_else(|| format!("'{keyword}' line is missing the {what}"))
        };

        match keyword {
            "dc" => {
                self.dc = Some(next("host name")?);
            }
            "node" => {
                let host = next("host name")?;
                let online = match next("state")?.as_str() {
                    "online" | "yes" => true,
                    "offline" | "no" => false,
                    other => return Err(format!("unknown node state '{other}'")),
                };
                self.nodes.insert(host, online);
            }
            "rsc" => {
                let id = next("resource id")?;
                let agent = next("agent")?.parse::<ResourceAgent>()?;
                self.resources.insert(
                    id,
                    ResourceConfig {
                        agent,
                        parameters: BTreeMap::new(),
                        operations: Vec::new(),
                    },
                );
            }
            "param" => {
                let id = next("resource id")?;
                let pair = next("parameter")?;
                let (key, value) = split_pair(&pair)?;
                self.resource_mut(&id)?
                    .parameters
                    .insert(key.to_string(), value.to_string());
            }
            "op" => {
                let id = next("resource id")?;
                let name = next("operation name")?;
                let mut parameters = BTreeMap::new();
                for pair in words {
                    let (key, value) = split_pair(pair)?;
                    parameters.insert(key.to_string(), value.to_string());
                }
                self.resource_mut(&id)?
                    .operations
                    .push(Operation { name, parameters });
            }
            "status" => {
                let id = next("resource id")?;
                let host = next("host name")?;
                let state = next("state")?.parse::<ResourceState>()?;
                self.resource_mut(&id)?;
                self.resource_states
                    .entry(id)
                    .or_default()
                    .insert(host, state);
            }
            other => return Err(format!("unrecognized line '{other}'")),
        }

        Ok(())
    }

    fn resource_mut(&mut self, id: &str) -> Result<&mut ResourceConfig, String> {
        self.resources
            .get_mut(id)
            .ok_or_else(|| format!("resource '{id}' was not declared"))
    }
}

fn split_pair(pair: &str) -> Result<(&str, &str), String> {
    pair.split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{pair}'"))
}

/// The authoritative view of what the cluster manager reports: which nodes are online, who the
/// DC is, and what resources are configured and where they run.
///
/// The store does no locking of its own. It lives behind the `Cluster`'s mutex, and every caller
/// holds that lock for one whole logical update, so that e.g. "apply a frame, then read this
/// host's online flag" is atomic.
#[derive(Debug, Default)]
pub struct ClusterStatus {
    online_nodes: HashMap<String, bool>,
    dc: Option<String>,
    resources: BTreeMap<String, ResourceConfig>,
    resource_states: BTreeMap<String, BTreeMap<String, ResourceState>>,

    /// The host the DC election picked last time, the starting point of its round-robin.
    last_detected_dc: Option<String>,
    /// The DC as confirmed by the election, `None` when the last pick was only provisional.
    dc_reported_by_crm: Option<String>,
}

impl ClusterStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a complete CRM status frame.
    ///
    /// Either the whole frame is applied or, on a parse error, nothing is. Returns whether
    /// anything visible changed: the DC, any resource, any resource state, or the online flag of
    /// any node the frame lists.
    pub fn parse_status(&mut self, frame: &str) -> Result<bool, ParseError> {
        let snapshot = CrmSnapshot::parse(frame)?;

        let mut changed = self.dc != snapshot.dc
            || self.resources != snapshot.resources
            || self.resource_states != snapshot.resource_states;

        for (host, online) in snapshot.nodes {
            if self.online_nodes.insert(host, online) != Some(online) {
                changed = true;
            }
        }
        self.dc = snapshot.dc;
        self.resources = snapshot.resources;
        self.resource_states = snapshot.resource_states;

        Ok(changed)
    }

    /// Returns whether the flag changed.
    pub fn set_online_node(&mut self, host: &str, online: bool) -> bool {
        self.online_nodes.insert(host.to_string(), online) != Some(online)
    }

    /// `None` when nothing is known about the host yet.
    pub fn is_online_node(&self, host: &str) -> Option<bool> {
        self.online_nodes.get(host).copied()
    }

    pub fn online_nodes(&self) -> &HashMap<String, bool> {
        &self.online_nodes
    }

    pub fn set_dc(&mut self, dc: Option<String>) {
        self.dc = dc;
    }

    /// The DC the cluster manager last reported. May be stale.
    pub fn dc(&self) -> Option<&str> {
        self.dc.as_deref()
    }

    pub fn resources(&self) -> &BTreeMap<String, ResourceConfig> {
        &self.resources
    }

    pub fn resource(&self, id: &str) -> Option<&ResourceConfig> {
        self.resources.get(id)
    }

    /// State of resource `id` on each host that reports it.
    pub fn resource_states(&self, id: &str) -> Option<&BTreeMap<String, ResourceState>> {
        self.resource_states.get(id)
    }

    /// Hosts where resource `id` is running in any role.
    pub fn running_on(&self, id: &str) -> Vec<&str> {
        self.resource_states
            .get(id)
            .map(|states| {
                states
                    .iter()
                    .filter(|(_, state)| {
                        matches!(
                            state,
                            ResourceState::Started | ResourceState::Master | ResourceState::Slave
                        )
                    })
                    .map(|(host, _)| host.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dc_reported_by_crm(&self) -> Option<&str> {
        self.dc_reported_by_crm.as_deref()
    }

    pub fn last_detected_dc(&self) -> Option<&str> {
        self.last_detected_dc.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &[&str]) -> String {
        format!("---start---\r\n{}\r\n---done---\r\n", body.join("\r\n"))
    }

    fn sample() -> String {
        frame(&[
            "dc alice",
            "node alice online",
            "node bob offline",
            "rsc vip ocf:heartbeat:IPaddr2",
            "param vip ip=10.0.0.10",
            "op vip monitor interval=10s timeout=20s",
            "rsc fence stonith:fence_ipmilan",
            "status vip alice started",
            "status vip bob stopped",
        ])
    }

    #[test]
    fn parse_full_frame() {
        let mut status = ClusterStatus::new();
        assert_eq!(status.parse_status(&sample()), Ok(true));

        assert_eq!(status.dc(), Some("alice"));
        assert_eq!(status.is_online_node("alice"), Some(true));
        assert_eq!(status.is_online_node("bob"), Some(false));
        assert_eq!(status.is_online_node("carol"), None);

        let vip = status.resource("vip").unwrap();
        assert_eq!(vip.agent.to_string(), "ocf:heartbeat:IPaddr2");
        assert_eq!(vip.parameters.get("ip").map(String::as_str), Some("10.0.0.10"));
        assert_eq!(vip.operations[0].name, "monitor");
        assert_eq!(
            vip.operations[0].parameters.get("timeout").map(String::as_str),
            Some("20s")
        );
        assert_eq!(status.resource("fence").unwrap().agent.provider, None);
        assert_eq!(status.running_on("vip"), vec!["alice"]);
    }

    #[test]
    fn unchanged_frame_reports_no_change() {
        let mut status = ClusterStatus::new();
        assert_eq!(status.parse_status(&sample()), Ok(true));
        assert_eq!(status.parse_status(&sample()), Ok(false));

        let moved = sample().replace("status vip bob stopped", "status vip bob started");
        assert_eq!(status.parse_status(&moved), Ok(true));
        assert_eq!(status.running_on("vip"), vec!["alice", "bob"]);
    }

    #[test]
    fn bad_frame_leaves_store_intact() {
        let mut status = ClusterStatus::new();
        status.parse_status(&sample()).unwrap();

        let bad = frame(&["dc bob", "rsc vip ocf:heartbeat:IPaddr2", "status ghost bob started"]);
        let err = status.parse_status(&bad).unwrap_err();
        assert_eq!(err.line, 4);

        let bad = frame(&["dc bob", "bogus line"]);
        assert!(status.parse_status(&bad).is_err());

        assert_eq!(status.dc(), Some("alice"));
        assert!(status.resource("vip").is_some());
    }

    #[test]
    fn frame_without_dc_clears_it() {
        let mut status = ClusterStatus::new();
        status.parse_status(&sample()).unwrap();
        assert_eq!(status.parse_status(&frame(&["node alice online"])), Ok(true));
        assert_eq!(status.dc(), None);
        assert!(status.resources().is_empty());
    }

    #[test]
    fn online_flags() {
        let mut status = ClusterStatus::new();
        assert!(status.set_online_node("alice", true));
        assert!(!status.set_online_node("alice", true));
        assert!(status.set_online_node("alice", false));
        assert_eq!(status.is_online_node("alice"), Some(false));

        status.set_dc(Some("alice".to_string()));
        assert_eq!(status.dc(), Some("alice"));
        status.set_dc(None);
        assert_eq!(status.dc(), None);
    }

    #[test]
    fn agent_strings() {
        assert!("ocf::IPaddr2".parse::<ResourceAgent>().is_err());
        assert!(":heartbeat:IPaddr2".parse::<ResourceAgent>().is_err());
        assert_eq!(
            "ocf:heartbeat:IPaddr2"
                .parse::<ResourceAgent>()
                .unwrap()
                .provider
                .as_deref(),
            Some("heartbeat")
        );
        assert!("IPaddr2".parse::<ResourceAgent>().is_err());
        assert_eq!(
            "systemd:httpd".parse::<ResourceAgent>().unwrap().to_string(),
            "systemd:httpd"
        );
    }
}
