// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Taking the DRBD lock of several hosts at once.
//!
//! Locks are always acquired in cluster host order and released in the reverse order, so two
//! callers locking overlapping sets of hosts can never deadlock against each other.

use std::sync::{Arc, MutexGuard};

use super::{Host, HostDrbd};

pub struct HostsDrbdGuard<'a> {
    names: Vec<&'a str>,
    guards: Vec<MutexGuard<'a, HostDrbd>>,
}

impl<'a> HostsDrbdGuard<'a> {
    pub(crate) fn lock(hosts: &'a [Arc<Host>]) -> Self {
        let mut names = Vec::with_capacity(hosts.len());
        let mut guards = Vec::with_capacity(hosts.len());
        for host in hosts.iter() {
            names.push(host.name());
            guards.push(host.lock_drbd());
        }
        Self { names, guards }
    }

    /// The locked state of each host, in host order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostDrbd)> {
        self.names
            .iter()
            .copied()
            .zip(self.guards.iter().map(|guard| &**guard))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut HostDrbd> {
        let index = self.names.iter().position(|n| *n == name)?;
        Some(&mut *self.guards[index])
    }
}

impl Drop for HostsDrbdGuard<'_> {
    fn drop(&mut self) {
        // A Vec drops its elements front to back; unlock back to front instead.
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_all_in_order() {
        let hosts: Vec<Arc<Host>> = ["a", "b", "c"]
            .iter()
            .map(|name| Arc::new(Host::new(name, Some(22))))
            .collect();

        {
            let mut guard = HostsDrbdGuard::lock(&hosts);
            guard.get_mut("b").unwrap().status_ok = true;
            let names: Vec<&str> = guard.iter().map(|(name, _)| name).collect();
            assert_eq!(names, vec!["a", "b", "c"]);
            assert!(guard.get_mut("d").is_none());
        }

        // Every lock was released:
        assert!(hosts[1].drbd_status_ok());
        assert!(!hosts[0].drbd_status_ok());
    }
}
