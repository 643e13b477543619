// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The status aggregation engine: owns every host status channel of one cluster.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {futures::future, log::debug, tokio_util::sync::CancellationToken};

use crate::{
    channel::{ChannelHandle, Subsystem},
    cluster::Cluster,
    crm::DcSelection,
    notify::Notifier,
    remote::Executor,
};

pub mod handlers;

use handlers::Target;

/// Starts and stops the status channels of a cluster.
///
/// All channels are children of one cancellation scope, so `stop_all` ends every one of them
/// with a single signal and then waits for each to finish. Channels must be started from within
/// a tokio runtime.
pub struct StatusEngine {
    cluster: Arc<Cluster>,
    executor: Arc<dyn Executor>,
    notifier: Arc<dyn Notifier>,
    scope: Mutex<CancellationToken>,
    channels: Mutex<HashMap<(String, Subsystem), ChannelHandle>>,
}

impl StatusEngine {
    pub fn new(
        cluster: Arc<Cluster>,
        executor: Arc<dyn Executor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cluster,
            executor,
            notifier,
            scope: Mutex::new(CancellationToken::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Start the channel for `subsystem` on the named host. Does nothing if that channel is
    /// already running. Returns whether a channel was started.
    pub fn start(&self, host: &str, subsystem: Subsystem) -> bool {
        let Some(host) = self.cluster.get_host(host) else {
            debug!("not starting {subsystem} for unknown host {host}");
            return false;
        };

        let mut channels = self.channels.lock().unwrap();
        let key = (host.name().to_string(), subsystem);
        if channels
            .get(&key)
            .is_some_and(|channel| !channel.is_finished())
        {
            return false;
        }

        let cancel = self.scope.lock().unwrap().child_token();
        let target = Target {
            cluster: Arc::clone(&self.cluster),
            host: Arc::clone(host),
            notifier: Arc::clone(&self.notifier),
        };
        let channel =
            handlers::start_channel(target, subsystem, Arc::clone(&self.executor), cancel);
        channels.insert(key, channel);
        true
    }

    /// Start all four channels of a host.
    pub fn start_host(&self, host: &str) {
        for subsystem in Subsystem::ALL {
            self.start(host, subsystem);
        }
    }

    pub fn start_all(&self) {
        for host in self.cluster.hosts() {
            self.start_host(host.name());
        }
    }

    pub fn is_running(&self, host: &str, subsystem: Subsystem) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(&(host.to_string(), subsystem))
            .is_some_and(|channel| !channel.is_finished())
    }

    /// Whether the channel has released its loaded latch. `None` if there is no such channel.
    pub fn is_loaded(&self, host: &str, subsystem: Subsystem) -> Option<bool> {
        self.channels
            .lock()
            .unwrap()
            .get(&(host.to_string(), subsystem))
            .map(ChannelHandle::loaded)
    }

    /// Wait until the channel has delivered data or completed a run. Returns false if there is no
    /// such channel or it ended without loading.
    pub async fn wait_loaded(&self, host: &str, subsystem: Subsystem) -> bool {
        let loaded = self
            .channels
            .lock()
            .unwrap()
            .get(&(host.to_string(), subsystem))
            .map(ChannelHandle::subscribe_loaded);
        let Some(mut loaded) = loaded else {
            return false;
        };
        let released = loaded.wait_for(|loaded| *loaded).await.is_ok();
        released
    }

    /// Stop one channel and wait until it has finished. No handler of that channel runs after
    /// this returns.
    pub async fn stop(&self, host: &str, subsystem: Subsystem) {
        let channel = self
            .channels
            .lock()
            .unwrap()
            .remove(&(host.to_string(), subsystem));
        if let Some(channel) = channel {
            channel.stop().await;
        }
    }

    /// Stop every channel of the cluster and wait until all of them have finished. The engine
    /// can be started again afterwards.
    pub async fn stop_all(&self) {
        let channels: Vec<ChannelHandle> = {
            let mut channels = self.channels.lock().unwrap();
            let old_scope = std::mem::replace(
                &mut *self.scope.lock().unwrap(),
                CancellationToken::new(),
            );
            old_scope.cancel();
            channels.drain().map(|(_, channel)| channel).collect()
        };

        debug!(
            "stopping {} channels of cluster {}",
            channels.len(),
            self.cluster.name()
        );
        future::join_all(channels.into_iter().map(ChannelHandle::stop)).await;
    }

    /// The host cluster manager commands should go to right now.
    pub fn dc_host(&self) -> Option<DcSelection> {
        self.cluster.dc_host()
    }
}
