// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, sync::Arc};

use {
    axum::{extract::Path, http::StatusCode, routing::get, Json, Router},
    log::warn,
    serde::Serialize,
};

use crate::{
    cluster::Cluster,
    crm::{Operation, ResourceState},
    drbd::DrbdStatus,
    host::{ConnectionState, Host, HostDrbd, HostStatus},
};

/// Main entrypoint for the status server.
///
/// This answers read-only status queries on a unix socket.
pub async fn server_main(listener: tokio::net::UnixListener, cluster: Arc<Cluster>) {
    let server = Router::new()
        .route(
            "/status",
            get({
                let cluster = Arc::clone(&cluster);
                || get_status(cluster)
            }),
        )
        .route(
            "/hosts/{id}",
            get({
                let cluster = Arc::clone(&cluster);
                |path| get_host(path, cluster)
            }),
        )
        .route(
            "/dc",
            get({
                let cluster = Arc::clone(&cluster);
                || get_dc(cluster)
            }),
        );

    if let Err(e) = axum::serve(listener, server).await {
        warn!("status server failed: {e}");
    }
}

#[derive(Serialize, Debug)]
pub struct ClusterJson {
    pub name: String,
    /// The DC the cluster manager reports, which may be stale.
    pub dc: Option<String>,
    pub hosts: Vec<HostJson>,
    pub resources: BTreeMap<String, ResourceJson>,
    pub drbd: DrbdStatus,
}

#[derive(Serialize, Debug)]
pub struct HostJson {
    pub name: String,
    pub port: u16,
    pub connection: ConnectionState,
    pub online: Option<bool>,
    pub status: HostStatus,
    pub drbd: HostDrbd,
    pub vms: BTreeMap<String, String>,
}

impl HostJson {
    fn build(host: &Host, online: Option<bool>, drbd: HostDrbd) -> Self {
        Self {
            name: host.name().to_string(),
            port: host.port(),
            connection: host.connection(),
            online,
            status: host.status(),
            drbd,
            vms: host.lock_vms().vms.clone(),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ResourceJson {
    pub agent: String,
    pub parameters: BTreeMap<String, String>,
    pub operations: Vec<Operation>,
    pub states: BTreeMap<String, ResourceState>,
}

#[derive(Serialize, Debug)]
pub struct DcJson {
    pub host: String,
    pub confirmed: bool,
}

/// Copy everything out under the store locks, one store at a time.
fn cluster_json(cluster: &Cluster) -> ClusterJson {
    let (dc, online, resources) = {
        let status = cluster.lock_cluster_status();
        let online: Vec<Option<bool>> = cluster
            .hosts()
            .iter()
            .map(|host| status.is_online_node(host.name()))
            .collect();
        let resources = status
            .resources()
            .iter()
            .map(|(id, config)| {
                let resource = ResourceJson {
                    agent: config.agent.to_string(),
                    parameters: config.parameters.clone(),
                    operations: config.operations.clone(),
                    states: status.resource_states(id).cloned().unwrap_or_default(),
                };
                (id.clone(), resource)
            })
            .collect();
        (status.dc().map(str::to_string), online, resources)
    };

    let drbd = cluster.drbd_snapshot();
    let hosts = cluster
        .hosts()
        .iter()
        .zip(online)
        .zip(drbd.hosts)
        .map(|((host, online), (_, host_drbd))| HostJson::build(host, online, host_drbd))
        .collect();

    ClusterJson {
        name: cluster.name().to_string(),
        dc,
        hosts,
        resources,
        drbd: drbd.status,
    }
}

async fn get_status(cluster: Arc<Cluster>) -> Json<ClusterJson> {
    Json(cluster_json(&cluster))
}

async fn get_host(
    Path(host_id): Path<String>,
    cluster: Arc<Cluster>,
) -> Result<Json<HostJson>, StatusCode> {
    let Some(host) = cluster.get_host(&host_id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    let online = cluster.lock_cluster_status().is_online_node(host.name());
    let drbd = host.lock_drbd().clone();
    Ok(Json(HostJson::build(host, online, drbd)))
}

async fn get_dc(cluster: Arc<Cluster>) -> Result<Json<DcJson>, StatusCode> {
    let Some(selection) = cluster.dc_host() else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(DcJson {
        host: selection.host.name().to_string(),
        confirmed: selection.confirmed,
    }))
}

#[cfg(test)]
mod tests {
    use crate::test_env::{crm_frame, test_cluster, test_context};

    use super::*;

    #[test]
    fn status_json() {
        let cluster = test_cluster(&["alice", "bob"], test_context());
        cluster
            .lock_cluster_status()
            .parse_status(&crm_frame(&[
                "dc bob",
                "node alice online",
                "rsc vip ocf:heartbeat:IPaddr2",
                "status vip alice started",
            ]))
            .unwrap();

        let json = cluster_json(&cluster);
        assert_eq!(json.dc.as_deref(), Some("bob"));
        assert_eq!(json.hosts[0].online, Some(true));
        assert_eq!(json.hosts[1].online, None);
        assert_eq!(json.resources["vip"].agent, "ocf:heartbeat:IPaddr2");
        assert_eq!(json.resources["vip"].states["alice"], ResourceState::Started);
    }

    #[test]
    fn dc_and_host_routes() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let cluster = test_cluster(&["alice", "bob"], test_context());

            // Nothing is usable, so the first host is a best-effort pick.
            let Json(dc) = get_dc(Arc::clone(&cluster)).await.unwrap();
            assert_eq!(dc.host, "alice");
            assert!(!dc.confirmed);

            let Json(host) = get_host(Path("bob".to_string()), Arc::clone(&cluster))
                .await
                .unwrap();
            assert_eq!(host.connection, ConnectionState::Disconnected);

            let missing = get_host(Path("carol".to_string()), cluster).await;
            assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
        });
    }
}
