// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::runtime::Runtime;

    use clusterwatch_lib::{
        channel::Subsystem,
        config::{Polling, Ssh},
        host::ConnectionState,
        manager::WatchContext,
        notify::Change,
        parser::CRM_ERROR_FRAME,
        remote::{KILLED_BY_REQUEST, KILLED_SIGTERM},
        test_env::*,
        LogStream,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn chunk(text: &str) -> Step {
        Step::Chunk(text.to_string())
    }

    fn online_frame(dc: &str) -> String {
        crm_frame(&[
            &format!("dc {dc}"),
            "node alice online",
            "node bob online",
            "rsc vip ocf:heartbeat:IPaddr2",
            "param vip ip=10.0.0.10",
            "status vip alice started",
        ])
    }

    #[test]
    fn crm_frames_feed_the_store() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice", "bob"], test_context());
            let frame = online_frame("bob");
            let (head, tail) = frame.split_at(20);
            t.executor.script(
                "alice",
                "ClusterStatus",
                vec![chunk(head), chunk(tail), Step::UntilKilled(KILLED_SIGTERM)],
            );

            assert!(t.engine.start("alice", Subsystem::CrmStatus));
            assert!(t.engine.wait_loaded("alice", Subsystem::CrmStatus).await);

            {
                let status = t.cluster.lock_cluster_status();
                assert_eq!(status.dc(), Some("bob"));
                assert_eq!(status.is_online_node("alice"), Some(true));
                assert_eq!(status.running_on("vip"), vec!["alice"]);
            }
            assert!(t.cluster.hosts()[0].crm_status_ok());

            assert_eq!(
                t.notifier.count(&Change::ClusterStatus {
                    dc: Some("bob".to_string())
                }),
                1
            );
            assert_eq!(
                t.notifier.count(&Change::Host {
                    host: "alice".to_string()
                }),
                1
            );
            assert_eq!(
                t.notifier.count(&Change::Loaded {
                    host: "alice".to_string(),
                    subsystem: Subsystem::CrmStatus,
                }),
                1
            );

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn error_frame_takes_host_offline() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice", "bob"], test_context());
            t.executor.script(
                "alice",
                "ClusterStatus",
                vec![
                    chunk(&online_frame("alice")),
                    Step::Sleep(Duration::from_millis(50)),
                    chunk(CRM_ERROR_FRAME),
                    Step::UntilKilled(KILLED_SIGTERM),
                ],
            );
            t.engine.start("alice", Subsystem::CrmStatus);

            let alice = Arc::clone(&t.cluster.hosts()[0]);
            assert!(wait_until(WAIT, || alice.crm_status_ok()).await);
            assert!(wait_until(WAIT, || !alice.crm_status_ok()).await);

            let status = t.cluster.lock_cluster_status();
            assert_eq!(status.is_online_node("alice"), Some(false));
            // The error frame carries no cluster state, so the rest is untouched.
            assert_eq!(status.dc(), Some("alice"));
            assert!(status.resource("vip").is_some());
            drop(status);

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn bad_frame_is_discarded() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice"], test_context());
            t.executor.script(
                "alice",
                "ClusterStatus",
                vec![
                    chunk(&online_frame("alice")),
                    chunk(&crm_frame(&["dc bob", "status ghost alice started"])),
                    chunk(&crm_frame(&["dc alice", "node alice online"])),
                    Step::UntilKilled(KILLED_SIGTERM),
                ],
            );
            t.engine.start("alice", Subsystem::CrmStatus);

            // The last frame drops the resource; the broken one before it changed nothing.
            assert!(
                wait_until(WAIT, || t.cluster.lock_cluster_status().resources().is_empty()).await
            );
            assert_eq!(t.notifier.count(&Change::ClusterStatus { dc: Some("bob".to_string()) }), 0);

            t.engine.stop_all().await;
        });
    }

    /// Stopping kills the commands with 143 (CRM) and 100 (DRBD); neither may mark the host as
    /// having gone offline.
    #[test]
    fn stopping_does_not_flip_flags() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice", "bob"], test_context());
            t.executor.script(
                "alice",
                "ClusterStatus",
                vec![chunk(&online_frame("alice")), Step::UntilKilled(KILLED_SIGTERM)],
            );
            t.executor.script(
                "alice",
                "DrbdEvents",
                vec![
                    chunk("event exists resource name:r0 role:Primary\n"),
                    Step::UntilKilled(KILLED_BY_REQUEST),
                ],
            );
            t.engine.start("alice", Subsystem::CrmStatus);
            t.engine.start("alice", Subsystem::DrbdStatus);

            let alice = Arc::clone(&t.cluster.hosts()[0]);
            assert!(wait_until(WAIT, || alice.crm_status_ok() && alice.drbd_status_ok()).await);

            t.engine.stop_all().await;

            assert!(alice.crm_status_ok());
            assert!(alice.drbd_status_ok());
            assert_eq!(
                t.cluster.lock_cluster_status().is_online_node("alice"),
                Some(true)
            );
            assert!(!t.engine.is_running("alice", Subsystem::CrmStatus));
            assert!(!t.engine.is_running("alice", Subsystem::DrbdStatus));
        });
    }

    /// Only the DRBD channel takes 143 and 100 to mean "stopped on purpose" when nobody asked it
    /// to stop. The CRM channel treats them like any other failure.
    #[test]
    fn killed_exit_codes_without_stop() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice", "bob"], test_context());
            t.executor.script(
                "alice",
                "ClusterStatus",
                vec![chunk(&online_frame("alice")), Step::Exit(KILLED_SIGTERM)],
            );
            for code in [KILLED_SIGTERM, KILLED_BY_REQUEST] {
                t.executor.script(
                    "alice",
                    "DrbdEvents",
                    vec![
                        chunk("event exists resource name:r0 role:Primary\n"),
                        Step::Exit(code),
                    ],
                );
            }
            t.engine.start("alice", Subsystem::CrmStatus);
            t.engine.start("alice", Subsystem::DrbdStatus);

            let alice = Arc::clone(&t.cluster.hosts()[0]);
            // Both DRBD runs have ended once the third one starts.
            assert!(wait_until(WAIT, || t.executor.calls("alice", "DrbdEvents") == 3).await);
            assert!(alice.drbd_status_ok());

            assert!(wait_until(WAIT, || t.executor.calls("alice", "ClusterStatus") == 2).await);
            assert!(!alice.crm_status_ok());
            assert_eq!(
                t.cluster.lock_cluster_status().is_online_node("alice"),
                Some(false)
            );

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn drbd_failure_and_no_manager() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice", "bob"], test_context());
            t.executor.script(
                "alice",
                "DrbdEvents",
                vec![
                    chunk("drbd r0 0 device:/dev/drbd0 host:alice disk:/dev/sdb1\r\n"),
                    chunk("event exists resource name:r0 role:Secondary\r\nevent exists device name:r0 volume:0 disk:UpToDate\r\n"),
                    Step::Exit(1),
                ],
            );
            t.executor.script("bob", "DrbdEvents", vec![chunk("--nm--\n")]);
            t.engine.start_host("alice");
            t.engine.start("bob", Subsystem::DrbdStatus);

            let (alice, bob) = (
                Arc::clone(&t.cluster.hosts()[0]),
                Arc::clone(&t.cluster.hosts()[1]),
            );
            assert!(wait_until(WAIT, || t.executor.calls("alice", "DrbdEvents") == 2).await);
            assert!(!alice.drbd_status_ok());

            let snapshot = t.cluster.drbd_snapshot();
            assert_eq!(snapshot.status.device("r0", 0), Some("/dev/drbd0"));
            assert_eq!(snapshot.status.disk("r0", 0, "alice"), Some("/dev/sdb1"));
            // The second run starts from a clean slate; only the mappings survive.
            assert_eq!(snapshot.status.role("r0", "alice"), None);
            assert_eq!(snapshot.hosts[0].1.events, 2);
            assert!(t.notifier.count(&Change::DrbdStatus) >= 1);

            assert!(t.engine.wait_loaded("bob", Subsystem::DrbdStatus).await);
            assert!(!bob.drbd_status_ok());

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn drbd_reconnect_rebuilds_host_state() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice", "bob"], test_context());
            t.executor.script(
                "alice",
                "DrbdEvents",
                vec![
                    chunk("drbd r0 0 device:/dev/drbd0 host:alice disk:/dev/sdb1\n"),
                    chunk("event exists resource name:r0 role:Primary\n"),
                    chunk("event exists connection name:r0 conn-name:bob connection:Connected\n"),
                    Step::Exit(255),
                ],
            );
            t.executor.script(
                "alice",
                "DrbdEvents",
                vec![
                    chunk("event exists resource name:r0 role:Secondary\nevent exists -\n"),
                    Step::UntilKilled(KILLED_SIGTERM),
                ],
            );
            t.executor.script(
                "bob",
                "DrbdEvents",
                vec![
                    chunk("event exists resource name:r0 role:Secondary\n"),
                    Step::UntilKilled(KILLED_SIGTERM),
                ],
            );
            t.engine.start("bob", Subsystem::DrbdStatus);
            assert!(t.engine.wait_loaded("bob", Subsystem::DrbdStatus).await);
            t.engine.start("alice", Subsystem::DrbdStatus);

            assert!(
                wait_until(WAIT, || {
                    t.cluster.lock_drbd_status().role("r0", "alice") == Some("Secondary")
                })
                .await
            );

            let status = t.cluster.lock_drbd_status().clone();
            let r0 = status.resource("r0").unwrap();
            assert!(r0.connections.get("alice").is_none());
            assert_eq!(status.device("r0", 0), Some("/dev/drbd0"));
            assert_eq!(status.disk("r0", 0, "alice"), Some("/dev/sdb1"));
            // Other hosts' reports are untouched.
            assert_eq!(status.role("r0", "bob"), Some("Secondary"));

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn malformed_drbd_line_is_not_healthy() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice"], test_context());
            t.executor.script(
                "alice",
                "DrbdEvents",
                vec![
                    chunk("event garbled\ndrbd r0 zero device:/dev/drbd0\n"),
                    Step::UntilKilled(KILLED_SIGTERM),
                ],
            );
            t.engine.start("alice", Subsystem::DrbdStatus);

            assert!(t.engine.wait_loaded("alice", Subsystem::DrbdStatus).await);
            let alice = &t.cluster.hosts()[0];
            assert!(!alice.drbd_status_ok());
            assert_eq!(alice.lock_drbd().events, 0);

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn ping_tracks_connection() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice", "bob"], test_context());
            t.executor.script(
                "alice",
                "PingCommand",
                vec![chunk("\n"), Step::Sleep(Duration::from_millis(50)), Step::Exit(255)],
            );
            t.executor.script("bob", "PingCommand", vec![chunk("\n"), Step::Exit(1)]);
            t.engine.start("alice", Subsystem::Ping);
            t.engine.start("bob", Subsystem::Ping);

            let (alice, bob) = (
                Arc::clone(&t.cluster.hosts()[0]),
                Arc::clone(&t.cluster.hosts()[1]),
            );
            assert!(wait_until(WAIT, || alice.is_connected()).await);
            assert!(alice.status().last_ping.is_some());
            assert!(
                wait_until(WAIT, || alice.connection() == ConnectionState::Disconnected).await
            );
            assert!(wait_until(WAIT, || bob.connection() == ConnectionState::Failed).await);

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn silent_ping_disconnects() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let context = Arc::new(WatchContext {
                out_stream: LogStream::Buffer(clusterwatch_lib::Buffer::new()),
                verbose: false,
                polling: Polling {
                    ping_timeout_ms: 50,
                    ..test_polling()
                },
                ssh: Ssh::default(),
            });
            let t = test_engine(&["alice"], context);
            t.executor.script(
                "alice",
                "PingCommand",
                vec![
                    chunk("\n"),
                    Step::Sleep(Duration::from_millis(300)),
                    chunk("\n"),
                    Step::UntilKilled(KILLED_SIGTERM),
                ],
            );
            t.engine.start("alice", Subsystem::Ping);

            let alice = Arc::clone(&t.cluster.hosts()[0]);
            assert!(wait_until(WAIT, || alice.is_connected()).await);
            assert!(
                wait_until(WAIT, || alice.connection() == ConnectionState::Disconnected).await
            );
            // Output again reconnects, without restarting the command.
            assert!(wait_until(WAIT, || alice.is_connected()).await);
            assert_eq!(t.executor.calls("alice", "PingCommand"), 1);

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn server_info_feeds_dc_election() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice", "bob", "carol"], test_context());
            t.executor.script(
                "bob",
                "GetHostInfo",
                vec![
                    chunk("motd noise\r\n--hw-info-start--1700000000\r\ncs:running\r\nmem:4096\r\n--hw-info-end--\r\n"),
                    chunk("--vm-info-start--1700000000\r\nweb1 running\r\nweb2 shut\r\n--vm-info-end--\r\n"),
                    Step::UntilKilled(KILLED_SIGTERM),
                ],
            );
            t.executor
                .script("bob", "PingCommand", vec![chunk("\n"), Step::UntilKilled(KILLED_SIGTERM)]);
            t.executor.script(
                "bob",
                "ClusterStatus",
                vec![chunk(&online_frame("bob")), Step::UntilKilled(KILLED_SIGTERM)],
            );
            t.engine.start_host("bob");

            let bob = Arc::clone(&t.cluster.hosts()[1]);
            assert!(wait_until(WAIT, || bob.lock_vms().vms.len() == 2).await);
            assert!(wait_until(WAIT, || {
                bob.comm_layer().corosync && bob.is_connected() && bob.crm_status_ok()
            })
            .await);
            assert_eq!(
                bob.status().hardware.get("mem").map(String::as_str),
                Some("4096")
            );

            let dc = t.engine.dc_host().unwrap();
            assert_eq!(dc.host.name(), "bob");
            assert!(dc.confirmed);
            assert_eq!(
                t.cluster.lock_cluster_status().dc_reported_by_crm(),
                Some("bob")
            );

            // The comm layer being restarted demotes bob to a provisional pick.
            bob.set_comm_layer_stopping(true);
            let dc = t.engine.dc_host().unwrap();
            assert_eq!(dc.host.name(), "bob");
            assert!(!dc.confirmed);

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn start_is_idempotent() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let t = test_engine(&["alice"], test_context());

            assert!(t.engine.start("alice", Subsystem::CrmStatus));
            assert!(!t.engine.start("alice", Subsystem::CrmStatus));
            assert!(!t.engine.start("nobody", Subsystem::CrmStatus));
            assert!(t.engine.is_running("alice", Subsystem::CrmStatus));
            assert!(wait_until(WAIT, || t.executor.calls("alice", "ClusterStatus") == 1).await);

            t.engine.stop("alice", Subsystem::CrmStatus).await;
            assert!(!t.engine.is_running("alice", Subsystem::CrmStatus));
            assert_eq!(t.engine.is_loaded("alice", Subsystem::CrmStatus), None);

            assert!(t.engine.start("alice", Subsystem::CrmStatus));
            assert!(wait_until(WAIT, || t.executor.calls("alice", "ClusterStatus") == 2).await);

            t.engine.stop_all().await;
        });
    }

    #[test]
    fn stop_all_quiesces_every_channel() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let hosts = ["alice", "bob", "carol"];
            let t = test_engine(&hosts, test_context());
            for host in hosts {
                t.executor.script(
                    host,
                    "PingCommand",
                    vec![Step::Repeat("\n".to_string(), Duration::from_millis(5))],
                );
            }
            t.engine.start_all();

            assert!(
                wait_until(WAIT, || {
                    hosts.iter().all(|host| {
                        Subsystem::ALL
                            .iter()
                            .all(|s| t.executor.calls(host, s.command_id()) == 1)
                    })
                })
                .await
            );
            assert!(wait_until(WAIT, || t.cluster.hosts().iter().all(|h| h.is_connected())).await);

            t.engine.stop_all().await;
            for host in hosts {
                for subsystem in Subsystem::ALL {
                    assert!(!t.engine.is_running(host, subsystem));
                }
            }

            let seen = t.notifier.changes().len();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(t.notifier.changes().len(), seen);
            // Being stopped is not a reason to call a host disconnected.
            assert!(t.cluster.hosts().iter().all(|h| h.is_connected()));

            // The engine can be started again.
            assert!(t.engine.start("alice", Subsystem::Ping));
            t.engine.stop_all().await;
        });
    }

    #[test]
    fn verbose_output() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (context, output) = test_context_with_output(true);
            let t = test_engine(&["alice"], context);
            t.executor.script(
                "alice",
                "PingCommand",
                vec![chunk("\n"), Step::UntilKilled(KILLED_SIGTERM)],
            );
            t.engine.start("alice", Subsystem::Ping);

            assert!(wait_until(WAIT, || output.lines().len() == 1).await);
            assert_eq!(output.next_line().as_deref(), Some("alice: connected"));

            t.engine.stop_all().await;
        });
    }
}
