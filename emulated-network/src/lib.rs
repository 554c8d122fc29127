pub mod convergence;
pub mod gateway;
pub mod inspect;
pub mod orchestrator;
pub mod run;
pub mod shaping;
pub mod sim;
pub mod substrate;
pub mod topology;
pub mod tunables;
pub mod util;

#[cfg(test)]
mod testlab;

#[cfg(test)]
mod test {
    use crate::convergence::{ConvergenceController, ConvergenceError, ConvergenceSettings};
    use crate::gateway::rule::Protocol;
    use crate::gateway::{self, GatewayConfigurator};
    use crate::shaping::LinkShaping;
    use crate::sim::{ObservedPacket, SimulatedNetwork};
    use crate::substrate::{ExecOutput, Executor, NodeCommand};
    use crate::testlab;
    use crate::topology::{NodeRole, Topology};
    use bon::builder;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn ping(destination: &str) -> NodeCommand {
        NodeCommand::Ping {
            destination: ip(destination),
            count: 1,
            timeout: Duration::from_secs(2),
        }
    }

    #[builder]
    async fn nat_lab(bandwidth_mbps: Option<f64>) -> Arc<Executor<SimulatedNetwork>> {
        let topology = testlab::nat_topology()
            .maybe_public_bandwidth_mbps(bandwidth_mbps)
            .call();
        let executor = testlab::start(&topology).await;
        let mut gateway =
            GatewayConfigurator::new(executor.clone(), &topology, testlab::gateway_plan()).unwrap();
        gateway.assign_addresses().await.unwrap();
        for addressing in testlab::nat_addressing() {
            gateway::apply_addressing(&executor, &addressing)
                .await
                .unwrap();
        }
        gateway.enable_forwarding().await.unwrap();
        gateway.install_rules(gateway.plan().rules()).await.unwrap();
        executor
    }

    /// A ring whose switches are inserted (and therefore enabled) in the given order
    fn ring_in_order(order: &[&str]) -> Topology {
        let mut topology = Topology::new();
        for switch in order {
            topology.add_node(switch, NodeRole::Switch).unwrap();
        }
        for (a, b) in [("s1", "s2"), ("s2", "s3"), ("s3", "s4"), ("s4", "s1"), ("s1", "s3")] {
            topology.add_link(a, b, LinkShaping::default()).unwrap();
        }
        topology
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowest_priority_always_becomes_root() {
        let orders = [
            ["s1", "s2", "s3", "s4"],
            ["s4", "s3", "s2", "s1"],
            ["s2", "s4", "s1", "s3"],
            ["s3", "s1", "s4", "s2"],
        ];

        for order in orders {
            let topology = ring_in_order(&order);
            let executor = testlab::start(&topology).await;
            let mut controller = ConvergenceController::new(
                executor,
                &topology,
                ConvergenceSettings::new("s3"),
            )
            .unwrap();
            controller.enable().await.unwrap();
            let report = controller.wait_for_convergence(&topology).await.unwrap();

            assert_eq!(report.root.as_deref(), Some("s3"), "order {order:?}");
            assert!(report.forms_spanning_tree(&topology), "order {order:?}");
            assert_eq!(report.forwarding_links.len(), 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_needs_convergence() {
        let topology = testlab::ring_topology().call();
        let executor = testlab::start(&topology).await;

        // The redundant backbone floods without a spanning tree
        let output = executor.exec("h3", &ping("10.0.0.8")).await.unwrap();
        assert!(!output.success());

        let mut controller =
            ConvergenceController::new(executor.clone(), &topology, ConvergenceSettings::new("s1"))
                .unwrap();
        controller.enable().await.unwrap();
        let report = controller.wait_for_convergence(&topology).await.unwrap();
        assert!(report.waited >= Duration::from_secs(30));

        let mut succeeded = false;
        for _ in 0..3 {
            if executor.exec("h3", &ping("10.0.0.8")).await.unwrap().success() {
                succeeded = true;
                break;
            }
        }
        assert!(succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_switch_converges_immediately() {
        let mut topology = Topology::new();
        topology.add_node("s1", NodeRole::Switch).unwrap();
        topology.add_node("h1", NodeRole::Host).unwrap();
        topology.add_link("h1", "s1", LinkShaping::default()).unwrap();

        let executor = testlab::start(&topology).await;
        let mut controller =
            ConvergenceController::new(executor, &topology, ConvergenceSettings::new("s1"))
                .unwrap();
        controller.enable().await.unwrap();

        let start = tokio::time::Instant::now();
        let report = controller.wait_for_convergence(&topology).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(report.root.as_deref(), Some("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_behind_a_gateway_converge_separately() {
        // s1 and s2 are only joined through the gateway host, so s2 remains its own root
        let topology = testlab::nat_topology().call();
        let executor = testlab::start(&topology).await;
        let mut controller =
            ConvergenceController::new(executor, &topology, ConvergenceSettings::new("s1"))
                .unwrap();
        controller.enable().await.unwrap();
        let report = controller.wait_for_convergence(&topology).await.unwrap();

        assert_eq!(report.root.as_deref(), Some("s1"));
        assert_eq!(report.statuses.iter().filter(|s| s.is_root).count(), 2);
        assert!(report.forms_spanning_tree(&topology));
        assert!(report.forwarding_links.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_priority_must_win() {
        let topology = testlab::ring_topology().call();
        let executor = testlab::start(&topology).await;
        let mut settings = ConvergenceSettings::new("s1");
        settings.root_priority = settings.default_priority;

        let log_len = executor.log_len();
        assert!(ConvergenceController::new(executor.clone(), &topology, settings).is_err());
        assert!(
            ConvergenceController::new(
                executor.clone(),
                &topology,
                ConvergenceSettings::new("h1")
            )
            .is_err()
        );
        assert_eq!(executor.log_len(), log_len);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_poll_interval_is_rejected() {
        let topology = testlab::ring_topology().call();
        let executor = testlab::start(&topology).await;
        let mut settings = ConvergenceSettings::new("s1");
        settings.poll_interval = Duration::ZERO;

        let log_len = executor.log_len();
        let err = ConvergenceController::new(executor.clone(), &topology, settings)
            .err()
            .unwrap();
        assert!(matches!(err, ConvergenceError::ZeroPollInterval));
        assert_eq!(executor.log_len(), log_len);

        // The smallest accepted interval still gives up on time
        let mut settings = ConvergenceSettings::new("s1");
        settings.poll_interval = Duration::from_millis(1);
        settings.timeout = Duration::from_secs(5);
        let mut controller = ConvergenceController::new(executor, &topology, settings).unwrap();
        controller.enable().await.unwrap();
        let err = controller.wait_for_convergence(&topology).await.unwrap_err();
        assert!(matches!(err, ConvergenceError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_status_is_retried() {
        let mut garbled = 0;
        let network = testlab::FaultyNetwork::new(move |_, command| {
            if !matches!(command, NodeCommand::StpShow { .. }) || garbled == 6 {
                return None;
            }
            garbled += 1;
            Some(ExecOutput::ok("---- s1 ----\nbridge ID:"))
        });
        let topology = testlab::ring_topology().call();
        let executor = testlab::start_on(network, &topology).await;
        let mut controller =
            ConvergenceController::new(executor, &topology, ConvergenceSettings::new("s1"))
                .unwrap();
        controller.enable().await.unwrap();

        let report = controller.wait_for_convergence(&topology).await.unwrap();
        assert_eq!(report.root.as_deref(), Some("s1"));
        assert!(report.forms_spanning_tree(&topology));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_traffic_is_masqueraded() {
        let executor = nat_lab().call().await;

        let output = executor.exec("h1", &ping("10.0.0.4")).await.unwrap();
        assert!(output.success(), "{}", output.stdout);

        let seen_by_public = executor.substrate().observed_by("h3");
        assert_eq!(
            seen_by_public,
            [ObservedPacket {
                node: "h3".into(),
                protocol: Protocol::Icmp,
                source: ip("10.0.0.1"),
                destination: ip("10.0.0.4"),
                destination_port: None,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_private_hosts_only_reachable_through_translation() {
        let executor = nat_lab().call().await;

        let direct = executor.exec("h3", &ping("10.1.1.2")).await.unwrap();
        assert!(!direct.success());
        assert!(direct.stderr.contains("Network is unreachable"));

        let translated = executor.exec("h3", &ping("172.16.10.11")).await.unwrap();
        assert!(translated.success(), "{}", translated.stdout);
        // The reply comes back from the public address
        let replies = executor.substrate().observed_by("h3");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].source, ip("172.16.10.11"));

        let seen_by_private = executor.substrate().observed_by("h1");
        assert_eq!(seen_by_private.len(), 1);
        assert_eq!(seen_by_private[0].source, ip("10.0.0.4"));
        assert_eq!(seen_by_private[0].destination, ip("10.1.1.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_forwards_never_cross_deliver() {
        let executor = nat_lab().bandwidth_mbps(100.0).call().await;
        for server in ["h1", "h2"] {
            executor
                .exec_checked(server, &NodeCommand::IperfServer { port: 5201 })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let client = |destination| NodeCommand::IperfClient {
            destination: ip(destination),
            port: 5201,
            duration: Duration::from_secs(10),
        };

        let output = executor.exec("h3", &client("172.16.10.11")).await.unwrap();
        assert!(output.success(), "{}", output.stdout);
        let tcp_to = |node| {
            executor
                .substrate()
                .observed_by(node)
                .into_iter()
                .filter(|p| p.protocol == Protocol::Tcp)
                .count()
        };
        assert_eq!(tcp_to("h1"), 1);
        assert_eq!(tcp_to("h2"), 0);

        let output = executor.exec("h4", &client("172.16.10.12")).await.unwrap();
        assert!(output.success(), "{}", output.stdout);
        assert_eq!(tcp_to("h1"), 1);
        assert_eq!(tcp_to("h2"), 1);

        // Both transfers were tracked as translated connections
        let table = executor
            .exec_checked("h9", &NodeCommand::ConntrackList)
            .await
            .unwrap();
        let entries = gateway::conntrack::parse_conntrack(&table.stdout).unwrap();
        let translated_tcp = entries
            .iter()
            .filter(|e| e.protocol == Protocol::Tcp && e.is_translated())
            .count();
        assert_eq!(translated_tcp, 2);
    }
}
