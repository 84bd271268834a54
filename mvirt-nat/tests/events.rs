mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use common::{
    backend_binding, dnat_line, eventually, harness, harness_with, snat_line, subnet, EXTERNAL_IP,
};
use mvirt_nat::model::{BindingStatus, NatEvent};
use mvirt_nat::rules::RuleBackend;
use mvirt_nat::{NatError, TickOutcome};
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_created_event_assigns_and_applies() {
    let h = harness(RuleBackend::Iptables);
    let b1 = backend_binding("b1", 5, 80);
    h.cp.add_binding(b1.clone());

    assert_ok!(h.agent.dispatch(NatEvent::BindingCreated(b1)).await);

    let stored = h.cp.binding("b1").unwrap();
    assert_eq!(stored.status, BindingStatus::Active);
    assert_eq!(stored.external_port, Some(10001));
    assert!(h.agent.cached_binding("b1").await.is_some());
    assert!(h.agent.needs_resync());
    let doc = h.exec.last_restore().unwrap();
    assert!(doc.contains(&dnat_line(10001, "10.0.0.5:80")));

    // The following tick agrees with what the event applied.
    h.exec.clear();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert_eq!(h.cp.call_count("CreateVServer"), 1);
    assert!(h.exec.last_restore().is_none());
}

#[tokio::test]
async fn test_redelivered_created_event_is_ignored() {
    let h = harness(RuleBackend::Iptables);
    let b1 = backend_binding("b1", 5, 80);
    h.cp.add_binding(b1.clone());

    h.agent
        .dispatch(NatEvent::BindingCreated(b1.clone()))
        .await
        .unwrap();
    let commands = h.exec.commands().len();
    h.agent.dispatch(NatEvent::BindingCreated(b1)).await.unwrap();

    assert_eq!(h.cp.call_count("CreateVServer"), 1);
    assert_eq!(h.cp.call_count("UpdateBinding"), 1);
    assert_eq!(h.exec.commands().len(), commands);
}

#[tokio::test]
async fn test_created_event_after_failed_apply_reuses_vserver() {
    let h = harness(RuleBackend::Iptables);
    let b1 = backend_binding("b1", 5, 80);
    h.cp.add_binding(b1.clone());
    h.exec.fail_when("iptables-restore");

    assert_err!(h.agent.dispatch(NatEvent::BindingCreated(b1.clone())).await);
    assert!(h.agent.cached_binding("b1").await.is_none());

    // Redelivered with the original, unassigned payload.
    h.exec.clear_failures();
    assert_ok!(h.agent.dispatch(NatEvent::BindingCreated(b1)).await);

    assert_eq!(h.cp.call_count("CreateVServer"), 1);
    assert_eq!(h.cp.call_count("UpdateBinding"), 1);
    let vservers = h.cp.vservers_on(EXTERNAL_IP);
    assert_eq!(vservers.len(), 1);
    assert_eq!(vservers[0].external_port, 10001);
    assert!(h.agent.cached_binding("b1").await.is_some());
    let doc = h.exec.last_restore().unwrap();
    assert!(doc.contains(&dnat_line(10001, "10.0.0.5:80")));
}

#[tokio::test]
async fn test_failed_binding_update_releases_vserver() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    h.cp.fail_on("UpdateBinding");

    assert_eq!(h.agent.tick().await, TickOutcome::Failed);
    assert!(!h.cp.vserver("vs-1").unwrap().admin_state_up);
    assert_eq!(h.cp.binding("b1").unwrap().external_port, None);

    h.cp.clear_failures();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    let stored = h.cp.binding("b1").unwrap();
    assert_eq!(stored.vserver_id.as_deref(), Some("vs-1"));
    assert_eq!(stored.external_port, Some(10001));
    assert_eq!(h.cp.call_count("CreateVServer"), 1);
    assert!(h.cp.vserver("vs-1").unwrap().admin_state_up);
}

#[tokio::test]
async fn test_created_event_for_deleted_binding_is_skipped() {
    let h = harness(RuleBackend::Iptables);
    let b1 = backend_binding("b1", 5, 80);

    assert_ok!(h.agent.dispatch(NatEvent::BindingCreated(b1)).await);

    assert_eq!(h.cp.call_count("GetBinding"), 1);
    assert_eq!(h.cp.call_count("CreateVServer"), 0);
    assert!(h.exec.lines().is_empty());
    assert!(h.agent.cached_binding("b1").await.is_none());
}

#[tokio::test]
async fn test_created_event_reuses_gateway_of_port() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_subnet(subnet("sub-1", "net-1"));
    h.cp.attach_port("port-1", "sub-1");
    let mut b1 = backend_binding("b1", 5, 80);
    b1.port_id = Some("port-1".to_string());
    h.cp.add_binding(b1);
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    let lookups = h.cp.call_count("GetSubnetsForPorts");

    let mut b2 = backend_binding("b2", 5, 22);
    b2.port_id = Some("port-1".to_string());
    h.cp.add_binding(b2.clone());
    assert_ok!(h.agent.dispatch(NatEvent::BindingCreated(b2)).await);

    let gw_ip = Ipv4Addr::new(10, 0, 0, 2);
    assert_eq!(h.cp.call_count("GetSubnetsForPorts"), lookups);
    assert_eq!(h.cp.binding("b2").unwrap().gateway, Some(gw_ip));
    let doc = h.exec.last_restore().unwrap();
    assert!(doc.contains(&snat_line("10.0.0.5", 22, gw_ip)));
}

#[tokio::test]
async fn test_created_event_for_assigned_binding_skips_assignment() {
    let h = harness(RuleBackend::Ipvs);
    let mut b1 = backend_binding("b1", 5, 80);
    b1.status = BindingStatus::Active;
    b1.vserver_id = Some("vs-7".to_string());
    b1.external_ip = Some(EXTERNAL_IP);
    b1.external_port = Some(10007);

    h.agent.dispatch(NatEvent::BindingCreated(b1)).await.unwrap();

    assert_eq!(h.cp.call_count("UpdateBinding"), 0);
    assert_eq!(
        h.exec.lines(),
        vec![
            "ipvsadm -A -t 198.51.100.1:10007 -s rr".to_string(),
            "ipvsadm -a -t 198.51.100.1:10007 -r 10.0.0.5:80 -m".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_created_event_without_fixed_endpoint_is_rejected() {
    let h = harness(RuleBackend::Iptables);
    let mut b1 = backend_binding("b1", 5, 80);
    b1.fixed_port = None;

    let err = assert_err!(h.agent.dispatch(NatEvent::BindingCreated(b1)).await);
    assert!(matches!(err, NatError::InvalidPayload { .. }));
    assert!(h.exec.lines().is_empty());
    assert!(h.agent.needs_resync());
}

#[tokio::test]
async fn test_deleted_event_removes_rule() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    h.cp.add_binding(backend_binding("b2", 6, 22));
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    let b1 = h.cp.binding("b1").unwrap();
    assert_ok!(h.agent.dispatch(NatEvent::BindingDeleted(b1)).await);

    assert!(h.agent.cached_binding("b1").await.is_none());
    let doc = h.exec.last_restore().unwrap();
    assert!(!doc.contains("--dport 10001"));
    assert!(doc.contains(&dnat_line(10002, "10.0.0.6:22")));
    assert!(h.agent.needs_resync());
}

#[tokio::test]
async fn test_deleted_event_prefers_applied_rule() {
    let h = harness(RuleBackend::Ipvs);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    // The payload carries a stale external port.
    let mut payload = h.cp.binding("b1").unwrap();
    payload.external_port = Some(20000);
    h.exec.clear();
    h.agent
        .dispatch(NatEvent::BindingDeleted(payload))
        .await
        .unwrap();

    assert_eq!(
        h.exec.lines(),
        vec![
            "ipvsadm -d -t 198.51.100.1:10001 -r 10.0.0.5:80".to_string(),
            "ipvsadm -D -t 198.51.100.1:10001".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_deleted_event_for_unknown_binding_uses_payload() {
    let h = harness(RuleBackend::Iptables);
    let mut b1 = backend_binding("b1", 5, 80);
    b1.external_ip = Some(EXTERNAL_IP);
    b1.external_port = Some(10001);

    h.agent.dispatch(NatEvent::BindingDeleted(b1)).await.unwrap();

    let doc = h.exec.last_restore().unwrap();
    assert!(!doc.contains("10.0.0.5"));
    assert!(h.agent.cached_binding_ids().await.is_empty());
}

#[tokio::test]
async fn test_agent_updated_requests_resync() {
    let h = harness(RuleBackend::Iptables);
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert!(!h.agent.needs_resync());

    h.agent
        .dispatch(NatEvent::AgentUpdated {
            admin_state_up: false,
        })
        .await
        .unwrap();
    assert!(h.agent.needs_resync());
}

#[tokio::test]
async fn test_watch_events_dispatches_stream() {
    let h = harness(RuleBackend::Iptables);
    let b1 = backend_binding("b1", 5, 80);
    h.cp.add_binding(b1.clone());
    let events = h.cp.event_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(h.agent.clone().watch_events(shutdown_rx));
    events.send(Ok(NatEvent::BindingCreated(b1))).unwrap();

    let agent = h.agent.clone();
    assert!(
        eventually(|| {
            let agent = agent.clone();
            async move { agent.cached_binding("b1").await.is_some() }
        })
        .await
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_watch_events_stops_while_reconnecting() {
    let h = harness(RuleBackend::Iptables);
    h.cp.fail_on("WatchEvents");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(h.agent.clone().watch_events(shutdown_rx));
    let cp = h.cp.clone();
    assert!(eventually(|| {
        let cp = cp.clone();
        async move { cp.call_count("WatchEvents") == 1 }
    })
    .await);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert!(h.agent.needs_resync());
}

#[tokio::test]
async fn test_report_state_fields() {
    let h = harness(RuleBackend::Ipvs);
    h.agent.report_state(true).await.unwrap();

    let reports = h.cp.reports();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.start_flag);
    assert_eq!(report.host, "node-1");
    assert_eq!(report.binary, "mvirt-nat");
    assert_eq!(report.agent_id, h.agent.agent_id());
    assert_eq!(report.configurations["rule_backend"], "ipvs");
    assert_eq!(report.configurations["interface_driver"], "ovs");
    assert_eq!(report.configurations["external_ip"], "198.51.100.1");
}

#[tokio::test]
async fn test_report_loop_clears_start_flag() {
    let h = harness(RuleBackend::Iptables);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(h.agent.clone().report_state_loop(shutdown_rx));

    let cp = h.cp.clone();
    assert!(eventually(|| {
        let cp = cp.clone();
        async move { cp.reports().len() >= 2 }
    })
    .await);
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    let reports = h.cp.reports();
    assert!(reports[0].start_flag);
    assert!(reports[1..].iter().all(|r| !r.start_flag));
}

#[tokio::test]
async fn test_report_loop_stops_when_unimplemented() {
    let h = harness(RuleBackend::Iptables);
    h.cp.fail_with("ReportState", tonic::Code::Unimplemented);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::time::timeout(
        Duration::from_secs(5),
        h.agent.clone().report_state_loop(shutdown_rx),
    )
    .await
    .unwrap();
    assert_eq!(h.cp.call_count("ReportState"), 1);
}

#[tokio::test]
async fn test_report_loop_disabled_by_zero_interval() {
    let h = harness_with(RuleBackend::Iptables, |c| c.report_interval = Duration::ZERO);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::time::timeout(
        Duration::from_secs(1),
        h.agent.clone().report_state_loop(shutdown_rx),
    )
    .await
    .unwrap();
    assert_eq!(h.cp.call_count("ReportState"), 0);
}

#[tokio::test]
async fn test_run_converges_and_stops() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(h.agent.clone().run(shutdown_rx));
    let agent = h.agent.clone();
    assert!(
        eventually(|| {
            let agent = agent.clone();
            async move { agent.cached_binding("b1").await.is_some() }
        })
        .await
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.cp.binding("b1").unwrap().external_port, Some(10001));
}
