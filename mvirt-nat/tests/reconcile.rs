mod common;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use common::{
    backend_binding, dnat_line, harness, harness_with, snat_line, subnet, EXTERNAL_IP, INTERNAL_IP,
};
use mvirt_nat::model::{BindingKind, BindingStatus};
use mvirt_nat::rules::RuleBackend;
use mvirt_nat::TickOutcome;

#[tokio::test]
async fn test_new_binding_is_assigned_and_forwarded() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert!(!h.agent.needs_resync());

    let vservers = h.cp.vservers_on(EXTERNAL_IP);
    assert_eq!(vservers.len(), 1);
    assert_eq!(vservers[0].external_port, 10001);

    let b1 = h.cp.binding("b1").unwrap();
    assert_eq!(b1.status, BindingStatus::Active);
    assert_eq!(b1.external_ip, Some(EXTERNAL_IP));
    assert_eq!(b1.external_port, Some(10001));
    assert_eq!(b1.vserver_id.as_deref(), Some(vservers[0].id.as_str()));
    assert_eq!(b1.gateway, Some(INTERNAL_IP));
    assert!(b1.admin_state_up);

    let doc = h.exec.last_restore().unwrap();
    assert!(doc.contains(&dnat_line(10001, "10.0.0.5:80")));
    assert!(doc.contains(&snat_line("10.0.0.5", 80, INTERNAL_IP)));
    assert_eq!(
        h.agent.cached_binding_ids().await,
        BTreeSet::from(["b1".to_string()])
    );
    assert_eq!(h.agent.binding_count(), 1);
}

#[tokio::test]
async fn test_tick_skipped_when_nothing_pending() {
    let h = harness(RuleBackend::Iptables);
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert_eq!(h.agent.tick().await, TickOutcome::Skipped);
    assert_eq!(h.cp.call_count("GetActiveBindings"), 2);
}

#[tokio::test]
async fn test_second_tick_is_idempotent() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    h.exec.clear();
    h.agent.request_resync();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    assert!(h.exec.lines().is_empty());
    assert_eq!(h.cp.call_count("UpdateBinding"), 1);
    assert_eq!(h.cp.call_count("CreateVServer"), 1);
    assert!(h.cp.deleted().is_empty());
}

#[tokio::test]
async fn test_ports_allocated_in_order() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    h.cp.add_binding(backend_binding("b2", 6, 22));

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    assert_eq!(h.cp.binding("b1").unwrap().external_port, Some(10001));
    assert_eq!(h.cp.binding("b2").unwrap().external_port, Some(10002));
    let doc = h.exec.last_restore().unwrap();
    assert!(doc.contains(&dnat_line(10001, "10.0.0.5:80")));
    assert!(doc.contains(&dnat_line(10002, "10.0.0.6:22")));
}

#[tokio::test]
async fn test_released_vserver_is_reused() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_vserver("vs-old", EXTERNAL_IP, 10005, false);
    h.cp.add_binding(backend_binding("b1", 5, 80));

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    let b1 = h.cp.binding("b1").unwrap();
    assert_eq!(b1.vserver_id.as_deref(), Some("vs-old"));
    assert_eq!(b1.external_port, Some(10005));
    assert!(h.cp.vserver("vs-old").unwrap().admin_state_up);
    assert_eq!(h.cp.call_count("CreateVServer"), 0);
}

#[tokio::test]
async fn test_duplicate_ids_keep_first() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    h.cp.add_binding(backend_binding("b1", 5, 443));

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    assert_eq!(h.cp.call_count("CreateVServer"), 1);
    assert_eq!(h.agent.binding_count(), 1);
    let cached = h.agent.cached_binding("b1").await.unwrap();
    assert_eq!(cached.fixed_port, Some(80));
}

#[tokio::test]
async fn test_stale_binding_removed_then_deleted() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    h.cp.add_binding(backend_binding("b2", 6, 22));
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    h.cp.unschedule("b1");
    h.agent.request_resync();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    assert_eq!(h.cp.deleted(), vec!["b1".to_string()]);
    assert!(h.cp.binding("b1").is_none());
    let doc = h.exec.last_restore().unwrap();
    assert!(!doc.contains("10.0.0.5"));
    assert!(doc.contains(&dnat_line(10002, "10.0.0.6:22")));
    assert_eq!(
        h.agent.cached_binding_ids().await,
        BTreeSet::from(["b2".to_string()])
    );
}

#[tokio::test]
async fn test_stale_binding_kept_until_rule_removed() {
    let h = harness(RuleBackend::Ipvs);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    h.cp.unschedule("b1");
    h.exec.fail_when("-d -t 198.51.100.1:10001");
    h.agent.request_resync();
    assert_eq!(h.agent.tick().await, TickOutcome::Incomplete);
    assert!(h.cp.deleted().is_empty());
    assert!(h.cp.binding("b1").is_some());

    // The rebuild drops the real server, then the record goes.
    h.exec.clear_failures();
    h.exec.clear();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert_eq!(h.exec.lines(), vec!["ipvsadm -C".to_string()]);
    assert_eq!(h.cp.deleted(), vec!["b1".to_string()]);
    assert!(h.agent.cached_binding_ids().await.is_empty());
}

#[tokio::test]
async fn test_rpc_failure_schedules_resync() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    h.cp.fail_on("GetActiveBindings");

    assert_eq!(h.agent.tick().await, TickOutcome::Failed);
    assert!(h.agent.needs_resync());
    assert!(h.exec.lines().is_empty());

    h.cp.clear_failures();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert!(!h.agent.needs_resync());
    assert!(h.agent.cached_binding("b1").await.is_some());
}

#[tokio::test]
async fn test_restore_failure_keeps_cache_empty() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    h.exec.fail_when("iptables-restore");

    assert_eq!(h.agent.tick().await, TickOutcome::Failed);
    assert!(h.agent.cached_binding_ids().await.is_empty());
    // The assignment itself went through upstream.
    assert_eq!(h.cp.binding("b1").unwrap().status, BindingStatus::Active);

    h.exec.clear_failures();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    let doc = h.exec.last_restore().unwrap();
    assert!(doc.contains(&dnat_line(10001, "10.0.0.5:80")));
    assert_eq!(h.cp.call_count("CreateVServer"), 1);
}

#[tokio::test]
async fn test_ipvs_partial_failure_forces_full_rebuild() {
    let h = harness(RuleBackend::Ipvs);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    h.exec.fail_when("-r 10.0.0.5:80");

    assert_eq!(h.agent.tick().await, TickOutcome::Incomplete);
    assert!(h.agent.needs_resync());

    h.exec.clear_failures();
    h.exec.clear();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert_eq!(
        h.exec.lines(),
        vec![
            "ipvsadm -C".to_string(),
            "ipvsadm -A -t 198.51.100.1:10001 -s rr".to_string(),
            "ipvsadm -a -t 198.51.100.1:10001 -r 10.0.0.5:80 -m".to_string(),
        ]
    );

    // Converged again: nothing left to do.
    h.exec.clear();
    h.agent.request_resync();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert!(h.exec.lines().is_empty());
}

#[tokio::test]
async fn test_ipvs_incremental_failure_rebuilds_next_tick() {
    let h = harness(RuleBackend::Ipvs);
    h.cp.add_binding(backend_binding("b1", 5, 80));
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    h.cp.add_binding(backend_binding("b2", 6, 22));
    h.exec.fail_when("-A -t 198.51.100.1:10002");
    h.agent.request_resync();
    assert_eq!(h.agent.tick().await, TickOutcome::Incomplete);
    assert!(h.agent.cached_binding("b2").await.is_none());

    h.exec.clear_failures();
    h.exec.clear();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    let lines = h.exec.lines();
    assert_eq!(lines.first().map(String::as_str), Some("ipvsadm -C"));
    assert_eq!(lines.len(), 5);
    assert_eq!(
        h.agent.cached_binding_ids().await,
        BTreeSet::from(["b1".to_string(), "b2".to_string()])
    );
}

#[tokio::test]
async fn test_gateway_plumbed_once_and_torn_down() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_subnet(subnet("sub-1", "net-1"));
    h.cp.attach_port("port-1", "sub-1");
    let mut b1 = backend_binding("b1", 5, 80);
    b1.port_id = Some("port-1".to_string());
    h.cp.add_binding(b1);

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    let interfaces = h.cp.gateway_interfaces();
    assert_eq!(interfaces.len(), 1);
    let gw_ip = Ipv4Addr::new(10, 0, 0, 2);
    assert_eq!(interfaces[0].fixed_ips, vec![gw_ip]);
    assert_eq!(h.driver.plug_count(), 1);
    assert_eq!(h.cp.binding("b1").unwrap().gateway, Some(gw_ip));
    let doc = h.exec.last_restore().unwrap();
    assert!(doc.contains(&snat_line("10.0.0.5", 80, gw_ip)));

    h.agent.request_resync();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert_eq!(h.driver.plug_count(), 1);
    assert_eq!(h.cp.gateway_interfaces().len(), 1);

    h.cp.unschedule("b1");
    h.agent.request_resync();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert!(h.cp.gateway_interfaces().is_empty());
    assert_eq!(h.driver.unplug_count(), 1);
    assert!(h.driver.devices().is_empty());
}

#[tokio::test]
async fn test_ipvs_gateway_takes_subnet_gateway() {
    let h = harness(RuleBackend::Ipvs);
    h.cp.add_subnet(subnet("sub-1", "net-1"));
    h.cp.attach_port("port-1", "sub-1");
    let mut b1 = backend_binding("b1", 5, 80);
    b1.port_id = Some("port-1".to_string());
    h.cp.add_binding(b1);

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert_eq!(
        h.cp.binding("b1").unwrap().gateway,
        Some(Ipv4Addr::new(10, 0, 0, 1))
    );
}

#[tokio::test]
async fn test_gateway_failure_defers_assignment() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_subnet(subnet("sub-1", "net-1"));
    h.cp.attach_port("port-1", "sub-1");
    let mut b1 = backend_binding("b1", 5, 80);
    b1.port_id = Some("port-1".to_string());
    h.cp.add_binding(b1);
    h.cp.add_binding(backend_binding("b2", 6, 22));
    h.driver.fail_on("plug");

    assert_eq!(h.agent.tick().await, TickOutcome::Incomplete);
    assert!(h.agent.needs_resync());
    assert_eq!(h.cp.binding("b1").unwrap().status, BindingStatus::Inactive);
    // Bindings without a port are not held up.
    assert!(h.agent.cached_binding("b2").await.is_some());
    assert_eq!(h.cp.gateway_interfaces().len(), 1);

    h.driver.clear_failures();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert_eq!(h.cp.gateway_interfaces().len(), 1);
    assert_eq!(h.driver.plug_count(), 1);
}

#[tokio::test]
async fn test_gateway_failure_keeps_interface() {
    let h = harness(RuleBackend::Iptables);
    h.cp.add_subnet(subnet("sub-1", "net-1"));
    h.cp.attach_port("port-1", "sub-1");
    // Assigned by an earlier run.
    let mut b1 = backend_binding("b1", 5, 80);
    b1.port_id = Some("port-1".to_string());
    b1.status = BindingStatus::Active;
    b1.vserver_id = Some("vs-9".to_string());
    b1.external_ip = Some(EXTERNAL_IP);
    b1.external_port = Some(10009);
    b1.gateway = Some(Ipv4Addr::new(10, 0, 0, 2));
    h.cp.add_binding(b1);
    h.driver.fail_on("plug");

    assert_eq!(h.agent.tick().await, TickOutcome::Incomplete);
    assert!(h.agent.needs_resync());
    assert_eq!(h.cp.gateway_interfaces().len(), 1);
    assert!(h.agent.cached_binding("b1").await.is_some());

    h.driver.clear_failures();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert_eq!(h.cp.gateway_interfaces().len(), 1);
    assert_eq!(h.driver.plug_count(), 1);
}

#[tokio::test]
async fn test_console_bindings_requested_once() {
    let h = harness_with(RuleBackend::Iptables, |c| c.console_enabled = true);
    h.inventory.add_host("192.0.2.21", "compute");
    h.inventory.add_host("192.0.2.22", "network");
    h.inventory.add_host("192.0.2.23", "compute");
    let mut console = mvirt_nat::test_util::new_binding("c1", Ipv4Addr::new(192, 0, 2, 23), 6080);
    console.kind = BindingKind::Hypervisor;
    h.cp.add_binding(console);

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    h.agent.request_resync();
    assert_eq!(h.agent.tick().await, TickOutcome::Converged);

    let created = h.cp.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].fixed_ip, Ipv4Addr::new(192, 0, 2, 21));
    assert_eq!(created[0].kind, BindingKind::Hypervisor);
    assert_eq!(created[0].fixed_port, Some(6080));
    assert!(created[0].shared);
}

#[tokio::test]
async fn test_console_disabled_requests_nothing() {
    let h = harness(RuleBackend::Iptables);
    h.inventory.add_host("192.0.2.21", "compute");

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    assert!(h.cp.created().is_empty());
}

#[tokio::test]
async fn test_user_rules_staged_on_rebuild() {
    let h = harness_with(RuleBackend::Iptables, |c| {
        c.user_rules = vec![mvirt_nat::rules::RawDirective::Chain {
            chain: "OUTPUT".to_string(),
            rule: "-d 203.0.113.9 -j ACCEPT".to_string(),
        }];
    });

    assert_eq!(h.agent.tick().await, TickOutcome::Converged);
    let doc = h.exec.last_restore().unwrap();
    assert!(doc.contains("-A mvirt-nat-OUTPUT -d 203.0.113.9 -j ACCEPT"));
}
