//! NAT agent: keeps the kernel rule set of this host converged with the
//! bindings the control plane assigns to it.
//!
//! Two drivers mutate local state: the periodic reconciliation tick and the
//! binding notifications from the event stream. Both run under one lock
//! owned by the agent. The tick only runs while `needs_resync` is set; any
//! failure sets it again so the next tick retries.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::audit::NatAuditLogger;
use crate::cache::BindingCache;
use crate::clients::{BindingScope, ComputeInventory, ControlPlane, COMPUTE_SERVICE};
use crate::config::AgentConfig;
use crate::error::{NatError, Result};
use crate::gateway::GatewayManager;
use crate::model::{
    AgentStateReport, Binding, BindingKind, BindingStatus, BindingUpdate, GatewayInterface,
    NatEvent, NewBinding,
};
use crate::rules::{NatRule, RuleManager};

const BINARY: &str = "mvirt-nat";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Result of one reconciliation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was pending.
    Skipped,
    Converged,
    /// The tick finished but some step must be retried.
    Incomplete,
    Failed,
}

/// State guarded by the agent lock.
struct SyncState {
    rules: Box<dyn RuleManager>,
    gateways: GatewayManager,
    /// Bindings whose rules are in the kernel.
    cache: BindingCache,
    /// Fixed addresses of compute hosts that already have a console binding.
    compute_hosts: HashSet<Ipv4Addr>,
    /// Stage the whole rule set from scratch on the next tick.
    full_rebuild: bool,
}

pub struct NatAgent {
    config: AgentConfig,
    agent_id: String,
    control_plane: Arc<dyn ControlPlane>,
    inventory: Arc<dyn ComputeInventory>,
    audit: Arc<NatAuditLogger>,
    needs_resync: AtomicBool,
    binding_count: AtomicUsize,
    state: Mutex<SyncState>,
}

impl NatAgent {
    pub fn new(
        config: AgentConfig,
        control_plane: Arc<dyn ControlPlane>,
        inventory: Arc<dyn ComputeInventory>,
        rules: Box<dyn RuleManager>,
        gateways: GatewayManager,
        audit: Arc<NatAuditLogger>,
    ) -> Self {
        Self {
            config,
            agent_id: uuid::Uuid::new_v4().to_string(),
            control_plane,
            inventory,
            audit,
            needs_resync: AtomicBool::new(true),
            binding_count: AtomicUsize::new(0),
            state: Mutex::new(SyncState {
                rules,
                gateways,
                cache: BindingCache::new(),
                compute_hosts: HashSet::new(),
                full_rebuild: true,
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::SeqCst)
    }

    /// Make the next tick run.
    pub fn request_resync(&self) {
        self.needs_resync.store(true, Ordering::SeqCst);
    }

    /// Bindings in the last successful pull.
    pub fn binding_count(&self) -> usize {
        self.binding_count.load(Ordering::SeqCst)
    }

    /// Ids of the bindings whose rules are applied.
    pub async fn cached_binding_ids(&self) -> BTreeSet<String> {
        self.state.lock().await.cache.ids().into_iter().collect()
    }

    pub async fn cached_binding(&self, id: &str) -> Option<Binding> {
        self.state.lock().await.cache.get(id).cloned()
    }

    fn default_gateway(&self) -> Ipv4Addr {
        self.config.local_internal_ip
    }

    // === Reconciliation ===

    /// Run one reconciliation pass if one is pending.
    pub async fn tick(&self) -> TickOutcome {
        if !self.needs_resync() {
            return TickOutcome::Skipped;
        }
        let mut state = self.state.lock().await;
        // Cleared before syncing: anything setting it meanwhile keeps its effect.
        self.needs_resync.store(false, Ordering::SeqCst);

        info!("Synchronizing state");
        match self.sync(&mut state).await {
            Ok(true) => {
                debug!("State converged");
                TickOutcome::Converged
            }
            Ok(false) => {
                warn!("State not fully converged, retrying on next tick");
                self.request_resync();
                TickOutcome::Incomplete
            }
            Err(e) => {
                if e.is_retryable() {
                    error!(error = %e, "Unable to sync NAT agent state");
                } else {
                    error!(error = %e, "Unable to sync NAT agent state (not retryable)");
                }
                self.request_resync();
                TickOutcome::Failed
            }
        }
    }

    /// One reconciliation pass. Returns whether every step completed.
    async fn sync(&self, st: &mut SyncState) -> Result<bool> {
        let pulled = dedupe(
            self.control_plane
                .get_active_bindings(BindingScope::Agent)
                .await?,
        );
        let mut on_address: HashMap<String, Binding> = dedupe(
            self.control_plane
                .get_active_bindings(BindingScope::ExternalIp(self.config.local_external_ip))
                .await?,
        )
        .into_iter()
        .map(|b| (b.id.clone(), b))
        .collect();

        let mut complete = true;
        let mut desired = Vec::with_capacity(pulled.len());
        let mut port_ids = BTreeSet::new();
        for binding in pulled {
            if binding.kind == BindingKind::Hypervisor {
                if let Some(ip) = binding.fixed_ip {
                    st.compute_hosts.insert(ip);
                }
            }
            on_address.remove(&binding.id);
            if let Some(port_id) = &binding.port_id {
                port_ids.insert(port_id.clone());
            }
            let binding = if binding.vserver_id.is_none() {
                let id = binding.id.clone();
                match self.assign(st, binding).await {
                    Ok(assigned) => assigned,
                    Err(e @ NatError::Device { .. }) => {
                        warn!(binding_id = %id, error = %e, "Gateway not ready, assigning later");
                        complete = false;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                binding
            };
            desired.push(binding);
        }

        let rules_converged = self.converge_rules(st, &desired).await?;
        complete &= rules_converged;

        // Left over: on our address but no longer assigned to us. Their rules
        // were dropped by the diff above; the records go only once that landed.
        if rules_converged {
            for id in on_address.into_keys() {
                info!(binding_id = %id, "Deleting stale binding");
                self.control_plane.delete_binding(&id).await?;
                self.audit.stale_binding_deleted(&id);
            }
        } else if !on_address.is_empty() {
            warn!(stale = on_address.len(), "Rules not converged, keeping stale bindings for now");
        }

        complete &= self.converge_gateways(st, &port_ids).await?;
        self.ensure_console_bindings(st).await?;

        self.binding_count.store(desired.len(), Ordering::SeqCst);
        Ok(complete)
    }

    /// Give a new binding a vserver and gateway and mark it ACTIVE upstream.
    async fn assign(&self, st: &mut SyncState, binding: Binding) -> Result<Binding> {
        // Bindings already applied on the same port share its subnet gateway.
        let known = binding.port_id.as_deref().and_then(|port_id| {
            st.cache
                .get_by_port(port_id)
                .into_iter()
                .find_map(|b| b.gateway)
        });
        let gateway = match known {
            Some(gateway) => gateway,
            None => {
                st.gateways
                    .gateway_for_port(binding.port_id.as_deref(), self.default_gateway())
                    .await?
            }
        };
        let vserver = self
            .control_plane
            .get_vserver(self.config.local_external_ip, self.config.external_port_start)
            .await?;

        let update = BindingUpdate {
            external_ip: Some(vserver.external_ip),
            external_port: Some(vserver.external_port),
            vserver_id: Some(vserver.id.clone()),
            gateway: Some(gateway),
            device_id: binding.device_id.clone(),
            status: Some(BindingStatus::Active),
            admin_state_up: Some(true),
        };
        if let Err(e) = self.control_plane.update_binding(&binding.id, &update).await {
            warn!(binding_id = %binding.id, vserver_id = %vserver.id, error = %e, "Binding update failed, releasing vserver");
            if let Err(release) = self.control_plane.update_vserver(&vserver.id, false).await {
                warn!(vserver_id = %vserver.id, error = %release, "Failed to release vserver");
            }
            return Err(e);
        }

        let mut assigned = binding;
        update.apply_to(&mut assigned);
        let endpoint = format!("{}:{}", vserver.external_ip, vserver.external_port);
        info!(binding_id = %assigned.id, vserver_id = %vserver.id, %endpoint, %gateway, "Assigned vserver");
        self.audit
            .vserver_assigned(&assigned.id, &vserver.id, &endpoint);
        Ok(assigned)
    }

    /// Bring the kernel rule set in line with `desired`.
    async fn converge_rules(&self, st: &mut SyncState, desired: &[Binding]) -> Result<bool> {
        let default_gw = self.default_gateway();
        let wanted: Vec<(&Binding, NatRule)> = desired
            .iter()
            .filter_map(|b| b.nat_rule(default_gw).map(|r| (b, r)))
            .collect();

        if st.full_rebuild {
            st.rules.clear();
            for raw in &self.config.user_rules {
                st.rules.add_raw(raw.clone());
            }
            for (_, rule) in &wanted {
                st.rules.add_rule(rule);
            }
            let report = st.rules.apply().await?;

            st.cache.clear();
            for (binding, _) in &wanted {
                st.cache.put((*binding).clone(), binding.port_id.as_deref());
            }
            if !report.is_complete() {
                warn!(failed = report.failed, "Full rule rebuild incomplete");
                return Ok(false);
            }
            st.full_rebuild = false;
            info!(rules = wanted.len(), "Rebuilt NAT rule set");
            self.audit.full_rebuild(wanted.len());
            return Ok(true);
        }

        let wanted_by_id: HashMap<&str, NatRule> =
            wanted.iter().map(|(b, r)| (b.id.as_str(), *r)).collect();

        let removals: Vec<(String, NatRule)> = st
            .cache
            .iter()
            .filter_map(|cached| {
                let rule = cached.nat_rule(default_gw)?;
                match wanted_by_id.get(cached.id.as_str()) {
                    Some(w) if *w == rule => None,
                    _ => Some((cached.id.clone(), rule)),
                }
            })
            .collect();
        let additions: Vec<(Binding, NatRule)> = wanted
            .iter()
            .filter(|(b, r)| {
                st.cache.get(&b.id).and_then(|c| c.nat_rule(default_gw)) != Some(*r)
            })
            .map(|(b, r)| ((*b).clone(), *r))
            .collect();

        if removals.is_empty() && additions.is_empty() {
            return Ok(true);
        }

        for (_, rule) in &removals {
            st.rules.remove_rule(rule);
        }
        for (_, rule) in &additions {
            st.rules.add_rule(rule);
        }
        let report = st.rules.apply().await?;
        if !report.is_complete() {
            // Kernel state is now unknown: rebuild it next time.
            warn!(failed = report.failed, "Rule update incomplete, scheduling full rebuild");
            st.full_rebuild = true;
            return Ok(false);
        }

        for (id, rule) in removals {
            st.cache.remove(&id, None);
            self.audit.binding_removed(&id, &rule.to_string());
        }
        for (binding, rule) in additions {
            self.audit.binding_applied(&binding.id, &rule.to_string());
            let port_id = binding.port_id.clone();
            st.cache.put(binding, port_id.as_deref());
        }
        Ok(true)
    }

    /// Plumb gateways for every subnet in use and tear down the rest.
    async fn converge_gateways(&self, st: &mut SyncState, port_ids: &BTreeSet<String>) -> Result<bool> {
        let mut orphans: HashMap<String, GatewayInterface> = self
            .control_plane
            .get_gateway_interfaces(None)
            .await?
            .into_iter()
            .map(|intf| (intf.port_id.clone(), intf))
            .collect();

        let subnets = if port_ids.is_empty() {
            Vec::new()
        } else {
            let ids: Vec<String> = port_ids.iter().cloned().collect();
            self.control_plane.get_subnets_for_ports(&ids).await?
        };

        let mut complete = true;
        for subnet in &subnets {
            match st.gateways.ensure_gateway(subnet).await {
                Ok(intf) => {
                    orphans.remove(&intf.port_id);
                }
                Err(e @ NatError::Device { .. }) => {
                    warn!(subnet_id = %subnet.id, error = %e, "Failed to plumb gateway");
                    complete = false;
                    // Still in use: must not be torn down below.
                    orphans.retain(|_, intf| intf.network_id != subnet.network_id);
                }
                Err(e) => return Err(e),
            }
        }

        for (port_id, intf) in orphans {
            info!(%port_id, network_id = %intf.network_id, "Removing gateway interface");
            match st.gateways.remove_gateway(&intf).await {
                Ok(()) => self.control_plane.remove_gateway_interface(&port_id).await?,
                Err(e) => {
                    warn!(%port_id, error = %e, "Failed to remove gateway");
                    complete = false;
                }
            }
        }
        Ok(complete)
    }

    /// Request a console binding for every compute host that has none.
    async fn ensure_console_bindings(&self, st: &mut SyncState) -> Result<()> {
        if !self.config.console_enabled {
            return Ok(());
        }
        let hosts = self.inventory.list_compute_hosts().await?;
        for host in hosts.iter().filter(|h| h.service == COMPUTE_SERVICE) {
            let Some(fixed_ip) = resolve_host(&host.host_name).await else {
                warn!(host = %host.host_name, "Cannot resolve compute host to an IPv4 address");
                continue;
            };
            if st.compute_hosts.contains(&fixed_ip) {
                continue;
            }
            info!(host = %host.host_name, %fixed_ip, "Requesting console binding");
            self.control_plane
                .create_binding(&NewBinding {
                    fixed_ip,
                    kind: BindingKind::Hypervisor,
                    fixed_port: Some(self.config.console_port),
                    device_id: None,
                    port_id: None,
                    tenant_id: None,
                    shared: true,
                })
                .await?;
            self.audit
                .console_binding_requested(&host.host_name, &fixed_ip.to_string());
            st.compute_hosts.insert(fixed_ip);
        }
        Ok(())
    }

    // === Event handlers ===

    pub async fn on_binding_created(&self, binding: Binding) -> Result<()> {
        let mut state = self.state.lock().await;
        let result = self.handle_created(&mut state, binding).await;
        self.request_resync();
        result
    }

    async fn handle_created(&self, st: &mut SyncState, binding: Binding) -> Result<()> {
        let default_gw = self.default_gateway();
        if binding.fixed_endpoint().is_none() {
            return Err(NatError::invalid(
                "binding",
                format!("{} has no fixed endpoint", binding.id),
            ));
        }
        // Redelivered notification.
        if st.cache.contains(&binding.id) {
            debug!(binding_id = %binding.id, "Binding already applied");
            return Ok(());
        }

        let binding = if binding.is_assigned() {
            binding
        } else {
            // An earlier delivery may have assigned it before failing to apply.
            match self.control_plane.get_binding(&binding.id).await? {
                Some(stored) if stored.is_assigned() => {
                    debug!(binding_id = %stored.id, "Binding already assigned upstream");
                    stored
                }
                Some(_) => self.assign(st, binding).await?,
                None => {
                    info!(binding_id = %binding.id, "Binding no longer exists, skipping");
                    return Ok(());
                }
            }
        };
        let Some(rule) = binding.nat_rule(default_gw) else {
            return Ok(());
        };

        st.rules.add_rule(&rule);
        let report = st.rules.apply().await?;
        if report.is_complete() {
            self.audit.binding_applied(&binding.id, &rule.to_string());
            let port_id = binding.port_id.clone();
            st.cache.put(binding, port_id.as_deref());
        } else {
            warn!(binding_id = %binding.id, "Binding rule only partially applied");
            st.full_rebuild = true;
        }
        Ok(())
    }

    pub async fn on_binding_deleted(&self, binding: Binding) -> Result<()> {
        let mut state = self.state.lock().await;
        let result = self.handle_deleted(&mut state, binding).await;
        self.request_resync();
        result
    }

    async fn handle_deleted(&self, st: &mut SyncState, binding: Binding) -> Result<()> {
        let default_gw = self.default_gateway();
        // What is in the kernel wins over what the payload recorded.
        let rule = st
            .cache
            .get(&binding.id)
            .and_then(|c| c.nat_rule(default_gw))
            .or_else(|| binding.recorded_rule(default_gw));

        if let Some(rule) = rule {
            st.rules.remove_rule(&rule);
            let report = st.rules.apply().await?;
            if !report.is_complete() {
                warn!(binding_id = %binding.id, "Binding rule only partially removed");
                st.full_rebuild = true;
                return Ok(());
            }
            self.audit.binding_removed(&binding.id, &rule.to_string());
        }
        st.cache.remove(&binding.id, binding.port_id.as_deref());
        Ok(())
    }

    pub fn on_agent_updated(&self, admin_state_up: bool) {
        info!(admin_state_up, "Agent updated");
        self.request_resync();
    }

    pub async fn dispatch(&self, event: NatEvent) -> Result<()> {
        match event {
            NatEvent::BindingCreated(binding) => {
                debug!(binding_id = %binding.id, "Binding created");
                self.on_binding_created(binding).await
            }
            NatEvent::BindingDeleted(binding) => {
                debug!(binding_id = %binding.id, "Binding deleted");
                self.on_binding_deleted(binding).await
            }
            NatEvent::AgentUpdated { admin_state_up } => {
                self.on_agent_updated(admin_state_up);
                Ok(())
            }
        }
    }

    // === Background tasks ===

    /// Consume control-plane notifications until shutdown, reconnecting on error.
    pub async fn watch_events(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.control_plane.watch_events().await {
                Ok(mut stream) => {
                    info!("Watching control plane events");
                    // Events may have been missed while disconnected.
                    self.request_resync();
                    loop {
                        tokio::select! {
                            item = stream.next() => match item {
                                Some(Ok(event)) => {
                                    if let Err(e) = self.dispatch(event).await {
                                        warn!(error = %e, "Failed to handle event");
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "Event stream error");
                                    break;
                                }
                                None => {
                                    info!("Event stream ended");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to watch events"),
            }

            self.request_resync();
            info!("Reconnecting event stream in {} seconds...", RECONNECT_DELAY.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Send one state report.
    pub async fn report_state(&self, start_flag: bool) -> Result<()> {
        let mut configurations = BTreeMap::new();
        configurations.insert(
            "interface_driver".to_string(),
            self.config.interface_driver.as_str().to_string(),
        );
        configurations.insert(
            "rule_backend".to_string(),
            self.config.rule_backend.as_str().to_string(),
        );
        configurations.insert(
            "external_ip".to_string(),
            self.config.local_external_ip.to_string(),
        );
        configurations.insert("bindings".to_string(), self.binding_count().to_string());

        self.control_plane
            .report_state(&AgentStateReport {
                host: self.config.host.clone(),
                agent_id: self.agent_id.clone(),
                binary: BINARY.to_string(),
                start_flag,
                configurations,
                bindings: self.binding_count(),
                reported_at: Utc::now(),
            })
            .await
    }

    /// Periodic state reports until shutdown or until the server refuses them.
    pub async fn report_state_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.config.report_interval.is_zero() {
            return;
        }
        let mut interval = tokio::time::interval(self.config.report_interval);
        let mut start_flag = true;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }
            match self.report_state(start_flag).await {
                Ok(()) => {
                    start_flag = false;
                    debug!("State reported");
                }
                Err(e) if e.rpc_code() == Some(tonic::Code::Unimplemented) => {
                    warn!("Control plane does not accept state reports, stopping");
                    return;
                }
                Err(e) => warn!(error = %e, "Failed reporting state"),
            }
        }
    }

    /// Run the agent until `shutdown` changes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            host = %self.config.host,
            agent_id = %self.agent_id,
            backend = self.config.rule_backend.as_str(),
            "NAT agent started"
        );
        let events = tokio::spawn(Arc::clone(&self).watch_events(shutdown.clone()));
        let reports = tokio::spawn(Arc::clone(&self).report_state_loop(shutdown.clone()));

        let mut interval = tokio::time::interval(self.config.resync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        let _ = events.await;
        let _ = reports.await;
        info!("NAT agent stopped");
    }
}

/// Drop repeated ids, keeping the first occurrence.
fn dedupe(bindings: Vec<Binding>) -> Vec<Binding> {
    let mut seen = HashSet::new();
    bindings
        .into_iter()
        .filter(|b| {
            let first = seen.insert(b.id.clone());
            if !first {
                warn!(binding_id = %b.id, "Duplicate binding in pull, keeping the first");
            }
            first
        })
        .collect()
}

async fn resolve_host(name: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = name.parse() {
        return Some(ip);
    }
    let addrs = tokio::net::lookup_host((name, 0)).await.ok()?;
    addrs.into_iter().find_map(|addr| match addr.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    })
}
