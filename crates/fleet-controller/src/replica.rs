//! Replica controller — drives one deploy key's host configs toward its
//! declared config.
//!
//! ```text
//!   DeployConfig ─▶ deploy() ─┬─ rollingUpdate: convert legacy in place, prune legacy
//!                             ├─ newDeploy:     add new hosts, lease out legacy
//!                             └─ mixed:         add ceil(N·p), convert the rest
//!                                    │
//!                     SetHostConfig on deploy/expect/{host}/{type}/{name}
//! ```
//!
//! A pass only mutates its own key. Steps are separated by the update
//! policy's `step` so changes roll out as a wave. Per-step failures are
//! collected and returned together; partial progress stays in the store.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fleet_core::{DeployConfig, DeployKey, DeploySpec, DeployVer, HostId, MultiError, UpdatePolicy};
use fleet_placement::{Scheduler, SchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};
use crate::host_config::{HostConfigManager, hc_stat};
use crate::phase_log::{Phase, PhaseEntry, PhaseLog};
use crate::wait::wait_instance_up;

struct LegacyLease {
    generation: u64,
    version: DeployVer,
    token: CancellationToken,
}

pub struct ReplicaController {
    key: DeployKey,
    ctx: Arc<ControllerContext>,
    config: Mutex<Option<DeployConfig>>,
    lease: Arc<Mutex<Option<LegacyLease>>>,
    lease_generation: AtomicU64,
    /// Serializes host-config mutation between passes and lease expiry.
    busy: Arc<tokio::sync::Mutex<()>>,
    log: Mutex<PhaseLog>,
}

impl ReplicaController {
    pub fn new(key: DeployKey, ctx: Arc<ControllerContext>) -> Self {
        Self {
            key,
            ctx,
            config: Mutex::new(None),
            lease: Arc::new(Mutex::new(None)),
            lease_generation: AtomicU64::new(0),
            busy: Arc::new(tokio::sync::Mutex::new(())),
            log: Mutex::new(PhaseLog::default()),
        }
    }

    pub fn key(&self) -> &DeployKey {
        &self.key
    }

    /// Config of the latest pass.
    pub fn config(&self) -> Option<DeployConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The last `n` recorded phases, oldest first.
    pub fn phase_log(&self, n: usize) -> Vec<PhaseEntry> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).tail(n)
    }

    fn record(&self, phase: Phase, detail: impl Into<String>) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(phase, detail);
    }

    // ── Reconciliation ────────────────────────────────────────────

    /// Run one reconciliation pass for `config`.
    pub async fn deploy(&self, config: &DeployConfig, cancel: &CancellationToken) -> ControllerResult<()> {
        let expected = config.expected_version();
        self.record(
            Phase::UpdateConfig,
            format!("{expected} x{} via {}", config.num_of_instance, config.update_policy.name()),
        );
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());

        let _busy = tokio::select! {
            _ = cancel.cancelled() => return Err(ControllerError::Cancelled),
            guard = self.busy.lock() => guard,
        };
        self.record(Phase::Start, expected);
        info!(
            deploy = %self.key,
            version = %expected,
            replicas = config.num_of_instance,
            policy = config.update_policy.name(),
            "reconciliation started"
        );

        let mut pass = Pass {
            ctrl: self,
            config,
            expected,
            cancel,
            errors: MultiError::new(),
        };
        match &config.update_policy {
            UpdatePolicy::RollingUpdate { .. } => pass.rolling_update().await,
            UpdatePolicy::NewDeploy { .. } => pass.new_deploy().await,
            UpdatePolicy::Mixed { new_percent, .. } => pass.mixed(*new_percent).await,
        }
        let errors = pass.errors;

        if cancel.is_cancelled() {
            info!(deploy = %self.key, "reconciliation cancelled");
            return Err(ControllerError::Cancelled);
        }
        if !errors.is_empty() {
            warn!(deploy = %self.key, errors = errors.len(), "reconciliation finished with errors");
            return Err(errors.into());
        }
        let (num_exp, num_legacy) = hc_stat(&self.host_configs(), expected);
        self.record(Phase::DeployUptodate, format!("{num_exp} current, {num_legacy} legacy"));
        info!(deploy = %self.key, version = %expected, num_exp, num_legacy, "reconciliation done");
        Ok(())
    }

    fn host_configs(&self) -> BTreeMap<HostId, DeploySpec> {
        self.ctx.host_configs.list_host_configs(&self.key)
    }

    fn scheduler(&self, config: &DeployConfig) -> Scheduler {
        let mut exclude: HashSet<HostId> = self.host_configs().into_keys().collect();
        exclude.extend(
            self.ctx
                .infor
                .running_instances(&self.key)
                .into_iter()
                .map(|ins| ins.host_id),
        );
        let scheduler = Scheduler::new(
            self.ctx.store.clone(),
            self.key.clone(),
            config.selector.clone(),
            config.resource_required.unwrap_or_default(),
        )
        .exclude(exclude);
        match self.ctx.settings.scheduler_seed {
            Some(seed) => scheduler.with_seed(seed),
            None => scheduler,
        }
    }

    // ── Legacy-version lease ──────────────────────────────────────

    /// Whether legacy replicas are currently tolerated.
    pub fn lease_active(&self) -> bool {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Arm a lease for `version` unless one is already running for it.
    fn ensure_lease(&self, version: &str, timeout: Duration) {
        let current = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|l| l.version == version) {
            return;
        }
        drop(current);
        self.arm_lease(version, timeout);
    }

    /// Restart the lease clock for the config's expected version.
    pub fn renew_lease(&self) {
        if let Some(config) = self.config() {
            let timeout = self.lease_timeout(&config);
            self.arm_lease(config.expected_version(), timeout);
        }
    }

    /// Drop the lease without touching host configs.
    pub fn revoke_lease(&self) {
        let prev = self.lease.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(prev) = prev {
            prev.token.cancel();
            debug!(deploy = %self.key, version = %prev.version, "legacy lease revoked");
        }
    }

    fn lease_timeout(&self, config: &DeployConfig) -> Duration {
        self.ctx
            .settings
            .legacy_timeout
            .unwrap_or_else(|| config.update_policy.timeout())
    }

    fn arm_lease(&self, version: &str, timeout: Duration) {
        let generation = self.lease_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let prev = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(LegacyLease {
                generation,
                version: version.to_string(),
                token: token.clone(),
            });
        if let Some(prev) = prev {
            prev.token.cancel();
        }
        info!(deploy = %self.key, %version, ?timeout, "legacy lease armed");

        let slot = self.lease.clone();
        let busy = self.busy.clone();
        let host_configs = self.ctx.host_configs.clone();
        let key = self.key.clone();
        let version = version.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            let _busy = tokio::select! {
                _ = token.cancelled() => return,
                guard = busy.lock() => guard,
            };
            {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.as_ref().is_some_and(|l| l.generation == generation) {
                    *slot = None;
                }
            }
            info!(deploy = %key, %version, "legacy lease expired");
            if let Err(e) = remove_legacy_host_configs(&host_configs, &key, &version).await {
                warn!(deploy = %key, error = %e, "pruning legacy replicas failed");
            }
        });
    }

    // ── Audit and teardown ────────────────────────────────────────

    /// Read-only comparison of declared, configured and reported state.
    pub fn check_status(&self) -> Result<(), MultiError> {
        let Some(config) = self.config() else {
            return Ok(());
        };
        let expected = config.expected_version();
        let hc = self.host_configs();
        let (num_exp, num_legacy) = hc_stat(&hc, expected);
        let mut errors = MultiError::new();

        if num_exp != config.num_of_instance {
            errors.push(ControllerError::Divergence(format!(
                "{}: {num_exp} replicas of {expected} configured, {} declared",
                self.key, config.num_of_instance
            )));
        }
        if num_legacy > 0 && !self.lease_active() {
            errors.push(ControllerError::Divergence(format!(
                "{}: {num_legacy} legacy replicas without a legacy lease",
                self.key
            )));
        }

        let mut wanted: BTreeMap<DeployVer, u32> = BTreeMap::new();
        for spec in hc.values() {
            for (version, v) in &spec.info {
                *wanted.entry(version.clone()).or_default() += v.num;
            }
        }
        let mut running: BTreeMap<DeployVer, u32> = BTreeMap::new();
        for ins in self.ctx.infor.running_instances(&self.key) {
            *running.entry(ins.version).or_default() += 1;
        }
        let versions: HashSet<&DeployVer> = wanted.keys().chain(running.keys()).collect();
        let mut versions: Vec<_> = versions.into_iter().collect();
        versions.sort();
        for version in versions {
            let want = wanted.get(version).copied().unwrap_or(0);
            let have = running.get(version).copied().unwrap_or(0);
            if want != have {
                errors.push(ControllerError::Divergence(format!(
                    "{}: {have} running instances of {version}, {want} configured",
                    self.key
                )));
            }
        }
        errors.into_result()
    }

    /// Stop the lease and remove every host config of this key.
    pub async fn destroy(&self) -> Result<(), MultiError> {
        self.revoke_lease();
        let _busy = self.busy.lock().await;
        let hosts: Vec<HostId> = self.host_configs().into_keys().collect();
        self.ctx.host_configs.delete_host_configs(&self.key, &hosts).await?;
        info!(deploy = %self.key, hosts = hosts.len(), "deployment destroyed");
        Ok(())
    }
}

/// Strip every version except `expected` from the key's host configs.
/// Returns how many replicas were dropped.
pub async fn remove_legacy_host_configs(
    host_configs: &HostConfigManager,
    key: &DeployKey,
    expected: &str,
) -> Result<u32, MultiError> {
    let mut errors = MultiError::new();
    let mut removed = 0;
    for (host, mut spec) in host_configs.list_host_configs(key) {
        if !spec.has_legacy(expected) {
            continue;
        }
        let dropped = spec.retain_only(expected);
        match host_configs.set_host_config(key, &host, spec).await {
            Ok(()) => removed += dropped,
            Err(e) => errors.push(e),
        }
    }
    if removed > 0 {
        info!(deploy = %key, removed, "legacy replicas pruned");
    }
    errors.into_result().map(|()| removed)
}

// ── One pass ──────────────────────────────────────────────────────

struct Pass<'a> {
    ctrl: &'a ReplicaController,
    config: &'a DeployConfig,
    expected: &'a str,
    cancel: &'a CancellationToken,
    errors: MultiError,
}

impl Pass<'_> {
    fn stat(&self) -> (u32, u32) {
        hc_stat(&self.ctrl.host_configs(), self.expected)
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep one step. False when cancelled meanwhile.
    async fn step(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.update_policy.step()) => true,
        }
    }

    async fn set(&mut self, host: &str, spec: DeploySpec) -> bool {
        let detail = format!("{host}: {}", describe(&spec));
        match self
            .ctrl
            .ctx
            .host_configs
            .set_host_config(&self.ctrl.key, host, spec)
            .await
        {
            Ok(()) => {
                self.ctrl.record(Phase::UpdateNodeConfig, detail);
                true
            }
            Err(e) => {
                warn!(deploy = %self.ctrl.key, %host, error = %e, "host config write failed");
                self.errors.push(e);
                false
            }
        }
    }

    async fn wait_up(&mut self, host: &str) {
        let ctx = &self.ctrl.ctx;
        if !ctx.settings.wait.enabled {
            return;
        }
        self.ctrl.record(Phase::WaitingInstanceUp, host);
        let result = wait_instance_up(
            &ctx.store,
            &ctx.keyspace,
            host,
            &self.ctrl.key,
            self.expected,
            &self.config.restart_policy,
            &ctx.settings.wait,
            self.config.update_policy.timeout(),
            self.cancel,
        )
        .await;
        match result {
            Ok(ins) => debug!(deploy = %self.ctrl.key, %host, instance = %ins.id, "replica up"),
            Err(ControllerError::Cancelled) => {}
            Err(e) => {
                warn!(deploy = %self.ctrl.key, %host, error = %e, "replica did not come up");
                self.errors.push(e);
            }
        }
    }

    fn settle_legacy(&self) {
        if self.cancelled() {
            return;
        }
        let (_, num_legacy) = self.stat();
        if num_legacy == 0 {
            self.ctrl.revoke_lease();
        } else {
            let timeout = self.ctrl.lease_timeout(self.config);
            self.ctrl.ensure_lease(self.expected, timeout);
        }
    }

    // ── Policies ──────────────────────────────────────────────────

    async fn rolling_update(&mut self) {
        let target = self.config.num_of_instance;
        let (num_exp, num_unexp) = self.stat();
        if num_exp > target {
            self.remove_expect_instances(num_exp - target).await;
        } else if num_exp < target {
            let mut num_update = target - num_exp;
            if num_update > num_unexp {
                self.add_instances(num_update - num_unexp).await;
                num_update = num_unexp;
            }
            self.update_instances(num_update).await;
        }
        if self.cancelled() {
            return;
        }
        if let Err(e) = remove_legacy_host_configs(
            &self.ctrl.ctx.host_configs,
            &self.ctrl.key,
            self.expected,
        )
        .await
        {
            self.errors.extend(e);
        }
        self.ctrl.revoke_lease();
    }

    async fn new_deploy(&mut self) {
        let target = self.config.num_of_instance;
        let (num_exp, _) = self.stat();
        if num_exp > target {
            self.remove_expect_instances(num_exp - target).await;
        } else if num_exp < target {
            self.add_instances(target - num_exp).await;
        }
        self.settle_legacy();
    }

    /// Scale down first, then split the shortfall between new hosts and
    /// in-place conversions.
    async fn mixed(&mut self, new_percent: f64) {
        let target = self.config.num_of_instance;
        let (num_exp, _) = self.stat();
        if num_exp > target {
            self.remove_expect_instances(num_exp - target).await;
        }

        let (num_exp, num_legacy) = self.stat();
        let need = target.saturating_sub(num_exp);
        if need > 0 && !self.cancelled() {
            if num_legacy == 0 {
                self.add_instances(need).await;
            } else {
                let (add, convert) = mixed_split(target, new_percent, need, num_legacy);
                debug!(deploy = %self.ctrl.key, need, add, convert, "mixed split");
                let added = self.add_instances(add).await;
                if added > 0 && convert > 0 && !self.step().await {
                    return;
                }
                self.update_instances(convert).await;
            }
        }
        self.settle_legacy();
    }

    // ── Steps ─────────────────────────────────────────────────────

    /// Place `num` new replicas of the expected version.
    async fn add_instances(&mut self, num: u32) -> u32 {
        if num == 0 {
            return 0;
        }
        self.ctrl.record(Phase::SchedulerHosts, format!("{num} new"));
        let mut scheduler = self.ctrl.scheduler(self.config);
        let mut added = 0;
        for i in 0..num {
            if self.cancelled() {
                break;
            }
            if i > 0 && !self.step().await {
                break;
            }
            let host = match scheduler.next_host().await {
                Ok(host) => host,
                Err(SchedulerError::AlreadyExists(host)) => {
                    warn!(deploy = %self.ctrl.key, %host, "no fresh host left, co-locating");
                    host
                }
                Err(e @ SchedulerError::NoHostMeetCondition(_)) => {
                    warn!(deploy = %self.ctrl.key, error = %e, "no host meets the selector");
                    self.errors.push(e);
                    break;
                }
                Err(e) => {
                    warn!(deploy = %self.ctrl.key, error = %e, "scheduling failed");
                    self.errors.push(e);
                    continue;
                }
            };
            let mut spec = self
                .ctrl
                .ctx
                .host_configs
                .get_host_config(&self.ctrl.key, &host)
                .unwrap_or_default();
            spec.bump(self.expected, &self.config.values);
            if self.set(&host, spec).await {
                info!(deploy = %self.ctrl.key, %host, version = %self.expected, "replica added");
                added += 1;
                self.wait_up(&host).await;
            }
        }
        added
    }

    /// Convert up to `num` legacy replicas to the expected version, one per
    /// host per step.
    async fn update_instances(&mut self, num: u32) -> u32 {
        let mut done = 0;
        while done < num && !self.cancelled() {
            let mut progressed = false;
            for (host, mut spec) in self.ctrl.host_configs() {
                if done >= num || self.cancelled() {
                    break;
                }
                if !spec.has_legacy(self.expected) {
                    continue;
                }
                if done > 0 && !self.step().await {
                    return done;
                }
                let Some(from) = spec.decrement_legacy(self.expected) else {
                    continue;
                };
                spec.bump(self.expected, &self.config.values);
                if self.set(&host, spec).await {
                    info!(deploy = %self.ctrl.key, %host, %from, to = %self.expected, "replica converted");
                    done += 1;
                    progressed = true;
                    self.wait_up(&host).await;
                }
            }
            if !progressed {
                break;
            }
        }
        done
    }

    /// Drop `num` replicas of the expected version, one per host per step.
    async fn remove_expect_instances(&mut self, num: u32) -> u32 {
        let mut removed = 0;
        while removed < num && !self.cancelled() {
            let mut progressed = false;
            for (host, mut spec) in self.ctrl.host_configs() {
                if removed >= num || self.cancelled() {
                    break;
                }
                if spec.num(self.expected) == 0 {
                    continue;
                }
                if removed > 0 && !self.step().await {
                    return removed;
                }
                spec.decrement(self.expected);
                if self.set(&host, spec).await {
                    info!(deploy = %self.ctrl.key, %host, version = %self.expected, "replica removed");
                    removed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        removed
    }
}

/// `(new hosts, in-place conversions)` for a mixed pass that is `need`
/// replicas short while `num_legacy` legacy replicas exist.
pub fn mixed_split(target: u32, new_percent: f64, need: u32, num_legacy: u32) -> (u32, u32) {
    let new_total = ((f64::from(target) * new_percent).ceil() as u32).min(target);
    let convert = num_legacy.min(target - new_total).min(need);
    let add = (need - convert).min(new_total.saturating_sub(convert));
    (add, convert)
}

fn describe(spec: &DeploySpec) -> String {
    if spec.is_empty() {
        return "removed".to_string();
    }
    spec.info
        .iter()
        .map(|(version, v)| format!("{version}={}", v.num))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_split_cases() {
        // Half new: one new host, one conversion.
        assert_eq!(mixed_split(3, 0.5, 3, 3), (1, 1));
        // All new behaves like newDeploy.
        assert_eq!(mixed_split(3, 1.0, 3, 3), (3, 0));
        // None new behaves like rollingUpdate.
        assert_eq!(mixed_split(3, 0.0, 3, 3), (0, 3));
        // Second pass with one replica still short.
        assert_eq!(mixed_split(3, 0.5, 1, 2), (0, 1));
    }

    #[test]
    fn describe_spec() {
        let mut spec = DeploySpec::single("v1", 2);
        spec.bump("v2", &BTreeMap::new());
        assert_eq!(describe(&spec), "v1=2,v2=1");
        assert_eq!(describe(&DeploySpec::default()), "removed");
    }
}
