//! Reconciler for maintaining desired state.
//!
//! Walks the declared resources in declaration order and drives each one
//! through the lifecycle orchestrator: refresh, then create, update or
//! replace. Records left in state but no longer declared are deleted newest
//! first. The state is saved after every operation so a failed run can be
//! resumed.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use tracing::{debug, error, info, warn};

use crate::cancel::Cancellation;
use crate::config::{ConfigHasher, ResourceConfig, StackConfig, TimeoutsConfig};
use crate::error::{ConvergeError, Result};
use crate::gateway::{ResourceGateway, ResourceRegistry};
use crate::lifecycle::{
    LifecycleOptions, LifecycleResult, LifecycleState, Orchestrator, ReadOutcome,
    ResourceInstance, pending_attributes,
};
use crate::planner::{ActionType, ChangePlan, PlannedAction, StackPlan};
use crate::resources::ResourceKind;
use crate::schema::AttributeSet;
use crate::state::{HistoryEntry, ResourceRecord, StackOperation, StackState, StateStore};

/// Reconciler for maintaining desired state.
pub struct Reconciler<'a, S: StateStore> {
    /// Configuration.
    config: &'a StackConfig,
    /// Resource kinds and their gateways.
    registry: &'a ResourceRegistry,
    /// State store.
    state_store: &'a S,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Options handed to every orchestrator.
    options: LifecycleOptions,
}

/// Result of a reconciliation or destroy run.
#[derive(Debug, Default, Serialize)]
pub struct ReconciliationResult {
    /// Whether every operation succeeded.
    pub success: bool,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated in place.
    pub updated: usize,
    /// Number of resources deleted and recreated.
    pub replaced: usize,
    /// Number of resources deleted.
    pub deleted: usize,
    /// Number of resources already converged.
    pub unchanged: usize,
    /// Resources not reached because an earlier one failed.
    pub skipped: Vec<String>,
    /// Attributes of partially updated resources still waiting to be applied,
    /// as `resource.attribute`.
    pub pending: Vec<String>,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Final state after the run.
    #[serde(skip)]
    pub final_state: Option<StackState>,
}

/// Result of a refresh run.
#[derive(Debug, Default, Serialize)]
pub struct RefreshReport {
    /// Resources whose observed attributes were refreshed.
    pub refreshed: Vec<String>,
    /// Resources whose remote object no longer exists.
    pub gone: Vec<String>,
    /// Errors encountered.
    pub errors: Vec<String>,
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources that have drifted.
    pub drifted_resources: Vec<DriftedResource>,
    /// Total number of resources in config.
    pub total_resources: usize,
    /// Number of resources tracked in state.
    pub tracked_count: usize,
}

/// One drifted resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftedResource {
    /// Resource name.
    pub name: String,
    /// What an apply would do about it.
    pub action: String,
    /// Why.
    pub reason: String,
    /// Differing attributes.
    pub attributes: Vec<String>,
}

/// What converging one resource did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
    Replaced,
    Unchanged,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler. The resize timeout policy comes from the
    /// provider configuration.
    #[must_use]
    pub fn new(config: &'a StackConfig, registry: &'a ResourceRegistry, state_store: &'a S) -> Self {
        Self {
            config,
            registry,
            state_store,
            hasher: ConfigHasher::new(),
            options: LifecycleOptions {
                resize_timeout_policy: config.provider.resize_timeout_policy,
                cancel: Cancellation::none(),
            },
        }
    }

    /// Threads `cancel` through every remote call and wait.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.options.cancel = cancel;
        self
    }

    /// Builds the kind for a resource type with per-resource overrides.
    fn kind_for(
        &self,
        resource_type: &str,
        timeouts: Option<TimeoutsConfig>,
    ) -> Result<(ResourceKind, &'a dyn ResourceGateway)> {
        let entry = self.registry.get(resource_type)?;
        let mut kind = entry.kind().clone();
        if let Some(timeouts) = timeouts {
            kind = kind.with_timeouts(&timeouts.to_resource_timeouts());
        }
        if let Some(retry) = self.config.provider.conflict_retry {
            kind = kind.with_conflict_retry(retry.to_policy());
        }
        Ok((kind, entry.gateway()))
    }

    fn orchestrator<'k>(
        &self,
        kind: &'k ResourceKind,
        gateway: &'k dyn ResourceGateway,
    ) -> Orchestrator<'k> {
        Orchestrator::new(kind, gateway).with_options(self.options.clone())
    }

    async fn load_state(&self) -> Result<StackState> {
        Ok(self.state_store.load().await?.unwrap_or_else(|| {
            StackState::new(&self.config.project.name, &self.config.project.environment)
        }))
    }

    /// Runs `op` while holding the state lock.
    async fn locked<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.state_store.acquire_lock("").await?;
        debug!("Acquired state lock {}", lock.lock_id);
        let result = op().await;
        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {}", lock.lock_id, e);
        }
        result
    }

    /// Converges every declared resource and deletes undeclared ones.
    ///
    /// Processing stops at the first failed resource; later resources are
    /// reported as skipped and undeclared records are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked, loaded or saved.
    /// Failures of individual resources are reported in the result.
    pub async fn reconcile(&self) -> Result<ReconciliationResult> {
        info!(
            "Starting reconciliation for {}/{}",
            self.config.project.name, self.config.project.environment
        );
        self.locked(|| self.reconcile_locked()).await
    }

    async fn reconcile_locked(&self) -> Result<ReconciliationResult> {
        let config_hash = self.hasher.hash_config(self.config);
        let mut state = self.load_state().await?;
        let mut result = ReconciliationResult::default();
        let mut touched = Vec::new();

        for (i, resource) in self.config.resources.iter().enumerate() {
            if let Some(reason) = self.options.cancel.check() {
                result.errors.push(ConvergeError::from(reason).to_string());
                result.skipped = self.config.resource_names()[i..]
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                break;
            }

            touched.push(resource.name.clone());
            let outcome = self.converge(resource, &mut state).await;
            self.state_store.save(&state).await?;

            match outcome {
                Ok(applied) => result.count(applied),
                Err(e) => {
                    error!("Failed to converge {}: {}", resource.name, e);
                    result.record_failure(&resource.name, &e);
                    result.skipped = self.config.resource_names()[i + 1..]
                        .iter()
                        .map(ToString::to_string)
                        .collect();
                    break;
                }
            }
        }

        if result.errors.is_empty() {
            let declared = self.config.resource_names();
            let orphans: Vec<ResourceRecord> =
                state.orphans(&declared).into_iter().cloned().collect();
            for record in orphans {
                info!("{} is no longer declared, deleting", record.name);
                touched.push(record.name.clone());
                let outcome = self.delete_record(&record, &mut state).await;
                self.state_store.save(&state).await?;
                match outcome {
                    Ok(()) => result.deleted += 1,
                    Err(e) => {
                        error!("Failed to delete {}: {}", record.name, e);
                        result.record_failure(&record.name, &e);
                        break;
                    }
                }
            }
        }

        result.success = result.errors.is_empty();
        if result.success {
            state.config_hash.clone_from(&config_hash);
            state.add_history(HistoryEntry::new(StackOperation::Apply, &config_hash, touched));
        } else {
            state.add_history(HistoryEntry::failed(
                StackOperation::Apply,
                &config_hash,
                touched,
                &result.errors.join("; "),
            ));
        }
        self.state_store.save(&state).await?;

        info!("Reconciliation finished: {}", result.summary());
        result.final_state = Some(state);
        Ok(result)
    }

    /// Converges one resource and records the resulting instance.
    async fn converge(&self, resource: &ResourceConfig, state: &mut StackState) -> Result<Applied> {
        let hash = self.hasher.hash_resource(resource);
        let previous = state.get(&resource.name).cloned();

        // A changed type means a different remote object altogether.
        if let Some(record) = &previous
            && record.instance.resource_type != resource.resource_type
        {
            info!(
                "{} changed type from {} to {}",
                resource.name, record.instance.resource_type, resource.resource_type
            );
            self.delete_record(record, state).await?;
        }
        let previous = state.get(&resource.name).map(|r| (r.instance.clone(), r.config_hash.clone()));

        let (kind, gateway) = self.kind_for(&resource.resource_type, resource.timeouts)?;
        let orchestrator = self.orchestrator(&kind, gateway);
        let (instance, kept_hash) = previous.unzip();

        match Self::converge_instance(&orchestrator, &resource.attributes, instance).await {
            Ok((applied, instance)) => {
                debug!("{} converged ({:?})", resource.name, applied);
                state.record(&resource.name, &hash, instance);
                Ok(applied)
            }
            Err(failure) => {
                let kept_hash = kept_hash.unwrap_or_default();
                state.record(&resource.name, &kept_hash, failure.instance.clone());
                Err(failure.into())
            }
        }
    }

    async fn converge_instance(
        orchestrator: &Orchestrator<'_>,
        desired: &AttributeSet,
        previous: Option<ResourceInstance>,
    ) -> LifecycleResult<(Applied, ResourceInstance)> {
        let Some(mut instance) = previous else {
            let instance = orchestrator.create(desired).await?;
            return Ok((Applied::Created, instance));
        };

        match instance.state {
            LifecycleState::Absent | LifecycleState::Deleted => {
                instance.mark_absent();
                instance.desired = desired.clone();
                let instance = orchestrator.create_instance(instance).await?;
                Ok((Applied::Created, instance))
            }
            LifecycleState::Active => match orchestrator.read(instance).await? {
                ReadOutcome::Gone(mut instance) => {
                    info!(
                        "{} was deleted outside stackconverge, recreating",
                        orchestrator.kind().name()
                    );
                    instance.desired = desired.clone();
                    let instance = orchestrator.create_instance(instance).await?;
                    Ok((Applied::Created, instance))
                }
                ReadOutcome::Found(instance) => {
                    let outcome = orchestrator.update(instance, desired).await?;
                    let applied = if outcome.replaced {
                        Applied::Replaced
                    } else if outcome.groups.is_empty() {
                        Applied::Unchanged
                    } else {
                        Applied::Updated
                    };
                    Ok((applied, outcome.instance))
                }
            },
            LifecycleState::Failed
            | LifecycleState::Creating
            | LifecycleState::Updating
            | LifecycleState::Deleting => {
                warn!(
                    "{} {} was left {}, recreating",
                    orchestrator.kind().name(),
                    instance.id().unwrap_or("-"),
                    instance.state
                );
                let instance = orchestrator.recreate(deletable(instance), desired).await?;
                Ok((Applied::Replaced, instance))
            }
        }
    }

    /// Deletes the remote object of a record and drops the record.
    async fn delete_record(&self, record: &ResourceRecord, state: &mut StackState) -> Result<()> {
        let (kind, gateway) = self.kind_for(&record.instance.resource_type, None)?;
        let orchestrator = self.orchestrator(&kind, gateway);
        match orchestrator.delete(deletable(record.instance.clone())).await {
            Ok(_) => {
                state.remove(&record.name);
                Ok(())
            }
            Err(failure) => {
                state.record(&record.name, &record.config_hash, failure.instance.clone());
                Err(failure.into())
            }
        }
    }

    /// Computes what [`Self::reconcile`] would do without changing anything.
    ///
    /// With `refresh` every tracked object is read first, so out-of-band
    /// changes and deletions show up in the plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded, a resource type is not
    /// registered, desired attributes violate their schema, or a refresh read
    /// fails.
    pub async fn plan(&self, refresh: bool) -> Result<StackPlan> {
        let config_hash = self.hasher.hash_config(self.config);
        let state = self.state_store.load().await?;
        let mut plan = StackPlan::new(&config_hash);

        for resource in &self.config.resources {
            let record = state.as_ref().and_then(|s| s.get(&resource.name));
            plan.actions
                .push(self.plan_resource(resource, record, refresh).await?);
        }

        if let Some(state) = &state {
            for record in state.orphans(&self.config.resource_names()) {
                plan.actions.push(PlannedAction {
                    action_type: ActionType::Delete,
                    resource_name: record.name.clone(),
                    resource_type: record.instance.resource_type.clone(),
                    remote_id: record.instance.id().map(ToString::to_string),
                    reason: String::from("no longer declared"),
                    changes: Vec::new(),
                });
            }
        }

        debug!(
            "Planned {} action(s) for {}",
            plan.changes().count(),
            self.config.project.name
        );
        Ok(plan)
    }

    async fn plan_resource(
        &self,
        resource: &ResourceConfig,
        record: Option<&ResourceRecord>,
        refresh: bool,
    ) -> Result<PlannedAction> {
        let (kind, gateway) = self.kind_for(&resource.resource_type, resource.timeouts)?;
        kind.validate(&resource.attributes)?;

        let action = |action_type, instance: Option<&ResourceInstance>, reason: String| {
            PlannedAction {
                action_type,
                resource_name: resource.name.clone(),
                resource_type: resource.resource_type.clone(),
                remote_id: instance.and_then(ResourceInstance::id).map(ToString::to_string),
                reason,
                changes: Vec::new(),
            }
        };

        let Some(record) = record else {
            return Ok(action(ActionType::Create, None, String::from("not yet created")));
        };
        let instance = &record.instance;

        if instance.resource_type != resource.resource_type {
            return Ok(action(
                ActionType::Replace,
                Some(instance),
                format!("type changed from {}", instance.resource_type),
            ));
        }
        match instance.state {
            LifecycleState::Active => {}
            LifecycleState::Absent | LifecycleState::Deleted => {
                return Ok(action(ActionType::Create, None, String::from("not yet created")));
            }
            state => {
                return Ok(action(
                    ActionType::Replace,
                    Some(instance),
                    format!("previous operation left it {state}"),
                ));
            }
        }

        let orchestrator = self.orchestrator(&kind, gateway);
        let instance = if refresh {
            match orchestrator.read(instance.clone()).await? {
                ReadOutcome::Found(instance) => instance,
                ReadOutcome::Gone(_) => {
                    return Ok(action(
                        ActionType::Create,
                        None,
                        String::from("deleted outside stackconverge"),
                    ));
                }
            }
        } else {
            instance.clone()
        };

        let (diff, change) = orchestrator.plan(&instance, &resource.attributes)?;
        let (action_type, reason) = match &change {
            ChangePlan::Noop => (ActionType::Noop, String::new()),
            ChangePlan::Replace { attributes } => (
                ActionType::Replace,
                format!("{} cannot change in place", attributes.join(", ")),
            ),
            ChangePlan::Update { groups } => (
                ActionType::Update,
                format!(
                    "update {}",
                    groups
                        .iter()
                        .map(|g| g.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ),
        };

        let mut planned = action(action_type, Some(&instance), reason);
        planned.changes = diff.changes;
        Ok(planned)
    }

    /// Checks for drift without applying changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the drift check fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.config.project.name, self.config.project.environment
        );

        let plan = self.plan(true).await?;
        let tracked_count = self
            .state_store
            .load()
            .await?
            .map_or(0, |s| s.resources.len());

        let drifted_resources: Vec<DriftedResource> = plan
            .changes()
            .map(|a| DriftedResource {
                name: a.resource_name.clone(),
                action: a.action_type.to_string(),
                reason: a.reason.clone(),
                attributes: a.changes.iter().map(|c| c.name.clone()).collect(),
            })
            .collect();

        Ok(DriftReport {
            has_drift: !drifted_resources.is_empty(),
            drifted_resources,
            total_resources: self.config.resources.len(),
            tracked_count,
        })
    }

    /// Reads every tracked object and stores what the remote system reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked, loaded or saved.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        self.locked(|| self.refresh_locked()).await
    }

    async fn refresh_locked(&self) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();
        let Some(mut state) = self.state_store.load().await? else {
            info!("No state found, nothing to refresh");
            return Ok(report);
        };

        let records: Vec<ResourceRecord> = state.resources.values().cloned().collect();
        for record in records {
            if record.instance.id().is_none() {
                continue;
            }
            let read = match self.kind_for(&record.instance.resource_type, None) {
                Ok((kind, gateway)) => self
                    .orchestrator(&kind, gateway)
                    .read(record.instance.clone())
                    .await
                    .map_err(ConvergeError::from),
                Err(e) => Err(e),
            };
            match read {
                Ok(ReadOutcome::Found(instance)) => {
                    state.record(&record.name, &record.config_hash, instance);
                    report.refreshed.push(record.name.clone());
                }
                Ok(ReadOutcome::Gone(instance)) => {
                    warn!("{} no longer exists remotely", record.name);
                    state.record(&record.name, &record.config_hash, instance);
                    report.gone.push(record.name.clone());
                }
                Err(e) => {
                    error!("Failed to refresh {}: {}", record.name, e);
                    report.errors.push(format!("{}: {}", record.name, e));
                }
            }
            self.state_store.save(&state).await?;
        }

        let names = report
            .refreshed
            .iter()
            .chain(&report.gone)
            .cloned()
            .collect();
        let entry = if report.errors.is_empty() {
            HistoryEntry::new(StackOperation::Refresh, &state.config_hash, names)
        } else {
            HistoryEntry::failed(
                StackOperation::Refresh,
                &state.config_hash,
                names,
                &report.errors.join("; "),
            )
        };
        state.add_history(entry);
        self.state_store.save(&state).await?;
        Ok(report)
    }

    /// Deletes every tracked resource, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked, loaded or saved.
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        info!(
            "Destroying {}/{}",
            self.config.project.name, self.config.project.environment
        );
        self.locked(|| self.destroy_locked()).await
    }

    async fn destroy_locked(&self) -> Result<ReconciliationResult> {
        let mut result = ReconciliationResult::default();
        let Some(mut state) = self.state_store.load().await? else {
            info!("No state found, nothing to destroy");
            result.success = true;
            return Ok(result);
        };

        let records: Vec<ResourceRecord> = state.newest_first().into_iter().cloned().collect();
        let mut touched = Vec::new();
        for (i, record) in records.iter().enumerate() {
            touched.push(record.name.clone());
            let outcome = self.delete_record(record, &mut state).await;
            self.state_store.save(&state).await?;
            match outcome {
                Ok(()) => result.deleted += 1,
                Err(e) => {
                    error!("Failed to delete {}: {}", record.name, e);
                    result.record_failure(&record.name, &e);
                    result.skipped = records[i + 1..].iter().map(|r| r.name.clone()).collect();
                    break;
                }
            }
        }

        result.success = result.errors.is_empty();
        let entry = if result.success {
            state.config_hash.clear();
            HistoryEntry::new(StackOperation::Destroy, "", touched)
        } else {
            HistoryEntry::failed(
                StackOperation::Destroy,
                &state.config_hash,
                touched,
                &result.errors.join("; "),
            )
        };
        state.add_history(entry);
        self.state_store.save(&state).await?;
        result.final_state = Some(state);
        Ok(result)
    }
}

/// An instance interrupted mid-update cannot be deleted directly.
fn deletable(mut instance: ResourceInstance) -> ResourceInstance {
    if instance.state == LifecycleState::Updating {
        instance.transition(LifecycleState::Failed);
    }
    instance
}

impl ReconciliationResult {
    const fn count(&mut self, applied: Applied) {
        match applied {
            Applied::Created => self.created += 1,
            Applied::Updated => self.updated += 1,
            Applied::Replaced => self.replaced += 1,
            Applied::Unchanged => self.unchanged += 1,
        }
    }

    fn record_failure(&mut self, name: &str, error: &ConvergeError) {
        if let ConvergeError::Operation(failure) = error {
            self.pending.extend(
                pending_attributes(&failure.updates)
                    .into_iter()
                    .map(|attr| format!("{name}.{attr}")),
            );
        }
        self.errors.push(format!("{name}: {error}"));
    }

    /// One-line summary of the counters.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} created, {} updated, {} replaced, {} deleted, {} unchanged",
            self.created, self.updated, self.replaced, self.deleted, self.unchanged
        )
    }
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for resource in &self.drifted_resources {
                write!(f, "  - {} ({})", resource.name, resource.action)?;
                if !resource.reason.is_empty() {
                    write!(f, ": {}", resource.reason)?;
                }
                writeln!(f)?;
            }
        } else {
            write!(f, "No drift detected - state is converged")?;
        }
        Ok(())
    }
}

impl fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Replaced: {}", self.replaced)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        if !self.pending.is_empty() {
            writeln!(f, "  Pending: {}", self.pending.join(", "))?;
        }
        if !self.skipped.is_empty() {
            writeln!(f, "  Skipped: {}", self.skipped.join(", "))?;
        }
        if !self.errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for error in &self.errors {
                writeln!(f, "    - {error}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{GatewayError, StateError};
    use crate::gateway::{GatewayCall, InMemoryGateway};
    use crate::resources;
    use crate::state::LocalStateStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    const NET: &str = "  - name: net\n    type: network\n    attributes:\n      name: private\n";
    const NET_RENAMED: &str = "  - name: net\n    type: network\n    attributes:\n      name: backend\n";
    const SUB: &str = "  - name: sub\n    type: subnet\n    attributes:\n      name: app\n      network_id: n1\n      cidr: 10.0.0.0/24\n      ip_version: 4\n";
    const SUB_MOVED: &str = "  - name: sub\n    type: subnet\n    attributes:\n      name: app\n      network_id: n1\n      cidr: 10.1.0.0/24\n      ip_version: 4\n";
    const EDGE: &str = "  - name: edge\n    type: network\n    attributes:\n      name: public\n";

    struct Fixture {
        _dir: TempDir,
        store: LocalStateStore,
        networks: Arc<InMemoryGateway>,
        subnets: Arc<InMemoryGateway>,
        registry: ResourceRegistry,
    }

    fn fixture_with(subnets: InMemoryGateway) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        let networks = Arc::new(InMemoryGateway::new("network").with_ids(["net-a", "net-b", "net-c"]));
        let subnets = Arc::new(subnets);
        let registry = ResourceRegistry::new()
            .with(resources::network(), networks.clone())
            .with(resources::subnet(), subnets.clone());
        Fixture {
            _dir: dir,
            store,
            networks,
            subnets,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            InMemoryGateway::new("subnet")
                .with_ids(["sub-a", "sub-b"])
                .with_computed(AttributeSet::new().with("gateway_ip", "10.0.0.1")),
        )
    }

    fn stack(resources: &[&str]) -> StackConfig {
        let yaml = format!("project:\n  name: demo\nresources:\n{}", resources.concat());
        ConfigParser::new().parse_yaml(&yaml, None).unwrap()
    }

    async fn apply(fx: &Fixture, config: &StackConfig) -> ReconciliationResult {
        Reconciler::new(config, &fx.registry, &fx.store)
            .reconcile()
            .await
            .unwrap()
    }

    async fn state(fx: &Fixture) -> StackState {
        fx.store.load().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_apply_creates_then_converges() {
        let fx = fixture();
        let config = stack(&[NET, SUB]);

        let first = apply(&fx, &config).await;
        assert!(first.success, "{first}");
        assert_eq!(first.created, 2);

        let saved = state(&fx).await;
        assert_eq!(saved.get("net").unwrap().instance.id(), Some("net-a"));
        assert_eq!(saved.get("sub").unwrap().instance.id(), Some("sub-a"));
        assert_eq!(saved.config_hash, ConfigHasher::new().hash_config(&config));
        assert!(saved.history.last().unwrap().success);

        let second = apply(&fx, &config).await;
        assert!(second.success);
        assert_eq!(second.unchanged, 2);
        assert_eq!(fx.networks.mutations().len(), 1);
        assert_eq!(fx.subnets.mutations().len(), 1);
        assert!(!fx.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_mutable_change_updates_in_place() {
        let fx = fixture();
        apply(&fx, &stack(&[NET])).await;

        let result = apply(&fx, &stack(&[NET_RENAMED])).await;
        assert_eq!(result.updated, 1);
        assert_eq!(
            fx.networks.mutations().last(),
            Some(&GatewayCall::Update(String::from("net-a"), vec![String::from("name")]))
        );
        assert_eq!(state(&fx).await.get("net").unwrap().instance.id(), Some("net-a"));
    }

    #[tokio::test]
    async fn test_immutable_change_replaces() {
        let fx = fixture();
        apply(&fx, &stack(&[SUB])).await;

        let result = apply(&fx, &stack(&[SUB_MOVED])).await;
        assert_eq!(result.replaced, 1);
        assert_eq!(
            fx.subnets.mutations()[1..],
            [
                GatewayCall::Delete(String::from("sub-a")),
                GatewayCall::Create(vec![
                    String::from("cidr"),
                    String::from("enable_dhcp"),
                    String::from("ip_version"),
                    String::from("name"),
                    String::from("network_id"),
                ]),
            ]
        );
        assert_eq!(state(&fx).await.get("sub").unwrap().instance.id(), Some("sub-b"));
    }

    #[tokio::test]
    async fn test_undeclared_resources_deleted_newest_first() {
        let fx = fixture();
        apply(&fx, &stack(&[NET, EDGE, SUB])).await;

        let plan = Reconciler::new(&stack(&[NET]), &fx.registry, &fx.store)
            .plan(false)
            .await
            .unwrap();
        let deletes: Vec<&str> = plan
            .changes()
            .map(|a| a.resource_name.as_str())
            .collect();
        assert_eq!(deletes, ["sub", "edge"]);

        let result = apply(&fx, &stack(&[NET])).await;
        assert_eq!(result.deleted, 2);
        assert_eq!(fx.subnets.mutations().last(), Some(&GatewayCall::Delete(String::from("sub-a"))));
        assert_eq!(fx.networks.mutations().last(), Some(&GatewayCall::Delete(String::from("net-b"))));

        let saved = state(&fx).await;
        assert_eq!(saved.resources.len(), 1);
        assert!(saved.get("net").is_some());
    }

    #[tokio::test]
    async fn test_out_of_band_deletion_is_recreated() {
        let fx = fixture();
        let config = stack(&[NET]);
        apply(&fx, &config).await;
        assert!(fx.networks.remove_object("net-a"));

        let reconciler = Reconciler::new(&config, &fx.registry, &fx.store);
        assert!(reconciler.plan(false).await.unwrap().is_empty());
        let refreshed = reconciler.plan(true).await.unwrap();
        assert_eq!(refreshed.count(ActionType::Create), 1);
        assert_eq!(refreshed.actions[0].reason, "deleted outside stackconverge");

        let result = apply(&fx, &config).await;
        assert_eq!(result.created, 1);
        assert_eq!(state(&fx).await.get("net").unwrap().instance.id(), Some("net-b"));
    }

    #[tokio::test]
    async fn test_failure_stops_and_keeps_progress() {
        let fx = fixture_with(
            InMemoryGateway::new("subnet").with_create_failure(GatewayError::remote(500, "quota")),
        );
        let result = apply(&fx, &stack(&[NET, SUB, EDGE])).await;

        assert!(!result.success);
        assert_eq!(result.created, 1);
        assert_eq!(result.skipped, ["edge"]);
        assert!(result.errors[0].starts_with("sub: "));

        let saved = state(&fx).await;
        assert_eq!(saved.get("net").unwrap().instance.id(), Some("net-a"));
        assert_eq!(saved.get("sub").unwrap().instance.state, LifecycleState::Absent);
        assert!(saved.get("edge").is_none());
        assert!(!saved.history.last().unwrap().success);
        assert!(saved.config_hash.is_empty());
    }

    #[tokio::test]
    async fn test_failed_instance_is_recreated() {
        let fx = fixture();
        let config = stack(&[NET]);
        apply(&fx, &config).await;

        let mut saved = state(&fx).await;
        let mut instance = saved.get("net").unwrap().instance.clone();
        instance.transition(LifecycleState::Failed);
        saved.record("net", "stale", instance);
        fx.store.save(&saved).await.unwrap();

        let plan = Reconciler::new(&config, &fx.registry, &fx.store)
            .plan(false)
            .await
            .unwrap();
        assert_eq!(plan.count(ActionType::Replace), 1);

        let result = apply(&fx, &config).await;
        assert_eq!(result.replaced, 1);
        assert_eq!(
            fx.networks.mutations()[1..],
            [
                GatewayCall::Delete(String::from("net-a")),
                GatewayCall::Create(vec![
                    String::from("admin_state_up"),
                    String::from("name"),
                    String::from("shared"),
                ]),
            ]
        );
        let record = state(&fx).await.get("net").cloned().unwrap();
        assert_eq!(record.instance.state, LifecycleState::Active);
        assert_ne!(record.config_hash, "stale");
    }

    #[tokio::test]
    async fn test_drift_detected_and_repaired() {
        let fx = fixture();
        let config = stack(&[NET]);
        apply(&fx, &config).await;
        fx.networks
            .tamper("net-a", &AttributeSet::new().with("name", "hijacked"));

        let reconciler = Reconciler::new(&config, &fx.registry, &fx.store);
        let report = reconciler.check_drift().await.unwrap();
        assert!(report.has_drift);
        assert_eq!(report.drifted_resources[0].name, "net");
        assert_eq!(report.drifted_resources[0].attributes, ["name"]);
        assert_eq!(report.tracked_count, 1);

        let mutations = fx.networks.mutations().len();
        assert_eq!(mutations, 1);

        apply(&fx, &config).await;
        assert!(reconciler.check_drift().await.unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_plan_is_read_only() {
        let fx = fixture();
        let plan = Reconciler::new(&stack(&[NET, SUB]), &fx.registry, &fx.store)
            .plan(true)
            .await
            .unwrap();

        assert_eq!(plan.count(ActionType::Create), 2);
        assert!(fx.networks.calls().is_empty());
        assert!(!fx.store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_plan_rejects_schema_violation() {
        let fx = fixture();
        let bad = "  - name: net\n    type: network\n    attributes:\n      colour: blue\n";
        let err = Reconciler::new(&stack(&[bad]), &fx.registry, &fx.store)
            .plan(false)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Schema(_)));
    }

    #[tokio::test]
    async fn test_refresh_marks_gone() {
        let fx = fixture();
        let config = stack(&[NET, EDGE]);
        apply(&fx, &config).await;
        fx.networks.remove_object("net-b");

        let report = Reconciler::new(&config, &fx.registry, &fx.store)
            .refresh()
            .await
            .unwrap();
        assert_eq!(report.refreshed, ["net"]);
        assert_eq!(report.gone, ["edge"]);

        let saved = state(&fx).await;
        assert_eq!(saved.get("edge").unwrap().instance.state, LifecycleState::Absent);
        assert_eq!(saved.history.last().unwrap().operation, StackOperation::Refresh);
    }

    #[tokio::test]
    async fn test_destroy_newest_first() {
        let fx = fixture();
        let config = stack(&[NET, EDGE]);
        apply(&fx, &config).await;

        let result = Reconciler::new(&config, &fx.registry, &fx.store)
            .destroy()
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.deleted, 2);
        assert_eq!(
            fx.networks.mutations()[2..],
            [
                GatewayCall::Delete(String::from("net-b")),
                GatewayCall::Delete(String::from("net-a")),
            ]
        );
        assert!(fx.networks.is_empty());
        assert!(state(&fx).await.resources.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_retry_override_applies() {
        let fx = fixture_with(InMemoryGateway::new("subnet").with_delete_conflicts(5));
        apply(&fx, &stack(&[SUB])).await;

        let yaml = "project:\n  name: demo\nprovider:\n  conflict_retry:\n    max_attempts: 2\n    delay_secs: 1\nresources: []\n";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let result = Reconciler::new(&config, &fx.registry, &fx.store)
            .destroy()
            .await
            .unwrap();

        assert!(!result.success);
        let deletes = fx
            .subnets
            .calls()
            .into_iter()
            .filter(|c| matches!(c, GatewayCall::Delete(_)))
            .count();
        assert_eq!(deletes, 2);
        assert_eq!(state(&fx).await.get("sub").unwrap().instance.state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_locked_state_is_refused() {
        let fx = fixture();
        fx.store.acquire_lock("someone-else").await.unwrap();

        let err = Reconciler::new(&stack(&[NET]), &fx.registry, &fx.store)
            .reconcile()
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { .. })));
        assert!(fx.networks.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_everything() {
        let fx = fixture();
        let (handle, cancel) = Cancellation::new();
        handle.cancel();

        let result = Reconciler::new(&stack(&[NET, SUB]), &fx.registry, &fx.store)
            .with_cancellation(cancel)
            .reconcile()
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.skipped, ["net", "sub"]);
        assert!(fx.networks.calls().is_empty());
    }
}
