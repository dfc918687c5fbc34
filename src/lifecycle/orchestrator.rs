//! Lifecycle orchestrator.
//!
//! Sequences create, read, update and delete for one resource instance
//! against its gateway. Every failure comes back as a [`LifecycleFailure`]
//! carrying the phase that failed and the last known instance, so remote IDs
//! and partially applied updates are never lost.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::error::{ConvergeError, ErrorClass, GatewayError, LifecycleError, SchemaViolation};
use crate::gateway::{ResourceGateway, ResourceRegistry};
use crate::planner::{ChangePlan, DiffEngine, DiffResult, GroupUpdate};
use crate::poller::{PollSpec, StatePoller};
use crate::resources::{ResourceKind, UpdateProtocol};
use crate::schema::AttributeSet;

use super::instance::{LifecycleState, ResourceInstance};
use super::retry::RetryFailure;
use super::update::{GroupOutcome, GroupStatus};

/// What to do when a resize never reaches "awaiting confirmation".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeTimeoutPolicy {
    /// Leave the resize unconfirmed and mark the instance failed.
    #[default]
    LeaveUnconfirmed,
    /// Also issue a best-effort revert.
    Revert,
}

/// Caller-supplied knobs for lifecycle operations.
#[derive(Debug, Clone, Default)]
pub struct LifecycleOptions {
    /// Resize failure handling.
    pub resize_timeout_policy: ResizeTimeoutPolicy,
    /// Cancellation threaded through every remote call and sleep.
    pub cancel: Cancellation,
}

/// Lifecycle phase, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Checking desired attributes against the schema.
    Validate,
    /// Issuing the create call.
    Create,
    /// Waiting for a new object to become active.
    CreateWait,
    /// Reading the object back.
    Refresh,
    /// Applying update groups.
    Update,
    /// Issuing the delete call.
    Delete,
    /// Waiting for the object to disappear.
    DeleteWait,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validate => "validate",
            Self::Create => "create",
            Self::CreateWait => "create wait",
            Self::Refresh => "refresh",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::DeleteWait => "delete wait",
        };
        write!(f, "{s}")
    }
}

/// A failed lifecycle operation and everything known at the time.
#[derive(Debug, thiserror::Error)]
#[error("{phase} of {kind} failed: {source}", kind = .instance.resource_type)]
pub struct LifecycleFailure {
    /// Phase that failed.
    pub phase: Phase,
    /// Last known instance state.
    pub instance: ResourceInstance,
    /// Update groups processed before the failure.
    pub updates: Vec<GroupOutcome>,
    /// The underlying error.
    pub source: ConvergeError,
}

impl LifecycleFailure {
    fn boxed(
        phase: Phase,
        instance: ResourceInstance,
        updates: Vec<GroupOutcome>,
        source: impl Into<ConvergeError>,
    ) -> Box<Self> {
        Box::new(Self {
            phase,
            instance,
            updates,
            source: source.into(),
        })
    }
}

/// Result type of lifecycle operations.
pub type LifecycleResult<T> = std::result::Result<T, Box<LifecycleFailure>>;

/// Outcome of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The object exists; the instance holds fresh observed attributes.
    Found(ResourceInstance),
    /// The object no longer exists; the instance is absent with its ID cleared.
    Gone(ResourceInstance),
}

impl ReadOutcome {
    /// Returns the instance in either case.
    #[must_use]
    pub fn into_instance(self) -> ResourceInstance {
        match self {
            Self::Found(instance) | Self::Gone(instance) => instance,
        }
    }
}

/// Outcome of an update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// The converged instance.
    pub instance: ResourceInstance,
    /// One entry per update group applied.
    pub groups: Vec<GroupOutcome>,
    /// True if the instance was deleted and recreated.
    pub replaced: bool,
}

/// Drives one resource instance through its lifecycle.
pub struct Orchestrator<'a> {
    kind: &'a ResourceKind,
    gateway: &'a dyn ResourceGateway,
    options: LifecycleOptions,
    diff: DiffEngine,
}

impl fmt::Debug for Orchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("kind", &self.kind.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator with default options.
    #[must_use]
    pub fn new(kind: &'a ResourceKind, gateway: &'a dyn ResourceGateway) -> Self {
        Self {
            kind,
            gateway,
            options: LifecycleOptions::default(),
            diff: DiffEngine::new(),
        }
    }

    /// Creates an orchestrator for a registered resource type.
    ///
    /// # Errors
    ///
    /// Returns an error if the type is not registered.
    pub fn for_type(
        registry: &'a ResourceRegistry,
        resource_type: &str,
    ) -> Result<Self, LifecycleError> {
        let entry = registry.get(resource_type)?;
        Ok(Self::new(entry.kind(), entry.gateway()))
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: LifecycleOptions) -> Self {
        self.options = options;
        self
    }

    /// Resource kind being driven.
    #[must_use]
    pub const fn kind(&self) -> &ResourceKind {
        self.kind
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, ConvergeError> {
        match self.options.cancel.run(fut).await {
            Ok(result) => result.map_err(ConvergeError::from),
            Err(reason) => Err(ConvergeError::from(reason)),
        }
    }

    async fn wait(&self, spec: &PollSpec, id: &str) -> Result<String, ConvergeError> {
        let gateway = self.gateway;
        debug!(
            "Waiting for {} {} to reach {}",
            self.kind.name(),
            id,
            spec.target
        );
        StatePoller::wait_for_state(spec, &self.options.cancel, move || gateway.status(id))
            .await
            .map_err(ConvergeError::from)
    }

    /// Computes the diff and change plan for moving `instance` to `desired`.
    ///
    /// # Errors
    ///
    /// Returns a schema violation if `desired` does not fit the schema.
    pub fn plan(
        &self,
        instance: &ResourceInstance,
        desired: &AttributeSet,
    ) -> Result<(DiffResult, ChangePlan), SchemaViolation> {
        let diff = self
            .diff
            .diff(desired, &instance.observed, self.kind.schema())?;
        let plan = ChangePlan::from_diff(&diff, self.kind);
        Ok((diff, plan))
    }

    /// Creates a new remote object from `desired`.
    ///
    /// # Errors
    ///
    /// Fails on schema violations, a failed create call, or a create poll
    /// that times out or sees an unexpected status. After the create call
    /// succeeded the instance in the failure keeps its remote ID.
    pub async fn create(&self, desired: &AttributeSet) -> LifecycleResult<ResourceInstance> {
        let mut instance = ResourceInstance::new(self.kind.name());
        instance.desired = desired.clone();
        self.create_instance(instance).await
    }

    /// Creates the remote object for an absent instance using its desired attributes.
    ///
    /// # Errors
    ///
    /// See [`Self::create`]. Also fails if the instance is not absent.
    pub async fn create_instance(
        &self,
        mut instance: ResourceInstance,
    ) -> LifecycleResult<ResourceInstance> {
        if instance.state != LifecycleState::Absent {
            let state = instance.state.to_string();
            return Err(LifecycleFailure::boxed(
                Phase::Create,
                instance,
                Vec::new(),
                LifecycleError::InvalidTransition {
                    operation: String::from("create"),
                    state,
                },
            ));
        }

        if let Err(violation) = self.kind.validate(&instance.desired) {
            return Err(LifecycleFailure::boxed(
                Phase::Validate,
                instance,
                Vec::new(),
                violation,
            ));
        }

        let mut request = self.kind.schema().with_defaults(&instance.desired);
        self.kind.generate_missing(&mut request);
        let created = match self.call(self.gateway.create(&request)).await {
            Ok(created) => created,
            Err(e) => return Err(LifecycleFailure::boxed(Phase::Create, instance, Vec::new(), e)),
        };

        info!("Created {} {}", self.kind.name(), created.id);
        instance.id = Some(created.id.clone());
        instance.observed = request;
        instance.observed.merge(&created.observed);
        instance.remote_status = created.status;
        instance.transition(LifecycleState::Creating);

        if let Some(spec) = self.kind.create_poll() {
            match self.wait(spec, &created.id).await {
                Ok(status) => instance.remote_status = Some(status),
                Err(e) => {
                    if !is_cancelled(&e) {
                        instance.transition(LifecycleState::Failed);
                    }
                    warn!(
                        "{} {} did not become active: {}",
                        self.kind.name(),
                        created.id,
                        e
                    );
                    return Err(LifecycleFailure::boxed(
                        Phase::CreateWait,
                        instance,
                        Vec::new(),
                        e,
                    ));
                }
            }
        }

        instance.transition(LifecycleState::Active);
        self.refresh(instance, Vec::new()).await
    }

    /// Reads observed attributes into an active instance.
    async fn refresh(
        &self,
        mut instance: ResourceInstance,
        updates: Vec<GroupOutcome>,
    ) -> LifecycleResult<ResourceInstance> {
        let Some(id) = instance.id().map(ToString::to_string) else {
            return Err(LifecycleFailure::boxed(
                Phase::Refresh,
                instance,
                updates,
                LifecycleError::MissingId {
                    operation: String::from("refresh"),
                },
            ));
        };
        match self.call(self.gateway.read(&id)).await {
            Ok(observed) => {
                instance.observed.merge(&observed.attributes);
                instance.remote_status = Some(observed.status);
                Ok(instance)
            }
            Err(e) => Err(LifecycleFailure::boxed(Phase::Refresh, instance, updates, e)),
        }
    }

    /// Refreshes an instance from the remote system.
    ///
    /// Reported attributes replace the observed ones. Declared attributes
    /// the remote system leaves out keep their previous values. A not-found
    /// answer is not an error: the instance comes back as
    /// [`ReadOutcome::Gone`], absent with its ID cleared.
    ///
    /// # Errors
    ///
    /// Fails if the instance has no ID or the read fails with anything but
    /// not-found.
    pub async fn read(&self, mut instance: ResourceInstance) -> LifecycleResult<ReadOutcome> {
        let Some(id) = instance.id().map(ToString::to_string) else {
            return Err(LifecycleFailure::boxed(
                Phase::Refresh,
                instance,
                Vec::new(),
                LifecycleError::MissingId {
                    operation: String::from("read"),
                },
            ));
        };

        match self.call(self.gateway.read(&id)).await {
            Ok(observed) => {
                let previous = std::mem::replace(&mut instance.observed, observed.attributes);
                // Declared attributes the remote system does not report keep
                // their last known value.
                for (name, value) in &previous {
                    if self.kind.schema().get(name).is_some() && !instance.observed.contains(name) {
                        instance.observed.insert(name.clone(), value.clone());
                    }
                }
                instance.remote_status = Some(observed.status);
                instance.updated_at = chrono::Utc::now();
                Ok(ReadOutcome::Found(instance))
            }
            Err(ConvergeError::Gateway(e)) if e.is_not_found() => {
                info!("{} {} no longer exists", self.kind.name(), id);
                instance.mark_absent();
                Ok(ReadOutcome::Gone(instance))
            }
            Err(e) => Err(LifecycleFailure::boxed(Phase::Refresh, instance, Vec::new(), e)),
        }
    }

    /// Converges an active instance to `desired`.
    ///
    /// Immutable changes replace the object. Otherwise each update group is
    /// applied with its own remote call; processing stops at the first failed
    /// group and later groups are skipped.
    ///
    /// # Errors
    ///
    /// Fails if the instance is not active, `desired` violates the schema, or
    /// an update group fails. The failure carries the per-group outcomes and
    /// an instance whose observed attributes include every applied group.
    pub async fn update(
        &self,
        instance: ResourceInstance,
        desired: &AttributeSet,
    ) -> LifecycleResult<UpdateOutcome> {
        if !instance.is_active() {
            let state = instance.state.to_string();
            return Err(LifecycleFailure::boxed(
                Phase::Update,
                instance,
                Vec::new(),
                LifecycleError::InvalidTransition {
                    operation: String::from("update"),
                    state,
                },
            ));
        }

        if let Err(violation) = self.kind.validate(desired) {
            return Err(LifecycleFailure::boxed(
                Phase::Validate,
                instance,
                Vec::new(),
                violation,
            ));
        }

        let plan = match self.plan(&instance, desired) {
            Ok((_, plan)) => plan,
            Err(violation) => {
                return Err(LifecycleFailure::boxed(
                    Phase::Validate,
                    instance,
                    Vec::new(),
                    violation,
                ));
            }
        };

        match plan {
            ChangePlan::Noop => {
                debug!("{} already converged", self.kind.name());
                let mut instance = instance;
                instance.desired = desired.clone();
                Ok(UpdateOutcome {
                    instance,
                    groups: Vec::new(),
                    replaced: false,
                })
            }
            ChangePlan::Replace { attributes } => {
                info!(
                    "Replacing {} {}: {} cannot change in place",
                    self.kind.name(),
                    instance.id().unwrap_or("-"),
                    attributes.join(", ")
                );
                let instance = self.recreate(instance, desired).await?;
                Ok(UpdateOutcome {
                    instance,
                    groups: Vec::new(),
                    replaced: true,
                })
            }
            ChangePlan::Update { groups } => self.apply_groups(instance, desired, &groups).await,
        }
    }

    /// Deletes the remote object, then creates a new one from `desired`.
    ///
    /// # Errors
    ///
    /// Fails if either the delete or the create fails.
    pub async fn recreate(
        &self,
        instance: ResourceInstance,
        desired: &AttributeSet,
    ) -> LifecycleResult<ResourceInstance> {
        let mut instance = self.delete(instance).await?;
        instance.mark_absent();
        instance.desired = desired.clone();
        self.create_instance(instance).await
    }

    async fn apply_groups(
        &self,
        mut instance: ResourceInstance,
        desired: &AttributeSet,
        groups: &[GroupUpdate],
    ) -> LifecycleResult<UpdateOutcome> {
        let Some(id) = instance.id().map(ToString::to_string) else {
            return Err(LifecycleFailure::boxed(
                Phase::Update,
                instance,
                Vec::new(),
                LifecycleError::MissingId {
                    operation: String::from("update"),
                },
            ));
        };

        let schema = self.kind.schema();
        let desired_full = schema.with_defaults(desired);
        let mut outcomes = Vec::with_capacity(groups.len());
        let mut failure: Option<(ConvergeError, bool)> = None;

        instance.transition(LifecycleState::Updating);

        for group in groups {
            if failure.is_some() {
                outcomes.push(outcome(group, GroupStatus::Skipped));
                continue;
            }

            let mut attrs = desired_full.subset(group.attributes.iter().map(String::as_str));
            for name in &group.attributes {
                if !attrs.contains(name)
                    && let Some(decl) = schema.get(name)
                {
                    attrs.insert(name.clone(), decl.attr_type.empty_value());
                }
            }

            info!(
                "Updating {} {} group {} ({})",
                self.kind.name(),
                id,
                group.name,
                group.attributes.join(", ")
            );

            let result = match group.protocol {
                UpdateProtocol::InPlace => self
                    .apply_in_place(&id, &attrs)
                    .await
                    .map_err(|e| (e, false)),
                UpdateProtocol::Resize => self.apply_resize(&id, &attrs).await,
            };

            match result {
                Ok(observed) => {
                    instance.observed.merge(&attrs);
                    instance.observed.merge(&observed);
                    outcomes.push(outcome(group, GroupStatus::Applied));
                }
                Err((e, broken)) => {
                    warn!(
                        "Update group {} of {} {} failed: {}",
                        group.name,
                        self.kind.name(),
                        id,
                        e
                    );
                    outcomes.push(outcome(group, GroupStatus::Failed(e.to_string())));
                    failure = Some((e, broken));
                }
            }
        }

        if let Some((source, broken)) = failure {
            // A cancelled update stays in flight, like a cancelled create or delete.
            if !is_cancelled(&source) {
                instance.transition(if broken {
                    LifecycleState::Failed
                } else {
                    LifecycleState::Active
                });
            }
            return Err(LifecycleFailure::boxed(Phase::Update, instance, outcomes, source));
        }

        instance.desired = desired.clone();
        instance.transition(LifecycleState::Active);
        let instance = self.refresh(instance, outcomes.clone()).await?;

        Ok(UpdateOutcome {
            instance,
            groups: outcomes,
            replaced: false,
        })
    }

    async fn apply_in_place(
        &self,
        id: &str,
        attrs: &AttributeSet,
    ) -> Result<AttributeSet, ConvergeError> {
        let observed = self.call(self.gateway.update(id, attrs)).await?;
        if let Some(spec) = self.kind.update_poll() {
            self.wait(spec, id).await?;
        }
        Ok(observed)
    }

    /// Two-phase resize. The flag in the error is true when the object was
    /// left mid-resize.
    async fn apply_resize(
        &self,
        id: &str,
        attrs: &AttributeSet,
    ) -> Result<AttributeSet, (ConvergeError, bool)> {
        self.call(self.gateway.resize(id, attrs))
            .await
            .map_err(|e| (e, false))?;

        if let Some(spec) = self.kind.resize_poll()
            && let Err(e) = self.wait(spec, id).await
        {
            if self.options.resize_timeout_policy == ResizeTimeoutPolicy::Revert {
                info!("Reverting unconfirmed resize of {} {}", self.kind.name(), id);
                if let Err(revert) = self.call(self.gateway.revert_resize(id)).await {
                    warn!("Revert of {} {} failed: {}", self.kind.name(), id, revert);
                }
            }
            return Err((e, true));
        }

        info!("Confirming resize of {} {}", self.kind.name(), id);
        self.call(self.gateway.confirm_resize(id))
            .await
            .map_err(|e| (e, true))?;

        if let Some(spec) = self.kind.confirm_poll() {
            self.wait(spec, id).await.map_err(|e| (e, true))?;
        }
        Ok(AttributeSet::new())
    }

    /// Deletes the remote object and waits for it to disappear.
    ///
    /// Conflicts are retried within the kind's retry budget. A not-found
    /// answer to the delete call means the object is already gone. An
    /// instance that never obtained an ID is simply marked deleted.
    ///
    /// # Errors
    ///
    /// Fails if the delete call fails, conflicts exhaust the retry budget,
    /// or the deletion poll fails. A failed delete call leaves the instance
    /// in its prior state.
    pub async fn delete(&self, mut instance: ResourceInstance) -> LifecycleResult<ResourceInstance> {
        let Some(id) = instance.id().map(ToString::to_string) else {
            debug!("{} has no remote ID, nothing to delete", self.kind.name());
            instance.transition(LifecycleState::Deleted);
            return Ok(instance);
        };

        let prior = instance.state;
        match prior {
            LifecycleState::Active
            | LifecycleState::Failed
            | LifecycleState::Creating
            | LifecycleState::Deleting => {}
            LifecycleState::Deleted => return Ok(instance),
            LifecycleState::Absent | LifecycleState::Updating => {
                return Err(LifecycleFailure::boxed(
                    Phase::Delete,
                    instance,
                    Vec::new(),
                    LifecycleError::InvalidTransition {
                        operation: String::from("delete"),
                        state: prior.to_string(),
                    },
                ));
            }
        }

        instance.transition(LifecycleState::Deleting);
        info!("Deleting {} {}", self.kind.name(), id);

        let gateway = self.gateway;
        let deleted = self
            .kind
            .conflict_retry()
            .run(&self.options.cancel, || gateway.delete(&id))
            .await;

        let already_gone = match deleted {
            Ok(attempts) => {
                debug!("Delete of {} accepted after {} attempt(s)", id, attempts);
                false
            }
            Err(RetryFailure::Failed(e)) if e.is_not_found() => true,
            Err(failure) => {
                let source = match failure {
                    RetryFailure::Exhausted { attempts, last } => {
                        ConvergeError::from(LifecycleError::ConflictRetriesExhausted {
                            id: id.clone(),
                            attempts,
                            message: last.to_string(),
                        })
                    }
                    RetryFailure::Failed(e) => ConvergeError::from(e),
                    RetryFailure::Cancelled(reason) => ConvergeError::from(reason),
                };
                instance.transition(prior);
                return Err(LifecycleFailure::boxed(Phase::Delete, instance, Vec::new(), source));
            }
        };

        if !already_gone
            && let Some(spec) = self.kind.delete_poll()
            && let Err(e) = self.wait(spec, &id).await
        {
            if !is_cancelled(&e) {
                instance.transition(LifecycleState::Failed);
            }
            return Err(LifecycleFailure::boxed(
                Phase::DeleteWait,
                instance,
                Vec::new(),
                e,
            ));
        }

        info!("Deleted {} {}", self.kind.name(), id);
        instance.remote_status = None;
        instance.transition(LifecycleState::Deleted);
        Ok(instance)
    }
}

fn is_cancelled(error: &ConvergeError) -> bool {
    error.class() == ErrorClass::Cancelled
}

fn outcome(group: &GroupUpdate, status: GroupStatus) -> GroupOutcome {
    GroupOutcome {
        group: group.name.clone(),
        protocol: group.protocol,
        attributes: group.attributes.clone(),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayCall, InMemoryGateway, MockResourceGateway, Observed};
    use crate::lifecycle::{ConflictRetry, pending_attributes};
    use crate::resources;
    use crate::schema::{AttributeSchema, AttributeValue, Schema};
    use std::time::Duration;

    fn server_kind() -> ResourceKind {
        ResourceKind::new(
            Schema::new("server")
                .attribute("name", AttributeSchema::string())
                .attribute("flavor", AttributeSchema::string().required().immutable())
                .attribute("ip", AttributeSchema::string().computed_only()),
        )
        .with_create_poll(
            PollSpec::new("ACTIVE", ["BUILD"]).with_interval(Duration::from_secs(1)),
        )
    }

    fn server_gateway() -> InMemoryGateway {
        InMemoryGateway::new("server")
            .with_ids(["abc", "def"])
            .with_build_statuses(["BUILD"])
            .with_computed(AttributeSet::new().with("ip", "10.0.0.5"))
    }

    fn web1(flavor: &str) -> AttributeSet {
        AttributeSet::new().with("name", "web1").with("flavor", flavor)
    }

    #[test]
    fn test_for_type_requires_registration() {
        let registry = ResourceRegistry::new().with(server_kind(), std::sync::Arc::new(server_gateway()));
        assert!(Orchestrator::for_type(&registry, "server").is_ok());
        assert!(matches!(
            Orchestrator::for_type(&registry, "volume"),
            Err(LifecycleError::UnregisteredType { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_for_active_and_reads_computed() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);

        let instance = orchestrator.create(&web1("small")).await.unwrap();

        assert_eq!(instance.id(), Some("abc"));
        assert_eq!(instance.state, LifecycleState::Active);
        assert_eq!(instance.remote_status.as_deref(), Some("ACTIVE"));
        assert_eq!(instance.observed.get("ip"), Some(&"10.0.0.5".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immutable_change_replaces() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let instance = orchestrator.create(&web1("small")).await.unwrap();

        let outcome = orchestrator
            .update(instance, &web1("large"))
            .await
            .unwrap();

        assert!(outcome.replaced);
        assert_eq!(outcome.instance.id(), Some("def"));
        assert_eq!(outcome.instance.observed.get("flavor"), Some(&"large".into()));
        let mutations = gateway.mutations();
        assert!(matches!(mutations[1], GatewayCall::Delete(ref id) if id == "abc"));
        assert!(matches!(mutations[2], GatewayCall::Create(_)));
        assert_eq!(mutations.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immutable_and_mutable_change_together_only_replaces() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let instance = orchestrator.create(&web1("small")).await.unwrap();

        let desired = AttributeSet::new().with("name", "web2").with("flavor", "large");
        let outcome = orchestrator.update(instance, &desired).await.unwrap();

        assert!(outcome.replaced);
        assert!(outcome.groups.is_empty());
        assert_eq!(outcome.instance.id(), Some("def"));
        assert_eq!(outcome.instance.observed.get("name"), Some(&"web2".into()));
        assert_eq!(
            gateway.mutations()[1..],
            [
                GatewayCall::Delete(String::from("abc")),
                GatewayCall::Create(vec![String::from("flavor"), String::from("name")]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutable_change_is_single_update() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let instance = orchestrator.create(&web1("small")).await.unwrap();

        let desired = AttributeSet::new().with("name", "web2").with("flavor", "small");
        let outcome = orchestrator.update(instance, &desired).await.unwrap();

        assert!(!outcome.replaced);
        assert_eq!(outcome.instance.id(), Some("abc"));
        assert_eq!(outcome.groups.len(), 1);
        assert!(outcome.groups[0].is_applied());
        assert_eq!(
            gateway.mutations()[1..],
            [GatewayCall::Update(String::from("abc"), vec![String::from("name")])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_update_makes_no_calls() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let instance = orchestrator.create(&web1("small")).await.unwrap();

        let outcome = orchestrator.update(instance, &web1("small")).await.unwrap();
        assert!(outcome.groups.is_empty());
        assert_eq!(gateway.mutations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_violation_makes_no_calls() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);

        let err = orchestrator
            .create(&AttributeSet::new().with("name", "web1"))
            .await
            .unwrap_err();
        assert_eq!(err.phase, Phase::Validate);
        assert_eq!(err.source.class(), ErrorClass::SchemaViolation);

        let err = orchestrator
            .create(&web1("small").with("ip", "1.2.3.4"))
            .await
            .unwrap_err();
        assert_eq!(err.source.class(), ErrorClass::SchemaViolation);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_timeout_keeps_id() {
        let kind = server_kind();
        let gateway = InMemoryGateway::new("server")
            .with_ids(["abc"])
            .with_active_status("BUILD");
        let orchestrator = Orchestrator::new(&kind, &gateway);

        let failure = orchestrator.create(&web1("small")).await.unwrap_err();

        assert_eq!(failure.phase, Phase::CreateWait);
        assert_eq!(failure.source.class(), ErrorClass::Timeout);
        assert_eq!(failure.instance.state, LifecycleState::Failed);
        assert_eq!(failure.instance.id(), Some("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_unexpected_status() {
        let kind = server_kind();
        let gateway = InMemoryGateway::new("server")
            .with_build_statuses(["BUILD"])
            .with_active_status("ERROR");
        let orchestrator = Orchestrator::new(&kind, &gateway);

        let failure = orchestrator.create(&web1("small")).await.unwrap_err();
        assert_eq!(failure.source.class(), ErrorClass::UnexpectedState);
        assert_eq!(failure.instance.state, LifecycleState::Failed);
        assert!(failure.instance.id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_create_keeps_state() {
        let kind = server_kind();
        let gateway = InMemoryGateway::new("server")
            .with_ids(["abc"])
            .with_active_status("BUILD");
        let options = LifecycleOptions {
            cancel: Cancellation::none().with_timeout(Duration::from_secs(30)),
            ..LifecycleOptions::default()
        };
        let orchestrator = Orchestrator::new(&kind, &gateway).with_options(options);

        let failure = orchestrator.create(&web1("small")).await.unwrap_err();
        assert_eq!(failure.source.class(), ErrorClass::Cancelled);
        assert_eq!(failure.instance.state, LifecycleState::Creating);
        assert_eq!(failure.instance.id(), Some("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_not_found_is_gone() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let instance = orchestrator.create(&web1("small")).await.unwrap();
        gateway.remove_object("abc");

        let outcome = orchestrator.read(instance).await.unwrap();
        let ReadOutcome::Gone(instance) = outcome else {
            panic!("expected gone, got {outcome:?}");
        };
        assert!(instance.id().is_none());
        assert_eq!(instance.state, LifecycleState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_refreshes_observed() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let instance = orchestrator.create(&web1("small")).await.unwrap();
        gateway.tamper("abc", &AttributeSet::new().with("name", "renamed"));

        let instance = orchestrator.read(instance).await.unwrap().into_instance();
        assert_eq!(instance.observed.get("name"), Some(&"renamed".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_keeps_attributes_the_remote_omits() {
        let kind = resources::compute();
        let mut gateway = MockResourceGateway::new();
        gateway.expect_read().times(1).returning(|_| {
            Ok(Observed {
                attributes: AttributeSet::new()
                    .with("name", "web1")
                    .with("image_ref", "img")
                    .with("flavor_ref", "small")
                    .with("access_ip_v4", "10.0.0.5"),
                status: String::from("ACTIVE"),
            })
        });
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let desired = compute_desired("small").with("networks", AttributeValue::strings(["net1"]));
        let mut instance = ResourceInstance::existing("compute", "abc");
        instance.desired = desired.clone();
        instance.observed = desired.clone().with("stale", "x");

        let instance = orchestrator.read(instance).await.unwrap().into_instance();

        assert_eq!(instance.observed.get("networks"), Some(&AttributeValue::strings(["net1"])));
        assert_eq!(instance.observed.get("access_ip_v4"), Some(&"10.0.0.5".into()));
        assert!(!instance.observed.contains("stale"));
        let (_, plan) = orchestrator.plan(&instance, &desired).unwrap();
        assert_eq!(plan, ChangePlan::Noop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_retries_conflicts() {
        let kind = resources::firewall_policy();
        let mut gateway = MockResourceGateway::new();
        let mut attempts = 0;
        gateway.expect_delete().times(4).returning(move |id| {
            attempts += 1;
            if attempts <= 3 {
                Err(GatewayError::conflict("firewall_policy", id, "policy in use"))
            } else {
                Ok(())
            }
        });
        let orchestrator = Orchestrator::new(&kind, &gateway);

        let instance = orchestrator
            .delete(ResourceInstance::existing("firewall_policy", "p1"))
            .await
            .unwrap();
        assert_eq!(instance.state, LifecycleState::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_conflicts_exhausted() {
        let kind = resources::firewall_policy()
            .with_conflict_retry(ConflictRetry::new(3, Duration::from_secs(2)));
        let mut gateway = MockResourceGateway::new();
        gateway
            .expect_delete()
            .times(3)
            .returning(|id| Err(GatewayError::conflict("firewall_policy", id, "policy in use")));
        let orchestrator = Orchestrator::new(&kind, &gateway);

        let failure = orchestrator
            .delete(ResourceInstance::existing("firewall_policy", "p1"))
            .await
            .unwrap_err();
        assert_eq!(failure.phase, Phase::Delete);
        assert_eq!(failure.source.class(), ErrorClass::Conflict);
        assert_eq!(failure.instance.state, LifecycleState::Active);
        assert_eq!(failure.instance.id(), Some("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_of_missing_object_succeeds() {
        let kind = resources::firewall_policy();
        let mut gateway = MockResourceGateway::new();
        gateway
            .expect_delete()
            .times(1)
            .returning(|id| Err(GatewayError::not_found("firewall_policy", id)));
        let orchestrator = Orchestrator::new(&kind, &gateway);

        let instance = orchestrator
            .delete(ResourceInstance::existing("firewall_policy", "p1"))
            .await
            .unwrap();
        assert_eq!(instance.state, LifecycleState::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_without_id_is_noop() {
        let kind = resources::firewall_policy();
        let gateway = MockResourceGateway::new();
        let orchestrator = Orchestrator::new(&kind, &gateway);

        let instance = orchestrator
            .delete(ResourceInstance::new("firewall_policy"))
            .await
            .unwrap();
        assert_eq!(instance.state, LifecycleState::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_waits_for_disappearance() {
        let kind = resources::compute();
        let gateway = InMemoryGateway::new("compute")
            .with_ids(["abc"])
            .with_delete_statuses(["DELETING", "DELETING"]);
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let desired = AttributeSet::new()
            .with("image_ref", "img")
            .with("flavor_ref", "small");
        let instance = orchestrator.create(&desired).await.unwrap();

        let instance = orchestrator.delete(instance).await.unwrap();
        assert_eq!(instance.state, LifecycleState::Deleted);
        assert!(gateway.is_empty());
    }

    fn compute_desired(flavor: &str) -> AttributeSet {
        AttributeSet::new()
            .with("name", "web1")
            .with("image_ref", "img")
            .with("flavor_ref", flavor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_two_phase() {
        let kind = resources::compute();
        let gateway = InMemoryGateway::new("compute")
            .with_ids(["abc"])
            .with_resize_statuses(["RESIZE", "RESIZE"]);
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let instance = orchestrator.create(&compute_desired("small")).await.unwrap();

        let outcome = orchestrator
            .update(instance, &compute_desired("large"))
            .await
            .unwrap();

        assert!(!outcome.replaced);
        assert_eq!(outcome.instance.id(), Some("abc"));
        assert_eq!(outcome.instance.state, LifecycleState::Active);
        assert_eq!(outcome.groups[0].protocol, UpdateProtocol::Resize);
        assert_eq!(
            gateway.mutations()[1..],
            [
                GatewayCall::Resize(String::from("abc")),
                GatewayCall::ConfirmResize(String::from("abc")),
            ]
        );
        assert_eq!(
            gateway.object("abc").unwrap().attributes.get("flavor_ref"),
            Some(&"large".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_timeout_leaves_unconfirmed() {
        let kind = resources::compute();
        let gateway = InMemoryGateway::new("compute")
            .with_ids(["abc"])
            .with_stalled_resize();
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let instance = orchestrator.create(&compute_desired("small")).await.unwrap();

        let failure = orchestrator
            .update(instance, &compute_desired("large"))
            .await
            .unwrap_err();

        assert_eq!(failure.phase, Phase::Update);
        assert_eq!(failure.source.class(), ErrorClass::Timeout);
        assert_eq!(failure.instance.state, LifecycleState::Failed);
        assert!(!gateway.calls().iter().any(|c| matches!(
            c,
            GatewayCall::ConfirmResize(_) | GatewayCall::RevertResize(_)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_timeout_reverts_when_asked() {
        let kind = resources::compute();
        let gateway = InMemoryGateway::new("compute")
            .with_ids(["abc"])
            .with_stalled_resize();
        let options = LifecycleOptions {
            resize_timeout_policy: ResizeTimeoutPolicy::Revert,
            ..LifecycleOptions::default()
        };
        let orchestrator = Orchestrator::new(&kind, &gateway).with_options(options);
        let instance = orchestrator.create(&compute_desired("small")).await.unwrap();

        let failure = orchestrator
            .update(instance, &compute_desired("large"))
            .await
            .unwrap_err();

        assert_eq!(failure.instance.state, LifecycleState::Failed);
        assert!(gateway.calls().contains(&GatewayCall::RevertResize(String::from("abc"))));
        assert_eq!(
            gateway.object("abc").unwrap().attributes.get("flavor_ref"),
            Some(&"small".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_resize_stays_in_flight() {
        let kind = resources::compute();
        let gateway = InMemoryGateway::new("compute")
            .with_ids(["abc"])
            .with_stalled_resize();
        let instance = Orchestrator::new(&kind, &gateway)
            .create(&compute_desired("small"))
            .await
            .unwrap();
        let options = LifecycleOptions {
            resize_timeout_policy: ResizeTimeoutPolicy::Revert,
            cancel: Cancellation::none().with_timeout(Duration::from_secs(30)),
        };
        let orchestrator = Orchestrator::new(&kind, &gateway).with_options(options);

        let failure = orchestrator
            .update(instance, &compute_desired("large"))
            .await
            .unwrap_err();

        assert_eq!(failure.source.class(), ErrorClass::Cancelled);
        assert_eq!(failure.instance.state, LifecycleState::Updating);
        assert_eq!(failure.instance.id(), Some("abc"));
        assert_eq!(
            gateway.mutations()[1..],
            [GatewayCall::Resize(String::from("abc"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unnamed_server_gets_generated_name() {
        let kind = resources::compute();
        let gateway = InMemoryGateway::new("compute").with_ids(["abc"]);
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let desired = AttributeSet::new()
            .with("image_ref", "img")
            .with("flavor_ref", "small");

        let instance = orchestrator.create(&desired).await.unwrap();

        assert!(matches!(
            &gateway.mutations()[0],
            GatewayCall::Create(names) if names.contains(&String::from("name"))
        ));
        let name = instance.observed.get("name").and_then(AttributeValue::as_str).unwrap();
        assert_eq!(name.len(), resources::GENERATED_NAME_LEN);
        assert_eq!(
            gateway.object("abc").unwrap().attributes.get("name"),
            Some(&AttributeValue::from(name))
        );
        let (_, plan) = orchestrator.plan(&instance, &desired).unwrap();
        assert_eq!(plan, ChangePlan::Noop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_update_records_applied_groups() {
        let kind = resources::lb_pool();
        let gateway = InMemoryGateway::new("lb_pool")
            .with_ids(["pool1"])
            .with_update_failure("health_monitors", "monitor busy");
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let desired = AttributeSet::new()
            .with("name", "web")
            .with("subnet_id", "s1")
            .with("protocol", "HTTP")
            .with("lb_method", "ROUND_ROBIN");
        let instance = orchestrator.create(&desired).await.unwrap();

        let changed = desired
            .clone()
            .with("name", "web-pool")
            .with("health_monitors", crate::schema::AttributeValue::strings(["hm1"]));
        let failure = orchestrator.update(instance, &changed).await.unwrap_err();

        assert_eq!(failure.phase, Phase::Update);
        assert_eq!(failure.instance.state, LifecycleState::Active);
        assert_eq!(failure.updates.len(), 2);
        assert!(failure.updates[0].is_applied());
        assert_eq!(
            failure.updates[1].status,
            GroupStatus::Failed(String::from("Remote API error: Request failed: 400 - monitor busy"))
        );
        assert_eq!(pending_attributes(&failure.updates), vec!["health_monitors"]);
        assert_eq!(failure.instance.observed.get("name"), Some(&"web-pool".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_requires_active() {
        let kind = server_kind();
        let gateway = server_gateway();
        let orchestrator = Orchestrator::new(&kind, &gateway);
        let mut instance = ResourceInstance::existing("server", "abc");
        instance.state = LifecycleState::Failed;

        let failure = orchestrator.update(instance, &web1("small")).await.unwrap_err();
        assert!(matches!(
            failure.source,
            ConvergeError::Lifecycle(LifecycleError::InvalidTransition { .. })
        ));
        assert!(gateway.calls().is_empty());
    }
}
