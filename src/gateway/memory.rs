//! In-memory gateway.
//!
//! Simulates a remote control plane: objects move through scripted status
//! sequences, computed attributes appear on create, and conflicts or update
//! failures can be injected. Every call is recorded, which makes it the
//! gateway of choice for tests and for offline planning.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::error::GatewayError;
use crate::schema::AttributeSet;

use super::{Created, Observed, ResourceGateway};

/// A call received by an [`InMemoryGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `create` with the attribute names sent.
    Create(Vec<String>),
    /// `read` of an ID.
    Read(String),
    /// `update` of an ID with the attribute names sent.
    Update(String, Vec<String>),
    /// `delete` of an ID.
    Delete(String),
    /// `status` of an ID.
    Status(String),
    /// `list`.
    List,
    /// `resize` of an ID.
    Resize(String),
    /// `confirm_resize` of an ID.
    ConfirmResize(String),
    /// `revert_resize` of an ID.
    RevertResize(String),
}

#[derive(Debug, Clone)]
struct SimObject {
    attributes: AttributeSet,
    status: String,
    upcoming: VecDeque<String>,
    deleting: bool,
    before_resize: Option<AttributeSet>,
}

impl SimObject {
    fn start(&mut self, mut statuses: VecDeque<String>, fallback: &str) {
        self.status = statuses
            .pop_front()
            .unwrap_or_else(|| fallback.to_string());
        self.upcoming = statuses;
    }
}

#[derive(Debug, Default)]
struct Cloud {
    objects: BTreeMap<String, SimObject>,
    ids: VecDeque<String>,
    counter: u64,
    build_statuses: Vec<String>,
    delete_statuses: Vec<String>,
    resize_statuses: Vec<String>,
    resize_stalls: bool,
    computed: AttributeSet,
    delete_conflicts: u32,
    create_failure: Option<GatewayError>,
    update_failures: BTreeMap<String, String>,
    calls: Vec<GatewayCall>,
}

impl Cloud {
    fn next_id(&mut self, resource_type: &str) -> String {
        if let Some(id) = self.ids.pop_front() {
            return id;
        }
        // Skip IDs of objects inserted out of band.
        loop {
            self.counter += 1;
            let id = format!("{resource_type}-{}", self.counter);
            if !self.objects.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Scriptable in-memory gateway.
#[derive(Debug)]
pub struct InMemoryGateway {
    resource_type: String,
    active_status: String,
    cloud: Mutex<Cloud>,
}

impl InMemoryGateway {
    /// Creates a gateway whose objects become `ACTIVE` immediately.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            active_status: String::from("ACTIVE"),
            cloud: Mutex::new(Cloud::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cloud> {
        self.cloud.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn configure(self, f: impl FnOnce(&mut Cloud)) -> Self {
        f(&mut self.lock());
        self
    }

    fn strings<I, S>(items: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        items.into_iter().map(Into::into).collect()
    }

    /// IDs handed out by `create`, in order. Generated IDs follow.
    #[must_use]
    pub fn with_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = Self::strings(ids);
        self.configure(|c| c.ids = ids.into())
    }

    /// Status reported once a new object has finished building.
    #[must_use]
    pub fn with_active_status(mut self, status: impl Into<String>) -> Self {
        self.active_status = status.into();
        self
    }

    /// Statuses a new object reports before it becomes active.
    #[must_use]
    pub fn with_build_statuses<I, S>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statuses = Self::strings(statuses);
        self.configure(|c| c.build_statuses = statuses)
    }

    /// Statuses a deleted object reports before it disappears.
    #[must_use]
    pub fn with_delete_statuses<I, S>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statuses = Self::strings(statuses);
        self.configure(|c| c.delete_statuses = statuses)
    }

    /// Statuses a resizing object reports before `VERIFY_RESIZE`.
    #[must_use]
    pub fn with_resize_statuses<I, S>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statuses = Self::strings(statuses);
        self.configure(|c| c.resize_statuses = statuses)
    }

    /// Makes resizes stay in `RESIZE` forever.
    #[must_use]
    pub fn with_stalled_resize(self) -> Self {
        self.configure(|c| c.resize_stalls = true)
    }

    /// Attributes the remote system fills in on create.
    #[must_use]
    pub fn with_computed(self, computed: AttributeSet) -> Self {
        self.configure(|c| c.computed = computed)
    }

    /// Number of delete calls answered with a conflict before one succeeds.
    #[must_use]
    pub fn with_delete_conflicts(self, count: u32) -> Self {
        self.configure(|c| c.delete_conflicts = count)
    }

    /// Makes every create call fail with `error`.
    #[must_use]
    pub fn with_create_failure(self, error: GatewayError) -> Self {
        self.configure(|c| c.create_failure = Some(error))
    }

    /// Makes updates touching `attribute` fail with `message`.
    #[must_use]
    pub fn with_update_failure(
        self,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let (attribute, message) = (attribute.into(), message.into());
        self.configure(|c| {
            c.update_failures.insert(attribute, message);
        })
    }

    /// Inserts an object as if created out of band.
    pub fn insert_object(&self, id: impl Into<String>, attributes: AttributeSet, status: &str) {
        self.lock().objects.insert(
            id.into(),
            SimObject {
                attributes,
                status: status.to_string(),
                upcoming: VecDeque::new(),
                deleting: false,
                before_resize: None,
            },
        );
    }

    /// Removes an object as if deleted out of band.
    pub fn remove_object(&self, id: &str) -> bool {
        self.lock().objects.remove(id).is_some()
    }

    /// Changes attributes of an object as if edited out of band.
    pub fn tamper(&self, id: &str, attributes: &AttributeSet) -> bool {
        self.lock()
            .objects
            .get_mut(id)
            .map(|o| o.attributes.merge(attributes))
            .is_some()
    }

    /// Current attributes and status of an object.
    #[must_use]
    pub fn object(&self, id: &str) -> Option<Observed> {
        self.lock().objects.get(id).map(|o| Observed {
            attributes: o.attributes.clone(),
            status: o.status.clone(),
        })
    }

    /// Number of objects held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns true if no objects are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock().calls.clone()
    }

    /// Calls other than `status` and `read`.
    #[must_use]
    pub fn mutations(&self) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, GatewayCall::Status(_) | GatewayCall::Read(_) | GatewayCall::List))
            .collect()
    }

    fn not_found(&self, id: &str) -> GatewayError {
        GatewayError::not_found(&self.resource_type, id)
    }
}

#[async_trait]
impl ResourceGateway for InMemoryGateway {
    async fn create(&self, attributes: &AttributeSet) -> Result<Created, GatewayError> {
        let mut cloud = self.lock();
        cloud
            .calls
            .push(GatewayCall::Create(attributes.names().map(String::from).collect()));
        if let Some(error) = cloud.create_failure.clone() {
            return Err(error);
        }

        let id = cloud.next_id(&self.resource_type);
        let mut observed = attributes.clone();
        for (name, value) in &cloud.computed {
            if !observed.contains(name) {
                observed.insert(name.clone(), value.clone());
            }
        }

        let mut object = SimObject {
            attributes: observed.clone(),
            status: String::new(),
            upcoming: VecDeque::new(),
            deleting: false,
            before_resize: None,
        };
        let mut statuses: VecDeque<String> = cloud.build_statuses.iter().cloned().collect();
        statuses.push_back(self.active_status.clone());
        object.start(statuses, &self.active_status);
        let status = object.status.clone();

        debug!("Simulated create of {} {}", self.resource_type, id);
        cloud.objects.insert(id.clone(), object);

        Ok(Created {
            id,
            observed: AttributeSet::new(),
            status: Some(status),
        })
    }

    async fn read(&self, id: &str) -> Result<Observed, GatewayError> {
        let mut cloud = self.lock();
        cloud.calls.push(GatewayCall::Read(id.to_string()));
        cloud
            .objects
            .get(id)
            .map(|o| Observed {
                attributes: o.attributes.clone(),
                status: o.status.clone(),
            })
            .ok_or_else(|| self.not_found(id))
    }

    async fn update(
        &self,
        id: &str,
        attributes: &AttributeSet,
    ) -> Result<AttributeSet, GatewayError> {
        let mut cloud = self.lock();
        cloud.calls.push(GatewayCall::Update(
            id.to_string(),
            attributes.names().map(String::from).collect(),
        ));
        if let Some(message) = attributes
            .names()
            .find_map(|name| cloud.update_failures.get(name).cloned())
        {
            return Err(GatewayError::remote(400, message));
        }
        let object = cloud.objects.get_mut(id).ok_or_else(|| self.not_found(id))?;
        object.attributes.merge(attributes);
        Ok(object.attributes.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let mut cloud = self.lock();
        cloud.calls.push(GatewayCall::Delete(id.to_string()));
        if !cloud.objects.contains_key(id) {
            return Err(self.not_found(id));
        }
        if cloud.delete_conflicts > 0 {
            cloud.delete_conflicts -= 1;
            return Err(GatewayError::conflict(
                &self.resource_type,
                id,
                "object is still in use",
            ));
        }

        let statuses: VecDeque<String> = cloud.delete_statuses.iter().cloned().collect();
        if statuses.is_empty() {
            cloud.objects.remove(id);
        } else if let Some(object) = cloud.objects.get_mut(id) {
            object.deleting = true;
            object.upcoming = statuses;
        }
        Ok(())
    }

    async fn status(&self, id: &str) -> Result<String, GatewayError> {
        let mut cloud = self.lock();
        cloud.calls.push(GatewayCall::Status(id.to_string()));
        let Some(object) = cloud.objects.get_mut(id) else {
            return Err(self.not_found(id));
        };

        if object.deleting {
            if let Some(status) = object.upcoming.pop_front() {
                object.status.clone_from(&status);
                return Ok(status);
            }
            cloud.objects.remove(id);
            return Err(self.not_found(id));
        }

        let status = object.status.clone();
        if let Some(next) = object.upcoming.pop_front() {
            object.status = next;
        }
        Ok(status)
    }

    async fn list(&self) -> Result<Vec<String>, GatewayError> {
        let mut cloud = self.lock();
        cloud.calls.push(GatewayCall::List);
        Ok(cloud.objects.keys().cloned().collect())
    }

    async fn resize(&self, id: &str, attributes: &AttributeSet) -> Result<(), GatewayError> {
        let mut cloud = self.lock();
        cloud.calls.push(GatewayCall::Resize(id.to_string()));
        let stalls = cloud.resize_stalls;
        let mut statuses: VecDeque<String> = cloud.resize_statuses.iter().cloned().collect();
        let object = cloud.objects.get_mut(id).ok_or_else(|| self.not_found(id))?;

        object.before_resize = Some(object.attributes.clone());
        object.attributes.merge(attributes);
        if stalls {
            object.start(VecDeque::new(), "RESIZE");
        } else {
            statuses.push_back(String::from("VERIFY_RESIZE"));
            object.start(statuses, "VERIFY_RESIZE");
        }
        Ok(())
    }

    async fn confirm_resize(&self, id: &str) -> Result<(), GatewayError> {
        let mut cloud = self.lock();
        cloud.calls.push(GatewayCall::ConfirmResize(id.to_string()));
        let object = cloud.objects.get_mut(id).ok_or_else(|| self.not_found(id))?;
        if object.status != "VERIFY_RESIZE" {
            return Err(GatewayError::conflict(
                &self.resource_type,
                id,
                format!("cannot confirm resize in status {}", object.status),
            ));
        }
        object.before_resize = None;
        object.start(VecDeque::new(), &self.active_status);
        Ok(())
    }

    async fn revert_resize(&self, id: &str) -> Result<(), GatewayError> {
        let mut cloud = self.lock();
        cloud.calls.push(GatewayCall::RevertResize(id.to_string()));
        let object = cloud.objects.get_mut(id).ok_or_else(|| self.not_found(id))?;
        if let Some(previous) = object.before_resize.take() {
            object.attributes = previous;
        }
        object.start(VecDeque::new(), &self.active_status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_statuses_then_active() {
        let gateway = InMemoryGateway::new("compute")
            .with_ids(["abc"])
            .with_build_statuses(["BUILD", "BUILD"]);
        let created = gateway
            .create(&AttributeSet::new().with("name", "web1"))
            .await
            .unwrap();
        assert_eq!(created.id, "abc");
        assert_eq!(created.status.as_deref(), Some("BUILD"));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(gateway.status("abc").await.unwrap());
        }
        assert_eq!(seen, vec!["BUILD", "BUILD", "ACTIVE", "ACTIVE"]);
    }

    #[tokio::test]
    async fn test_delete_statuses_then_gone() {
        let gateway = InMemoryGateway::new("firewall").with_delete_statuses(["DELETING"]);
        let id = gateway.create(&AttributeSet::new()).await.unwrap().id;
        assert_eq!(id, "firewall-1");
        gateway.delete(&id).await.unwrap();
        assert_eq!(gateway.status(&id).await.unwrap(), "DELETING");
        assert!(gateway.status(&id).await.unwrap_err().is_not_found());
        assert!(gateway.is_empty());
    }

    #[tokio::test]
    async fn test_conflicts_then_delete() {
        let gateway = InMemoryGateway::new("firewall_policy").with_delete_conflicts(2);
        let id = gateway.create(&AttributeSet::new()).await.unwrap().id;
        assert!(gateway.delete(&id).await.unwrap_err().is_conflict());
        assert!(gateway.delete(&id).await.unwrap_err().is_conflict());
        gateway.delete(&id).await.unwrap();
        assert!(gateway.read(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_resize_revert_restores_attributes() {
        let gateway = InMemoryGateway::new("compute").with_ids(["abc"]);
        gateway
            .create(&AttributeSet::new().with("flavor_ref", "small"))
            .await
            .unwrap();
        gateway
            .resize("abc", &AttributeSet::new().with("flavor_ref", "large"))
            .await
            .unwrap();
        assert_eq!(gateway.status("abc").await.unwrap(), "VERIFY_RESIZE");
        gateway.revert_resize("abc").await.unwrap();

        let object = gateway.object("abc").unwrap();
        assert_eq!(object.status, "ACTIVE");
        assert_eq!(object.attributes.get("flavor_ref"), Some(&"small".into()));
    }

    #[tokio::test]
    async fn test_update_failure_injection() {
        let gateway = InMemoryGateway::new("lb_pool").with_update_failure("health_monitors", "busy");
        let id = gateway.create(&AttributeSet::new()).await.unwrap().id;
        assert!(gateway.update(&id, &AttributeSet::new().with("name", "p")).await.is_ok());
        let err = gateway
            .update(&id, &AttributeSet::new().with("health_monitors", "hm"))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::remote(400, "busy"));
    }
}
