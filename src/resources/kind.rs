//! Resource kind descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::SchemaViolation;
use crate::lifecycle::ConflictRetry;
use crate::poller::PollSpec;
use crate::schema::{AttributeSet, AttributeValue, Schema};

use super::network::AllocationPool;
use super::security_group::SecurityGroupRule;

/// Length of names generated for instances created without one.
pub const GENERATED_NAME_LEN: usize = 16;

/// How an update group is applied remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateProtocol {
    /// A single update call.
    InPlace,
    /// Resize, wait for "awaiting confirmation", then confirm.
    Resize,
}

/// A named set of attributes applied by one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateGroup {
    /// Group name.
    pub name: String,
    /// Remote protocol.
    pub protocol: UpdateProtocol,
}

/// Textual encoding of the items of a collection attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFormat {
    /// `start-end` address ranges.
    AddressRange,
    /// `protocol:from_port:to_port:source` ingress rules.
    IngressRule,
}

impl ItemFormat {
    /// Checks one item, which must be written in canonical form.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not parse or is not canonical.
    pub fn check(self, attribute: &str, item: &str) -> Result<(), SchemaViolation> {
        let canonical = match self {
            Self::AddressRange => item.parse::<AllocationPool>()?.to_string(),
            Self::IngressRule => item.parse::<SecurityGroupRule>()?.to_string(),
        };
        if canonical == item {
            Ok(())
        } else {
            Err(SchemaViolation::InvalidValue {
                attribute: attribute.to_string(),
                value: item.to_string(),
                message: format!("write it as '{canonical}'"),
            })
        }
    }
}

/// Per-resource overrides of poll timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceTimeouts {
    /// Timeout for create polls.
    pub create: Option<Duration>,
    /// Timeout for update and resize polls.
    pub update: Option<Duration>,
    /// Timeout for delete polls.
    pub delete: Option<Duration>,
}

/// Everything the orchestrator needs to know about one resource type.
#[derive(Debug, Clone)]
pub struct ResourceKind {
    name: String,
    schema: Schema,
    update_groups: Vec<UpdateGroup>,
    create_poll: Option<PollSpec>,
    update_poll: Option<PollSpec>,
    resize_poll: Option<PollSpec>,
    confirm_poll: Option<PollSpec>,
    delete_poll: Option<PollSpec>,
    conflict_retry: ConflictRetry,
    item_formats: BTreeMap<String, ItemFormat>,
    generated_name: Option<String>,
}

impl ResourceKind {
    /// Creates a kind with no polls and the default conflict retry.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self {
            name: schema.resource_type().to_string(),
            schema,
            update_groups: Vec::new(),
            create_poll: None,
            update_poll: None,
            resize_poll: None,
            confirm_poll: None,
            delete_poll: None,
            conflict_retry: ConflictRetry::default(),
            item_formats: BTreeMap::new(),
            generated_name: None,
        }
    }

    /// Declares the encoding of a collection attribute's items.
    #[must_use]
    pub fn with_item_format(mut self, attribute: impl Into<String>, format: ItemFormat) -> Self {
        self.item_formats.insert(attribute.into(), format);
        self
    }

    /// Generates a random value for `attribute` when a create request lacks one.
    #[must_use]
    pub fn with_generated_name(mut self, attribute: impl Into<String>) -> Self {
        self.generated_name = Some(attribute.into());
        self
    }

    /// Declares an update group. Groups apply in declaration order.
    #[must_use]
    pub fn with_group(mut self, name: impl Into<String>, protocol: UpdateProtocol) -> Self {
        self.update_groups.push(UpdateGroup {
            name: name.into(),
            protocol,
        });
        self
    }

    /// Waits after create.
    #[must_use]
    pub fn with_create_poll(mut self, spec: PollSpec) -> Self {
        self.create_poll = Some(spec);
        self
    }

    /// Waits after each in-place update.
    #[must_use]
    pub fn with_update_poll(mut self, spec: PollSpec) -> Self {
        self.update_poll = Some(spec);
        self
    }

    /// Waits for a resize to await confirmation.
    #[must_use]
    pub fn with_resize_poll(mut self, spec: PollSpec) -> Self {
        self.resize_poll = Some(spec);
        self
    }

    /// Waits after a resize is confirmed.
    #[must_use]
    pub fn with_confirm_poll(mut self, spec: PollSpec) -> Self {
        self.confirm_poll = Some(spec);
        self
    }

    /// Waits after delete.
    #[must_use]
    pub fn with_delete_poll(mut self, spec: PollSpec) -> Self {
        self.delete_poll = Some(spec);
        self
    }

    /// Sets the delete conflict retry budget.
    #[must_use]
    pub const fn with_conflict_retry(mut self, retry: ConflictRetry) -> Self {
        self.conflict_retry = retry;
        self
    }

    /// Applies per-resource timeout overrides.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: &ResourceTimeouts) -> Self {
        fn apply(spec: &mut Option<PollSpec>, timeout: Option<Duration>) {
            if let (Some(spec), Some(timeout)) = (spec.as_mut(), timeout) {
                spec.timeout = timeout;
            }
        }
        apply(&mut self.create_poll, timeouts.create);
        apply(&mut self.update_poll, timeouts.update);
        apply(&mut self.resize_poll, timeouts.update);
        apply(&mut self.confirm_poll, timeouts.update);
        apply(&mut self.delete_poll, timeouts.delete);
        self
    }

    /// Resource type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attribute schema.
    #[must_use]
    pub const fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Validates desired attributes against the schema and the item formats.
    ///
    /// # Errors
    ///
    /// Returns the first schema violation or malformed collection item.
    pub fn validate(&self, desired: &AttributeSet) -> Result<(), SchemaViolation> {
        self.schema.validate(desired)?;
        for (name, format) in &self.item_formats {
            if let Some(items) = desired.get(name).and_then(AttributeValue::as_list) {
                for item in items {
                    format.check(name, &item.to_string())?;
                }
            }
        }
        Ok(())
    }

    /// Fills the generated name attribute of a create request if absent.
    pub fn generate_missing(&self, request: &mut AttributeSet) {
        if let Some(name) = &self.generated_name
            && !request.contains(name)
        {
            let mut value = Uuid::new_v4().simple().to_string();
            value.truncate(GENERATED_NAME_LEN);
            request.insert(name.clone(), value);
        }
    }

    /// Declared update groups in application order.
    #[must_use]
    pub fn update_groups(&self) -> &[UpdateGroup] {
        &self.update_groups
    }

    /// Protocol of a group. Undeclared groups are applied in place.
    #[must_use]
    pub fn group_protocol(&self, group: &str) -> UpdateProtocol {
        self.update_groups
            .iter()
            .find(|g| g.name == group)
            .map_or(UpdateProtocol::InPlace, |g| g.protocol)
    }

    /// Poll after create.
    #[must_use]
    pub const fn create_poll(&self) -> Option<&PollSpec> {
        self.create_poll.as_ref()
    }

    /// Poll after in-place update.
    #[must_use]
    pub const fn update_poll(&self) -> Option<&PollSpec> {
        self.update_poll.as_ref()
    }

    /// Poll for resize awaiting confirmation.
    #[must_use]
    pub const fn resize_poll(&self) -> Option<&PollSpec> {
        self.resize_poll.as_ref()
    }

    /// Poll after resize confirmation.
    #[must_use]
    pub const fn confirm_poll(&self) -> Option<&PollSpec> {
        self.confirm_poll.as_ref()
    }

    /// Poll after delete.
    #[must_use]
    pub const fn delete_poll(&self) -> Option<&PollSpec> {
        self.delete_poll.as_ref()
    }

    /// Delete conflict retry budget.
    #[must_use]
    pub const fn conflict_retry(&self) -> &ConflictRetry {
        &self.conflict_retry
    }
}
