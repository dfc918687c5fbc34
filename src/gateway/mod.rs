//! Remote resource gateways.
//!
//! A [`ResourceGateway`] is the network client for one resource type. The
//! lifecycle orchestrator only talks to the remote system through it.

mod memory;
mod registry;
mod rest;

pub use memory::{GatewayCall, InMemoryGateway};
pub use registry::{RegisteredType, ResourceRegistry};
pub use rest::{RestClient, RestEndpoint, RestGateway, Structured};

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::schema::AttributeSet;

/// Answer to a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Remote identifier assigned to the new object.
    pub id: String,
    /// Attributes reported by the create response.
    pub observed: AttributeSet,
    /// Status reported by the create response, if any.
    pub status: Option<String>,
}

/// Answer to a read call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    /// Attributes as the remote system reports them.
    pub attributes: AttributeSet,
    /// Remote status string.
    pub status: String,
}

/// Typed create/read/update/delete/status access to one resource type.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceGateway: Send + Sync {
    /// Creates an object and returns its identifier.
    async fn create(&self, attributes: &AttributeSet) -> Result<Created, GatewayError>;

    /// Reads an object. Fails with [`GatewayError::NotFound`] if it is gone.
    async fn read(&self, id: &str) -> Result<Observed, GatewayError>;

    /// Applies changed attributes in place and returns the observed result.
    async fn update(&self, id: &str, attributes: &AttributeSet)
    -> Result<AttributeSet, GatewayError>;

    /// Deletes an object. Fails with [`GatewayError::Conflict`] if it is still referenced.
    async fn delete(&self, id: &str) -> Result<(), GatewayError>;

    /// Returns the object's status string.
    async fn status(&self, id: &str) -> Result<String, GatewayError>;

    /// Lists the identifiers of all objects of this type.
    async fn list(&self) -> Result<Vec<String>, GatewayError>;

    /// Starts a resize to the given attributes.
    async fn resize(&self, id: &str, attributes: &AttributeSet) -> Result<(), GatewayError> {
        let _ = attributes;
        Err(GatewayError::unsupported(format!("object {id}"), "resize"))
    }

    /// Confirms a resize awaiting confirmation.
    async fn confirm_resize(&self, id: &str) -> Result<(), GatewayError> {
        Err(GatewayError::unsupported(format!("object {id}"), "confirm_resize"))
    }

    /// Reverts a resize awaiting confirmation.
    async fn revert_resize(&self, id: &str) -> Result<(), GatewayError> {
        Err(GatewayError::unsupported(format!("object {id}"), "revert_resize"))
    }
}
