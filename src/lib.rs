// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # stackconverge
//!
//! A convergence engine for OpenStack-style control-plane APIs.
//!
//! ## Overview
//!
//! stackconverge takes the declared attributes of remote resources (compute
//! instances, networks, subnets, routers, firewalls, load-balancer pools and
//! security groups) and drives the minimal sequence of remote calls that
//! makes the live objects match:
//!
//! - Attribute-level diffing with force-replace semantics
//! - Waiting for asynchronous operations by polling remote status
//! - Per-group partial update bookkeeping and two-phase resize
//! - Bounded retry of deletes that conflict with dependent objects
//!
//! ## Architecture
//!
//! 1. **Desired State**: attributes declared in `stackconverge.yaml`
//! 2. **Observed State**: read back through a [`gateway::ResourceGateway`]
//! 3. **Orchestrator**: diffs the two and sequences create, update, replace and delete
//! 4. **Reconciler**: walks the whole stack and persists progress after every operation
//!
//! ## Modules
//!
//! - [`schema`]: Attribute values, sets and schemas
//! - [`planner`]: Attribute diffing and change plans
//! - [`poller`]: Waiting for a remote status
//! - [`cancel`]: Cooperative cancellation and deadlines
//! - [`resources`]: Built-in resource kinds
//! - [`gateway`]: Remote gateways (REST, in-memory) and the type registry
//! - [`lifecycle`]: Per-instance lifecycle orchestration
//! - [`config`]: Configuration parsing, validation and hashing
//! - [`state`]: Persisted stack state with locking
//! - [`reconciler`]: Stack-wide reconciliation
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! provider:
//!   compute_url: https://compute.example.com/v2.1
//!   network_url: https://network.example.com
//!
//! resources:
//!   - name: private
//!     type: network
//!     attributes:
//!       name: private
//!   - name: web1
//!     type: compute
//!     attributes:
//!       name: web1
//!       image_ref: ubuntu-22.04
//!       flavor_ref: m1.small
//!     timeouts:
//!       create: 900
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod planner;
pub mod poller;
pub mod reconciler;
pub mod resources;
pub mod schema;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cancel::{CancelHandle, CancelReason, Cancellation};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{ConvergeError, ErrorClass, Result};
pub use gateway::{InMemoryGateway, ResourceGateway, ResourceRegistry, RestGateway};
pub use lifecycle::{
    LifecycleFailure, LifecycleOptions, LifecycleState, Orchestrator, ResizeTimeoutPolicy,
    ResourceInstance,
};
pub use planner::{ChangePlan, DiffEngine, StackPlan};
pub use poller::{PollSpec, StatePoller};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler, RefreshReport};
pub use resources::ResourceKind;
pub use schema::{AttributeSchema, AttributeSet, AttributeValue, Schema};
pub use state::{LocalStateStore, StackState, StateStore};
