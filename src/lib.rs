//! # Stratoform - Cloud Resource Lifecycle Engine
//!
//! Stratoform is an async, type-safe engine for driving cloud resources
//! through their lifecycle: create, read, update, and delete against a
//! JSON-action HTTP API, with retry, status polling, and hook extension
//! points built in.
//!
//! ## Core Concepts
//!
//! - **Resources**: Declarative descriptions of remote entities (VMs,
//!   public IPs, keypairs, placement groups, reserved instances, images)
//! - **Lifecycle Drivers**: Per-resource orchestrators sequencing the
//!   create/read/update/delete operations
//! - **Hooks**: Extension points that run before and after each operation
//!   to validate, default, or enrich requests and responses
//! - **Retry Executor**: Wall-clock-deadline retry with backoff and jitter
//!   for every remote call
//! - **State Poller**: Waits for an entity to reach a target status while
//!   distinguishing pending, failure, and absent states
//! - **Budget**: Cooperative cancellation plus deadline, threaded through
//!   every suspension point
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Resource Handlers                            │
//! │ (vm, public_ip, keypair, placement_group, reserved_instance, image)  │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Lifecycle Driver                             │
//! │            (create / read / update / delete sequencing)              │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                         │                         │
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │    Hook Sets    │   │   Retry Executor    │   │    State Poller     │
//! │  (phase-keyed   │   │  (deadline, backoff │   │  (status sets and   │
//! │   callbacks)    │   │   and jitter)       │   │   probe loop)       │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//!          │                         │                         │
//!          └─────────────────────────┼─────────────────────────┘
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            Cloud API                                 │
//! │                  (JSON actions over HTTPS)                           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use stratoform::prelude::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load provider configuration and build the API client
//!     let config = ProviderConfig::load(None)?;
//!     let api: Arc<dyn CloudApi> = Arc::new(config.build_api()?);
//!
//!     // Register the built-in resource handlers
//!     let registry = Registry::with_builtins(api)?;
//!
//!     // Drive a VM into existence
//!     let data = ResourceData::new()
//!         .with("image_id", serde_json::json!("img-0123"))
//!         .with("vm_type", serde_json::json!("t2.small"));
//!
//!     let driver = registry.get("vm").expect("vm handler is built in");
//!     let applied = driver.create(data, &CancellationToken::new()).await?;
//!     println!("created {}", applied.state.id);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.
    //!
    //! This prelude provides quick access to the most commonly needed types:
    //!
    //! - **Drivers**: Lifecycle drivers and their builders
    //! - **Hooks**: Phases, call frames, and the hook trait
    //! - **Retry**: Retry policies, backoff, and jitter strategies
    //! - **Polling**: Poll targets and absence handling
    //! - **Client**: The cloud API trait and HTTP implementation
    //! - **Errors**: Error handling types
    //!
    //! # Example
    //!
    //! ```rust,ignore
    //! use stratoform::prelude::*;
    //!
    //! #[tokio::main]
    //! async fn main() -> Result<()> {
    //!     let config = ProviderConfig::load(None)?;
    //!     let api = std::sync::Arc::new(config.build_api()?);
    //!     let registry = Registry::with_builtins(api)?;
    //!     Ok(())
    //! }
    //! ```

    // Budget and cancellation
    pub use crate::budget::Budget;

    // Client layer
    pub use crate::client::{CloudApi, HttpApi};

    // Configuration
    pub use crate::config::{ProviderConfig, RetrySettings};

    // Error handling
    pub use crate::error::{Error, ErrorContext, Result};

    // Lifecycle drivers
    pub use crate::driver::{
        Applied, DriverBuilder, LifecycleDriver, ReadOutcome, StepTimeouts, UpdateStep,
    };

    // Hook system
    pub use crate::hooks::{CallFrame, Hook, HookSet, OpKind, Phase};

    // Output state
    pub use crate::output::EntityState;

    // Polling
    pub use crate::poll::{OnAbsent, PollResult, PollTarget};

    // Resource handlers
    pub use crate::resources::{Registry, StatusWait};

    // Retry
    pub use crate::retry::{BackoffStrategy, JitterStrategy, RetryPolicy, RetryPolicyBuilder};

    // Resource data
    pub use crate::state::{EntityHandle, ResourceData};
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result aliases for Stratoform operations.
///
/// This module provides the main [`Error`](error::Error) enum that covers all
/// possible error conditions, including transport failures, remote API
/// rejections, lifecycle interruptions, and configuration problems. The
/// taxonomy drives retry classification: [`Error::is_retryable`](error::Error::is_retryable)
/// is the default predicate used by every retry policy.
pub mod error;

/// Cancellation and deadline tracking for lifecycle operations.
///
/// A [`Budget`](budget::Budget) combines a cancellation token with an optional
/// deadline. Every suspension point in the crate goes through it, so both
/// caller cancellation and step timeouts interrupt waits promptly.
pub mod budget;

// ============================================================================
// Execution Primitives
// ============================================================================

/// Retry execution with wall-clock deadlines, backoff, and jitter.
///
/// Remote APIs fail transiently: connections drop, rate limits trip, and
/// internal errors clear on their own. This module wraps every remote call
/// in a [`RetryPolicy`](retry::RetryPolicy) that retries those failures
/// until a deadline passes, and fails fast on everything else.
pub mod retry;

/// Status polling for asynchronous remote state transitions.
///
/// Cloud entities change state on their own schedule. A
/// [`PollTarget`](poll::PollTarget) names the statuses that mean success,
/// the ones that mean "keep waiting", and the ones that mean the remote
/// side gave up, then probes until one of them (or a timeout) is reached.
pub mod poll;

/// Hook registration and dispatch around lifecycle operations.
///
/// Hooks are the extension mechanism: resource handlers install validation,
/// defaulting, encoding, and wait logic as hooks keyed by
/// [`Phase`](hooks::Phase), and the driver runs them in registration order
/// around each operation.
pub mod hooks;

// ============================================================================
// Lifecycle Engine
// ============================================================================

/// Lifecycle orchestration for one resource type.
///
/// The [`LifecycleDriver`](driver::LifecycleDriver) sequences a resource's
/// create, read, update, and delete operations: it runs hooks, retries
/// remote submissions, extracts entity handles, applies update steps in
/// order, and keeps deletes idempotent.
///
/// # Example
///
/// ```rust,ignore
/// use stratoform::driver::LifecycleDriver;
///
/// let driver = LifecycleDriver::builder("widget")
///     .create(build_request, submit, extract_handle)
///     .read(fetch)
///     .delete(delete)
///     .build()?;
/// ```
pub mod driver;

/// Declared and computed resource data.
///
/// [`ResourceData`](state::ResourceData) carries the caller's declared
/// fields, the prior state for change detection, and computed values that
/// accumulate during an operation.
pub mod state;

/// Result state assembled from remote API responses.
pub mod output;

// ============================================================================
// Infrastructure
// ============================================================================

/// HTTP client for the JSON-action cloud API.
///
/// The [`CloudApi`](client::CloudApi) trait is the seam between lifecycle
/// logic and the wire: production code uses [`HttpApi`](client::HttpApi),
/// tests substitute mocks or scripted fakes.
pub mod client;

/// Configuration loading, merging, and endpoint resolution.
///
/// Handles loading and merging configuration from multiple sources:
/// built-in defaults, system and user config files, and environment
/// variables.
pub mod config;

// ============================================================================
// Resource Handlers
// ============================================================================

/// Built-in resource handlers and the handler registry.
///
/// Each submodule wires one resource type into a
/// [`LifecycleDriver`](driver::LifecycleDriver):
///
/// - **`vm`**: Virtual machines, with stop/modify/restart resizing
/// - **`public_ip`**: Public IP allocation and VM attachment
/// - **`keypair`**: SSH keypair generation and import
/// - **`placement_group`**: VM placement strategies
/// - **`reserved_instance`**: Reserved capacity purchases
/// - **`image`**: Machine image capture and lookup
///
/// The [`Registry`](resources::Registry) maps resource type names to their
/// drivers.
pub mod resources;

// ============================================================================
// Version Information
// ============================================================================

/// Returns the current version of Stratoform.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns detailed version information including build metadata.
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        rust_version: option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown"),
        target: std::env::consts::ARCH,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Detailed version information for the Stratoform build.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Semantic version string
    pub version: &'static str,
    /// Minimum Rust version required
    pub rust_version: &'static str,
    /// Target triple for the build
    pub target: &'static str,
    /// Build profile (debug or release)
    pub profile: &'static str,
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stratoform {} ({}, {})",
            self.version, self.target, self.profile
        )
    }
}
