//! CSI Sanity Harness Library
//!
//! Lifecycle engine for conformance tests against a CSI plugin. Every test
//! case depends on it before and after it runs.
//!
//! This library provides:
//! - Connections to the plugin's node and controller endpoints, reused
//!   across test cases for as long as the configured address is unchanged
//! - Provisioning and removal of mount target and staging paths, by
//!   external command, callback, or plain directory handling
//! - Secrets loading for call-scoped credentials
//! - Collision-free resource names
//! - A sequential driver that runs setup, the test body and teardown

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod metrics;
pub mod names;
pub mod provision;
pub mod secrets;
pub mod suite;
pub mod types;

pub use config::{Config, PathHooks};
pub use connection::{ConnectError, Dialer, EndpointRole, GrpcDialer};
pub use context::SanityContext;
pub use error::{CleanupFailure, SanityError};
pub use names::UniqueSuffix;
pub use provision::{PathError, PathStrategy, create_location, remove_location};
pub use secrets::{CredentialBundle, SecretOperation, load_secrets};
pub use suite::{Suite, SuiteReport, TestCase};
