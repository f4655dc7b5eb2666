use std::fmt::{self, Display};

use thiserror::Error;

use crate::connection::{ConnectError, EndpointRole};
use crate::provision::PathError;
use crate::secrets::SecretsError;
use crate::types::Location;

#[derive(Error, Debug)]
pub enum SanityError {
    #[error("failed to load secrets: {0}")]
    Secrets(#[source] SecretsError),

    #[error("failed to load test volume parameters: {0}")]
    Parameters(#[source] SecretsError),

    #[error("failed to connect to CSI driver {role} endpoint at {address}: {source}")]
    Connect {
        role: EndpointRole,
        address: String,
        #[source]
        source: ConnectError,
    },

    #[error("failed to create {location} directory {path} using {strategy}: {source}")]
    Provision {
        location: Location,
        path: String,
        strategy: String,
        #[source]
        source: PathError,
    },

    #[error("cleanup failed: {}", join_failures(.0))]
    Cleanup(Vec<CleanupFailure>),
}

/// A provisioned path that could not be removed.
#[derive(Debug)]
pub struct CleanupFailure {
    pub location: Location,
    pub path: String,
    pub strategy: String,
    pub source: PathError,
}

impl Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to remove {} directory {} using {}: {}",
            self.location, self.path, self.strategy, self.source
        )
    }
}

fn join_failures(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, SanityError>;
