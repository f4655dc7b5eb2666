//! Per-test session lifecycle.
//!
//! One `SanityContext` lives for the whole run. Before every test case
//! [`SanityContext::setup`] loads secrets, resolves the node and controller
//! connections and provisions the target and staging paths; afterwards
//! [`SanityContext::teardown`] removes the paths again.
//!
//! Teardown leaves the connections open. They are re-established only when
//! the configured address changes and are closed once by
//! [`SanityContext::finish`].

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{Connections, Dialer, EndpointRole, GrpcDialer};
use crate::error::{CleanupFailure, Result, SanityError};
use crate::names::UniqueSuffix;
use crate::provision::{PathStrategy, RemovePathFn, create_location, remove_location};
use crate::secrets::{CredentialBundle, load_secrets};
use crate::types::Location;

/// State every test case can depend on.
pub struct SanityContext<D: Dialer = GrpcDialer> {
    config: Config,
    connections: Connections<D>,
    secrets: CredentialBundle,
    /// File the current `secrets` were read from.
    secrets_source: Option<PathBuf>,
    target_path: String,
    staging_path: String,
    names: UniqueSuffix,
}

impl SanityContext<GrpcDialer> {
    pub fn new(config: Config) -> Self {
        Self::with_dialer(config, GrpcDialer::default())
    }
}

impl<D: Dialer> SanityContext<D> {
    pub fn with_dialer(config: Config, dialer: D) -> Self {
        Self {
            config,
            connections: Connections::new(dialer),
            secrets: CredentialBundle::default(),
            secrets_source: None,
            target_path: String::new(),
            staging_path: String::new(),
            names: UniqueSuffix::generate(),
        }
    }

    /// Prepare the environment for the next test case.
    ///
    /// Any error is a failed precondition: the test case must not run.
    pub async fn setup(&mut self) -> Result<()> {
        self.load_secrets().await?;
        self.connect().await?;

        info!("creating mount and staging directories");
        self.target_path.clear();
        self.staging_path.clear();

        let target = self.provision(Location::Target).await?;
        self.target_path = target;

        let staging = self.provision(Location::Staging).await?;
        self.staging_path = staging;

        Ok(())
    }

    /// Remove the paths created by [`SanityContext::setup`].
    ///
    /// Both paths are attempted even if the first removal fails; all
    /// failures are reported together.
    pub async fn teardown(&mut self) -> Result<()> {
        let mut failures = Vec::new();

        let target = std::mem::take(&mut self.target_path);
        if let Err(failure) = self.remove(Location::Target, &target).await {
            failures.push(failure);
        }

        let staging = std::mem::take(&mut self.staging_path);
        if let Err(failure) = self.remove(Location::Staging, &staging).await {
            failures.push(failure);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SanityError::Cleanup(failures))
        }
    }

    /// Close the connections. Called once, after the last test case.
    pub fn finish(&mut self) {
        debug!("closing connections to CSI driver");
        self.connections.close();
    }

    async fn load_secrets(&mut self) -> Result<()> {
        let Some(path) = self.config.secrets_path() else {
            self.secrets = CredentialBundle::default();
            self.secrets_source = None;
            return Ok(());
        };

        if self.secrets_source.as_ref() == Some(&path) {
            return Ok(());
        }

        self.secrets = load_secrets(&path).await.map_err(SanityError::Secrets)?;
        self.secrets_source = Some(path);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        // Tests may rebind addresses between cases, so both endpoints are
        // re-evaluated on every setup.
        let address = self.config.address.clone();
        self.connections
            .ensure_node(&address)
            .await
            .map_err(|source| SanityError::Connect {
                role: EndpointRole::Node,
                address: address.clone(),
                source,
            })?;

        let controller_address = self.config.controller_address.clone();
        self.connections
            .ensure_controller(&controller_address)
            .await
            .map_err(|source| SanityError::Connect {
                role: EndpointRole::Controller,
                address: controller_address,
                source,
            })?;

        Ok(())
    }

    async fn provision(&self, location: Location) -> Result<String> {
        let (path, hooks) = match location {
            Location::Target => (&self.config.target_path, &self.config.create_target_path),
            Location::Staging => (&self.config.staging_path, &self.config.create_staging_path),
        };
        let strategy = hooks.strategy();

        create_location(path, strategy)
            .await
            .map_err(|source| SanityError::Provision {
                location,
                path: path.clone(),
                strategy: strategy.to_string(),
                source,
            })
    }

    async fn remove(&self, location: Location, path: &str) -> std::result::Result<(), CleanupFailure> {
        let hooks = match location {
            Location::Target => &self.config.remove_target_path,
            Location::Staging => &self.config.remove_staging_path,
        };
        let strategy: PathStrategy<'_, RemovePathFn> = hooks.strategy();

        remove_location(path, strategy).await.map_err(|source| {
            warn!(location = %location, path = %path, error = %source, "failed to remove directory");
            CleanupFailure {
                location,
                path: path.to_string(),
                strategy: strategy.to_string(),
                source,
            }
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable configuration, for tests that rebind endpoints or paths.
    /// Changes take effect at the next [`SanityContext::setup`].
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Node (data-plane) connection.
    pub fn conn(&self) -> Option<&D::Conn> {
        self.connections.node()
    }

    /// Controller connection; the node connection when no controller
    /// address is configured.
    pub fn controller_conn(&self) -> Option<&D::Conn> {
        self.connections.controller()
    }

    pub fn connections(&self) -> &Connections<D> {
        &self.connections
    }

    pub fn secrets(&self) -> &CredentialBundle {
        &self.secrets
    }

    /// Provisioned mount target path, empty when disabled.
    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    /// Provisioned staging path, empty when disabled.
    pub fn staging_path(&self) -> &str {
        &self.staging_path
    }

    /// Name derived from `prefix` and this run's random suffix.
    pub fn unique_string(&self, prefix: &str) -> String {
        self.names.unique_string(prefix)
    }

    pub fn unique_suffix(&self) -> &UniqueSuffix {
        &self.names
    }
}
