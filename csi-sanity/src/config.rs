//! Harness configuration.
//!
//! `Config` is filled in by the caller (or the CLI) before the suite starts
//! and is only read by the session afterwards.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::provision::{CreatePathFn, PathStrategy, RemovePathFn};
use crate::secrets::{SecretsError, read_yaml};

/// Default deadline for external path commands, in seconds.
pub const DEFAULT_PATH_CMD_TIMEOUT_SECS: u64 = 10;

/// Default size of volumes created by the tests (10 GiB).
pub const DEFAULT_TEST_VOLUME_SIZE: i64 = 10 * 1024 * 1024 * 1024;

/// Overrides for one path operation.
///
/// A non-empty `command` wins over `callback`; with neither set the
/// built-in filesystem behaviour applies.
#[derive(Clone)]
pub struct PathHooks<F> {
    /// External command, invoked with the path as its argument.
    pub command: String,
    pub callback: Option<F>,
    /// Deadline for `command`, in seconds.
    pub timeout_secs: u64,
}

impl<F> Default for PathHooks<F> {
    fn default() -> Self {
        Self {
            command: String::new(),
            callback: None,
            timeout_secs: DEFAULT_PATH_CMD_TIMEOUT_SECS,
        }
    }
}

impl<F> fmt::Debug for PathHooks<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathHooks")
            .field("command", &self.command)
            .field("callback", &self.callback.is_some())
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl<F> PathHooks<F> {
    pub fn with_command(command: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            callback: None,
            timeout_secs,
        }
    }

    pub fn with_callback(callback: F) -> Self {
        Self {
            callback: Some(callback),
            ..Self::default()
        }
    }

    /// Resolve the hooks to the strategy that will actually run.
    pub fn strategy(&self) -> PathStrategy<'_, F> {
        PathStrategy::resolve(&self.command, self.callback.as_ref(), self.timeout_secs)
    }
}

/// Configuration for a sanity run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mount target path handed to NodePublishVolume. Empty disables it.
    pub target_path: String,
    /// Staging path handed to NodeStageVolume. Empty disables it.
    pub staging_path: String,
    /// Data-plane (node) endpoint.
    pub address: String,
    /// Control-plane endpoint. Empty means "use `address`".
    pub controller_address: String,
    /// YAML secrets file. Empty means no credentials.
    pub secrets_file: String,

    pub test_volume_size: i64,
    /// YAML file merged into `test_volume_parameters` at startup.
    pub test_volume_parameters_file: String,
    pub test_volume_parameters: HashMap<String, String>,
    pub test_node_volume_attach_limit: bool,

    pub create_target_path: PathHooks<CreatePathFn>,
    pub create_staging_path: PathHooks<CreatePathFn>,
    pub remove_target_path: PathHooks<RemovePathFn>,
    pub remove_staging_path: PathHooks<RemovePathFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_path: String::new(),
            staging_path: String::new(),
            address: String::new(),
            controller_address: String::new(),
            secrets_file: String::new(),
            test_volume_size: DEFAULT_TEST_VOLUME_SIZE,
            test_volume_parameters_file: String::new(),
            test_volume_parameters: HashMap::new(),
            test_node_volume_attach_limit: false,
            create_target_path: PathHooks::default(),
            create_staging_path: PathHooks::default(),
            remove_target_path: PathHooks::default(),
            remove_staging_path: PathHooks::default(),
        }
    }
}

impl Config {
    /// Merge the test volume parameters file, if one is configured.
    ///
    /// Entries from the file override entries already present. Errors
    /// here are fatal: the suite must not start with half-read parameters.
    pub async fn load_test_volume_parameters(&mut self) -> Result<(), SecretsError> {
        if self.test_volume_parameters_file.is_empty() {
            return Ok(());
        }
        let path = PathBuf::from(&self.test_volume_parameters_file);
        let params: HashMap<String, String> = read_yaml(&path).await?;
        tracing::info!(
            path = %path.display(),
            count = params.len(),
            "loaded test volume parameters"
        );
        self.test_volume_parameters.extend(params);
        Ok(())
    }

    /// Secrets file, if configured.
    pub fn secrets_path(&self) -> Option<PathBuf> {
        if self.secrets_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.secrets_file))
        }
    }
}
