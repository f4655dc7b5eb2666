//! Mount target and staging path provisioning.
//!
//! A path is created or removed by exactly one of three strategies:
//! an external command, a caller-supplied callback, or the built-in
//! filesystem behaviour. An empty path disables provisioning entirely.
//!
//! External commands are invoked as `command <path>`. A command line that
//! contains whitespace is handed to `/bin/sh -c` with the path as `$1`, so
//! `mkdir -p "$1" && echo "$1"` works as well as a bare program name.
//! Standard output (trimmed) is the resulting path; standard error goes to
//! the harness's own stderr. A command that outlives its deadline is killed.

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::metrics::OperationTimer;

/// Boxed error returned by provisioning callbacks.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Creates a location and returns the path to use.
pub type CreatePathFn = Arc<dyn Fn(&str) -> Result<String, BoxError> + Send + Sync>;

/// Removes a location.
pub type RemovePathFn = Arc<dyn Fn(&str) -> Result<(), BoxError> + Send + Sync>;

/// Wrap a closure as a [`CreatePathFn`].
pub fn create_path_fn<F>(f: F) -> CreatePathFn
where
    F: Fn(&str) -> Result<String, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`RemovePathFn`].
pub fn remove_path_fn<F>(f: F) -> RemovePathFn
where
    F: Fn(&str) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Shell used for command lines with arguments.
const SHELL: &str = "/bin/sh";
/// `$0` seen by shell command lines.
const SHELL_ARG0: &str = "csi-sanity";

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path command {command} could not be started: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("path command {command} failed for {path}: {status}")]
    CommandFailed {
        command: String,
        path: String,
        status: ExitStatus,
    },

    #[error("path command {command} timed out after {timeout:?} for {path}")]
    Timeout {
        command: String,
        path: String,
        timeout: Duration,
    },

    #[error("path callback failed for {path}: {source}")]
    Callback {
        path: String,
        #[source]
        source: BoxError,
    },

    #[error("target location {0} is not a directory")]
    NotADirectory(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// How a path operation is carried out.
pub enum PathStrategy<'a, F> {
    /// Run an external command with the path as argument.
    ExternalCommand { command: &'a str, timeout: Duration },
    /// Call back into the embedding test code.
    Callback(&'a F),
    /// Plain directory creation / recursive removal.
    Default,
}

impl<F> Clone for PathStrategy<'_, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F> Copy for PathStrategy<'_, F> {}

impl<'a, F> PathStrategy<'a, F> {
    /// Pick the strategy for one operation: a non-empty command beats a
    /// callback, and the default only applies when both are absent.
    pub fn resolve(command: &'a str, callback: Option<&'a F>, timeout_secs: u64) -> Self {
        if !command.is_empty() {
            PathStrategy::ExternalCommand {
                command,
                timeout: Duration::from_secs(timeout_secs),
            }
        } else if let Some(callback) = callback {
            PathStrategy::Callback(callback)
        } else {
            PathStrategy::Default
        }
    }

    /// Short label for logs and metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            PathStrategy::ExternalCommand { .. } => "command",
            PathStrategy::Callback(_) => "callback",
            PathStrategy::Default => "default",
        }
    }
}

impl<F> Display for PathStrategy<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStrategy::ExternalCommand { command, timeout } => {
                write!(f, "command {:?} (timeout {}s)", command, timeout.as_secs())
            }
            PathStrategy::Callback(_) => write!(f, "callback"),
            PathStrategy::Default => write!(f, "default"),
        }
    }
}

impl<F> fmt::Debug for PathStrategy<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Create the location for `path` and return the path tests should use.
///
/// Returns an empty string without doing anything when `path` is empty.
pub async fn create_location(
    path: &str,
    strategy: PathStrategy<'_, CreatePathFn>,
) -> Result<String, PathError> {
    if path.is_empty() {
        return Ok(String::new());
    }

    debug!(path = %path, strategy = %strategy, "creating location");
    let timer = OperationTimer::new("create", strategy.kind());

    let result = match strategy {
        PathStrategy::ExternalCommand { command, timeout } => {
            run_command(command, path, timeout).await
        }
        PathStrategy::Callback(callback) => {
            callback(path).map_err(|source| PathError::Callback {
                path: path.to_string(),
                source,
            })
        }
        PathStrategy::Default => create_directory(path).await,
    };

    timer.finish(result.is_ok());
    result
}

/// Remove the location at `path`. An empty path is a no-op.
pub async fn remove_location(
    path: &str,
    strategy: PathStrategy<'_, RemovePathFn>,
) -> Result<(), PathError> {
    if path.is_empty() {
        return Ok(());
    }

    debug!(path = %path, strategy = %strategy, "removing location");
    let timer = OperationTimer::new("remove", strategy.kind());

    let result = match strategy {
        PathStrategy::ExternalCommand { command, timeout } => {
            run_command(command, path, timeout).await.map(|_| ())
        }
        PathStrategy::Callback(callback) => {
            callback(path).map_err(|source| PathError::Callback {
                path: path.to_string(),
                source,
            })
        }
        PathStrategy::Default => remove_all(path).await,
    };

    timer.finish(result.is_ok());
    result
}

fn build_command(command: &str, path: &str) -> Command {
    let mut cmd = if command.contains(char::is_whitespace) {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(command).arg(SHELL_ARG0).arg(path);
        cmd
    } else {
        let mut cmd = Command::new(command);
        cmd.arg(path);
        cmd
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

/// Run `command <path>` under a deadline and return its trimmed stdout.
async fn run_command(command: &str, path: &str, timeout: Duration) -> Result<String, PathError> {
    let child = build_command(command, path)
        .spawn()
        .map_err(|source| PathError::Spawn {
            command: command.to_string(),
            source,
        })?;

    // Dropping the wait future on expiry drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.map_err(|source| PathError::Io {
            path: path.to_string(),
            source,
        })?,
        Err(_) => {
            return Err(PathError::Timeout {
                command: command.to_string(),
                path: path.to_string(),
                timeout,
            });
        }
    };

    if !output.status.success() {
        return Err(PathError::CommandFailed {
            command: command.to_string(),
            path: path.to_string(),
            status: output.status,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn create_directory(path: &str) -> Result<String, PathError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(path.to_string()),
        Ok(_) => Err(PathError::NotADirectory(path.to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o755);
            builder.create(path).await.map_err(|source| PathError::Io {
                path: path.to_string(),
                source,
            })?;
            info!(path = %path, "created directory");
            Ok(path.to_string())
        }
        Err(source) => Err(PathError::Io {
            path: path.to_string(),
            source,
        }),
    }
}

/// Remove `path` and everything below it. A missing path is not an error.
async fn remove_all(path: &str) -> Result<(), PathError> {
    let io_err = |source| PathError::Io {
        path: path.to_string(),
        source,
    };

    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(e)),
    };

    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn path_str(p: &std::path::Path) -> String {
        p.to_string_lossy().to_string()
    }

    #[test]
    fn test_resolve_priority() {
        let callback = create_path_fn(|p| Ok(p.to_string()));

        let s = PathStrategy::resolve("cmd", Some(&callback), 5);
        assert_eq!(s.kind(), "command");

        let s = PathStrategy::resolve("", Some(&callback), 5);
        assert_eq!(s.kind(), "callback");

        let s = PathStrategy::<CreatePathFn>::resolve("", None, 5);
        assert_eq!(s.kind(), "default");
    }

    #[test]
    fn test_strategy_display() {
        let s = PathStrategy::<CreatePathFn>::resolve("/usr/bin/mkpath", None, 7);
        assert_eq!(s.to_string(), "command \"/usr/bin/mkpath\" (timeout 7s)");
        assert_eq!(
            PathStrategy::<CreatePathFn>::Default.to_string(),
            "default"
        );
    }

    #[tokio::test]
    async fn test_empty_path_is_noop() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let create = create_path_fn(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok("/elsewhere".to_string())
        });
        let c = calls.clone();
        let remove = remove_path_fn(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(
            create_location("", PathStrategy::Callback(&create))
                .await
                .unwrap(),
            ""
        );
        remove_location("", PathStrategy::Callback(&remove))
            .await
            .unwrap();
        assert_eq!(
            create_location("", PathStrategy::resolve("/bin/false", None, 1))
                .await
                .unwrap(),
            ""
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_creates_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let target = path_str(&temp_dir.path().join("a/b/target"));

        let created = create_location(&target, PathStrategy::Default)
            .await
            .unwrap();
        assert_eq!(created, target);
        assert!(temp_dir.path().join("a/b/target").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o700, 0o700);
        }
    }

    #[tokio::test]
    async fn test_default_existing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let target = path_str(temp_dir.path());
        let marker = temp_dir.path().join("keep");
        std::fs::write(&marker, b"x").unwrap();

        let created = create_location(&target, PathStrategy::Default)
            .await
            .unwrap();
        assert_eq!(created, target);
        assert!(marker.exists(), "existing contents must be untouched");
    }

    #[tokio::test]
    async fn test_default_rejects_regular_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let err = create_location(&path_str(&file), PathStrategy::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, PathError::NotADirectory(_)));
        assert!(err.to_string().contains("is not a directory"));
    }

    #[tokio::test]
    async fn test_default_remove_recursive() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target");
        std::fs::create_dir_all(target.join("nested/deeper")).unwrap();
        std::fs::write(target.join("nested/file"), b"x").unwrap();

        remove_location(&path_str(&target), PathStrategy::Default)
            .await
            .unwrap();
        assert!(!target.exists());

        // Already gone
        remove_location(&path_str(&target), PathStrategy::Default)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_callback_passthrough() {
        let create = create_path_fn(|p| Ok(format!("{}/mnt", p)));
        let path = create_location("/base", PathStrategy::Callback(&create))
            .await
            .unwrap();
        assert_eq!(path, "/base/mnt");

        let failing = create_path_fn(|_| Err("no space left".into()));
        let err = create_location("/base", PathStrategy::Callback(&failing))
            .await
            .unwrap_err();
        assert!(matches!(err, PathError::Callback { .. }));
        assert!(err.to_string().contains("no space left"));
    }

    #[tokio::test]
    async fn test_command_stdout_becomes_path() {
        let path = create_location(
            "/ignored",
            PathStrategy::resolve("/bin/echo /custom/path", None, 5),
        )
        .await
        .unwrap();
        assert_eq!(path, "/custom/path");
    }

    #[tokio::test]
    async fn test_bare_command_receives_path() {
        let path = create_location("/some/where", PathStrategy::resolve("/bin/echo", None, 5))
            .await
            .unwrap();
        assert_eq!(path, "/some/where");
    }

    #[tokio::test]
    async fn test_command_failure() {
        let err = create_location("/x", PathStrategy::resolve("/bin/false", None, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, PathError::CommandFailed { .. }));

        let err = remove_location("/x", PathStrategy::resolve("exit 3", None, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, PathError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_command_not_found() {
        let err = create_location(
            "/x",
            PathStrategy::resolve("/nonexistent/csi-sanity-mkpath", None, 5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PathError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_command_timeout_kills_process() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("marker");
        let command = format!("sleep 1; touch {}", marker.display());

        let err = create_location("/x", PathStrategy::resolve(&command, None, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, PathError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "timed out command must be killed");
    }

    #[tokio::test]
    async fn test_remove_command_output_ignored() {
        remove_location("/x", PathStrategy::resolve("/bin/echo", None, 5))
            .await
            .unwrap();
    }
}
