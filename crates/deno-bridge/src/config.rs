//! Server configuration types.

use crate::error::{BridgeError, Result};
use crate::permissions::render_permission_flags;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Environment variable overriding the default executable name.
pub const DENO_EXECUTABLE_ENV: &str = "DENO_EXECUTABLE";

/// Default executable name when neither an override nor the environment
/// variable is set.
pub const DEFAULT_EXECUTABLE: &str = "deno";

/// Configuration for launching a VM server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Explicit executable override. When `None`, the executable is
    /// resolved from `DENO_EXECUTABLE`, then falls back to `"deno"`.
    pub command: Option<String>,
    /// Permission map for the server process. Each key is a permission
    /// category and each value a list of scope strings.
    pub permissions: Option<Map<String, Value>>,
    /// Path to the bridge server entry script.
    pub server_script: PathBuf,
    /// Path to the bundled worker script. The server is granted read
    /// access to exactly this path.
    pub worker_script: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let assets = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("vm-server");
        Self {
            command: None,
            permissions: None,
            server_script: assets.join("index.js"),
            worker_script: assets
                .join("vendor/deno.land/x/worker_vm@v0.2.0/worker.ts"),
        }
    }
}

impl ServerConfig {
    /// Create a new config builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Resolve the executable: explicit override, then the
    /// `DENO_EXECUTABLE` environment variable, then `"deno"`.
    pub fn resolve_command(&self) -> String {
        if let Some(command) = &self.command {
            return command.clone();
        }
        std::env::var(DENO_EXECUTABLE_ENV).unwrap_or_else(|_| DEFAULT_EXECUTABLE.to_string())
    }

    /// Validate the configuration, including the permission map.
    pub fn validate(&self) -> Result<()> {
        if self.server_script.as_os_str().is_empty() {
            return Err(BridgeError::InvalidPermissions(
                "server_script is required".into(),
            ));
        }
        if self.worker_script.as_os_str().is_empty() {
            return Err(BridgeError::InvalidPermissions(
                "worker_script is required".into(),
            ));
        }
        if let Some(permissions) = &self.permissions {
            render_permission_flags(permissions)?;
        }
        Ok(())
    }

    /// Build the full launch argument vector (everything after the
    /// executable name).
    pub fn launch_args(&self) -> Result<Vec<String>> {
        let mut args = vec!["run".to_string(), "--unstable-worker-options".to_string()];
        if let Some(permissions) = &self.permissions {
            args.extend(render_permission_flags(permissions)?);
        }
        args.push(format!("--allow-read={}", self.worker_script.display()));
        args.push(self.server_script.display().to_string());
        Ok(args)
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set an explicit executable override.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.config.command = Some(command.into());
        self
    }

    /// Set the permission map for the server process.
    pub fn permissions(mut self, permissions: Map<String, Value>) -> Self {
        self.config.permissions = Some(permissions);
        self
    }

    /// Set the server entry script path.
    pub fn server_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.server_script = path.into();
        self
    }

    /// Set the bundled worker script path.
    pub fn worker_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.worker_script = path.into();
        self
    }

    /// Build the configuration, validating the permission map.
    pub fn build(self) -> Result<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_explicit_command_wins() {
        let config = ServerConfig::builder().command("my-deno").build().unwrap();
        assert_eq!(config.resolve_command(), "my-deno");
    }

    #[test]
    fn test_default_command() {
        let config = ServerConfig::default();
        if std::env::var(DENO_EXECUTABLE_ENV).is_err() {
            assert_eq!(config.resolve_command(), DEFAULT_EXECUTABLE);
        }
    }

    #[test]
    fn test_launch_args_shape() {
        let config = ServerConfig::builder()
            .permissions(
                json!({"net": ["example.com:443"]})
                    .as_object()
                    .unwrap()
                    .clone(),
            )
            .server_script("/srv/index.js")
            .worker_script("/srv/worker.ts")
            .build()
            .unwrap();
        let args = config.launch_args().unwrap();
        assert_eq!(
            args,
            vec![
                "run",
                "--unstable-worker-options",
                "--allow-net=example.com:443",
                "--allow-read=/srv/worker.ts",
                "/srv/index.js",
            ]
        );
    }

    #[test]
    fn test_invalid_permissions_fail_build() {
        let result = ServerConfig::builder()
            .permissions(json!({"net": 42}).as_object().unwrap().clone())
            .build();
        assert!(result.is_err());
    }
}
