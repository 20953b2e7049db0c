//! Configuration loading via `ortho-config`.
//!
//! Each concern has its own struct and environment prefix. Values merge
//! defaults, `hatch.toml` (found through `HATCH_CONFIG_PATH`, the XDG config
//! directory, a dotfile, or the project directory), and environment variables.
//! Missing credentials are not load errors: they surface later, when a driver
//! is constructed, as a message naming the setting to provide.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::readiness::PollPolicy;
use crate::session::ProviderKind;

const APP_NAME: &str = "hatch";
const CONFIG_FILE: &str = "hatch.toml";

/// Core settings shared by every command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HATCH",
    discovery(
        app_name = "hatch",
        env_var = "HATCH_CONFIG_PATH",
        config_file_name = "hatch.toml",
        dotfile_name = ".hatch.toml",
        project_file_name = "hatch.toml"
    )
)]
pub struct HatchConfig {
    /// Directory holding `sessions.json` and `keys/`. Defaults to the
    /// platform data directory.
    pub state_dir: Option<String>,
    /// Provider used when `create` is not given one.
    #[ortho_config(default = "vm-instance".to_owned())]
    pub default_provider: String,
    /// Readiness attempts before giving up.
    #[ortho_config(default = 30)]
    pub poll_attempts: u32,
    /// Seconds between readiness attempts.
    #[ortho_config(default = 2)]
    pub poll_interval_secs: u64,
    /// Timeout applied to every control-plane request.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
    /// Whether a session that never becomes ready is torn down.
    #[ortho_config(default = true)]
    pub cleanup_on_failure: bool,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
}

impl HatchConfig {
    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        load_layers()
    }

    /// Resolves the state directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no directory is configured and
    /// the platform data directory cannot be determined or is not UTF-8.
    pub fn state_dir(&self) -> Result<Utf8PathBuf, ConfigError> {
        if let Some(configured) = self.state_dir.as_deref().map(str::trim)
            && !configured.is_empty()
        {
            return Ok(Utf8PathBuf::from(configured));
        }
        let dirs = ProjectDirs::from("", "", APP_NAME).ok_or_else(|| ConfigError::Invalid {
            field: "state_dir",
            message: HATCH.hint("state directory", "state_dir"),
        })?;
        Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf()).map_err(|path| {
            ConfigError::Invalid {
                field: "state_dir",
                message: format!("{} is not valid UTF-8", path.display()),
            }
        })
    }

    /// Directory holding per-session key files.
    ///
    /// # Errors
    ///
    /// See [`HatchConfig::state_dir`].
    pub fn key_dir(&self) -> Result<Utf8PathBuf, ConfigError> {
        Ok(self.state_dir()?.join("keys"))
    }

    /// Parses the default provider name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the name is unknown.
    pub fn default_provider(&self) -> Result<ProviderKind, ConfigError> {
        self.default_provider
            .parse()
            .map_err(|err: crate::session::UnknownProvider| ConfigError::Invalid {
                field: "default_provider",
                message: err.to_string(),
            })
    }

    /// Readiness policy built from the configured attempts and interval.
    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.poll_attempts,
            Duration::from_secs(self.poll_interval_secs),
        )
    }

    /// Per-request timeout for control-plane calls, at least one second.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Scaleway Instances settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCW",
    discovery(
        app_name = "hatch",
        env_var = "HATCH_CONFIG_PATH",
        config_file_name = "hatch.toml",
        dotfile_name = ".hatch.toml",
        project_file_name = "hatch.toml"
    )
)]
pub struct ScalewayConfig {
    /// Access key of the Scaleway application; informational only.
    pub access_key: Option<String>,
    /// Secret key used for authentication.
    pub secret_key: Option<String>,
    /// Organisation identifier used by some endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: Option<String>,
    /// Availability zone.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new servers.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Image label resolved to an image id at create time.
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture of the image.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
    /// Account the bridge logs in as.
    #[ortho_config(default = "root".to_owned())]
    pub login_user: String,
}

impl ScalewayConfig {
    /// Checks every required setting, naming the first one that is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the env var and TOML key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        SCALEWAY.require_set(self.secret_key.as_deref(), "Scaleway API secret key", "secret_key")?;
        SCALEWAY.require_set(
            self.default_project_id.as_deref(),
            "Scaleway project ID",
            "default_project_id",
        )?;
        SCALEWAY.require(&self.default_zone, "availability zone", "default_zone")?;
        SCALEWAY.require(&self.default_instance_type, "instance type", "default_instance_type")?;
        SCALEWAY.require(&self.default_image, "VM image", "default_image")?;
        SCALEWAY.require(&self.default_architecture, "CPU architecture", "default_architecture")?;
        SCALEWAY.require(&self.login_user, "login user", "login_user")
    }
}

/// Kubernetes-compatible cluster settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HATCH_CLUSTER",
    discovery(
        app_name = "hatch",
        env_var = "HATCH_CONFIG_PATH",
        config_file_name = "hatch.toml",
        dotfile_name = ".hatch.toml",
        project_file_name = "hatch.toml"
    )
)]
pub struct ClusterConfig {
    /// Base URL of the cluster API server.
    pub api_url: Option<String>,
    /// Bearer token with rights to manage pods and read nodes.
    pub token: Option<String>,
    /// PEM bundle used to verify the API server certificate.
    pub ca_bundle: Option<String>,
    /// Namespace receiving session pods.
    #[ortho_config(default = "default".to_owned())]
    pub namespace: String,
    /// Container image running an OpenSSH server that honours `PUBLIC_KEY`.
    #[ortho_config(default = "lscr.io/linuxserver/openssh-server:latest".to_owned())]
    pub image: String,
    /// Port the SSH server listens on inside the container.
    #[ortho_config(default = 2222)]
    pub ssh_port: u16,
    /// CPU request per pod.
    #[ortho_config(default = "500m".to_owned())]
    pub cpu: String,
    /// Memory request per pod.
    #[ortho_config(default = "512Mi".to_owned())]
    pub memory: String,
    /// Account created in the container for the bridge.
    #[ortho_config(default = "hatch".to_owned())]
    pub login_user: String,
}

impl ClusterConfig {
    /// Checks every required setting, naming the first one that is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the env var and TOML key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        CLUSTER.require_set(self.api_url.as_deref(), "cluster API URL", "api_url")?;
        CLUSTER.require_set(self.token.as_deref(), "cluster API token", "token")?;
        CLUSTER.require(&self.namespace, "namespace", "namespace")?;
        CLUSTER.require(&self.image, "SSH server image", "image")?;
        CLUSTER.require(&self.login_user, "login user", "login_user")?;
        if self.ssh_port == 0 {
            return Err(ConfigError::Invalid {
                field: "ssh_port",
                message: String::from("HATCH_CLUSTER_SSH_PORT must be a non-zero port"),
            });
        }
        Ok(())
    }
}

/// GitHub Codespaces settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HATCH_CODESPACES",
    discovery(
        app_name = "hatch",
        env_var = "HATCH_CONFIG_PATH",
        config_file_name = "hatch.toml",
        dotfile_name = ".hatch.toml",
        project_file_name = "hatch.toml"
    )
)]
pub struct CodespacesConfig {
    /// GitHub token with the `codespace` scope.
    pub token: Option<String>,
    /// Repository the codespace is created from, as `owner/name`.
    pub repository: Option<String>,
    /// Branch to check out; the repository default when unset.
    pub branch: Option<String>,
    /// Machine type.
    #[ortho_config(default = "basicLinux32gb".to_owned())]
    pub machine: String,
    /// Minutes of inactivity before GitHub stops the codespace.
    #[ortho_config(default = 30)]
    pub idle_timeout_minutes: u32,
    /// REST API base URL.
    #[ortho_config(default = "https://api.github.com".to_owned())]
    pub api_base: String,
    /// Path to the GitHub CLI used for SSH access.
    #[ortho_config(default = "gh".to_owned())]
    pub gh_bin: String,
}

impl CodespacesConfig {
    /// Checks every required setting, naming the first one that is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the env var and TOML key,
    /// or [`ConfigError::Invalid`] for a malformed repository.
    pub fn validate(&self) -> Result<(), ConfigError> {
        CODESPACES.require_set(self.token.as_deref(), "GitHub token", "token")?;
        let repository = CODESPACES.require_set(
            self.repository.as_deref(),
            "repository (owner/name)",
            "repository",
        )?;
        let well_formed = repository
            .split_once('/')
            .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'));
        if !well_formed {
            return Err(ConfigError::Invalid {
                field: "repository",
                message: format!("'{repository}' is not in owner/name form"),
            });
        }
        CODESPACES.require(&self.machine, "machine type", "machine")?;
        CODESPACES.require(&self.gh_bin, "GitHub CLI path", "gh_bin")
    }
}

/// Every provider's settings plus the shared request timeout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvidersConfig {
    /// VM-instance driver settings.
    pub scaleway: ScalewayConfig,
    /// Container-task driver settings.
    pub cluster: ClusterConfig,
    /// Hosted-container driver settings.
    pub codespaces: CodespacesConfig,
    /// Per-request timeout applied by every driver.
    pub request_timeout: Duration,
}

impl ProvidersConfig {
    /// Loads every provider's settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when any source fails to merge.
    pub fn load_without_cli_args(request_timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            scaleway: load_layers()?,
            cluster: load_layers()?,
            codespaces: load_layers()?,
            request_timeout,
        })
    }
}

fn load_layers<T: OrthoConfig>() -> Result<T, ConfigError> {
    T::load_from_iter([OsString::from(APP_NAME)]).map_err(|err| ConfigError::Parse(err.to_string()))
}

/// A `hatch.toml` table and the environment prefix of its keys, used to turn
/// a missing setting into a message naming both places it can be set.
struct Section {
    table: &'static str,
    env_prefix: &'static str,
}

const HATCH: Section = Section::new("hatch", "HATCH");
const SCALEWAY: Section = Section::new("scaleway", "SCW");
const CLUSTER: Section = Section::new("cluster", "HATCH_CLUSTER");
const CODESPACES: Section = Section::new("codespaces", "HATCH_CODESPACES");

impl Section {
    const fn new(table: &'static str, env_prefix: &'static str) -> Self {
        Self { table, env_prefix }
    }

    fn hint(&self, description: &str, key: &str) -> String {
        format!(
            "missing {description}: set {}_{} or add {key} to [{}] in {CONFIG_FILE}",
            self.env_prefix,
            key.to_ascii_uppercase(),
            self.table
        )
    }

    fn require(&self, value: &str, description: &str, key: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(self.hint(description, key)));
        }
        Ok(())
    }

    fn require_set<'a>(
        &self,
        value: Option<&'a str>,
        description: &str,
        key: &str,
    ) -> Result<&'a str, ConfigError> {
        match value.map(str::trim) {
            Some(present) if !present.is_empty() => Ok(present),
            _ => Err(ConfigError::MissingField(self.hint(description, key))),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required setting is empty or missing.
    #[error("{0}")]
    MissingField(String),
    /// A setting is present but unusable.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
    /// The `ortho-config` loader failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
