//! TOML-based configuration for obsgit.
//!
//! Passwords are never stored in the file: each service section names an
//! environment variable (`password_env`) that is resolved at runtime via
//! [`ObsGitConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::file_policy::DEFAULT_LARGE_THRESHOLD;
use crate::link::LinkPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsGitConfig {
    /// Build service used as the source of `export`.
    pub export: ServiceConfig,

    /// Build service used as the destination of `import`.
    pub import: ServiceConfig,

    /// Large-file storage backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Local tree layout.
    #[serde(default)]
    pub git: GitConfig,

    /// Large-file classification.
    #[serde(default)]
    pub files: FilesConfig,

    /// Scheduling of per-package work.
    #[serde(default)]
    pub run: RunConfig,
}

// ---------------------------------------------------------------------------
// Build service
// ---------------------------------------------------------------------------

/// Connection settings for one build-service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// API root URL (e.g. `https://api.opensuse.org`).
    pub url: String,

    pub username: String,

    /// Environment variable holding the password.
    pub password_env: String,

    /// How package links are exported. Ignored by `import`.
    #[serde(default)]
    pub link: LinkPolicy,

    /// Fail packages whose kept link points outside the project.
    #[serde(default)]
    pub strict_links: bool,

    /// Private key for SSH signature authentication. When set, the
    /// password only unlocks the key.
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,

    /// Resolved password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub password: Option<String>,
}

impl ServiceConfig {
    pub fn new(url: impl Into<String>, username: impl Into<String>, password_env: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password_env: password_env.into(),
            link: LinkPolicy::default(),
            strict_links: false,
            ssh_key: None,
            password: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Which large-file backend to use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Git LFS objects and pointers in the local repository.
    #[default]
    Lfs,
    /// Blobs kept in a package of a build service.
    Obs,
}

/// Large-file storage settings. Connection fields are only used by the
/// `obs` backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub storage_type: StorageType,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password_env: Option<String>,

    #[serde(default)]
    pub ssh_key: Option<PathBuf>,

    /// Blob store location as `<project>/<package>`.
    #[serde(default)]
    pub storage: Option<String>,

    #[serde(skip)]
    pub password: Option<String>,
}

impl StorageConfig {
    /// Split `storage` into project and package.
    pub fn location(&self) -> Result<(&str, &str), ConfigError> {
        let value = self.storage.as_deref().ok_or_else(|| ConfigError::InvalidValue {
            field: "storage.storage".into(),
            detail: "required when storage type is 'obs'".into(),
        })?;
        match value.split_once('/') {
            Some((project, package))
                if !project.is_empty() && !package.is_empty() && !package.contains('/') =>
            {
                Ok((project, package))
            }
            _ => Err(ConfigError::InvalidValue {
                field: "storage.storage".into(),
                detail: format!("expected '<project>/<package>', got '{}'", value),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tree layout, files, run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Directory inside the repository holding one directory per package.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "packages".into()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

/// Large-file classification settings, see [`crate::file_policy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Unknown files smaller than this many bytes are always text.
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u64,

    /// Globs (matched against the file name) always routed to storage.
    #[serde(default)]
    pub large_patterns: Vec<String>,

    /// Globs always kept in the tree.
    #[serde(default)]
    pub text_patterns: Vec<String>,
}

fn default_large_threshold() -> u64 {
    DEFAULT_LARGE_THRESHOLD
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            large_threshold: default_large_threshold(),
            large_patterns: Vec::new(),
            text_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Packages processed concurrently.
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Stop scheduling packages after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_jobs() -> usize {
    4
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            fail_fast: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl ObsGitConfig {
    /// Configuration written by `create-config`.
    pub fn template(
        api: &str,
        username: &str,
        password_env: &str,
        link: LinkPolicy,
        storage_type: StorageType,
        prefix: &str,
    ) -> Self {
        let mut export = ServiceConfig::new(api, username, password_env);
        export.link = link;
        let storage = match storage_type {
            StorageType::Lfs => StorageConfig::default(),
            StorageType::Obs => StorageConfig {
                storage_type,
                url: Some(api.to_string()),
                username: Some(username.to_string()),
                password_env: Some(password_env.to_string()),
                ssh_key: None,
                storage: Some(format!("home:{}:storage/files", username)),
                password: None,
            },
        };
        Self {
            export,
            import: ServiceConfig::new(api, username, password_env),
            storage,
            git: GitConfig {
                prefix: prefix.to_string(),
            },
            files: FilesConfig::default(),
            run: RunConfig::default(),
        }
    }

    /// Load an [`ObsGitConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: ObsGitConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Serialize to TOML and write with owner-only permissions.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(path = %path.display(), "wrote configuration");
        Ok(())
    }

    /// Resolve all `password_env` fields from environment variables.
    ///
    /// Missing variables only log a warning; anonymous access may be enough
    /// for some services.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.export.password = resolve_optional_env(&self.export.password_env, "export.password_env");
        self.import.password = resolve_optional_env(&self.import.password_env, "import.password_env");

        if let Some(ref env_name) = self.storage.password_env {
            self.storage.password = resolve_optional_env(env_name, "storage.password_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, service) in [("export", &self.export), ("import", &self.import)] {
            if service.url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.url", field),
                    detail: "API URL must not be empty".into(),
                });
            }
            if service.username.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.username", field),
                    detail: "username must not be empty".into(),
                });
            }
        }
        if self.storage.storage_type == StorageType::Obs {
            if self.storage.url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::InvalidValue {
                    field: "storage.url".into(),
                    detail: "required when storage type is 'obs'".into(),
                });
            }
            self.storage.location()?;
        }
        if self.git.prefix.is_empty() || self.git.prefix.starts_with('/') || self.git.prefix.contains("..") {
            return Err(ConfigError::InvalidValue {
                field: "git.prefix".into(),
                detail: "must be a relative path inside the repository".into(),
            });
        }
        if self.run.jobs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "run.jobs".into(),
                detail: "must be > 0".into(),
            });
        }
        for pattern in self.files.large_patterns.iter().chain(&self.files.text_patterns) {
            if pattern.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "files".into(),
                    detail: "empty glob pattern".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
