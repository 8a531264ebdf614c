//! Launch configuration shared by every spawn.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::secrets::fetcher::{ACCESS_KEY_FIELD, SECRET_KEY_FIELD};

/// NFS export backing user home directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsVolume {
    pub server: String,
    pub path: String,
}

/// Static launch settings applied to every planned session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchConfig {
    /// Command for a classic notebook session.
    #[serde(default = "default_command")]
    pub default_command: Vec<String>,

    /// Command when the "jupyterlab" option is selected.
    #[serde(default = "default_lab_command")]
    pub lab_command: Vec<String>,

    /// Object storage endpoint handed to sessions as S3_ENDPOINT_URL.
    #[serde(default)]
    pub storage_endpoint_url: Option<String>,

    /// Images users may pick. Empty allows any image.
    #[serde(default)]
    pub allowed_images: Vec<String>,

    /// Hub environment values copied into every session.
    #[serde(default)]
    pub kept_env: BTreeMap<String, String>,

    /// Shared home volume.
    #[serde(default)]
    pub home_volume: Option<NfsVolume>,

    #[serde(default = "default_home_mount_path")]
    pub home_mount_path: String,

    #[serde(default = "default_notebook_dir")]
    pub notebook_dir: String,

    /// Landing URL; `{username}` is replaced with the user's name.
    #[serde(default = "default_url_template")]
    pub default_url: String,
}

/// Hub variables passed through to sessions unless overridden.
pub const DEFAULT_ENV_KEEP: &[&str] = &[
    "PYSPARK_PYTHON",
    "PYSPARK_SUBMIT_ARGS",
    "PYSPARK_DRIVER_PYTHON",
    "PYSPARK_DRIVER_PYTHON_OPTS",
    "SPARK_HOME",
    "SPARK_CLUSTER",
    "PYTHONPATH",
];

fn default_command() -> Vec<String> {
    vec!["jupyterhub-singleuser".to_string()]
}

fn default_lab_command() -> Vec<String> {
    vec!["jupyter-labhub".to_string()]
}

fn default_home_mount_path() -> String {
    "/users".to_string()
}

fn default_notebook_dir() -> String {
    "/users".to_string()
}

fn default_url_template() -> String {
    "/tree/home/{username}".to_string()
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            default_command: default_command(),
            lab_command: default_lab_command(),
            storage_endpoint_url: None,
            allowed_images: Vec::new(),
            kept_env: BTreeMap::new(),
            home_volume: None,
            home_mount_path: default_home_mount_path(),
            notebook_dir: default_notebook_dir(),
            default_url: default_url_template(),
        }
    }
}

impl LaunchConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_command.is_empty() || self.lab_command.is_empty() {
            return Err("Launch commands must not be empty".to_string());
        }

        if let Some(volume) = &self.home_volume {
            if volume.server.is_empty() || volume.path.is_empty() {
                return Err("NFS server and path must both be set".to_string());
            }
        }

        if !self.home_mount_path.starts_with('/') {
            return Err("Home mount path must be absolute".to_string());
        }

        for name in [ACCESS_KEY_FIELD, SECRET_KEY_FIELD] {
            if self.kept_env.contains_key(name) {
                return Err(format!("{name} cannot be a kept hub variable"));
            }
        }

        Ok(())
    }

    /// Default URL for `username`.
    pub fn default_url_for(&self, username: &str) -> String {
        self.default_url.replace("{username}", username)
    }
}
