//! Turns a spawn form plus fetched secrets into a launch specification.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::config::{LaunchConfig, NfsVolume};
use crate::error::ValidationError;
use crate::secrets::fetcher::{ACCESS_KEY_FIELD, SECRET_KEY_FIELD};
use crate::secrets::SecretBundle;

pub const FIELD_CPU_LIMIT: &str = "cpu_limit";
pub const FIELD_MEM_LIMIT: &str = "mem_limit";
pub const FIELD_IMAGE_SPEC: &str = "image_spec";
pub const FIELD_OPTIONS: &str = "options";
pub const OPTION_JUPYTERLAB: &str = "jupyterlab";

pub const ENV_ENABLE_LAB: &str = "JUPYTER_ENABLE_LAB";
pub const ENV_S3_ENDPOINT: &str = "S3_ENDPOINT_URL";

/// Submitted spawn form: field name to selected values.
pub type FormInput = HashMap<String, Vec<String>>;

/// Volume mounted into a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub nfs: NfsVolume,
    pub mount_path: String,
}

/// Fully resolved session description handed to the orchestration platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    pub image: String,
    pub environment: BTreeMap<String, String>,
    pub uid: Option<u32>,
    pub command: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub default_url: Option<String>,
}

impl LaunchSpec {
    /// Memory limit in the platform's notation.
    pub fn mem_limit(&self) -> String {
        format!("{}M", self.memory_limit_mb)
    }
}

/// Build the launch spec for `username`.
///
/// Fails on the first invalid field; nothing is returned on failure. Absent
/// secrets are left out of the environment rather than set empty.
pub fn plan(
    username: &str,
    form: &FormInput,
    secrets: &SecretBundle,
    config: &LaunchConfig,
) -> Result<LaunchSpec, ValidationError> {
    let cpu_limit = first_value(form, FIELD_CPU_LIMIT)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| ValidationError::malformed(FIELD_CPU_LIMIT))?;

    let memory_limit_mb = first_value(form, FIELD_MEM_LIMIT)
        .map(|v| v.trim())
        .map(|v| v.strip_suffix('M').unwrap_or(v))
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| ValidationError::malformed(FIELD_MEM_LIMIT))?;

    let image = first_value(form, FIELD_IMAGE_SPEC)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ValidationError::malformed(FIELD_IMAGE_SPEC))?
        .to_string();

    if !config.allowed_images.is_empty() && !config.allowed_images.contains(&image) {
        return Err(ValidationError::disallowed_image(FIELD_IMAGE_SPEC));
    }

    let mut environment = config.kept_env.clone();

    let lab = form
        .get(FIELD_OPTIONS)
        .is_some_and(|opts| opts.iter().any(|o| o == OPTION_JUPYTERLAB));
    let command = if lab {
        environment.insert(ENV_ENABLE_LAB.to_string(), "true".to_string());
        config.lab_command.clone()
    } else {
        config.default_command.clone()
    };

    if let Some(endpoint) = &config.storage_endpoint_url {
        environment.insert(ENV_S3_ENDPOINT.to_string(), endpoint.clone());
    }
    if let Some(key) = &secrets.storage_access_key {
        environment.insert(ACCESS_KEY_FIELD.to_string(), key.clone());
    }
    if let Some(key) = &secrets.storage_secret_key {
        environment.insert(SECRET_KEY_FIELD.to_string(), key.clone());
    }

    let volumes = config
        .home_volume
        .iter()
        .map(|nfs| VolumeMount {
            name: "home".to_string(),
            nfs: nfs.clone(),
            mount_path: config.home_mount_path.clone(),
        })
        .collect();

    Ok(LaunchSpec {
        cpu_limit,
        memory_limit_mb,
        image,
        environment,
        uid: secrets.uid,
        command,
        volumes,
        working_dir: Some(config.notebook_dir.clone()),
        default_url: Some(config.default_url_for(username)),
    })
}

fn first_value<'a>(form: &'a FormInput, field: &str) -> Option<&'a str> {
    form.get(field).and_then(|v| v.first()).map(|s| s.as_str())
}
