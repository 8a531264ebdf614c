//! Admin list, user allowlist and spawnable image list.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// Who may use the hub, who administers it and which images can be spawned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    pub admins: BTreeSet<String>,
    /// Empty means every authenticated user is allowed.
    pub allowed: BTreeSet<String>,
    pub images: Vec<String>,
}

impl AccessList {
    /// Load from optional files. Missing or empty files leave the list empty.
    pub fn load(
        admins_file: Option<&Path>,
        allowlist_file: Option<&Path>,
        images_file: Option<&Path>,
    ) -> Result<Self> {
        let admins = read_optional(admins_file)?
            .map(|s| parse_names(&s))
            .unwrap_or_default();
        let allowed = read_optional(allowlist_file)?
            .map(|s| parse_names(&s))
            .unwrap_or_default();
        let images = read_optional(images_file)?
            .map(|s| parse_images(&s))
            .unwrap_or_default();

        debug!(
            admins = admins.len(),
            allowed = allowed.len(),
            images = images.len(),
            "Access lists loaded"
        );

        Ok(Self {
            admins,
            allowed,
            images,
        })
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.contains(user)
    }

    /// Admins are always allowed.
    pub fn is_allowed(&self, user: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(user) || self.is_admin(user)
    }
}

fn read_optional(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.exists() {
        warn!(path = %path.display(), "Access list file not found, ignoring");
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read access list: {:?}", path))?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(contents))
}

fn parse_names(contents: &str) -> BTreeSet<String> {
    contents.split_whitespace().map(str::to_string).collect()
}

/// JSON array of image names, else whitespace separated.
fn parse_images(contents: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(contents) {
        Ok(images) => images,
        Err(_) => contents.split_whitespace().map(str::to_string).collect(),
    }
}
