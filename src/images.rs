//! Image catalog listings
//!
//! Turns raw image records, either from a remote's catalog or from the
//! daemon's local cache, into `{Alias, Description}` rows.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::instance::Remote;
use crate::{Error, Result};

static UBUNTU_RELEASE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d\d\.\d\d").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct ImageAlias {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSource {
    pub alias: String,
    pub server: String,
}

/// The fields of an image record that listings use
#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    #[serde(default)]
    pub aliases: Vec<ImageAlias>,
    #[serde(rename = "type", default)]
    pub image_type: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub update_source: Option<UpdateSource>,
}

impl Image {
    fn description(&self) -> Option<&str> {
        self.properties.get("description").map(String::as_str)
    }
}

/// Row of an image listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    #[serde(rename = "Alias")]
    pub alias: String,
    #[serde(rename = "Description")]
    pub description: String,
}

/// Deserialize each record on its own, skipping the ones that don't fit
pub fn parse_images(values: Vec<serde_json::Value>) -> Vec<Image> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Image>(value) {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping image with unexpected schema");
                None
            }
        })
        .collect()
}

/// Aliased x86_64 container images
pub fn filter_remote_images(images: Vec<Image>) -> Vec<Image> {
    images
        .into_iter()
        .filter(|i| !i.aliases.is_empty())
        .filter(|i| i.image_type == "container")
        .filter(|i| i.architecture == "x86_64")
        .collect()
}

/// Shortest alias; for the ubuntu remote only release-number aliases count
pub fn shortest_alias(aliases: &[ImageAlias], remote: Remote) -> Option<String> {
    let candidates = aliases
        .iter()
        .map(|a| a.name.as_str())
        .filter(|a| remote != Remote::Ubuntu || UBUNTU_RELEASE.is_match(a));

    let mut shortest: Option<&str> = None;
    for alias in candidates {
        if shortest.map_or(true, |s| alias.len() < s.len()) {
            shortest = Some(alias);
        }
    }

    if shortest.is_none() {
        tracing::error!(?aliases, "Unexpected alias schema");
    }
    shortest.map(str::to_string)
}

pub fn remote_image_info(remote: Remote, image: &Image) -> Option<ImageRecord> {
    let Some(description) = image.description() else {
        tracing::debug!(?image, "Image has no description");
        return None;
    };

    Some(ImageRecord {
        alias: shortest_alias(&image.aliases, remote)?,
        description: description.to_string(),
    })
}

/// `<remote>:<alias>` row for an image in the local cache
pub fn cached_image_info(image: &Image) -> Option<ImageRecord> {
    let source = image.update_source.as_ref()?;
    let Some(remote) = Remote::from_url(&source.server) else {
        tracing::debug!(server = %source.server, "Unexpected source server");
        return None;
    };

    Some(ImageRecord {
        alias: format!("{}:{}", remote, source.alias),
        description: image.description()?.to_string(),
    })
}

/// Rows for a remote catalog given its raw JSON listing.
///
/// Sorted by alias, newest first for ubuntu and alphabetically otherwise.
pub fn list_remote_images(remote: Remote, raw_json: &str) -> Result<Vec<ImageRecord>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw_json)
        .map_err(|e| Error::Protocol(format!("could not parse {} image list: {}", remote, e)))?;

    let mut records: Vec<ImageRecord> = filter_remote_images(parse_images(values))
        .iter()
        .filter_map(|image| remote_image_info(remote, image))
        .collect();

    if remote == Remote::Ubuntu {
        records.sort_by(|a, b| b.alias.cmp(&a.alias));
    } else {
        records.sort_by(|a, b| a.alias.cmp(&b.alias));
    }
    Ok(records)
}

/// Rows for the images the daemon has cached
pub fn list_cached_images(values: Vec<serde_json::Value>) -> Vec<ImageRecord> {
    parse_images(values)
        .iter()
        .filter_map(cached_image_info)
        .collect()
}
