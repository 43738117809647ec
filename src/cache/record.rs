//! Stored artifact records.
//!
//! The set of kinds is closed; the JSON `type` tag is the only dispatch point.

use std::collections::BTreeMap;

use bytes::Bytes;
use isrgate_manifest::Revalidate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Response header through which the renderer reports the tags of a page.
pub const CACHE_TAGS_HEADER: &str = "x-next-cache-tags";

#[derive(Debug, Error)]
#[error("malformed artifact record: {0}")]
pub struct RecordError(#[from] serde_json::Error);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArtifactRecord {
    Page {
        html: String,
        json: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Meta>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revalidate: Option<Revalidate>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
    App {
        html: String,
        rsc: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Meta>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revalidate: Option<Revalidate>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
    Route {
        #[serde(with = "base64_bytes")]
        body: Bytes,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Meta>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revalidate: Option<Revalidate>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
    Redirect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        props: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Meta>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revalidate: Option<Revalidate>,
    },
    Image {
        etag: String,
        #[serde(with = "base64_bytes")]
        buffer: Bytes,
        extension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revalidate: Option<Revalidate>,
    },
    Fetch {
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revalidate: Option<Revalidate>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
}

impl ArtifactRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Page { .. } => "page",
            Self::App { .. } => "app",
            Self::Route { .. } => "route",
            Self::Redirect { .. } => "redirect",
            Self::Image { .. } => "image",
            Self::Fetch { .. } => "fetch",
        }
    }

    pub fn revalidate(&self) -> Option<Revalidate> {
        match self {
            Self::Page { revalidate, .. }
            | Self::App { revalidate, .. }
            | Self::Route { revalidate, .. }
            | Self::Redirect { revalidate, .. }
            | Self::Image { revalidate, .. }
            | Self::Fetch { revalidate, .. } => *revalidate,
        }
    }

    pub fn meta(&self) -> Option<&Meta> {
        match self {
            Self::Page { meta, .. }
            | Self::App { meta, .. }
            | Self::Route { meta, .. }
            | Self::Redirect { meta, .. } => meta.as_ref(),
            Self::Image { .. } | Self::Fetch { .. } => None,
        }
    }

    /// Explicit tags plus those listed in the stored cache-tags header, deduplicated.
    pub fn tags(&self) -> Vec<String> {
        let explicit: &[String] = match self {
            Self::Page { tags, .. }
            | Self::App { tags, .. }
            | Self::Route { tags, .. }
            | Self::Fetch { tags, .. } => tags,
            Self::Redirect { .. } | Self::Image { .. } => &[],
        };

        let from_header = self
            .meta()
            .and_then(|meta| meta.headers.get(CACHE_TAGS_HEADER))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut merged: Vec<String> = Vec::with_capacity(explicit.len() + from_header.len());
        for tag in explicit.iter().cloned().chain(from_header) {
            if !merged.contains(&tag) {
                merged.push(tag);
            }
        }
        merged
    }

    pub fn encode(&self) -> Result<Bytes, RecordError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub(crate) mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
