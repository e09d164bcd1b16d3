// Content metadata shared across the fetch, custodian and cache layers.

use serde::{Deserialize, Serialize};

/// Visibility tier of a blob, from most restricted to fully public.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ReachLevel {
    Private = 0,
    Invited = 1,
    Local = 2,
    Neighborhood = 3,
    Municipal = 4,
    Bioregional = 5,
    Regional = 6,
    #[default]
    Commons = 7,
}

impl ReachLevel {
    pub const ALL: [ReachLevel; 8] = [
        ReachLevel::Private,
        ReachLevel::Invited,
        ReachLevel::Local,
        ReachLevel::Neighborhood,
        ReachLevel::Municipal,
        ReachLevel::Bioregional,
        ReachLevel::Regional,
        ReachLevel::Commons,
    ];

    /// Values above 7 saturate to `Commons`.
    pub fn from_u8(value: u8) -> Self {
        Self::ALL[(value as usize).min(7)]
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReachLevel::Private => "private",
            ReachLevel::Invited => "invited",
            ReachLevel::Local => "local",
            ReachLevel::Neighborhood => "neighborhood",
            ReachLevel::Municipal => "municipal",
            ReachLevel::Bioregional => "bioregional",
            ReachLevel::Regional => "regional",
            ReachLevel::Commons => "commons",
        }
    }

    /// Whether a custodian serving `custodian_reach` may hold content at this reach.
    /// A custodian cleared for a more public tier must not hold more private content.
    pub fn admits_custodian(self, custodian_reach: ReachLevel) -> bool {
        custodian_reach <= self
    }
}

/// Alternate-bitrate encoding of the same logical blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobVariant {
    /// Human label such as `720p`.
    pub label: String,
    pub bitrate_mbps: f64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub fallback_urls: Vec<String>,
}

impl BlobVariant {
    pub fn new(label: impl Into<String>, bitrate_mbps: f64) -> Self {
        Self {
            label: label.into(),
            bitrate_mbps,
            hash: None,
            size_bytes: None,
            fallback_urls: Vec::new(),
        }
    }
}

/// Metadata of a content blob as produced by the authoring pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlob {
    /// Lowercase hex SHA-256 of the blob bytes.
    pub hash: String,
    pub size_bytes: u64,
    pub mime_type: String,
    /// Ordered by preference.
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    #[serde(default)]
    pub bitrate_mbps: Option<f64>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub variants: Vec<BlobVariant>,
}

impl ContentBlob {
    pub fn new(hash: impl Into<String>, size_bytes: u64, mime_type: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
            mime_type: mime_type.into(),
            fallback_urls: Vec::new(),
            bitrate_mbps: None,
            duration_secs: None,
            codec: None,
            variants: Vec::new(),
        }
    }

    pub fn with_fallback_url(mut self, url: impl Into<String>) -> Self {
        self.fallback_urls.push(url.into());
        self
    }

    pub fn with_bitrate(mut self, bitrate_mbps: f64) -> Self {
        self.bitrate_mbps = Some(bitrate_mbps);
        self
    }

    pub fn with_variant(mut self, variant: BlobVariant) -> Self {
        self.variants.push(variant);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reach_level_round_trip_and_saturation() {
        assert_eq!(ReachLevel::from_u8(0), ReachLevel::Private);
        assert_eq!(ReachLevel::from_u8(7), ReachLevel::Commons);
        assert_eq!(ReachLevel::from_u8(42), ReachLevel::Commons);
        assert_eq!(ReachLevel::Municipal.as_u8(), 4);
    }

    #[test]
    fn test_private_content_rejects_public_custodians() {
        assert!(ReachLevel::Private.admits_custodian(ReachLevel::Private));
        assert!(!ReachLevel::Private.admits_custodian(ReachLevel::Commons));
        assert!(ReachLevel::Commons.admits_custodian(ReachLevel::Local));
    }

    #[test]
    fn test_blob_deserializes_with_optional_fields_missing() {
        let blob: ContentBlob = serde_json::from_str(
            r#"{"hash":"ab","size_bytes":10,"mime_type":"video/mp4","fallback_urls":["http://a"]}"#,
        )
        .unwrap();
        assert_eq!(blob.fallback_urls.len(), 1);
        assert!(blob.variants.is_empty());
        assert!(blob.bitrate_mbps.is_none());
    }
}
