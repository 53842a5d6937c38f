//! Catalogued objects and their storage layout.

use crate::hash::ContentHash;
use crate::ids::{ObjectId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Broad media category, used to decide follow-up processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "heic", "heif", "webp", "tif", "tiff", "bmp", "avif", "dng",
    "cr2", "nef", "arw",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "m4v", "avi", "mkv", "webm", "3gp", "mts", "m2ts", "wmv", "mpg", "mpeg",
];

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Other => "other",
        }
    }

    /// Classify by MIME type, falling back to the file extension.
    pub fn detect(content_type: Option<&str>, filename: Option<&str>) -> Self {
        if let Some(ct) = content_type {
            let ct = ct.trim().to_ascii_lowercase();
            if ct.starts_with("image/") {
                return Self::Image;
            }
            if ct.starts_with("video/") {
                return Self::Video;
            }
        }

        let ext = filename
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => Self::Image,
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext) => Self::Video,
            _ => Self::Other,
        }
    }

    /// Best-effort MIME type for a file name.
    pub fn guess_content_type(filename: &str) -> Option<&'static str> {
        let (_, ext) = filename.rsplit_once('.')?;
        let ct = match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "heic" => "image/heic",
            "heif" => "image/heif",
            "webp" => "image/webp",
            "tif" | "tiff" => "image/tiff",
            "avif" => "image/avif",
            "mp4" | "m4v" => "video/mp4",
            "mov" => "video/quicktime",
            "webm" => "video/webm",
            "mkv" => "video/x-matroska",
            "avi" => "video/x-msvideo",
            "3gp" => "video/3gpp",
            _ => return None,
        };
        Some(ct)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "other" => Ok(Self::Other),
            other => Err(crate::Error::InvalidState(format!(
                "unknown media kind: {other}"
            ))),
        }
    }
}

/// A stored file, unique per (owner, fingerprint).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub owner: UserId,
    pub fingerprint: ContentHash,
    pub size_bytes: u64,
    pub storage_locator: String,
    pub media_kind: MediaKind,
    pub original_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ObjectRecord {
    /// Build a record stored at the canonical key for its owner and fingerprint.
    pub fn new(
        owner: UserId,
        fingerprint: ContentHash,
        size_bytes: u64,
        media_kind: MediaKind,
        original_name: Option<String>,
    ) -> Self {
        Self {
            id: ObjectId::new(),
            owner,
            fingerprint,
            size_bytes,
            storage_locator: object_key(&owner, &fingerprint),
            media_kind,
            original_name,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Durable storage key for a user's object.
///
/// Layout: `users/{owner}/objects/{aa}/{bb}/{fingerprint}`. The two-level
/// fan-out keeps directory sizes bounded on filesystem backends.
pub fn object_key(owner: &UserId, fingerprint: &ContentHash) -> String {
    let hex = fingerprint.to_hex();
    format!("users/{owner}/objects/{}/{}/{hex}", &hex[..2], &hex[2..4])
}
