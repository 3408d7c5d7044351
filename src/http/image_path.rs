//! Validation of image request paths.
//!
//! A request path names `/{image_type}/{chapter_hash}/{image_filename}`.
//! Only paths whose three tokens pass validation become a [`CacheKey`];
//! anything else is rejected before it can reach the cache or the origin.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static CHAPTER_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{32}$").expect("static chapter hash pattern"));

static IMAGE_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._-]*[A-Za-z0-9]\.(jpg|jpeg|png|gif)$")
        .expect("static image filename pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Data,
    DataSaver,
}

impl ImageType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "data" => Some(Self::Data),
            "data-saver" => Some(Self::DataSaver),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::DataSaver => "data-saver",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidPath {
    #[error("unsupported image type {0:?}")]
    ImageType(String),
    #[error("malformed chapter hash {0:?}")]
    ChapterHash(String),
    #[error("unsupported image filename {0:?}")]
    Filename(String),
}

/// Canonical `/{image_type}/{chapter_hash}/{image_filename}` path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: String,
    image_type: ImageType,
    content_type: &'static str,
}

impl CacheKey {
    /// Validate the three path tokens and build the canonical key.
    pub fn from_tokens(
        image_type: &str,
        chapter_hash: &str,
        image_filename: &str,
    ) -> Result<Self, InvalidPath> {
        let kind =
            ImageType::parse(image_type).ok_or_else(|| InvalidPath::ImageType(image_type.into()))?;
        if !CHAPTER_HASH.is_match(chapter_hash) {
            return Err(InvalidPath::ChapterHash(chapter_hash.into()));
        }
        let captures = IMAGE_FILENAME
            .captures(image_filename)
            .ok_or_else(|| InvalidPath::Filename(image_filename.into()))?;
        let content_type = match captures.get(1).map(|m| m.as_str()) {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            _ => "image/jpeg",
        };

        Ok(Self {
            path: format!("/{}/{chapter_hash}/{image_filename}", kind.as_str()),
            image_type: kind,
            content_type,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    /// MIME type implied by the file extension.
    pub fn content_type(&self) -> &'static str {
        self.content_type
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn builds_canonical_key() {
        let key = CacheKey::from_tokens("data", HASH, "x1.jpg").unwrap();
        assert_eq!(key.as_str(), "/data/0123456789abcdef0123456789abcdef/x1.jpg");
        assert_eq!(key.image_type(), ImageType::Data);
        assert_eq!(key.content_type(), "image/jpeg");

        let saver = CacheKey::from_tokens("data-saver", HASH, "M2-abcdef.png").unwrap();
        assert_eq!(saver.image_type(), ImageType::DataSaver);
        assert_eq!(saver.content_type(), "image/png");
    }

    #[test]
    fn rejects_unknown_image_type() {
        for kind in ["", "Data", "thumbs", "data-saver2", ".."] {
            assert_eq!(
                CacheKey::from_tokens(kind, HASH, "x1.jpg"),
                Err(InvalidPath::ImageType(kind.into()))
            );
        }
    }

    #[test]
    fn rejects_malformed_chapter_hash() {
        for hash in [
            "",
            "0123456789ABCDEF0123456789ABCDEF",
            "0123456789abcdef0123456789abcde",
            "0123456789abcdef0123456789abcdef0",
            "0123456789abcdef0123456789abcdeg",
        ] {
            assert_eq!(
                CacheKey::from_tokens("data", hash, "x1.jpg"),
                Err(InvalidPath::ChapterHash(hash.into()))
            );
        }
    }

    #[test]
    fn rejects_unsupported_filenames() {
        for name in ["x1.bmp", "x1.jpg.exe", ".jpg", "x1.", "x1.JPG", "a b.png", "x1.jpg?x=1", "-.gif"] {
            assert_eq!(
                CacheKey::from_tokens("data", HASH, name),
                Err(InvalidPath::Filename(name.into()))
            );
        }
    }

    #[test]
    fn accepts_supported_extensions() {
        for name in ["a.jpg", "b2.jpeg", "c3.png", "d4.gif", "x12-9f8e7d.png"] {
            assert!(CacheKey::from_tokens("data", HASH, name).is_ok(), "{name}");
        }
    }
}
