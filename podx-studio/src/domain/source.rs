//! Source URL validation and classification.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use url::Url;

use crate::{Error, Result};

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

static RSS_HINTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\.xml$|/feed|/rss|/podcast|feed=|format=rss|type=rss)")
        .expect("static regex is valid")
});

/// Kind of source a run fetches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Youtube,
    Rss,
    /// A show page; fetched as a feed.
    PodcastPage,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Youtube => "youtube",
            SourceKind::Rss => "rss",
            SourceKind::PodcastPage => "podcast_page",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated http(s) source URL with its detected kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUrl {
    url: String,
    kind: SourceKind,
}

impl SourceUrl {
    /// Validate `input` and detect its kind.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("URL cannot be empty"));
        }

        let parsed = Url::parse(trimmed)
            .map_err(|e| Error::validation(format!("Invalid URL format: {}", e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::validation("URL must start with http:// or https://"));
        }

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::validation("Invalid URL format"))?
            .to_ascii_lowercase();

        let kind = if YOUTUBE_HOSTS.contains(&host.as_str()) {
            SourceKind::Youtube
        } else if RSS_HINTS.is_match(trimmed) {
            SourceKind::Rss
        } else {
            SourceKind::PodcastPage
        };

        Ok(Self {
            url: trimmed.to_string(),
            kind,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

impl fmt::Display for SourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}
