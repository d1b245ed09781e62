//! Image reference parsing
//!
//! Weak-validation parsing of image references into registry, repository,
//! tag, and digest components. Weak validation accepts anything structurally
//! plausible and defaults the registry the way the container runtime does;
//! it exists so the orchestrator can answer "which registry does this
//! reference live in" without reimplementing the registry protocol.

use crate::errors::{ConfigError, Result};
use std::fmt;

const DEFAULT_REGISTRY: &str = "index.docker.io";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    raw: String,
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    /// Parse a reference with weak validation.
    ///
    /// `[registry/]repository[:tag][@digest]`. The first path component is a
    /// registry when it contains a dot or a colon or equals `localhost`.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |message: &str| ConfigError::InvalidImageRef {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("reference is empty").into());
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace").into());
        }

        let (name_part, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.starts_with("sha256:") && !digest.starts_with("sha512:") {
                    return Err(invalid("digest must start with sha256: or sha512:").into());
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (registry, remainder) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest)
            }
            _ => (DEFAULT_REGISTRY.to_string(), name_part),
        };

        // a colon in the remainder separates the tag; registry ports were
        // already split off above
        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repo, tag)) => (repo.to_string(), Some(tag.to_string())),
            None => (remainder.to_string(), None),
        };

        if repository.is_empty() {
            return Err(invalid("repository is empty").into());
        }
        if let Some(ref t) = tag {
            if t.is_empty() {
                return Err(invalid("tag after ':' is empty").into());
            }
        }

        Ok(Self {
            raw: reference.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The registry host this reference resolves against.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The reference exactly as given.
    pub fn name(&self) -> &str {
        &self.raw
    }
}

// Display yields the raw reference so flags and args carry exactly what the
// caller supplied.
impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
