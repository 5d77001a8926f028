use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

static DOCKER_HUB: &str = "docker.io";

/// A `repository:tag` image reference as written in a pod spec.
///
/// `repository` keeps the registry host when one is present (`ghcr.io/org/app`), so
/// `to_string()` reproduces the original string exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("repository is missing")]
    MissingRepository,
    #[error("tag is missing")]
    MissingTag,
    #[error("invalid image format, expected repo:tag: {0}")]
    InvalidFormat(String),
    #[error("digest references are not allowed")]
    DigestNotAllowed,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl ImageReference {
    /// Parses exactly one `repo:tag` pair. Anything else, including registry ports
    /// (`host:5000/app:1.0`) and untagged images, is rejected rather than guessed.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.contains('@') {
            return Err(ParseError::DigestNotAllowed);
        }

        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [_] => Err(ParseError::MissingTag),
            [repository, tag] => {
                if repository.is_empty() {
                    return Err(ParseError::MissingRepository);
                }
                if tag.is_empty() || tag.contains('/') {
                    return Err(ParseError::MissingTag);
                }
                Ok(Self {
                    repository: repository.to_string(),
                    tag: tag.to_string(),
                })
            }
            _ => Err(ParseError::InvalidFormat(s.to_string())),
        }
    }

    /// Registry host serving this image; unqualified names live on Docker Hub.
    pub fn registry(&self) -> &str {
        match self.repository.split_once('/') {
            Some((first, _)) if first.contains('.') || first == "localhost" => first,
            _ => DOCKER_HUB,
        }
    }

    /// Repository path relative to the registry host, as used by the distribution API.
    pub fn path(&self) -> String {
        match self.repository.split_once('/') {
            Some((first, rest)) if first.contains('.') || first == "localhost" => rest.to_string(),
            Some(_) => self.repository.clone(),
            None => format!("library/{}", self.repository),
        }
    }

    /// Same repository, different tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: tag.to_string(),
        }
    }
}
