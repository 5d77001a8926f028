//! Tag policy: decides whether a registry tag counts as an allowed update for a container.
//!
//! Rules run in a fixed order and the first rejection wins: workload include, global
//! includes, workload exclude, global excludes, then semantic version precedence.
//! Reordering them changes the outcome for tags matched by both an include and an exclude.

use crate::config::Policy;
use crate::error::{EngineError, Result};
use regex::Regex;
use semver::Version;
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// A wildcard pattern such as `*-rc*`. `*` matches any run of characters, everything else
/// is literal, and the pattern may match anywhere in the tag.
#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct WildcardPattern {
    source: String,
    regex: Regex,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex_source = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&regex_source).map_err(|e| {
            EngineError::Config(format!("invalid tag pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.regex.is_match(tag)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl TryFrom<String> for WildcardPattern {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        WildcardPattern::new(&value)
    }
}

impl fmt::Debug for WildcardPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WildcardPattern({:?})", self.source)
    }
}

/// Workload-scoped rules taken from annotations. Empty annotations mean "no rule".
#[derive(Debug, Default, Clone)]
pub struct WorkloadRules {
    pub include: Option<WildcardPattern>,
    pub exclude: Option<WildcardPattern>,
}

impl WorkloadRules {
    pub fn from_annotations(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        let compile = |pattern: Option<&str>| {
            pattern
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(WildcardPattern::new)
                .transpose()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }
}

/// Returns `Ok(true)` when `new_tag` is an allowed, strictly newer version than `current_tag`.
///
/// Pattern mismatches are plain rejections. A tag that is not a semantic version is an
/// [`EngineError::InvalidVersion`], never a silent "no update".
pub fn evaluate(
    current_tag: &str,
    new_tag: &str,
    workload: &WorkloadRules,
    global: &Policy,
) -> Result<bool> {
    if let Some(include) = &workload.include {
        if !include.matches(new_tag) {
            debug!(
                "Skipping tag {} due to not matching include pattern {}",
                new_tag,
                include.as_str()
            );
            return Ok(false);
        }
    }

    if !global.include_patterns.is_empty()
        && !global.include_patterns.iter().any(|p| p.matches(new_tag))
    {
        debug!("Tag {} does not match any global include pattern", new_tag);
        return Ok(false);
    }

    if let Some(exclude) = &workload.exclude {
        if exclude.matches(new_tag) {
            debug!(
                "Skipping tag {} due to exclude pattern {}",
                new_tag,
                exclude.as_str()
            );
            return Ok(false);
        }
    }

    if let Some(pattern) = global.exclude_patterns.iter().find(|p| p.matches(new_tag)) {
        debug!(
            "Skipping tag {} due to global exclude pattern {}",
            new_tag,
            pattern.as_str()
        );
        return Ok(false);
    }

    let current = parse_version(current_tag)?;
    let new = parse_version(new_tag)?;

    Ok(cmp_precedence(&new, &current) == Ordering::Greater)
}

/// Parses a tag as a semantic version, tolerating a leading `v` and missing minor/patch
/// components (`v1.2` is read as `1.2.0`).
pub fn parse_version(tag: &str) -> Result<Version> {
    let trimmed = tag.strip_prefix(['v', 'V']).unwrap_or(tag);
    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);

    let numeric = !core.is_empty()
        && core
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    let normalized = match core.split('.').count() {
        1 if numeric => format!("{}.0.0{}", core, suffix),
        2 if numeric => format!("{}.0{}", core, suffix),
        _ => trimmed.to_string(),
    };

    Version::parse(&normalized).map_err(|e| EngineError::InvalidVersion {
        tag: tag.to_string(),
        reason: e.to_string(),
    })
}

/// Semantic version precedence: build metadata never participates.
pub fn cmp_precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}
