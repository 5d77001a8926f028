//! Locating and rewriting container images in Kubernetes manifests.
//!
//! Documents are parsed only to decide whether they are a Deployment or StatefulSet that
//! runs the image. The rewrite itself is textual and limited to the `image:` lines of
//! `spec.template.spec.containers` and `initContainers` entries, so comments, key order
//! and formatting survive untouched.

use crate::error::{EngineError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde_yaml_ng::Value;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

static WORKLOAD_KINDS: [&str; 2] = ["Deployment", "StatefulSet"];

static IMAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<lead>\s*(?:-\s+)?image:\s*)(?P<open>["']?)(?P<image>[^"'\s#]+)(?P<tail>["']?.*)$"#,
    )
    .expect("image line regex is valid")
});

static MAPPING_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?P<key>"[^"]*"|'[^']*'|[^\s#"'][^:#]*?)\s*:(?:\s|$)"#)
        .expect("mapping key regex is valid")
});

/// Block-mapping keys enclosing the current line, with the column each key starts at.
#[derive(Debug, Default)]
struct KeyPath {
    stack: Vec<(usize, String)>,
}

impl KeyPath {
    /// Moves to `line`. Returns true when the line opens a mapping key.
    fn advance(&mut self, line: &str) -> bool {
        let trimmed = line.trim_start_matches(' ');
        if trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.starts_with("---")
            || trimmed.starts_with("...")
        {
            return false;
        }

        let mut column = line.len() - trimmed.len();
        let mut rest = trimmed;
        while let Some(item) = rest
            .strip_prefix('-')
            .filter(|r| r.is_empty() || r.starts_with(' '))
        {
            let inner = item.trim_start_matches(' ');
            column += rest.len() - inner.len();
            rest = inner;
        }

        self.stack.retain(|(col, _)| *col < column);
        let Some(caps) = MAPPING_KEY.captures(rest) else {
            return false;
        };
        let key = caps["key"].trim_matches(['"', '\'']).to_string();
        self.stack.push((column, key));
        true
    }

    fn is_container_image(&self) -> bool {
        let keys: Vec<&str> = self.stack.iter().map(|(_, key)| key.as_str()).collect();
        matches!(
            keys.as_slice(),
            ["spec", "template", "spec", "containers" | "initContainers", "image"]
        )
    }
}

/// A manifest file that references the current image, with its rewritten content.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub path: PathBuf,
    /// Path relative to the repository root, as git expects it.
    pub relative: PathBuf,
    pub patched: String,
}

fn manifest_globs() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in ["*.yaml", "*.yml"] {
        let glob = Glob::new(pattern)
            .map_err(|e| EngineError::Config(format!("invalid manifest glob: {}", e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| EngineError::Config(format!("invalid manifest glob set: {}", e)))
}

fn is_git_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == ".git"
}

/// Walks `root` (or `root/subdir`) and returns every manifest that runs `current_image`
/// in a Deployment or StatefulSet, together with its patched content. Nothing is written.
pub fn scan(
    root: &Path,
    subdir: Option<&str>,
    current_image: &str,
    new_image: &str,
) -> Result<Vec<ManifestFile>> {
    let globs = manifest_globs()?;
    let scan_root = match subdir.map(|dir| Path::new(dir.trim_matches('/'))) {
        Some(dir) if dir.components().any(|c| !matches!(c, Component::Normal(_))) => {
            return Err(EngineError::Config(format!(
                "GitOps directory {} escapes the repository",
                dir.display()
            )));
        }
        Some(dir) => root.join(dir),
        None => root.to_path_buf(),
    };

    let mut matches = Vec::new();
    for entry in WalkDir::new(&scan_root)
        .into_iter()
        .filter_entry(|e| !is_git_dir(e))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() || !globs.is_match(entry.file_name()) {
            continue;
        }
        let content =
            fs::read_to_string(entry.path()).map_err(|e| EngineError::io(entry.path(), e))?;
        if let Some(patched) = rewrite(&content, current_image, new_image) {
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();
            info!("Found image {} in manifest {}", current_image, relative.display());
            matches.push(ManifestFile {
                path: entry.path().to_path_buf(),
                relative,
                patched,
            });
        }
    }
    Ok(matches)
}

/// Writes the patched content of a scanned manifest back to disk.
pub fn patch(file: &ManifestFile) -> Result<()> {
    fs::write(&file.path, &file.patched).map_err(|e| EngineError::io(&file.path, e))
}

/// Rewrites `current_image` to `new_image` inside every Deployment or StatefulSet document
/// of a (possibly multi-document) YAML file. Returns `None` when nothing changed.
pub fn rewrite(content: &str, current_image: &str, new_image: &str) -> Option<String> {
    let mut changed = false;
    let mut out = String::with_capacity(content.len());

    for document in split_documents(content) {
        if runs_image(document, current_image) {
            let (patched, replaced) = rewrite_image_lines(document, current_image, new_image);
            changed |= replaced > 0;
            out.push_str(&patched);
        } else {
            out.push_str(document);
        }
    }

    changed.then_some(out)
}

/// Splits at `---` separator lines. The returned slices concatenate back to `content`.
fn split_documents(content: &str) -> Vec<&str> {
    let mut documents = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let is_separator = line.trim_end() == "---" || line.starts_with("--- ");
        if is_separator && offset > start {
            documents.push(&content[start..offset]);
            start = offset;
        }
        offset += line.len();
    }
    if start < content.len() {
        documents.push(&content[start..]);
    }
    documents
}

fn runs_image(document: &str, image: &str) -> bool {
    let value: Value = match serde_yaml_ng::from_str(document) {
        Ok(value) => value,
        Err(e) => {
            debug!("Skipping unparseable YAML document: {}", e);
            return false;
        }
    };
    let Some(kind) = value.get("kind").and_then(Value::as_str) else {
        return false;
    };
    if !WORKLOAD_KINDS.contains(&kind) {
        return false;
    }

    let Some(pod_spec) = value
        .get("spec")
        .and_then(|s| s.get("template"))
        .and_then(|t| t.get("spec"))
    else {
        return false;
    };
    ["containers", "initContainers"]
        .iter()
        .filter_map(|field| pod_spec.get(*field).and_then(Value::as_sequence))
        .flatten()
        .any(|container| container.get("image").and_then(Value::as_str) == Some(image))
}

fn rewrite_image_lines(document: &str, current_image: &str, new_image: &str) -> (String, usize) {
    let mut replaced = 0;
    let mut out = String::with_capacity(document.len());
    let mut path = KeyPath::default();

    for line in document.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);
        let ending = &line[body.len()..];
        let keyed = path.advance(body);

        match IMAGE_LINE.captures(body) {
            Some(caps)
                if keyed && path.is_container_image() && &caps["image"] == current_image =>
            {
                out.push_str(&caps["lead"]);
                out.push_str(&caps["open"]);
                out.push_str(new_image);
                out.push_str(&caps["tail"]);
                out.push_str(ending);
                replaced += 1;
            }
            _ => out.push_str(line),
        }
    }
    (out, replaced)
}
