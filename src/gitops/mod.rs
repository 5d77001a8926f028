//! GitOps reconciliation: turns an accepted update into a pushed manifest commit.
//!
//! Each candidate walks `Idle -> Cloning -> Scanning -> Patching -> Committing -> Pushing ->
//! Done` and drops to `Failed` from any stage. A failure ends that candidate only. Every
//! attempt starts by deleting the target's working copy, so nothing a failed attempt left
//! behind is ever reused.

mod git;
pub mod manifest;

use crate::config::GitOpsTarget;
use crate::controller::WorkloadDiscovery;
use crate::error::EngineError;
use crate::notifier::{Notification, Notifier};
use crate::state::UpdateCandidate;
use git::WorkingCopy;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStage {
    Idle,
    Cloning,
    Scanning,
    Patching,
    Committing,
    Pushing,
    Done,
    Failed,
}

impl fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The stage a candidate failed in, and why.
#[derive(Error, Debug)]
#[error("GitOps reconciliation failed while {stage}: {error}")]
pub struct ReconcileFailure {
    pub stage: ReconcileStage,
    #[source]
    pub error: EngineError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A commit touching `files` was pushed to the target branch.
    Pushed { commit: String, files: Vec<PathBuf> },
    /// Patching left the tree clean, so no commit was made.
    NothingToCommit,
}

/// Tracks the current stage of one candidate and logs every transition.
struct StageTracker<'a> {
    stage: ReconcileStage,
    candidate: &'a UpdateCandidate,
}

impl<'a> StageTracker<'a> {
    fn new(candidate: &'a UpdateCandidate) -> Self {
        Self {
            stage: ReconcileStage::Idle,
            candidate,
        }
    }

    fn enter(&mut self, next: ReconcileStage) {
        info!(
            "GitOps {} for {}: {} -> {}",
            self.candidate.new_tag,
            self.candidate.key(),
            self.stage,
            next
        );
        self.stage = next;
    }

    fn fail(&self, error: EngineError) -> ReconcileFailure {
        ReconcileFailure {
            stage: self.stage,
            error,
        }
    }
}

pub struct GitOpsReconciler {
    targets: Vec<GitOpsTarget>,
    work_dir: PathBuf,
    git_timeout: Duration,
    priority: u8,
    /// One lock per target: candidates for the same target share its working directory.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitOpsReconciler {
    pub fn new(
        targets: Vec<GitOpsTarget>,
        work_dir: impl Into<PathBuf>,
        git_timeout: Duration,
        priority: u8,
    ) -> Self {
        Self {
            targets,
            work_dir: work_dir.into(),
            git_timeout,
            priority,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn target_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    fn checkout_path(&self, target: &GitOpsTarget) -> PathBuf {
        self.work_dir.join(&target.name)
    }

    pub async fn reconcile(
        &self,
        candidate: &UpdateCandidate,
        cluster: &dyn WorkloadDiscovery,
        notifier: &dyn Notifier,
    ) -> Result<ReconcileOutcome, ReconcileFailure> {
        let mut tracker = StageTracker::new(candidate);

        let target_name = candidate.workload.gitops_target.as_deref().unwrap_or_default();
        let target = self
            .targets
            .iter()
            .find(|t| t.name == target_name)
            .ok_or_else(|| tracker.fail(EngineError::UnknownGitOpsTarget(target_name.into())))?;

        let lock = self.target_lock(&target.name);
        let _guard = lock.lock().await;

        let result = self
            .run_stages(&mut tracker, candidate, target, cluster, notifier)
            .await;
        match &result {
            Ok(_) => tracker.enter(ReconcileStage::Done),
            Err(failure) if failure.error.is_drift() => {
                warn!("GitOps drift for {}: {}", candidate.key(), failure);
                tracker.enter(ReconcileStage::Failed);
            }
            Err(failure) => {
                error!("GitOps failed for {}: {}", candidate.key(), failure);
                tracker.enter(ReconcileStage::Failed);
            }
        }
        result
    }

    async fn run_stages(
        &self,
        tracker: &mut StageTracker<'_>,
        candidate: &UpdateCandidate,
        target: &GitOpsTarget,
        cluster: &dyn WorkloadDiscovery,
        notifier: &dyn Notifier,
    ) -> Result<ReconcileOutcome, ReconcileFailure> {
        let current_image = candidate.current_image.to_string();
        let new_image = candidate.new_image().to_string();

        tracker.enter(ReconcileStage::Cloning);
        let checkout = self.checkout_path(target);
        remove_working_copy(&checkout)
            .await
            .map_err(|e| tracker.fail(e))?;
        let working_copy = WorkingCopy::clone(
            &target.repository_url,
            &target.branch,
            &checkout,
            &target.auth_token,
            self.git_timeout,
        )
        .await
        .map_err(|e| tracker.fail(e))?;

        tracker.enter(ReconcileStage::Scanning);
        let files = manifest::scan(
            working_copy.path(),
            candidate.workload.gitops_directory.as_deref(),
            &current_image,
            &new_image,
        )
        .map_err(|e| tracker.fail(e))?;
        if files.is_empty() {
            return Err(tracker.fail(EngineError::ManifestNotFound {
                target: target.name.clone(),
                image: current_image,
            }));
        }

        tracker.enter(ReconcileStage::Patching);
        for file in &files {
            manifest::patch(file).map_err(|e| tracker.fail(e))?;
            working_copy
                .add(&file.relative)
                .await
                .map_err(|e| tracker.fail(e))?;
        }

        tracker.enter(ReconcileStage::Committing);
        let live = cluster
            .live_image(candidate.key())
            .await
            .map_err(|e| tracker.fail(e))?;
        if live.as_deref() != Some(current_image.as_str()) {
            return Err(tracker.fail(EngineError::StaleUpdateRequest {
                workload: candidate.key().to_string(),
                requested: current_image,
                live: live.unwrap_or_else(|| "<absent>".to_string()),
            }));
        }
        if !working_copy.is_dirty().await.map_err(|e| tracker.fail(e))? {
            info!("Manifests for {} already up to date", candidate.key());
            return Ok(ReconcileOutcome::NothingToCommit);
        }
        let message = format!(
            "{}: {} -> {}\n\nWorkload: {}",
            target.commit_message,
            current_image,
            new_image,
            candidate.key()
        );
        working_copy
            .commit(&message, &target.commit_name, &target.commit_email)
            .await
            .map_err(|e| tracker.fail(e))?;
        let commit = working_copy.head().await.map_err(|e| tracker.fail(e))?;
        info!("Committed {} to GitOps target {}", commit, target.name);

        let notification = Notification::committed(candidate, &target.name, self.priority);
        if let Err(e) = notifier.send(&notification).await {
            warn!("Failed to send commit notification for {}: {}", candidate.key(), e);
        }

        // A failed push keeps the local commit; the next attempt starts from a fresh clone.
        tracker.enter(ReconcileStage::Pushing);
        working_copy
            .push(&target.auth_token)
            .await
            .map_err(|e| tracker.fail(e))?;
        info!(
            "Pushed {} to {} branch {}",
            commit, target.repository_url, target.branch
        );

        Ok(ReconcileOutcome::Pushed {
            commit,
            files: files.into_iter().map(|f| f.relative).collect(),
        })
    }
}

async fn remove_working_copy(path: &Path) -> Result<(), EngineError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io(path, e)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;

    pub fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .current_dir(dir)
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(["-c", "commit.gpgsign=false", "-c", "init.defaultBranch=main"])
            .args(args)
            .output()
            .expect("git must be installed to run GitOps tests");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// A bare repository on `main` seeded with `files`, and its `file://` URL.
    pub struct Remote {
        pub bare: PathBuf,
        pub url: String,
    }

    impl Remote {
        pub fn seed(dir: &Path, files: &[(&str, &str)]) -> Self {
            let bare = dir.join("remote.git");
            let seed = dir.join("seed");
            fs::create_dir_all(&bare).unwrap();
            fs::create_dir_all(&seed).unwrap();
            git(&bare, &["init", "--bare"]);
            git(&seed, &["init"]);
            for (path, content) in files {
                let file = seed.join(path);
                fs::create_dir_all(file.parent().unwrap()).unwrap();
                fs::write(file, content).unwrap();
            }
            git(&seed, &["add", "."]);
            git(&seed, &["commit", "-m", "initial manifests"]);
            git(&seed, &["remote", "add", "origin", bare.to_str().unwrap()]);
            git(&seed, &["push", "origin", "main"]);
            let url = format!("file://{}", bare.display());
            Self { bare, url }
        }

        pub fn show(&self, path: &str) -> String {
            git(&self.bare, &["show", &format!("main:{}", path)])
        }

        pub fn commit_count(&self) -> usize {
            git(&self.bare, &["rev-list", "--count", "main"])
                .trim()
                .parse()
                .unwrap()
        }
    }
}
