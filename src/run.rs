//! The reconciliation run: discovery, candidate building, notification, GitOps and
//! snapshot persistence, once per trigger.

use crate::config::Config;
use crate::controller::WorkloadDiscovery;
use crate::error::Result;
use crate::gitops::{GitOpsReconciler, ReconcileOutcome};
use crate::notification_gate::{self, GateOutcome};
use crate::notifier::Notifier;
use crate::oci_registry::TagLister;
use crate::snapshot_store::{CONTAINERS, IMAGE_UPDATES, IMAGES, SnapshotStore};
use crate::state::{
    ContainerRecord, NotificationRecord, UpdateCandidate, WorkloadKey, WorkloadRef,
};
use crate::update_candidates;
use chrono::Utc;
use futures::{StreamExt, future, stream};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub workloads: usize,
    /// Workloads dropped from the snapshots because their tags could not be resolved.
    pub failed: usize,
    pub candidates: usize,
    pub notified: usize,
    pub committed: usize,
    pub gitops_failed: usize,
    pub cancelled: bool,
}

pub struct Engine {
    config: Arc<Config>,
    cluster: Arc<dyn WorkloadDiscovery>,
    registry: Arc<dyn TagLister>,
    notifier: Arc<dyn Notifier>,
    gitops: GitOpsReconciler,
    store: SnapshotStore,
    cancel: CancellationToken,
    run_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<dyn WorkloadDiscovery>,
        registry: Arc<dyn TagLister>,
        notifier: Arc<dyn Notifier>,
        cancel: CancellationToken,
    ) -> Self {
        let gitops = GitOpsReconciler::new(
            config.gitops.clone(),
            &config.system.work_dir,
            config.timeouts.git(),
            config.notifications.ntfy.priority,
        );
        let store = SnapshotStore::new(&config.system.data_dir);
        Self {
            config,
            cluster,
            registry,
            notifier,
            gitops,
            store,
            cancel,
            run_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Starts a run in the background. Runs triggered while another is in progress wait
    /// for it to finish.
    pub fn trigger(self: &Arc<Self>, source: &'static str) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("Reconciliation run triggered by {}", source);
            match engine.run().await {
                Ok(summary) if summary.cancelled => info!("Reconciliation run cancelled"),
                Ok(_) => {}
                Err(e) => error!("Reconciliation run failed: {}", e),
            }
        })
    }

    /// Waits for the run in progress, if any, to finish.
    pub async fn wait_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Reconciliation run already in progress, waiting for it to finish");
                self.run_lock.lock().await
            }
        };
        if self.cancel.is_cancelled() {
            return Ok(RunSummary {
                cancelled: true,
                ..Default::default()
            });
        }

        let started = Utc::now();
        info!("Starting reconciliation run");
        let previous = self.load_previous_updates();
        let history = NotificationRecord::from_snapshot(&previous);
        let workloads = self.discover().await;
        let mut summary = RunSummary {
            workloads: workloads.len(),
            ..Default::default()
        };

        let config = &*self.config;
        let registry = &*self.registry;
        let cancel = &self.cancel;
        let resolved: Vec<(WorkloadRef, Result<Vec<UpdateCandidate>>)> = stream::iter(workloads)
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(move |workload| async move {
                let result = update_candidates::resolve(&workload, config, registry, started).await;
                (workload, result)
            })
            .buffered(config.system.registry_concurrency)
            .collect()
            .await;

        let mut containers = Vec::new();
        let mut updates = Vec::new();
        let mut processed = HashSet::new();
        for (workload, result) in resolved {
            if self.cancel.is_cancelled() {
                break;
            }
            processed.insert(workload.key.clone());
            let mut candidates = match result {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("Skipping {}: {}", workload.key, e);
                    summary.failed += 1;
                    continue;
                }
            };
            if let Some(index) = update_candidates::highest(&candidates) {
                self.act_on(&mut candidates[index], &history, &mut summary)
                    .await;
            }
            summary.candidates += candidates.len();
            containers.push(ContainerRecord {
                workload,
                time_scanned: started,
            });
            updates.extend(candidates);
        }

        if self.cancel.is_cancelled() {
            warn!(
                "Shutdown requested after {} of {} workloads, previous rows kept for the rest",
                processed.len(),
                summary.workloads
            );
            self.keep_unprocessed(&processed, &mut containers, &mut updates, previous);
            self.store.write_all(CONTAINERS, &containers)?;
            self.store.write_all(IMAGE_UPDATES, &updates)?;
            summary.cancelled = true;
            return Ok(summary);
        }

        self.store.write_all(CONTAINERS, &containers)?;
        self.store.write_all(IMAGE_UPDATES, &updates)?;
        match self
            .cluster
            .list_all_images(self.config.discovery.namespace.as_deref())
            .await
        {
            Ok(images) => self.store.write_all(IMAGES, &images)?,
            Err(e) => warn!("Image inventory failed, previous snapshot kept: {}", e),
        }

        info!(
            "Reconciliation run finished in {}ms: {} workloads, {} failed, {} candidates, {} notified, {} committed, {} GitOps failures",
            (Utc::now() - started).num_milliseconds(),
            summary.workloads,
            summary.failed,
            summary.candidates,
            summary.notified,
            summary.committed,
            summary.gitops_failed
        );
        Ok(summary)
    }

    /// The `imageUpdates` snapshot of the last run. An unreadable snapshot means no
    /// notification history.
    fn load_previous_updates(&self) -> Vec<UpdateCandidate> {
        self.store
            .read_all::<UpdateCandidate>(IMAGE_UPDATES)
            .unwrap_or_else(|e| {
                warn!("Cannot read previous update snapshot: {}", e);
                Vec::new()
            })
    }

    /// Carries the previous rows of workloads a cancelled run never reached, so their
    /// `sentTime` stamps survive next to the ones this run just set.
    fn keep_unprocessed(
        &self,
        processed: &HashSet<WorkloadKey>,
        containers: &mut Vec<ContainerRecord>,
        updates: &mut Vec<UpdateCandidate>,
        previous: Vec<UpdateCandidate>,
    ) {
        match self.store.read_all::<ContainerRecord>(CONTAINERS) {
            Ok(rows) => containers.extend(
                rows.into_iter()
                    .filter(|row| !processed.contains(&row.workload.key)),
            ),
            Err(e) => warn!("Cannot read previous container snapshot: {}", e),
        }
        updates.extend(
            previous
                .into_iter()
                .filter(|row| !processed.contains(row.key())),
        );
    }

    async fn discover(&self) -> Vec<WorkloadRef> {
        let discovery = &self.config.discovery;
        match self
            .cluster
            .list_annotated_workloads(
                discovery.namespace.as_deref(),
                &discovery.annotation_key,
                &discovery.annotation_value,
            )
            .await
        {
            Ok(workloads) => workloads,
            Err(e) => {
                error!("{}, continuing with no workloads", e);
                Vec::new()
            }
        }
    }

    async fn act_on(
        &self,
        candidate: &mut UpdateCandidate,
        history: &[NotificationRecord],
        summary: &mut RunSummary,
    ) {
        let ntfy = &self.config.notifications.ntfy;
        let outcome = notification_gate::process(
            candidate,
            history,
            &ntfy.reminder,
            &*self.notifier,
            ntfy.priority,
            Utc::now(),
        )
        .await;
        if outcome == GateOutcome::Sent {
            summary.notified += 1;
        }

        if !candidate.workload.is_gitops_managed() {
            return;
        }
        match self
            .gitops
            .reconcile(candidate, &*self.cluster, &*self.notifier)
            .await
        {
            Ok(ReconcileOutcome::Pushed { commit, files }) => {
                info!(
                    "GitOps commit {} for {} touched {} manifests",
                    commit,
                    candidate.key(),
                    files.len()
                );
                summary.committed += 1;
            }
            Ok(ReconcileOutcome::NothingToCommit) => {}
            Err(_) => summary.gitops_failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeCluster;
    use crate::error::EngineError;
    use crate::gitops::testing::Remote;
    use crate::image_reference::ImageReference;
    use crate::notifier::Notification;
    use crate::notifier::testing::RecordingNotifier;
    use crate::oci_registry::RegistryCredentials;
    use crate::state::fixtures::{candidate, workload};
    use crate::update_candidates::testing::StaticTags;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MANIFEST: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: api\nspec:\n  template:\n    spec:\n      containers:\n        - name: api\n          image: repo/app:1.0.0\n";

    fn config(dir: &Path, extra: &str) -> Arc<Config> {
        let yaml = format!(
            r#"
system:
  dataDir: "{data}"
  workDir: "{work}"
  registryConcurrency: 1
registries:
  - name: fallback
    default: true
notifications:
  ntfy:
    url: https://ntfy.invalid
    topic: updates
    reminder: 1d
{extra}"#,
            data = dir.join("data").display(),
            work = dir.join("work").display(),
        );
        Arc::new(serde_yaml_ng::from_str(&yaml).unwrap())
    }

    fn engine(
        config: Arc<Config>,
        cluster: Arc<FakeCluster>,
        registry: Arc<dyn TagLister>,
        notifier: Arc<RecordingNotifier>,
    ) -> Engine {
        Engine::new(config, cluster, registry, notifier, CancellationToken::new())
    }

    fn updates(engine: &Engine) -> Vec<UpdateCandidate> {
        engine.store().read_all(IMAGE_UPDATES).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_notifies_and_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Remote::seed(dir.path(), &[("apps/api.yaml", MANIFEST)]);
        let mut api = workload("default", "api", "repo/app:1.0.0");
        api.exclude_pattern = Some("*-rc*".into());
        api.gitops_target = Some("infra".into());
        let cluster = Arc::new(FakeCluster::new(vec![api]));
        let registry = Arc::new(StaticTags::default().with("repo/app", &["1.0.0", "1.1.0", "1.1.0-rc1"]));
        let notifier = Arc::new(RecordingNotifier::default());
        let cfg = config(
            dir.path(),
            &format!("gitops:\n  - name: infra\n    repositoryUrl: \"{}\"\n", remote.url),
        );
        let engine = engine(cfg, cluster, registry, notifier.clone());

        let summary = engine.run().await.unwrap();

        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.notified, 1);
        assert_eq!(summary.committed, 1);
        let rows = updates(&engine);
        let new_tags: Vec<_> = rows.iter().map(|c| c.new_tag.as_str()).collect();
        assert_eq!(new_tags, ["1.1.0"]);
        assert!(rows[0].sent_time.is_some());
        let sent = notifier.sent();
        assert_eq!(sent.iter().filter(|n| n.title.starts_with("New tag")).count(), 1);
        assert_eq!(sent.iter().filter(|n| n.title.starts_with("GitOps commit")).count(), 1);
        assert_eq!(remote.show("apps/api.yaml"), MANIFEST.replace("1.0.0", "1.1.0"));

        let containers: Vec<ContainerRecord> = engine.store().read_all(CONTAINERS).unwrap();
        assert_eq!(containers.len(), 1);
        let images: Vec<crate::state::ImageInventoryEntry> =
            engine.store().read_all(IMAGES).unwrap();
        assert_eq!(images[0].image, "repo/app:1.0.0");
    }

    #[tokio::test]
    async fn test_second_run_within_reminder_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::new(vec![workload("default", "api", "repo/app:1.0.0")]));
        let registry = Arc::new(StaticTags::default().with("repo/app", &["1.1.0", "1.2.0"]));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = engine(config(dir.path(), ""), cluster, registry, notifier.clone());

        let first = engine.run().await.unwrap();
        let first_sent = updates(&engine)
            .iter()
            .find(|c| c.new_tag == "1.2.0")
            .and_then(|c| c.sent_time);
        let second = engine.run().await.unwrap();

        assert_eq!(first.notified, 1);
        assert_eq!(second.notified, 0);
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(second.candidates, 2);
        let carried = updates(&engine)
            .iter()
            .find(|c| c.new_tag == "1.2.0")
            .and_then(|c| c.sent_time);
        assert!(first_sent.is_some());
        assert_eq!(carried, first_sent);
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_retried_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "");
        let cluster = Arc::new(FakeCluster::new(vec![workload("default", "api", "repo/app:1.0.0")]));
        let registry = Arc::new(StaticTags::default().with("repo/app", &["1.1.0"]));

        let failing = engine(
            cfg.clone(),
            cluster.clone(),
            registry.clone(),
            Arc::new(RecordingNotifier::failing()),
        );
        assert_eq!(failing.run().await.unwrap().notified, 0);
        assert!(updates(&failing)[0].sent_time.is_none());

        let notifier = Arc::new(RecordingNotifier::default());
        let healthy = engine(cfg, cluster, registry, notifier.clone());
        assert_eq!(healthy.run().await.unwrap().notified, 1);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_registry_failure_excludes_workload() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::new(vec![
            workload("default", "api", "repo/app:1.0.0"),
            workload("default", "web", "repo/missing:1.0.0"),
        ]));
        let registry = Arc::new(StaticTags::default().with("repo/app", &["1.1.0"]));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = engine(config(dir.path(), ""), cluster, registry, notifier);

        let summary = engine.run().await.unwrap();

        assert_eq!(summary.workloads, 2);
        assert_eq!(summary.failed, 1);
        let containers: Vec<ContainerRecord> = engine.store().read_all(CONTAINERS).unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].workload.key.workload_name, "api");
        assert_eq!(updates(&engine).len(), 1);
    }

    #[tokio::test]
    async fn test_discovery_failure_runs_with_no_workloads() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster {
            fail_discovery: true,
            ..Default::default()
        });
        let engine = engine(
            config(dir.path(), ""),
            cluster,
            Arc::new(StaticTags::default()),
            Arc::new(RecordingNotifier::default()),
        );

        let summary = engine.run().await.unwrap();

        assert_eq!(summary.workloads, 0);
        assert!(updates(&engine).is_empty());
    }

    #[tokio::test]
    async fn test_gitops_drift_keeps_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let other = MANIFEST.replace("repo/app", "repo/other");
        let remote = Remote::seed(dir.path(), &[("api.yaml", &other)]);
        let mut api = workload("default", "api", "repo/app:1.0.0");
        api.gitops_target = Some("infra".into());
        let cluster = Arc::new(FakeCluster::new(vec![api]));
        let registry = Arc::new(StaticTags::default().with("repo/app", &["1.1.0"]));
        let cfg = config(
            dir.path(),
            &format!("gitops:\n  - name: infra\n    repositoryUrl: \"{}\"\n", remote.url),
        );
        let engine = engine(cfg, cluster, registry, Arc::new(RecordingNotifier::default()));

        let summary = engine.run().await.unwrap();

        assert_eq!(summary.gitops_failed, 1);
        assert_eq!(summary.committed, 0);
        assert_eq!(updates(&engine).len(), 1);
        assert_eq!(remote.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_previous_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::new(vec![workload("default", "api", "repo/app:1.0.0")]));
        let cancel = CancellationToken::new();
        let engine = Engine::new(
            config(dir.path(), ""),
            cluster,
            Arc::new(StaticTags::default().with("repo/app", &["1.1.0"])),
            Arc::new(RecordingNotifier::default()),
            cancel.clone(),
        );

        cancel.cancel();
        let summary = engine.run().await.unwrap();

        assert!(summary.cancelled);
        assert!(!engine.store().dir().join("imageUpdates.json").exists());
    }

    /// Delivers notifications and requests shutdown after the first one.
    struct CancelOnSend {
        cancel: CancellationToken,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CancelOnSend {
        async fn send(&self, _notification: &Notification) -> Result<DateTime<Utc>, EngineError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            Ok(Utc::now())
        }
    }

    #[tokio::test]
    async fn test_cancelled_mid_run_persists_sent_time() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "");
        let api = workload("default", "api", "repo/app:1.0.0");
        let web = workload("default", "web", "repo/app:1.0.0");
        let cluster = Arc::new(FakeCluster::new(vec![api, web.clone()]));
        let registry = Arc::new(StaticTags::default().with("repo/app", &["1.1.0"]));

        let mut earlier = candidate(web, "1.1.0");
        earlier.sent_time = Some(Utc::now() - chrono::Duration::hours(2));
        SnapshotStore::new(&cfg.system.data_dir)
            .write_all(IMAGE_UPDATES, &[earlier.clone()])
            .unwrap();

        let cancel = CancellationToken::new();
        let cancelling = Arc::new(CancelOnSend {
            cancel: cancel.clone(),
            sent: AtomicUsize::new(0),
        });
        let first = Engine::new(
            cfg.clone(),
            cluster.clone(),
            registry.clone(),
            cancelling.clone(),
            cancel,
        );
        let summary = first.run().await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(cancelling.sent.load(Ordering::SeqCst), 1);
        let rows = updates(&first);
        assert_eq!(rows.len(), 2);
        let api_row = rows.iter().find(|c| c.key().workload_name == "api").unwrap();
        assert!(api_row.sent_time.is_some());
        let web_row = rows.iter().find(|c| c.key().workload_name == "web").unwrap();
        assert_eq!(web_row.sent_time, earlier.sent_time);

        let notifier = Arc::new(RecordingNotifier::default());
        let second = engine(cfg, cluster, registry, notifier.clone());
        assert_eq!(second.run().await.unwrap().notified, 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_run_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::new(vec![workload("default", "api", "repo/app:1.0.0")]));
        let engine = Arc::new(engine(
            config(dir.path(), ""),
            cluster,
            Arc::new(SlowTags::default()),
            Arc::new(RecordingNotifier::default()),
        ));

        let handle = engine.trigger("test");
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.wait_idle().await;

        assert_eq!(updates(&engine).len(), 1);
        handle.await.unwrap();
    }

    /// Tag lister that records how many listings overlap.
    #[derive(Default)]
    struct SlowTags {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl TagLister for SlowTags {
        async fn list_tags(
            &self,
            _image: &ImageReference,
            _credentials: &RegistryCredentials,
        ) -> Result<Vec<String>, EngineError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec!["1.1.0".to_string()])
        }
    }

    #[tokio::test]
    async fn test_concurrent_triggers_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::new(vec![workload("default", "api", "repo/app:1.0.0")]));
        let tags = Arc::new(SlowTags::default());
        let engine = Arc::new(engine(
            config(dir.path(), ""),
            cluster,
            tags.clone(),
            Arc::new(RecordingNotifier::default()),
        ));

        let (first, second) = tokio::join!(engine.trigger("test"), engine.trigger("test"));
        first.unwrap();
        second.unwrap();

        assert_eq!(tags.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(updates(&engine).len(), 1);
    }
}
