use crate::image_reference::ImageReference;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Full identity of a watched container. Notification dedup keys on all of it, so two
/// containers named `app` in different workloads never suppress each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadKey {
    pub namespace: String,
    pub kind: String,
    pub workload_name: String,
    pub container_name: String,
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}[{}]",
            self.namespace, self.kind, self.workload_name, self.container_name
        )
    }
}

/// A monitored container plus the policy hints read from its workload's annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    #[serde(flatten)]
    pub key: WorkloadKey,
    /// Image string exactly as it appears in the pod template.
    pub image: String,
    #[serde(default)]
    pub include_pattern: Option<String>,
    #[serde(default)]
    pub exclude_pattern: Option<String>,
    /// Name of a configured GitOps target; `None` means not GitOps-managed.
    #[serde(default)]
    pub gitops_target: Option<String>,
    /// Repository subtree holding this workload's manifests.
    #[serde(default)]
    pub gitops_directory: Option<String>,
}

impl WorkloadRef {
    pub fn is_gitops_managed(&self) -> bool {
        self.gitops_target.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Row of the `containers` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    #[serde(flatten)]
    pub workload: WorkloadRef,
    pub time_scanned: DateTime<Utc>,
}

/// Row of the `images` inventory snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInventoryEntry {
    pub namespace: String,
    pub image: String,
    pub time_scanned: DateTime<Utc>,
}

/// An accepted update for one container; row of the `imageUpdates` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCandidate {
    pub workload: WorkloadRef,
    pub current_image: ImageReference,
    pub current_tag: String,
    pub new_tag: String,
    pub found_at: DateTime<Utc>,
    /// Set only once a notification for this pending update was actually delivered.
    #[serde(default)]
    pub sent_time: Option<DateTime<Utc>>,
}

impl UpdateCandidate {
    pub fn key(&self) -> &WorkloadKey {
        &self.workload.key
    }

    pub fn new_image(&self) -> ImageReference {
        self.current_image.with_tag(&self.new_tag)
    }
}

/// Last delivered notification for a workload, as recorded by a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub workload_key: WorkloadKey,
    pub last_sent_time: DateTime<Utc>,
}

impl NotificationRecord {
    /// Collapses a previous `imageUpdates` snapshot into one record per workload, keeping
    /// the most recent delivery.
    pub fn from_snapshot(previous: &[UpdateCandidate]) -> Vec<NotificationRecord> {
        let mut latest: std::collections::BTreeMap<&WorkloadKey, DateTime<Utc>> =
            std::collections::BTreeMap::new();
        for candidate in previous {
            if let Some(sent) = candidate.sent_time {
                latest
                    .entry(candidate.key())
                    .and_modify(|t| *t = (*t).max(sent))
                    .or_insert(sent);
            }
        }
        latest
            .into_iter()
            .map(|(key, last_sent_time)| NotificationRecord {
                workload_key: key.clone(),
                last_sent_time,
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_history_keeps_latest_per_workload() {
        let now = Utc::now();
        let api = workload("default", "api", "repo/app:1.0.0");
        let mut older = candidate(api.clone(), "1.1.0");
        older.sent_time = Some(now - Duration::hours(30));
        let mut newer = candidate(api.clone(), "1.2.0");
        newer.sent_time = Some(now - Duration::hours(2));
        let unsent = candidate(workload("default", "web", "repo/web:1.0.0"), "1.1.0");

        let history = NotificationRecord::from_snapshot(&[older, newer, unsent]);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].workload_key, api.key);
        assert_eq!(history[0].last_sent_time, now - Duration::hours(2));
    }

    #[test]
    fn test_candidate_snapshot_shape() {
        let row = candidate(workload("default", "api", "repo/app:1.0.0"), "1.1.0");
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["workload"]["workloadName"], "api");
        assert_eq!(json["currentTag"], "1.0.0");
        assert_eq!(json["newTag"], "1.1.0");
        assert!(json["sentTime"].is_null());
        let back: UpdateCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }
}
