use crate::config::{Config, Policy};
use crate::error::{EngineError, Result, with_timeout};
use crate::image_reference::ImageReference;
use crate::oci_registry::{RegistryCredentials, TagLister};
use crate::state::{UpdateCandidate, WorkloadRef};
use crate::version_policy::{self, WorkloadRules, cmp_precedence, parse_version};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Evaluates every registry tag, in registry order, against the current tag and emits one
/// candidate per accepted tag. Tags that are not semantic versions are logged and skipped.
pub fn build(
    workload: &WorkloadRef,
    current_image: &ImageReference,
    available_tags: &[String],
    policy: &Policy,
    now: DateTime<Utc>,
) -> Vec<UpdateCandidate> {
    let rules = match WorkloadRules::from_annotations(
        workload.include_pattern.as_deref(),
        workload.exclude_pattern.as_deref(),
    ) {
        Ok(rules) => rules,
        Err(e) => {
            warn!("Skipping {}: {}", workload.key, e);
            return Vec::new();
        }
    };

    available_tags
        .iter()
        .filter_map(|tag| {
            match version_policy::evaluate(&current_image.tag, tag, &rules, policy) {
                Ok(true) => {
                    info!(
                        "New tag {} found for {} (current {})",
                        tag, workload.key, current_image.tag
                    );
                    Some(UpdateCandidate {
                        workload: workload.clone(),
                        current_image: current_image.clone(),
                        current_tag: current_image.tag.clone(),
                        new_tag: tag.clone(),
                        found_at: now,
                        sent_time: None,
                    })
                }
                Ok(false) => None,
                Err(e) => {
                    debug!("Skipping tag for {}: {}", workload.key, e);
                    None
                }
            }
        })
        .collect()
}

/// Resolves credentials, lists tags and builds candidates for one workload.
///
/// A malformed image in the pod spec is logged and yields no candidates. Credential and
/// registry failures are returned and the caller drops the workload from the run.
pub async fn resolve(
    workload: &WorkloadRef,
    config: &Config,
    registry: &dyn TagLister,
    now: DateTime<Utc>,
) -> Result<Vec<UpdateCandidate>> {
    let current_image = match ImageReference::parse(&workload.image) {
        Ok(image) => image,
        Err(e) => {
            warn!(
                "Skipping {}: cannot parse image {}: {}",
                workload.key, workload.image, e
            );
            return Ok(Vec::new());
        }
    };

    let registry_config = config
        .find_registry_for_hostname(current_image.registry())
        .ok_or_else(|| EngineError::RegistryAuthUnresolved(current_image.registry().to_string()))?;
    let credentials = RegistryCredentials::from(registry_config);

    let tags = with_timeout(
        "registry tag listing",
        config.timeouts.registry(),
        registry.list_tags(&current_image, &credentials),
    )
    .await?;

    Ok(build(workload, &current_image, &tags, &config.policy, now))
}

/// Index of the candidate with the highest new tag.
pub fn highest(candidates: &[UpdateCandidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter_map(|(i, c)| parse_version(&c.new_tag).ok().map(|v| (i, v)))
        .max_by(|(_, a), (_, b)| cmp_precedence(a, b))
        .map(|(i, _)| i)
}
