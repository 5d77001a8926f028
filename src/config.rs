use crate::error::EngineError;
use crate::notification_gate::ReminderInterval;
use crate::secret_string::SecretString;
use crate::version_policy::WildcardPattern;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Component, PathBuf};
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub system: System,
    #[serde(default)]
    pub discovery: Discovery,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub gitops: Vec<GitOpsTarget>,
    pub notifications: Notifications,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct System {
    /// Cron expression with a seconds field, as understood by tokio-cron-scheduler.
    pub schedule: String,
    pub run_at_startup: bool,
    /// Directory holding the JSON snapshots.
    pub data_dir: PathBuf,
    /// Parent directory of the per-target GitOps working copies.
    pub work_dir: PathBuf,
    pub registry_concurrency: usize,
}

impl Default for System {
    fn default() -> Self {
        Self {
            schedule: "0 0 * * * *".to_string(),
            run_at_startup: false,
            data_dir: PathBuf::from("/app/data"),
            work_dir: env::temp_dir().join("kube-tagwatch"),
            registry_concurrency: 4,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Discovery {
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    pub annotation_key: String,
    pub annotation_value: String,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            namespace: None,
            annotation_key: "kube-tagwatch/enabled".to_string(),
            annotation_value: "true".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    pub registry_seconds: u64,
    pub git_seconds: u64,
    pub kubernetes_seconds: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            registry_seconds: 30,
            git_seconds: 120,
            kubernetes_seconds: 30,
        }
    }
}

impl Timeouts {
    pub fn registry(&self) -> Duration {
        Duration::from_secs(self.registry_seconds)
    }

    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_seconds)
    }

    pub fn kubernetes(&self) -> Duration {
        Duration::from_secs(self.kubernetes_seconds)
    }
}

/// Global tag rules applied to every workload after its own annotations.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    pub include_patterns: Vec<WildcardPattern>,
    pub exclude_patterns: Vec<WildcardPattern>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Matched as a substring of the image's registry host.
    pub name: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    #[serde(default)]
    pub token: SecretString,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsTarget {
    pub name: String,
    pub repository_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub auth_token: SecretString,
    #[serde(default = "default_commit_name")]
    pub commit_name: String,
    #[serde(default = "default_commit_email")]
    pub commit_email: String,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_commit_name() -> String {
    "kube-tagwatch".to_string()
}

fn default_commit_email() -> String {
    "kube-tagwatch@localhost".to_string()
}

fn default_commit_message() -> String {
    "Update container image".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Notifications {
    pub ntfy: Ntfy,
}

#[derive(Debug, Deserialize)]
pub struct Ntfy {
    pub url: String,
    pub topic: String,
    #[serde(default)]
    pub token: SecretString,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub reminder: ReminderInterval,
}

fn default_priority() -> u8 {
    3
}

impl Config {
    /// Registry entry whose name occurs in `hostname`, falling back to the default entry.
    pub fn find_registry_for_hostname(&self, hostname: &str) -> Option<&Registry> {
        self.registries
            .iter()
            .find(|registry| !registry.name.is_empty() && hostname.contains(&registry.name))
            .or_else(|| self.registries.iter().find(|registry| registry.default))
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.system.schedule.trim().is_empty() {
            return Err(EngineError::Config("system.schedule must not be empty".into()));
        }
        if self.system.registry_concurrency == 0 {
            return Err(EngineError::Config(
                "system.registryConcurrency must be at least 1".into(),
            ));
        }
        if self.registries.iter().filter(|r| r.default).count() > 1 {
            return Err(EngineError::Config(
                "at most one registry may be marked as default".into(),
            ));
        }
        let mut names = HashSet::new();
        for target in &self.gitops {
            let mut components = Path::new(&target.name).components();
            let single_dir = matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            );
            if !single_dir {
                return Err(EngineError::Config(format!(
                    "GitOps target name '{}' must be a single path segment",
                    target.name
                )));
            }
            if !names.insert(target.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate GitOps target name '{}'",
                    target.name
                )));
            }
        }
        if !(1..=5).contains(&self.notifications.ntfy.priority) {
            return Err(EngineError::Config(format!(
                "notifications.ntfy.priority must be between 1 and 5, got {}",
                self.notifications.ntfy.priority
            )));
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate().context("Invalid configuration")?;

    info!(
        "Loaded {} registries, {} GitOps targets, reminder interval {}",
        config.registries.len(),
        config.gitops.len(),
        config.notifications.ntfy.reminder
    );
    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = env::var(name.as_str()).map_err(|_| {
            EngineError::Config(format!("Missing environment variable: {}", name.as_str()))
        })?;
        result.push_str(&input[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&input[last..]);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const MINIMAL: &str = r#"
notifications:
  ntfy:
    url: https://ntfy.sh
    topic: updates
    reminder: 1d
"#;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("TAGWATCH_TEST_VAR", "value123");
        }
        let input = "This is a test: ${TAGWATCH_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("TAGWATCH_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${TAGWATCH_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert!(
            err.to_string()
                .contains("Missing environment variable: TAGWATCH_MISSING_VAR")
        );
    }

    #[test]
    fn test_expand_env_vars_multiple_vars() {
        unsafe {
            env::set_var("TAGWATCH_VAR1", "foo");
            env::set_var("TAGWATCH_VAR2", "bar");
        }
        let input = "${TAGWATCH_VAR1} and ${TAGWATCH_VAR2}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "foo and bar");
        unsafe {
            env::remove_var("TAGWATCH_VAR1");
            env::remove_var("TAGWATCH_VAR2");
        }
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("TAGWATCH_GIT_TOKEN", "git_secret");
        }
        let yaml_content = r#"
        webserver:
          port: 9090
        system:
          schedule: "0 */30 * * * *"
          runAtStartup: true
          dataDir: /var/lib/tagwatch
        policy:
          includePatterns: ["*.*.*"]
          excludePatterns: ["*-rc*", "*beta*"]
        registries:
          - name: ghcr.io
            token: secret_token
          - name: fallback
            username: user
            password: pass
            default: true
        gitops:
          - name: infra
            repositoryUrl: https://github.com/example/infra.git
            authToken: ${TAGWATCH_GIT_TOKEN}
        notifications:
          ntfy:
            url: https://ntfy.sh
            topic: updates
            token: ntfy_token
            priority: 4
            reminder: 2w
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.webserver.port, 9090);
        assert!(config.system.run_at_startup);
        assert_eq!(config.system.data_dir, PathBuf::from("/var/lib/tagwatch"));
        assert_eq!(config.system.registry_concurrency, 4);
        assert_eq!(config.policy.include_patterns.len(), 1);
        assert_eq!(config.policy.exclude_patterns.len(), 2);
        assert_eq!(config.registries[0].token.expose_secret(), "secret_token");
        assert_eq!(config.gitops[0].branch, "main");
        assert_eq!(config.gitops[0].auth_token.expose_secret(), "git_secret");
        assert_eq!(config.notifications.ntfy.priority, 4);
        assert_eq!(
            config.notifications.ntfy.reminder.as_duration(),
            chrono::Duration::weeks(2)
        );
        unsafe {
            env::remove_var("TAGWATCH_GIT_TOKEN");
        }
    }

    #[test]
    fn test_invalid_reminder_is_config_error() {
        let yaml = MINIMAL.replace("reminder: 1d", "reminder: 5x");
        let tmp_file = tempfile::NamedTempFile::new().unwrap();
        fs::write(tmp_file.path(), yaml).unwrap();
        assert!(load_config(tmp_file.path()).is_err());
    }

    #[test]
    fn test_two_default_registries_rejected() {
        let yaml = format!(
            "{}registries:\n  - name: a\n    default: true\n  - name: b\n    default: true\n",
            MINIMAL
        );
        let config: Config = serde_yaml_ng::from_str(&yaml).unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_gitops_target_name_must_be_single_segment() {
        for name in ["\"\"", "../infra", "a/b", "/abs", "."] {
            let yaml = format!(
                "{}gitops:\n  - name: {}\n    repositoryUrl: https://git.example.com/infra.git\n",
                MINIMAL, name
            );
            let config: Config = serde_yaml_ng::from_str(&yaml).unwrap();
            assert!(matches!(config.validate(), Err(EngineError::Config(_))), "{name}");
        }
        let yaml = format!(
            "{}gitops:\n  - name: infra\n    repositoryUrl: https://git.example.com/infra.git\n",
            MINIMAL
        );
        let config: Config = serde_yaml_ng::from_str(&yaml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_find_registry_falls_back_to_default() {
        let yaml = format!(
            "{}registries:\n  - name: ghcr.io\n    token: t\n  - name: other\n    default: true\n",
            MINIMAL
        );
        let config: Config = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(
            config.find_registry_for_hostname("ghcr.io").map(|r| r.name.as_str()),
            Some("ghcr.io")
        );
        assert_eq!(
            config.find_registry_for_hostname("docker.io").map(|r| r.name.as_str()),
            Some("other")
        );
    }

    #[test]
    fn test_find_registry_without_default() {
        let config: Config = serde_yaml_ng::from_str(MINIMAL).unwrap();
        assert!(config.find_registry_for_hostname("docker.io").is_none());
        assert_eq!(config.system.schedule, "0 0 * * * *");
        assert_eq!(config.discovery.annotation_key, "kube-tagwatch/enabled");
    }
}
