//! Engine configuration and validation.
//!
//! Loaded from `.xbot/engine.toml`; every field has a default so a missing
//! file or a partial one is fine. [`Validate`] catches mistakes before the
//! dispatcher starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::actions::ActionCatalog;
use crate::dispatcher::DispatcherConfig;
use crate::error::{Error, Result};
use crate::publisher::{PublisherSettings, StatusLedger};
use crate::sandbox::{ContainerSettings, ResourceLimits, SandboxSettings};

/// Conventional location of the config file, relative to the repository.
pub const DEFAULT_CONFIG_PATH: &str = ".xbot/engine.toml";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

/// Which sandbox backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Container,
    Worktree,
}

impl std::str::FromStr for SandboxKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" => Ok(SandboxKind::Container),
            "worktree" => Ok(SandboxKind::Worktree),
            other => Err(Error::Config(format!("unknown sandbox kind '{}'", other))),
        }
    }
}

fn default_runtime() -> String {
    "podman".to_string()
}
fn default_image() -> String {
    "node:20-bookworm".to_string()
}
fn default_memory() -> String {
    "2g".to_string()
}
fn default_cpus() -> f64 {
    2.0
}
fn default_lifetime_secs() -> u64 {
    30 * 60
}
fn default_provision_timeout_secs() -> u64 {
    300
}
fn default_workdir() -> PathBuf {
    PathBuf::from("/workspace")
}
fn default_true() -> bool {
    true
}
fn default_clone_base_url() -> String {
    "https://github.com".to_string()
}

/// `[sandbox]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub provider: SandboxKind,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Hard lifetime of a sandbox, in seconds.
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
    #[serde(default = "default_provision_timeout_secs")]
    pub provision_timeout_secs: u64,
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_true")]
    pub clone_repository: bool,
    #[serde(default = "default_clone_base_url")]
    pub clone_base_url: String,
    #[serde(default = "default_true")]
    pub forward_token: bool,
    /// Where worktree sandboxes are created. Defaults to the temp dir.
    #[serde(default)]
    pub worktree_base: Option<PathBuf>,
    /// Extra environment for every sandbox.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            provider: SandboxKind::default(),
            runtime: default_runtime(),
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            lifetime_secs: default_lifetime_secs(),
            provision_timeout_secs: default_provision_timeout_secs(),
            workdir: default_workdir(),
            clone_repository: true,
            clone_base_url: default_clone_base_url(),
            forward_token: true,
            worktree_base: None,
            env: BTreeMap::new(),
        }
    }
}

impl Validate for SandboxSection {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.provider == SandboxKind::Container {
            if self.image.trim().is_empty() {
                result.add_error("sandbox.image cannot be empty");
            }
            if self.runtime.trim().is_empty() {
                result.add_error("sandbox.runtime cannot be empty");
            }
            if !self.workdir.is_absolute() {
                result.add_error("sandbox.workdir must be an absolute path");
            }
        }
        if self.memory.trim().is_empty() {
            result.add_error("sandbox.memory cannot be empty");
        }
        if self.cpus <= 0.0 {
            result.add_error("sandbox.cpus must be greater than zero");
        }
        if self.lifetime_secs == 0 {
            result.add_error("sandbox.lifetime_secs must be greater than zero");
        }
        if self.provision_timeout_secs == 0 {
            result.add_error("sandbox.provision_timeout_secs must be greater than zero");
        }
        if self.provision_timeout_secs >= self.lifetime_secs {
            result.add_warning("sandbox.provision_timeout_secs is not shorter than the sandbox lifetime");
        }
        if self.lifetime_secs > 4 * 60 * 60 {
            result.add_warning("sandbox.lifetime_secs over 4 hours may leak resources");
        }

        result
    }
}

fn default_cooldown_secs() -> u64 {
    5
}

/// `[dispatcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    /// Pause between consecutive tasks, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_plan() -> Vec<String> {
    vec!["analyze".to_string()]
}
fn default_step_timeout_secs() -> u64 {
    300
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Plan used when an assignment does not name one.
    #[serde(default = "default_plan")]
    pub default_plan: Vec<String>,
    /// Timeout for every command a step runs, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            default_plan: default_plan(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

fn default_usernames() -> Vec<String> {
    vec!["xcloud-bot".to_string(), "xbot".to_string()]
}

/// `[intake]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeSection {
    /// Accounts whose assignment starts a task.
    #[serde(default = "default_usernames")]
    pub usernames: Vec<String>,
}

impl Default for IntakeSection {
    fn default() -> Self {
        Self {
            usernames: default_usernames(),
        }
    }
}

fn default_branch_prefix() -> String {
    "xbot".to_string()
}
fn default_base_branch() -> String {
    "main".to_string()
}
fn default_author_name() -> String {
    "xBot".to_string()
}
fn default_author_email() -> String {
    "xbot@users.noreply.github.com".to_string()
}
fn default_gh_program() -> String {
    "gh".to_string()
}
fn default_command_timeout_secs() -> u64 {
    120
}
fn default_status_attempts() -> u32 {
    3
}
fn default_status_backoff_secs() -> u64 {
    1
}
fn default_status_backoff_max_secs() -> u64 {
    30
}

/// `[publisher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherSection {
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    #[serde(default = "default_gh_program")]
    pub gh_program: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Delivery attempts per status update.
    #[serde(default = "default_status_attempts")]
    pub status_attempts: u32,
    #[serde(default = "default_status_backoff_secs")]
    pub status_backoff_secs: u64,
    #[serde(default = "default_status_backoff_max_secs")]
    pub status_backoff_max_secs: u64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            base_branch: default_base_branch(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            gh_program: default_gh_program(),
            command_timeout_secs: default_command_timeout_secs(),
            status_attempts: default_status_attempts(),
            status_backoff_secs: default_status_backoff_secs(),
            status_backoff_max_secs: default_status_backoff_max_secs(),
        }
    }
}

impl Validate for PublisherSection {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let prefix = self.branch_prefix.trim();
        if prefix.is_empty() || prefix.starts_with('-') || prefix.contains(char::is_whitespace) {
            result.add_error("publisher.branch_prefix must be a non-empty branch name component");
        }
        if self.base_branch.trim().is_empty() {
            result.add_error("publisher.base_branch cannot be empty");
        }
        if self.status_attempts == 0 {
            result.add_error("publisher.status_attempts must be at least 1");
        }
        if self.command_timeout_secs == 0 {
            result.add_error("publisher.command_timeout_secs must be greater than zero");
        }
        if self.status_backoff_secs > self.status_backoff_max_secs {
            result.add_warning("publisher.status_backoff_secs exceeds status_backoff_max_secs and will be clamped");
        }

        result
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub intake: IntakeSection,
    #[serde(default)]
    pub publisher: PublisherSection,
}

impl EngineConfig {
    /// Loads the config at `path`. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory: self.sandbox.memory.clone(),
            cpus: self.sandbox.cpus,
            lifetime: Duration::from_secs(self.sandbox.lifetime_secs),
        }
    }

    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            limits: self.limits(),
            provision_timeout: Duration::from_secs(self.sandbox.provision_timeout_secs),
            environment: self.sandbox.env.clone(),
        }
    }

    pub fn container_settings(&self) -> ContainerSettings {
        ContainerSettings {
            runtime: self.sandbox.runtime.clone(),
            image: self.sandbox.image.clone(),
            workdir: self.sandbox.workdir.clone(),
            clone_repository: self.sandbox.clone_repository,
            clone_base_url: self.sandbox.clone_base_url.clone(),
            forward_token: self.sandbox.forward_token,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            cooldown: Duration::from_secs(self.dispatcher.cooldown_secs),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.step_timeout_secs)
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            branch_prefix: self.publisher.branch_prefix.clone(),
            base_branch: self.publisher.base_branch.clone(),
            author_name: self.publisher.author_name.clone(),
            author_email: self.publisher.author_email.clone(),
            gh_program: self.publisher.gh_program.clone(),
            command_timeout: Duration::from_secs(self.publisher.command_timeout_secs),
        }
    }

    pub fn status_ledger(&self) -> StatusLedger {
        StatusLedger::new(
            self.publisher.status_attempts,
            Duration::from_secs(self.publisher.status_backoff_secs),
            Duration::from_secs(self.publisher.status_backoff_max_secs),
        )
    }
}

impl Validate for EngineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.sandbox.validate());
        result.merge(self.publisher.validate());

        if self.dispatcher.cooldown_secs > 600 {
            result.add_warning("dispatcher.cooldown_secs over 10 minutes may indicate a misconfiguration");
        }

        if self.pipeline.step_timeout_secs == 0 {
            result.add_error("pipeline.step_timeout_secs must be greater than zero");
        }
        if self.pipeline.step_timeout_secs > self.sandbox.lifetime_secs {
            result.add_error("pipeline.step_timeout_secs is longer than the sandbox lifetime");
        }
        if self.pipeline.default_plan.is_empty() {
            result.add_warning("pipeline.default_plan is empty; tasks will publish without running any action");
        }
        let catalog = ActionCatalog::with_defaults();
        for name in &self.pipeline.default_plan {
            if catalog.resolve(name).is_err() {
                result.add_warning(format!("pipeline.default_plan names unknown action '{}'", name));
            }
        }

        if self.intake.usernames.iter().all(|u| u.trim().is_empty()) {
            result.add_warning("intake.usernames is empty; only XBOT_USERNAME will match assignments");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let result = EngineConfig::default().validate();
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join(DEFAULT_CONFIG_PATH)).unwrap();
        assert_eq!(config.sandbox.image, "node:20-bookworm");
        assert_eq!(config.pipeline.default_plan, vec!["analyze"]);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            r#"
[sandbox]
provider = "worktree"
cpus = 1.5

[dispatcher]
cooldown_secs = 0

[pipeline]
default_plan = ["analyze", "mutate"]

[sandbox.env]
CI = "true"
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.sandbox.provider, SandboxKind::Worktree);
        assert_eq!(config.sandbox.cpus, 1.5);
        assert_eq!(config.sandbox.memory, "2g");
        assert_eq!(config.dispatcher_config().cooldown, Duration::ZERO);
        assert_eq!(config.pipeline.default_plan, vec!["analyze", "mutate"]);
        assert_eq!(config.sandbox_settings().environment["CI"], "true");
        assert_eq!(config.publisher.branch_prefix, "xbot");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[sandbox]\ncpus = \"many\"\n").unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("engine.toml")));
    }

    #[test]
    fn empty_image_and_zero_cpus_fail() {
        let mut config = EngineConfig::default();
        config.sandbox.image = "  ".to_string();
        config.sandbox.cpus = 0.0;

        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.contains("image")));
        assert!(result.errors.iter().any(|e| e.contains("cpus")));
        assert!(result.into_result().is_err());
    }

    #[test]
    fn worktree_provider_ignores_image() {
        let mut config = EngineConfig::default();
        config.sandbox.provider = SandboxKind::Worktree;
        config.sandbox.image = String::new();
        assert!(config.validate().is_valid());
    }

    #[test]
    fn step_timeout_longer_than_lifetime_fails() {
        let mut config = EngineConfig::default();
        config.sandbox.lifetime_secs = 60;
        config.sandbox.provision_timeout_secs = 30;
        config.pipeline.step_timeout_secs = 120;

        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.contains("step_timeout_secs")));
    }

    #[test]
    fn long_cooldown_and_unknown_plan_warn() {
        let mut config = EngineConfig::default();
        config.dispatcher.cooldown_secs = 3600;
        config.pipeline.default_plan = vec!["deploy".to_string()];

        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("10 minutes")));
        assert!(result.warnings.iter().any(|w| w.contains("'deploy'")));
    }

    #[test]
    fn bad_branch_prefix_fails() {
        let mut config = EngineConfig::default();
        config.publisher.branch_prefix = "--force".to_string();
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn sandbox_kind_parses_case_insensitively() {
        assert_eq!("Worktree".parse::<SandboxKind>().unwrap(), SandboxKind::Worktree);
        assert_eq!(" container ".parse::<SandboxKind>().unwrap(), SandboxKind::Container);
        assert!("vm".parse::<SandboxKind>().is_err());
    }
}
