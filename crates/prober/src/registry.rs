//! Backend registry for locating ffmpeg installations.
//!
//! A backend is one ffmpeg installation addressed by a version label, either a
//! native binary or a container image. The registry is built once at startup:
//! every candidate gets a single `-version` liveness check, and the result is
//! frozen for the lifetime of the process. Probe calls never re-verify.

use crate::command::build_version_command;
use crate::config::BackendConfig;
use crate::runner::CommandRunner;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for registry lookups
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown ffmpeg backend: {0}")]
    BackendNotFound(String),

    #[error("ffmpeg backend {0} is not available on this system")]
    BackendUnavailable(String),

    #[error("no ffmpeg backends are available on this system")]
    NoBackendAvailable,
}

/// How a backend is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendKind {
    Native,
    Containerized,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Containerized => write!(f, "container"),
        }
    }
}

/// Command template for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InvocationSpec {
    /// Binaries on the host. `ffprobe` sits next to `ffmpeg`.
    Native { ffmpeg: PathBuf, ffprobe: PathBuf },
    /// An image run through a container runtime with the input mounted read-only.
    Containerized { runtime: String, image: String },
}

impl std::fmt::Display for InvocationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationSpec::Native { ffmpeg, .. } => write!(f, "{}", ffmpeg.display()),
            InvocationSpec::Containerized { runtime, image } => {
                write!(f, "{} run --rm {}", runtime, image)
            }
        }
    }
}

/// One invocable ffmpeg installation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendDescriptor {
    label: String,
    invocation: InvocationSpec,
    available: bool,
    reported_version: Option<String>,
}

impl BackendDescriptor {
    /// Native backend; the structured-probe tool is the sibling `ffprobe`.
    pub fn native(label: impl Into<String>, ffmpeg: impl Into<PathBuf>) -> Self {
        let ffmpeg = ffmpeg.into();
        let ffprobe = sibling_ffprobe(&ffmpeg);
        Self {
            label: label.into(),
            invocation: InvocationSpec::Native { ffmpeg, ffprobe },
            available: false,
            reported_version: None,
        }
    }

    pub fn containerized(
        label: impl Into<String>,
        runtime: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            invocation: InvocationSpec::Containerized {
                runtime: runtime.into(),
                image: image.into(),
            },
            available: false,
            reported_version: None,
        }
    }

    /// Record the outcome of the liveness check
    pub fn with_availability(mut self, available: bool, reported_version: Option<String>) -> Self {
        self.available = available;
        self.reported_version = reported_version;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> BackendKind {
        match self.invocation {
            InvocationSpec::Native { .. } => BackendKind::Native,
            InvocationSpec::Containerized { .. } => BackendKind::Containerized,
        }
    }

    pub fn invocation(&self) -> &InvocationSpec {
        &self.invocation
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Version string the binary reported at liveness time
    pub fn reported_version(&self) -> Option<&str> {
        self.reported_version.as_deref()
    }
}

/// Status line for one registered backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub label: String,
    pub kind: BackendKind,
    pub available: bool,
    pub preferred: bool,
    pub reported_version: Option<String>,
    pub invocation: String,
}

/// Read-only set of backends, built once and shared by reference.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    descriptors: Vec<Arc<BackendDescriptor>>,
    preferred_label: String,
    fallback_order: Vec<String>,
}

impl BackendRegistry {
    /// Build a registry from already-verified descriptors.
    ///
    /// Descriptors keep their given order as discovery order. A repeated
    /// label is ignored; the first occurrence wins.
    pub fn from_descriptors(
        descriptors: Vec<BackendDescriptor>,
        preferred_label: impl Into<String>,
        fallback_order: Vec<String>,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if seen.insert(descriptor.label.clone()) {
                unique.push(Arc::new(descriptor));
            } else {
                warn!(label = %descriptor.label, "duplicate backend label ignored");
            }
        }
        Self {
            descriptors: unique,
            preferred_label: preferred_label.into(),
            fallback_order,
        }
    }

    /// Discover backends from configuration, running one liveness check per
    /// candidate. This is the single initialization point for the registry.
    pub async fn discover(cfg: &BackendConfig, runner: &dyn CommandRunner) -> Self {
        let timeout = Duration::from_secs(cfg.liveness_timeout_secs);
        let mut labels: Vec<&str> = Vec::new();
        for label in cfg
            .native
            .iter()
            .map(|n| n.label.as_str())
            .chain(cfg.container.iter().map(|c| c.label.as_str()))
        {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }

        let mut descriptors = Vec::with_capacity(labels.len());
        for label in labels {
            let native = cfg.native.iter().find(|n| n.label == label);
            let container = cfg.container.iter().find(|c| c.label == label);

            let mut candidates = Vec::new();
            if cfg.use_containers {
                if let Some(c) = container {
                    candidates.push(BackendDescriptor::containerized(
                        label,
                        &cfg.container_runtime,
                        &c.image,
                    ));
                }
            }
            if let Some(n) = native {
                candidates.push(match resolve_native_path(&n.path) {
                    Some(path) => BackendDescriptor::native(label, path),
                    None => BackendDescriptor::native(label, &n.path),
                });
            }
            if candidates.is_empty() {
                // Container-only label while containers are disabled
                if let Some(c) = container {
                    debug!(label, "containers disabled; backend not checked");
                    descriptors.push(BackendDescriptor::containerized(
                        label,
                        &cfg.container_runtime,
                        &c.image,
                    ));
                }
                continue;
            }

            let mut chosen = None;
            let mut last = None;
            for candidate in candidates {
                let checked = check_liveness(candidate, runner, timeout).await;
                if checked.available {
                    chosen = Some(checked);
                    break;
                }
                last = Some(checked);
            }
            if let Some(descriptor) = chosen.or(last) {
                descriptors.push(descriptor);
            }
        }

        let registry = Self::from_descriptors(
            descriptors,
            cfg.default.clone(),
            cfg.fallback_order.clone(),
        );
        info!(
            available = registry.list_available().len(),
            total = registry.descriptors.len(),
            "backend registry initialized"
        );
        registry
    }

    /// Resolve a version label to a runnable backend.
    pub fn resolve(&self, label: &str) -> Result<Arc<BackendDescriptor>, RegistryError> {
        let descriptor = self
            .descriptors
            .iter()
            .find(|d| d.label == label)
            .ok_or_else(|| RegistryError::BackendNotFound(label.to_string()))?;
        if !descriptor.available {
            return Err(RegistryError::BackendUnavailable(label.to_string()));
        }
        Ok(Arc::clone(descriptor))
    }

    /// Available backends: preferred label first, then the fallback order,
    /// then discovery order.
    pub fn list_available(&self) -> Vec<Arc<BackendDescriptor>> {
        let mut available: Vec<(usize, &Arc<BackendDescriptor>)> = self
            .descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.available)
            .collect();
        available.sort_by_key(|(idx, d)| self.rank(*idx, &d.label));
        available.into_iter().map(|(_, d)| Arc::clone(d)).collect()
    }

    /// The single preferred backend.
    pub fn preferred(&self) -> Result<Arc<BackendDescriptor>, RegistryError> {
        self.list_available()
            .into_iter()
            .next()
            .ok_or(RegistryError::NoBackendAvailable)
    }

    /// Resolve an explicit label, or fall back to the preferred backend.
    pub fn resolve_or_preferred(
        &self,
        label: Option<&str>,
    ) -> Result<Arc<BackendDescriptor>, RegistryError> {
        match label {
            Some(label) => self.resolve(label),
            None => self.preferred(),
        }
    }

    /// Every registered backend, available or not, in discovery order.
    pub fn status(&self) -> Vec<BackendStatus> {
        let preferred = self.preferred().ok();
        self.descriptors
            .iter()
            .map(|d| BackendStatus {
                label: d.label.clone(),
                kind: d.kind(),
                available: d.available,
                preferred: preferred.as_ref().map_or(false, |p| p.label == d.label),
                reported_version: d.reported_version.clone(),
                invocation: d.invocation.to_string(),
            })
            .collect()
    }

    fn rank(&self, discovery_idx: usize, label: &str) -> (u8, usize) {
        if label == self.preferred_label {
            return (0, 0);
        }
        match self.fallback_order.iter().position(|l| l == label) {
            Some(pos) => (1, pos),
            None => (2, discovery_idx),
        }
    }
}

async fn check_liveness(
    descriptor: BackendDescriptor,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> BackendDescriptor {
    if let InvocationSpec::Native { ffmpeg, .. } = &descriptor.invocation {
        if !is_bare_name(ffmpeg) && !ffmpeg.exists() {
            debug!(label = %descriptor.label, path = %ffmpeg.display(), "ffmpeg binary not found");
            return descriptor.with_availability(false, None);
        }
    }

    let spec = build_version_command(&descriptor);
    match runner.run(&spec, timeout).await {
        Ok(output) if output.success => match parse_reported_version(&output.stdout_text()) {
            Some(version) => {
                if !version_matches_label(&descriptor.label, &version) {
                    warn!(
                        label = %descriptor.label,
                        reported = %version,
                        "backend reports a different version than its label"
                    );
                }
                debug!(label = %descriptor.label, kind = %descriptor.kind(), "backend available");
                descriptor.with_availability(true, Some(version))
            }
            None => {
                warn!(label = %descriptor.label, "backend version output not recognized");
                descriptor.with_availability(false, None)
            }
        },
        Ok(output) => {
            warn!(
                label = %descriptor.label,
                code = ?output.code,
                "backend version query failed"
            );
            descriptor.with_availability(false, None)
        }
        Err(e) => {
            warn!(label = %descriptor.label, error = %e, "backend not runnable");
            descriptor.with_availability(false, None)
        }
    }
}

/// A path with no directory part is looked up through PATH at spawn time.
fn is_bare_name(path: &Path) -> bool {
    path.components().count() == 1 && path.parent().map_or(true, |p| p.as_os_str().is_empty())
}

/// Locate a configured ffmpeg binary, accepting the `<dir>/bin/ffmpeg`
/// layout left behind by source builds.
pub fn resolve_native_path(path: &Path) -> Option<PathBuf> {
    if is_bare_name(path) || path.exists() {
        return Some(path.to_path_buf());
    }
    let alternative = path.parent()?.join("bin").join("ffmpeg");
    if alternative.exists() {
        Some(alternative)
    } else {
        None
    }
}

fn sibling_ffprobe(ffmpeg: &Path) -> PathBuf {
    let name = match ffmpeg.extension() {
        Some(ext) => format!("ffprobe.{}", ext.to_string_lossy()),
        None => "ffprobe".to_string(),
    };
    match ffmpeg.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

/// Extract the version token from `ffmpeg -version` output.
///
/// Handles both release (`ffmpeg version 5.1.6 ...`) and git-build
/// (`ffmpeg version n8.0-...`) formats.
pub fn parse_reported_version(version_output: &str) -> Option<String> {
    version_output
        .lines()
        .find_map(|line| line.split("ffmpeg version").nth(1))?
        .split_whitespace()
        .next()
        .map(|token| token.to_string())
}

/// Major version number of a version token, tolerating an `n` prefix.
pub fn major_version(version: &str) -> Option<u32> {
    version
        .trim_start_matches('n')
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Numeric labels must agree with the reported major version; named labels
/// (`system`, `homebrew`) match anything.
fn version_matches_label(label: &str, reported: &str) -> bool {
    match (major_version(label), major_version(reported)) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => true,
    }
}
