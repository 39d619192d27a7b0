//! Staged probing of a single file.
//!
//! The protocol is a small state machine:
//!
//! ```text
//! Structured ──(not confident)──> Verbose ──(not confident)──> DecodeProbe ──> Exhausted
//!      │                             │
//!   confident                    confident
//!      └──────────> Success <────────┘
//! ```
//!
//! Problems with the file never surface as `Err`; they become `Error`
//! records. Only caller mistakes (empty path, unavailable backend) do.

use crate::command::{
    build_decode_probe_command, build_structured_command, build_verbose_command,
    demuxer_for_extension, demuxer_for_format,
};
use crate::config::ProbeConfig;
use crate::parse::{has_fatal_marker, parse_structured, parse_verbose, ParsedFields};
use crate::record::ProbeRecord;
use crate::registry::BackendDescriptor;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::warnings::RuleTable;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Error type for caller mistakes
#[derive(Debug, Error, PartialEq)]
pub enum ProbeError {
    #[error("probe called with an empty file path")]
    EmptyPath,

    #[error("backend {0} was not verified as runnable")]
    UnresolvedBackend(String),
}

/// One step of the fallback protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Structured,
    Verbose,
    DecodeProbe,
    Exhausted,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::Structured => Stage::Verbose,
            Stage::Verbose => Stage::DecodeProbe,
            Stage::DecodeProbe | Stage::Exhausted => Stage::Exhausted,
        }
    }
}

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub stage_timeout: Duration,
    pub decode_probe_seconds: u32,
    pub known_formats: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&ProbeConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &ProbeConfig) -> Self {
        Self {
            stage_timeout: Duration::from_secs(cfg.stage_timeout_secs),
            decode_probe_seconds: cfg.decode_probe_seconds,
            known_formats: cfg.known_formats.clone(),
        }
    }
}

enum StageOutcome {
    Confident(ParsedFields),
    NotConfident {
        fields: ParsedFields,
        reason: Option<String>,
    },
}

/// Raw output accumulated across the attempts of one probe.
#[derive(Debug, Default)]
struct Transcript {
    text: String,
}

impl Transcript {
    fn section(&mut self, heading: &str, body: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str("--- ");
        self.text.push_str(heading);
        self.text.push_str(" ---\n");
        self.text.push_str(body);
    }
}

/// Probes files through a backend with the staged fallback protocol.
#[derive(Clone)]
pub struct ProbeEngine {
    runner: Arc<dyn CommandRunner>,
    rules: Arc<RuleTable>,
    settings: EngineSettings,
}

impl ProbeEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, rules: RuleTable, settings: EngineSettings) -> Self {
        Self {
            runner,
            rules: Arc::new(rules),
            settings,
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Probe one file with one backend.
    pub async fn probe(
        &self,
        path: &Path,
        backend: &BackendDescriptor,
    ) -> Result<ProbeRecord, ProbeError> {
        if path.as_os_str().is_empty() {
            return Err(ProbeError::EmptyPath);
        }
        if !backend.is_available() {
            return Err(ProbeError::UnresolvedBackend(backend.label().to_string()));
        }

        let file_size = match tokio::fs::metadata(path).await {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "file not found");
                return Ok(ProbeRecord::not_found(path.to_path_buf(), backend.label()));
            }
            Err(_) => None,
        };

        let mut transcript = Transcript::default();
        let mut partial = ParsedFields::default();
        let mut last_failure = String::from("no stage produced a result");
        let mut stage = Stage::Structured;

        loop {
            let outcome = match stage {
                Stage::Structured => self.structured(path, backend, &mut transcript).await,
                Stage::Verbose => self.verbose(path, backend, &partial, &mut transcript).await,
                Stage::DecodeProbe => self.decode_probe(path, backend, &mut transcript).await,
                Stage::Exhausted => break,
            };

            match outcome {
                StageOutcome::Confident(mut fields) => {
                    fields.merge_missing(&partial);
                    let warnings = self.rules.detect(&transcript.text, &fields);
                    debug!(path = %path.display(), ?stage, "confident result");
                    if let Some(record) = ProbeRecord::success(
                        path.to_path_buf(),
                        backend.label(),
                        &fields,
                        warnings,
                        file_size,
                        transcript.text.clone(),
                    ) {
                        return Ok(record);
                    }
                }
                StageOutcome::NotConfident { fields, reason } => {
                    partial.merge_missing(&fields);
                    if let Some(reason) = reason {
                        last_failure = reason;
                    }
                }
            }
            stage = stage.next();
        }

        let warnings = self.rules.detect(&transcript.text, &partial);
        info!(path = %path.display(), reason = %last_failure, "all probe stages exhausted");
        Ok(ProbeRecord::error(
            path.to_path_buf(),
            backend.label(),
            format!("all probe stages exhausted: {}", last_failure),
            &partial,
            warnings,
            file_size,
            transcript.text,
        ))
    }

    /// Probe the same file with several backends, one record per backend.
    pub async fn compare(
        &self,
        path: &Path,
        backends: &[Arc<BackendDescriptor>],
    ) -> Result<Vec<ProbeRecord>, ProbeError> {
        let mut records = Vec::with_capacity(backends.len());
        for backend in backends {
            records.push(self.probe(path, backend).await?);
        }
        Ok(records)
    }

    async fn structured(
        &self,
        path: &Path,
        backend: &BackendDescriptor,
        transcript: &mut Transcript,
    ) -> StageOutcome {
        let spec = build_structured_command(backend, path);
        let output = match self.execute(&spec, "structured", transcript).await {
            Ok(output) => output,
            Err(reason) => return not_confident(ParsedFields::default(), reason),
        };

        let stderr = output.stderr_text();
        let fields = match parse_structured(&output.stdout_text(), &self.settings.known_formats) {
            Ok(fields) => fields,
            Err(e) => {
                return not_confident(
                    ParsedFields::default(),
                    format!("structured probe {}: {}", exit_summary(&output), e),
                )
            }
        };

        if !fields.has_duration_and_format() {
            return not_confident(fields, "structured probe missing duration or format".to_string());
        }
        if self.rules.has_misdetection_signal(&stderr, &fields) {
            return not_confident(fields, "structured probe reported a low format score".to_string());
        }
        StageOutcome::Confident(fields)
    }

    async fn verbose(
        &self,
        path: &Path,
        backend: &BackendDescriptor,
        partial: &ParsedFields,
        transcript: &mut Transcript,
    ) -> StageOutcome {
        let (fields, reason) = self.verbose_attempt(path, backend, None, transcript).await;
        if reason.is_none() {
            return StageOutcome::Confident(fields);
        }

        let hint = fields
            .format_name
            .as_deref()
            .or(partial.format_name.as_deref())
            .and_then(demuxer_for_format)
            .or_else(|| demuxer_for_extension(path));
        let Some(demuxer) = hint else {
            return StageOutcome::NotConfident { fields, reason };
        };

        let (mut forced, forced_reason) =
            self.verbose_attempt(path, backend, Some(demuxer), transcript).await;
        if forced_reason.is_none() {
            return StageOutcome::Confident(forced);
        }
        forced.merge_missing(&fields);
        StageOutcome::NotConfident {
            fields: forced,
            reason: forced_reason,
        }
    }

    /// One verbose invocation; a `None` reason means the attempt is confident.
    async fn verbose_attempt(
        &self,
        path: &Path,
        backend: &BackendDescriptor,
        forced_format: Option<&str>,
        transcript: &mut Transcript,
    ) -> (ParsedFields, Option<String>) {
        let spec = build_verbose_command(backend, path, forced_format);
        let heading = match forced_format {
            Some(format) => format!("verbose (forced {})", format),
            None => "verbose".to_string(),
        };
        let output = match self.execute(&spec, &heading, transcript).await {
            Ok(output) => output,
            Err(reason) => return (ParsedFields::default(), Some(reason)),
        };

        let text = output.stderr_text();
        let fields = parse_verbose(&text, &self.settings.known_formats);
        let reason = if has_fatal_marker(&text) {
            Some(format!("{} probe hit a read error: {}", heading, last_line(&text)))
        } else if !fields.has_duration_and_format() {
            Some(format!(
                "{} probe {} without duration or format",
                heading,
                exit_summary(&output)
            ))
        } else {
            None
        };
        (fields, reason)
    }

    async fn decode_probe(
        &self,
        path: &Path,
        backend: &BackendDescriptor,
        transcript: &mut Transcript,
    ) -> StageOutcome {
        let spec = build_decode_probe_command(backend, path, self.settings.decode_probe_seconds);
        let reason = match self.execute(&spec, "decode-probe", transcript).await {
            Ok(output) if output.success => None,
            Ok(output) => Some(format!(
                "decode probe {}: {}",
                exit_summary(&output),
                last_line(&output.stderr_text())
            )),
            Err(reason) => Some(reason),
        };
        StageOutcome::NotConfident {
            fields: ParsedFields::default(),
            reason,
        }
    }

    /// Run one invocation and append its output to the transcript. Launch
    /// failures and timeouts come back as a failure reason.
    async fn execute(
        &self,
        spec: &CommandSpec,
        heading: &str,
        transcript: &mut Transcript,
    ) -> Result<CommandOutput, String> {
        debug!(stage = heading, command = %spec.display(), "running probe stage");
        match self.runner.run(spec, self.settings.stage_timeout).await {
            Ok(output) => {
                let mut body = output.stdout_text();
                if !body.is_empty() && !body.ends_with('\n') {
                    body.push('\n');
                }
                body.push_str(&output.stderr_text());
                transcript.section(heading, &body);
                Ok(output)
            }
            Err(e) => {
                let reason = format!("{} stage failed: {}", heading, e);
                transcript.section(heading, &reason);
                Err(reason)
            }
        }
    }
}

impl std::fmt::Debug for ProbeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeEngine")
            .field("rules", &self.rules)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn not_confident(fields: ParsedFields, reason: String) -> StageOutcome {
    StageOutcome::NotConfident {
        fields,
        reason: Some(reason),
    }
}

fn exit_summary(output: &CommandOutput) -> String {
    match output.code {
        Some(0) => "exited cleanly".to_string(),
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by signal".to_string(),
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no diagnostic output")
}
