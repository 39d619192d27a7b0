//! Probe records and per-group aggregates.

use crate::parse::ParsedFields;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Outcome of probing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeStatus {
    Success,
    Error,
    NotFound,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Success => "Success",
            ProbeStatus::Error => "Error",
            ProbeStatus::NotFound => "File Not Found",
        }
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file's extracted metadata.
///
/// Successful records always carry a duration and a format name; every
/// other status carries an error message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeRecord {
    pub file_path: PathBuf,
    pub status: ProbeStatus,
    pub bitrate_kbps: Option<f64>,
    pub channels: Option<u32>,
    pub duration_secs: Option<f64>,
    pub format_name: Option<String>,
    pub mime_type: Option<String>,
    pub warnings: Vec<String>,
    pub file_size_bytes: Option<u64>,
    pub error_message: Option<String>,
    pub backend_used: String,
    pub raw_output: String,
}

impl ProbeRecord {
    /// Successful record from a confident stage. Returns `None` when the
    /// fields lack a duration or format.
    pub fn success(
        file_path: PathBuf,
        backend_used: &str,
        fields: &ParsedFields,
        warnings: Vec<String>,
        file_size_bytes: Option<u64>,
        raw_output: String,
    ) -> Option<Self> {
        let format_name = fields.format_name.clone()?;
        let duration_secs = fields.duration_secs?;
        Some(Self {
            file_path,
            status: ProbeStatus::Success,
            bitrate_kbps: fields.bitrate_kbps,
            channels: fields.channels,
            duration_secs: Some(duration_secs),
            mime_type: Some(format!("audio/{}", format_name)),
            format_name: Some(format_name),
            warnings,
            file_size_bytes,
            error_message: None,
            backend_used: backend_used.to_string(),
            raw_output,
        })
    }

    /// Failed record; keeps whatever partial fields were recovered.
    pub fn error(
        file_path: PathBuf,
        backend_used: &str,
        message: impl Into<String>,
        fields: &ParsedFields,
        warnings: Vec<String>,
        file_size_bytes: Option<u64>,
        raw_output: String,
    ) -> Self {
        Self {
            file_path,
            status: ProbeStatus::Error,
            bitrate_kbps: fields.bitrate_kbps,
            channels: fields.channels,
            duration_secs: fields.duration_secs,
            mime_type: fields.format_name.as_ref().map(|f| format!("audio/{}", f)),
            format_name: fields.format_name.clone(),
            warnings,
            file_size_bytes,
            error_message: Some(message.into()),
            backend_used: backend_used.to_string(),
            raw_output,
        }
    }

    pub fn not_found(file_path: PathBuf, backend_used: &str) -> Self {
        let message = format!("file not found: {}", file_path.display());
        Self {
            file_path,
            status: ProbeStatus::NotFound,
            bitrate_kbps: None,
            channels: None,
            duration_secs: None,
            format_name: None,
            mime_type: None,
            warnings: Vec::new(),
            file_size_bytes: None,
            error_message: Some(message),
            backend_used: backend_used.to_string(),
            raw_output: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}

/// Aggregate over one group of files, derived entirely from its records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub group_name: String,
    pub records: Vec<ProbeRecord>,
    pub total_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub not_found_count: usize,
    pub total_duration_secs: f64,
    /// Mean over successful records that report a bitrate
    pub average_bitrate_kbps: f64,
    pub formats_seen: BTreeSet<String>,
}

impl BatchResult {
    pub fn finalize(group_name: impl Into<String>, records: Vec<ProbeRecord>) -> Self {
        let count = |status| records.iter().filter(|r| r.status == status).count();
        let success_count = count(ProbeStatus::Success);
        let error_count = count(ProbeStatus::Error);
        let not_found_count = count(ProbeStatus::NotFound);

        let successes = || records.iter().filter(|r| r.is_success());
        let total_duration_secs = successes().filter_map(|r| r.duration_secs).sum();
        let bitrates: Vec<f64> = successes().filter_map(|r| r.bitrate_kbps).collect();
        let average_bitrate_kbps = if bitrates.is_empty() {
            0.0
        } else {
            bitrates.iter().sum::<f64>() / bitrates.len() as f64
        };
        let formats_seen = successes().filter_map(|r| r.format_name.clone()).collect();

        Self {
            group_name: group_name.into(),
            total_count: records.len(),
            success_count,
            error_count,
            not_found_count,
            total_duration_secs,
            average_bitrate_kbps,
            formats_seen,
            records,
        }
    }
}
