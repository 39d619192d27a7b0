//! Audio Prober
//!
//! Version-aware metadata extraction for audio files. Resolves an ffmpeg
//! backend, runs a staged fallback probe per file, classifies diagnostics into
//! warnings and aggregates results over directory trees into reports.

pub mod batch;
pub mod command;
pub mod concurrency;
pub mod discover;
pub mod engine;
pub mod parse;
pub mod record;
pub mod registry;
pub mod report;
pub mod runner;
pub mod warnings;

#[cfg(test)]
pub(crate) mod testing;

pub use audio_probe_config as config;
pub use audio_probe_config::Config;
pub use batch::{BatchError, BatchOrchestrator, BatchRun, CancelFlag};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use discover::{discover_groups, FileGroup, AUDIO_EXTENSIONS, LOOSE_GROUP};
pub use engine::{EngineSettings, ProbeEngine, ProbeError, Stage};
pub use parse::ParsedFields;
pub use record::{BatchResult, ProbeRecord, ProbeStatus};
pub use registry::{
    BackendDescriptor, BackendKind, BackendRegistry, BackendStatus, InvocationSpec, RegistryError,
};
pub use report::{format_summary, write_reports, ReportError};
pub use runner::{CommandRunner, TokioCommandRunner};
pub use warnings::{RuleError, RuleTable};
