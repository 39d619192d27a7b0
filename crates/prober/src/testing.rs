//! Scripted spy runner shared by unit tests.

use crate::runner::{CommandOutput, CommandRunner, CommandSpec, InvocationKind, RunError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Canned outcome of one invocation.
#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Output(CommandOutput),
    Timeout,
    SpawnFailure,
    Panic,
}

impl Scripted {
    pub(crate) fn ok(stdout: &str, stderr: &str) -> Self {
        Scripted::Output(CommandOutput {
            success: true,
            code: Some(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        })
    }

    pub(crate) fn failed(stderr: &str) -> Self {
        Scripted::Output(CommandOutput {
            success: false,
            code: Some(1),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        })
    }
}

#[derive(Debug)]
enum Matcher {
    /// File name of the command's target
    File(String),
    /// Container image named in the arguments
    Image(String),
    /// File name of the executable
    Program(String),
}

impl Matcher {
    fn matches(&self, spec: &CommandSpec) -> bool {
        match self {
            Matcher::File(name) => spec
                .target
                .as_deref()
                .and_then(Path::file_name)
                .map_or(false, |n| n.to_string_lossy() == name.as_str()),
            Matcher::Image(image) => spec.args.iter().any(|a| a.to_string_lossy() == image.as_str()),
            Matcher::Program(name) => Path::new(&spec.program)
                .file_name()
                .map_or(false, |n| n.to_string_lossy() == name.as_str()),
        }
    }

    fn same_as(&self, other: &Matcher) -> bool {
        match (self, other) {
            (Matcher::File(a), Matcher::File(b)) => a == b,
            (Matcher::Image(a), Matcher::Image(b)) => a == b,
            (Matcher::Program(a), Matcher::Program(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Rule {
    matcher: Matcher,
    kind: InvocationKind,
    /// Consecutive responses; the last one repeats
    responses: Vec<Scripted>,
    hits: AtomicUsize,
}

/// Spy runner: answers from a script and records every call.
///
/// Rules are checked in registration order. Registering the same matcher and
/// kind again queues another response for the next call.
#[derive(Debug)]
pub(crate) struct ScriptedRunner {
    default: Scripted,
    rules: Vec<Rule>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub(crate) fn new(default: Scripted) -> Self {
        Self {
            default,
            rules: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn on_file(self, name: &str, kind: InvocationKind, response: Scripted) -> Self {
        self.add(Matcher::File(name.to_string()), kind, response)
    }

    pub(crate) fn on_image(self, image: &str, kind: InvocationKind, response: Scripted) -> Self {
        self.add(Matcher::Image(image.to_string()), kind, response)
    }

    pub(crate) fn on_program(self, name: &str, kind: InvocationKind, response: Scripted) -> Self {
        self.add(Matcher::Program(name.to_string()), kind, response)
    }

    fn add(mut self, matcher: Matcher, kind: InvocationKind, response: Scripted) -> Self {
        match self
            .rules
            .iter_mut()
            .find(|r| r.kind == kind && r.matcher.same_as(&matcher))
        {
            Some(rule) => rule.responses.push(response),
            None => self.rules.push(Rule {
                matcher,
                kind,
                responses: vec![response],
                hits: AtomicUsize::new(0),
            }),
        }
        self
    }

    /// Every call received so far, in arrival order
    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Stage kinds invoked against one file
    pub(crate) fn kinds_for(&self, file_name: &str) -> Vec<InvocationKind> {
        self.calls()
            .iter()
            .filter(|c| Matcher::File(file_name.to_string()).matches(c))
            .map(|c| c.kind)
            .collect()
    }

    fn respond(&self, spec: &CommandSpec) -> Scripted {
        for rule in &self.rules {
            if rule.kind == spec.kind && rule.matcher.matches(spec) {
                let hit = rule.hits.fetch_add(1, Ordering::SeqCst);
                let idx = hit.min(rule.responses.len() - 1);
                return rule.responses[idx].clone();
            }
        }
        self.default.clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, RunError> {
        self.calls.lock().unwrap().push(spec.clone());
        match self.respond(spec) {
            Scripted::Output(output) => Ok(output),
            Scripted::Timeout => Err(RunError::Timeout(timeout)),
            Scripted::SpawnFailure => Err(RunError::Spawn {
                program: spec.program.to_string_lossy().into_owned(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }),
            Scripted::Panic => panic!("scripted backend crash"),
        }
    }
}

/// ffprobe JSON for a healthy file
pub(crate) fn structured_json(
    format_name: &str,
    duration: &str,
    bit_rate: &str,
    channels: u32,
    probe_score: u32,
) -> String {
    format!(
        r#"{{
    "streams": [
        {{
            "index": 0,
            "codec_name": "{codec}",
            "codec_type": "audio",
            "sample_rate": "44100",
            "channels": {channels},
            "channel_layout": "stereo",
            "bit_rate": "{bit_rate}"
        }}
    ],
    "format": {{
        "filename": "track",
        "nb_streams": 1,
        "format_name": "{format_name}",
        "duration": "{duration}",
        "size": "2880000",
        "bit_rate": "{bit_rate}",
        "probe_score": {probe_score}
    }}
}}"#,
        codec = format_name,
        channels = channels,
        bit_rate = bit_rate,
        format_name = format_name,
        duration = duration,
        probe_score = probe_score,
    )
}
