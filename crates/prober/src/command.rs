//! Command-line construction for the four backend invocation shapes.
//!
//! Native backends run `ffmpeg`/`ffprobe` directly. Containerized backends run
//! through the container runtime with the file's directory mounted read-only
//! at [`CONTAINER_MOUNT`], and the container-side path substituted for the
//! host path. Every container run gets a unique `--name` so a timed-out run
//! can be killed by name.

use crate::registry::{BackendDescriptor, InvocationSpec};
use crate::runner::{CommandSpec, InvocationKind};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Mount point for the input directory inside containers
pub const CONTAINER_MOUNT: &str = "/audio";

/// Which executable inside a backend a command needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Ffmpeg,
    Ffprobe,
}

/// `-version` liveness query.
pub fn build_version_command(backend: &BackendDescriptor) -> CommandSpec {
    assemble(backend, InvocationKind::Version, Tool::Ffmpeg, None, |_| {
        vec![OsString::from("-version")]
    })
}

/// Structured format/stream enumeration as JSON.
pub fn build_structured_command(backend: &BackendDescriptor, file: &Path) -> CommandSpec {
    assemble(
        backend,
        InvocationKind::Structured,
        Tool::Ffprobe,
        Some(file),
        |input| {
            let mut args: Vec<OsString> = [
                "-v",
                "warning",
                "-hide_banner",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ]
            .iter()
            .map(OsString::from)
            .collect();
            args.push(input.into_os_string());
            args
        },
    )
}

/// Verbose stream-copy pass that surfaces header, duration and bitrate lines
/// in the diagnostic log. `forced_format` pins the demuxer.
pub fn build_verbose_command(
    backend: &BackendDescriptor,
    file: &Path,
    forced_format: Option<&str>,
) -> CommandSpec {
    assemble(
        backend,
        InvocationKind::Verbose,
        Tool::Ffmpeg,
        Some(file),
        |input| {
            let mut args: Vec<OsString> = ["-hide_banner", "-xerror", "-loglevel", "info", "-vn"]
                .iter()
                .map(OsString::from)
                .collect();
            if let Some(format) = forced_format {
                args.push("-f".into());
                args.push(format.into());
            }
            args.push("-i".into());
            args.push(input.into_os_string());
            args.extend(["-codec", "copy", "-f", "null", "-"].iter().map(OsString::from));
            args
        },
    )
}

/// Partial decode of the first `seconds` of audio to a null sink.
pub fn build_decode_probe_command(
    backend: &BackendDescriptor,
    file: &Path,
    seconds: u32,
) -> CommandSpec {
    assemble(
        backend,
        InvocationKind::DecodeProbe,
        Tool::Ffmpeg,
        Some(file),
        |input| {
            let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "warning", "-vn", "-i"]
                .iter()
                .map(OsString::from)
                .collect();
            args.push(input.into_os_string());
            args.push("-t".into());
            args.push(seconds.to_string().into());
            args.extend(["-f", "null", "-"].iter().map(OsString::from));
            args
        },
    )
}

fn assemble(
    backend: &BackendDescriptor,
    kind: InvocationKind,
    tool: Tool,
    file: Option<&Path>,
    tool_args: impl FnOnce(PathBuf) -> Vec<OsString>,
) -> CommandSpec {
    let target = file.map(Path::to_path_buf);
    match backend.invocation() {
        InvocationSpec::Native { ffmpeg, ffprobe } => {
            let program = match tool {
                Tool::Ffmpeg => ffmpeg.as_os_str().to_owned(),
                Tool::Ffprobe => ffprobe.as_os_str().to_owned(),
            };
            let args = tool_args(file.map(Path::to_path_buf).unwrap_or_default());
            CommandSpec {
                kind,
                target,
                program,
                args,
                container_name: None,
            }
        }
        InvocationSpec::Containerized { runtime, image } => {
            let name = format!("audio-probe-{}", Uuid::new_v4());
            let mut args: Vec<OsString> =
                vec!["run".into(), "--rm".into(), "--name".into(), name.as_str().into()];
            let mut input = PathBuf::new();
            if let Some(file) = file {
                let mut mount = host_directory(file).into_os_string();
                mount.push(format!(":{}:ro", CONTAINER_MOUNT));
                args.push("-v".into());
                args.push(mount);
                input = container_path(file);
            }
            if tool == Tool::Ffprobe {
                args.push("--entrypoint".into());
                args.push("ffprobe".into());
            }
            args.push(image.into());
            args.extend(tool_args(input));
            CommandSpec {
                kind,
                target,
                program: runtime.into(),
                args,
                container_name: Some(name),
            }
        }
    }
}

/// Absolute directory holding `file`; bind mounts reject relative paths.
fn host_directory(file: &Path) -> PathBuf {
    let dir = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if dir.is_absolute() {
        return dir;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(dir),
        Err(_) => dir,
    }
}

/// Where `file` appears inside the container.
pub fn container_path(file: &Path) -> PathBuf {
    let mut path = PathBuf::from(CONTAINER_MOUNT);
    if let Some(name) = file.file_name() {
        path.push(name);
    }
    path
}

/// Demuxer name for the forced-format verbose retry, keyed by extension.
pub fn demuxer_for_extension(file: &Path) -> Option<&'static str> {
    demuxer_for_format(file.extension()?.to_str()?)
}

/// Demuxer that reads a format or extension name.
pub fn demuxer_for_format(name: &str) -> Option<&'static str> {
    match name.to_lowercase().as_str() {
        "mp3" => Some("mp3"),
        "flac" => Some("flac"),
        "ogg" => Some("ogg"),
        "wav" => Some("wav"),
        "m4a" | "mp4" | "mov" => Some("mov"),
        "aac" => Some("aac"),
        "wma" | "asf" => Some("asf"),
        _ => None,
    }
}
