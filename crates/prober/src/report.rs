//! CSV reports and summaries for batch runs.

use crate::batch::BatchRun;
use crate::record::{BatchResult, ProbeRecord};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Error type for report writing
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Column order of every group report
pub const REPORT_COLUMNS: [&str; 12] = [
    "file_path",
    "status",
    "bitrate",
    "channels",
    "duration",
    "format_name",
    "mime_type",
    "warnings",
    "file_size_bytes",
    "error_message",
    "backend_used",
    "raw_output",
];

pub const SUMMARY_FILE: &str = "batch_summary.json";

/// Report location for one group
pub fn report_path(output_dir: &Path, group_name: &str) -> PathBuf {
    output_dir.join(format!("{}_ffmpeg_probe_report.csv", group_name))
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

fn record_row(record: &ProbeRecord) -> [String; 12] {
    [
        record.file_path.display().to_string(),
        record.status.to_string(),
        opt(&record.bitrate_kbps),
        opt(&record.channels),
        opt(&record.duration_secs),
        opt(&record.format_name),
        opt(&record.mime_type),
        record.warnings.join("; "),
        opt(&record.file_size_bytes),
        opt(&record.error_message),
        record.backend_used.clone(),
        record.raw_output.clone(),
    ]
}

/// Write one group's records as CSV.
pub fn write_group_csv<W: io::Write>(writer: W, result: &BatchResult) -> Result<(), ReportError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(REPORT_COLUMNS)?;
    for record in &result.records {
        wtr.write_record(record_row(record))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Seconds as `HH:MM:SS`
pub fn format_hms(total_secs: f64) -> String {
    let secs = total_secs.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Human-readable summary block for one group.
pub fn format_summary(result: &BatchResult) -> String {
    let rule = "=".repeat(50);
    let mut lines = vec![
        rule.clone(),
        format!("SUMMARY: {}", result.group_name),
        rule.clone(),
        format!("Total files processed: {}", result.total_count),
        format!("Successful: {}", result.success_count),
        format!("Errors: {}", result.error_count),
        format!("File not found: {}", result.not_found_count),
    ];
    if result.total_duration_secs > 0.0 {
        lines.push(format!(
            "Total audio duration: {}",
            format_hms(result.total_duration_secs)
        ));
    }
    if result.average_bitrate_kbps > 0.0 {
        lines.push(format!("Average bitrate: {:.1} kbps", result.average_bitrate_kbps));
    }
    if !result.formats_seen.is_empty() {
        let formats: Vec<&str> = result.formats_seen.iter().map(String::as_str).collect();
        lines.push(format!("Audio formats found: {}", formats.join(", ")));
    }
    lines.push(rule);
    lines.join("\n")
}

/// Group aggregate without its records.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group_name: String,
    pub report_file: PathBuf,
    pub total_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub not_found_count: usize,
    pub total_duration_secs: f64,
    pub average_bitrate_kbps: f64,
    pub formats_seen: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub backend: String,
    pub cancelled: bool,
    pub skipped_files: usize,
    pub groups: Vec<GroupSummary>,
}

/// Write every group report plus the JSON summary into `output_dir`.
/// Returns the CSV paths in group order.
pub fn write_reports(
    output_dir: &Path,
    run: &BatchRun,
    backend: &str,
) -> Result<Vec<PathBuf>, ReportError> {
    fs::create_dir_all(output_dir)?;

    let mut written = Vec::with_capacity(run.groups.len());
    let mut groups = Vec::with_capacity(run.groups.len());
    for result in &run.groups {
        let path = report_path(output_dir, &result.group_name);
        write_group_csv(fs::File::create(&path)?, result)?;
        info!(group = %result.group_name, path = %path.display(), "report written");

        groups.push(GroupSummary {
            group_name: result.group_name.clone(),
            report_file: path.clone(),
            total_count: result.total_count,
            success_count: result.success_count,
            error_count: result.error_count,
            not_found_count: result.not_found_count,
            total_duration_secs: result.total_duration_secs,
            average_bitrate_kbps: result.average_bitrate_kbps,
            formats_seen: result.formats_seen.clone(),
        });
        written.push(path);
    }

    let summary = BatchSummary {
        backend: backend.to_string(),
        cancelled: run.cancelled,
        skipped_files: run.skipped_files,
        groups,
    };
    let json = serde_json::to_string_pretty(&summary)?;
    fs::write(output_dir.join(SUMMARY_FILE), json)?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::ParsedFields;
    use tempfile::TempDir;

    fn sample() -> BatchResult {
        let fields = ParsedFields {
            format_name: Some("mp3".into()),
            duration_secs: Some(3725.5),
            bitrate_kbps: Some(128.0),
            channels: Some(2),
            probe_score: Some(24),
        };
        let ok = ProbeRecord::success(
            PathBuf::from("Audio/album/one.mp3"),
            "5.1.6",
            &fields,
            vec![
                "Format mp3 detected only with low score of 24, misdetection possible!".into(),
                "Header anomaly: [mp3float] Header missing".into(),
            ],
            Some(4096),
            "--- structured ---\n{\"format\": {}}\n".into(),
        )
        .unwrap();
        let bad = ProbeRecord::error(
            PathBuf::from("Audio/album/two, live.mp3"),
            "5.1.6",
            "all probe stages exhausted: decode probe exited with code 1",
            &ParsedFields::default(),
            vec![],
            Some(0),
            "--- decode-probe ---\nInvalid data found\n".into(),
        );
        BatchResult::finalize("album", vec![ok, bad])
    }

    #[test]
    fn test_csv_columns_and_rows() {
        let mut buf = Vec::new();
        write_group_csv(&mut buf, &sample()).unwrap();

        let mut rdr = csv::Reader::from_reader(buf.as_slice());
        let headers: Vec<String> = rdr.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, REPORT_COLUMNS.to_vec());

        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "Audio/album/one.mp3");
        assert_eq!(&rows[0][1], "Success");
        assert_eq!(&rows[0][2], "128");
        assert_eq!(&rows[0][4], "3725.5");
        assert_eq!(&rows[0][6], "audio/mp3");
        assert_eq!(
            &rows[0][7],
            "Format mp3 detected only with low score of 24, misdetection possible!; Header anomaly: [mp3float] Header missing"
        );
        assert_eq!(&rows[0][9], "");
        // commas and newlines survive quoting
        assert_eq!(&rows[1][0], "Audio/album/two, live.mp3");
        assert_eq!(&rows[1][1], "Error");
        assert_eq!(&rows[1][2], "");
        assert_eq!(&rows[1][11], "--- decode-probe ---\nInvalid data found\n");
    }

    #[test]
    fn test_format_summary() {
        let text = format_summary(&sample());
        assert!(text.contains("SUMMARY: album"));
        assert!(text.contains("Total files processed: 2"));
        assert!(text.contains("Successful: 1"));
        assert!(text.contains("Errors: 1"));
        assert!(text.contains("Total audio duration: 01:02:05"));
        assert!(text.contains("Average bitrate: 128.0 kbps"));
        assert!(text.contains("Audio formats found: mp3"));
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(0.0), "00:00:00");
        assert_eq!(format_hms(59.99), "00:00:59");
        assert_eq!(format_hms(86_400.0), "24:00:00");
    }

    #[test]
    fn test_write_reports() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("Batch_Probe_Reports");
        let run = BatchRun {
            groups: vec![sample(), BatchResult::finalize("individual_files", vec![])],
            cancelled: true,
            skipped_files: 3,
        };

        let written = write_reports(&out, &run, "7.1.0").unwrap();

        assert_eq!(
            written,
            vec![
                out.join("album_ffmpeg_probe_report.csv"),
                out.join("individual_files_ffmpeg_probe_report.csv"),
            ]
        );
        assert!(written.iter().all(|p| p.exists()));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(json["backend"], "7.1.0");
        assert_eq!(json["cancelled"], true);
        assert_eq!(json["skipped_files"], 3);
        assert_eq!(json["groups"][0]["success_count"], 1);
        assert_eq!(json["groups"][0]["formats_seen"][0], "mp3");
    }
}
