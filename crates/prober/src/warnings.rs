//! Rule-based corruption and quality warnings.
//!
//! Detection is a pure function of the raw diagnostic text and the parsed
//! fields. Rules run in a fixed order (low score, truncation, header
//! anomalies, duration) and a warning already emitted is never repeated.

use crate::config::ProbeConfig;
use crate::parse::ParsedFields;
use regex::Regex;
use thiserror::Error;

/// Error type for building a rule table from configuration
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid warning pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub const DEFAULT_LOW_SCORE_THRESHOLD: u32 = 25;

pub const DEFAULT_TRUNCATION_PATTERNS: &[&str] = &[
    r"(?i)truncat",
    r"(?i)premature end",
    r"(?i)unexpected end of (file|stream)",
];

pub const DEFAULT_HEADER_PATTERNS: &[&str] = &[
    r"(?i)header missing",
    r"(?i)invalid data found",
    r"(?i)invalid (frame )?header",
    r"(?i)corrupt",
    r"(?i)could not find codec parameters",
];

const LOW_SCORE_PATTERN: &str =
    r"Format (?P<name>\S+) detected only with low score of (?P<score>\d+)";

const CONTEXT_ADDRESS_PATTERN: &str = r"\s*@ 0x[0-9a-fA-F]+";

// Input and output echo lines quote the file path, which may contain marker words
const QUOTED_PATH_PATTERN: &str = r"'[^']*'";

// Tag entries print as padded `key : value` in logs and `"key": value` in JSON
const METADATA_LINE_PATTERN: &str = r#"^(\s{4,}[\w .-]+?\s+: |\s*"[^"]+"\s*:)"#;

/// Configurable warning rules.
#[derive(Debug, Clone)]
pub struct RuleTable {
    low_score_threshold: u32,
    truncation: Vec<Regex>,
    header: Vec<Regex>,
    low_score: Regex,
    context_address: Regex,
    metadata_line: Regex,
    quoted_path: Regex,
}

impl RuleTable {
    /// Default markers plus extra patterns appended to each list.
    pub fn new(
        low_score_threshold: u32,
        extra_truncation: &[String],
        extra_header: &[String],
    ) -> Result<Self, RuleError> {
        Ok(Self {
            low_score_threshold,
            truncation: compile(DEFAULT_TRUNCATION_PATTERNS, extra_truncation)?,
            header: compile(DEFAULT_HEADER_PATTERNS, extra_header)?,
            low_score: compile_one(LOW_SCORE_PATTERN)?,
            context_address: compile_one(CONTEXT_ADDRESS_PATTERN)?,
            metadata_line: compile_one(METADATA_LINE_PATTERN)?,
            quoted_path: compile_one(QUOTED_PATH_PATTERN)?,
        })
    }

    /// Built-in markers with the default threshold
    pub fn standard() -> Result<Self, RuleError> {
        Self::new(DEFAULT_LOW_SCORE_THRESHOLD, &[], &[])
    }

    pub fn from_config(cfg: &ProbeConfig) -> Result<Self, RuleError> {
        Self::new(
            cfg.low_score_threshold,
            &cfg.extra_truncation_patterns,
            &cfg.extra_header_patterns,
        )
    }

    pub fn low_score_threshold(&self) -> u32 {
        self.low_score_threshold
    }

    /// Warnings for one file's diagnostics, in rule order, without repeats.
    pub fn detect(&self, raw_output: &str, fields: &ParsedFields) -> Vec<String> {
        let mut warnings = Vec::new();

        for warning in self.low_score_warnings(raw_output, fields) {
            push_unique(&mut warnings, warning);
        }

        for line in raw_output.lines() {
            if self.line_matches(line, &self.truncation) {
                push_unique(&mut warnings, format!("Truncated stream: {}", self.clean_line(line)));
            }
        }

        for line in raw_output.lines() {
            if self.line_matches(line, &self.header) {
                push_unique(&mut warnings, format!("Header anomaly: {}", self.clean_line(line)));
            }
        }

        if matches!(fields.duration_secs, Some(d) if d <= 0.0) {
            push_unique(&mut warnings, "non-positive duration".to_string());
        }

        warnings
    }

    /// True when the demuxer's format guess is below the confidence threshold.
    pub fn has_misdetection_signal(&self, raw_output: &str, fields: &ParsedFields) -> bool {
        !self.low_score_warnings(raw_output, fields).is_empty()
    }

    fn low_score_warnings(&self, raw_output: &str, fields: &ParsedFields) -> Vec<String> {
        let mut found: Vec<(String, u32)> = self
            .low_score
            .captures_iter(raw_output)
            .filter_map(|caps| {
                let score = caps.name("score")?.as_str().parse().ok()?;
                Some((caps.name("name")?.as_str().to_string(), score))
            })
            .collect();
        if let (Some(name), Some(score)) = (&fields.format_name, fields.probe_score) {
            found.push((name.clone(), score));
        }

        found
            .into_iter()
            .filter(|(_, score)| *score < self.low_score_threshold)
            .map(|(name, score)| {
                format!(
                    "Format {} detected only with low score of {}, misdetection possible!",
                    name, score
                )
            })
            .collect()
    }

    /// Marker match on a diagnostic line, ignoring tag lines and quoted paths.
    fn line_matches(&self, line: &str, markers: &[Regex]) -> bool {
        if self.metadata_line.is_match(line) {
            return false;
        }
        let unquoted = self.quoted_path.replace_all(line, "''");
        markers.iter().any(|re| re.is_match(&unquoted))
    }

    /// Trim a diagnostic line and drop `@ 0x...` context addresses.
    fn clean_line(&self, line: &str) -> String {
        self.context_address.replace_all(line.trim(), "").into_owned()
    }
}

fn compile_one(pattern: &str) -> Result<Regex, RuleError> {
    Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile(defaults: &[&str], extra: &[String]) -> Result<Vec<Regex>, RuleError> {
    defaults
        .iter()
        .copied()
        .chain(extra.iter().map(String::as_str))
        .map(compile_one)
        .collect()
}

fn push_unique(warnings: &mut Vec<String>, warning: String) {
    if !warnings.contains(&warning) {
        warnings.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fields(format: &str, duration: f64, score: Option<u32>) -> ParsedFields {
        ParsedFields {
            format_name: Some(format.to_string()),
            duration_secs: Some(duration),
            bitrate_kbps: Some(128.0),
            channels: Some(2),
            probe_score: score,
        }
    }

    #[test]
    fn test_clean_output_has_no_warnings() {
        let rules = RuleTable::standard().unwrap();
        let raw = "Input #0, mp3, from 'a.mp3':\n  Duration: 00:03:00.00, bitrate: 128 kb/s\n";
        assert!(rules.detect(raw, &fields("mp3", 180.0, Some(51))).is_empty());
    }

    #[test]
    fn test_low_score_from_structured_field() {
        let rules = RuleTable::standard().unwrap();
        let warnings = rules.detect("", &fields("mp3", 180.0, Some(24)));
        assert_eq!(
            warnings,
            vec!["Format mp3 detected only with low score of 24, misdetection possible!"]
        );
        assert!(rules.has_misdetection_signal("", &fields("mp3", 180.0, Some(24))));
        // exactly at the threshold is not low
        assert!(rules.detect("", &fields("mp3", 180.0, Some(25))).is_empty());
    }

    #[test]
    fn test_low_score_text_and_field_collapse() {
        let rules = RuleTable::standard().unwrap();
        let raw = "[mp3 @ 0x55d5c8a0b2c0] Format mp3 detected only with low score of 24, misdetection possible!\n";
        let warnings = rules.detect(raw, &fields("mp3", 180.0, Some(24)));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_truncation_and_header_order() {
        let rules = RuleTable::standard().unwrap();
        let raw = "[mp3float @ 0x7f00aa] Header missing\n\
                   [mp3float @ 0x7f00bb] Header missing\n\
                   [mp3 @ 0x7f00cc] Packet truncated at end of file\n\
                   a.mp3: Invalid data found when processing input\n";
        let warnings = rules.detect(raw, &fields("mp3", 0.0, None));
        assert_eq!(
            warnings,
            vec![
                "Truncated stream: [mp3] Packet truncated at end of file",
                "Header anomaly: [mp3float] Header missing",
                "Header anomaly: a.mp3: Invalid data found when processing input",
                "non-positive duration",
            ]
        );
    }

    #[test]
    fn test_metadata_lines_ignored() {
        let rules = RuleTable::standard().unwrap();
        let raw = "  Metadata:\n    title           : Corrupted Love\n        \"album\": \"Truncated Tales\",\n";
        assert!(rules.detect(raw, &fields("mp3", 10.0, None)).is_empty());
    }

    #[test]
    fn test_marker_words_in_file_path_ignored() {
        let rules = RuleTable::standard().unwrap();
        let raw = "Input #0, mp3, from '/music/Corrupt_Uploads/truncated_header missing.mp3':\n  Duration: 00:03:00.00, bitrate: 128 kb/s\nOutput #0, null, to '/tmp/corrupt.null':\n";
        assert!(rules.detect(raw, &fields("mp3", 180.0, Some(51))).is_empty());

        // real diagnostics on the same file still count
        let raw = format!("{}[mp3 @ 0x1] Packet truncated\n", raw);
        assert_eq!(
            rules.detect(&raw, &fields("mp3", 180.0, Some(51))),
            vec!["Truncated stream: [mp3] Packet truncated"]
        );
    }

    #[test]
    fn test_extra_patterns_and_invalid_pattern() {
        let rules = RuleTable::new(25, &[r"(?i)stream ends early".into()], &[]).unwrap();
        let warnings = rules.detect("Stream ends early\n", &fields("ogg", 3.0, None));
        assert_eq!(warnings, vec!["Truncated stream: Stream ends early"]);

        let err = RuleTable::new(25, &[], &["(unclosed".into()]).unwrap_err();
        assert!(matches!(err, RuleError::InvalidPattern { .. }));
    }

    #[test]
    fn test_custom_threshold() {
        let rules = RuleTable::new(50, &[], &[]).unwrap();
        assert_eq!(rules.low_score_threshold(), 50);
        assert_eq!(rules.detect("", &fields("wav", 1.0, Some(49))).len(), 1);
    }

    fn diagnostic_line() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("[mp3 @ 0x1234abcd] Header missing".to_string()),
            Just("Packet truncated".to_string()),
            Just("premature end of stream".to_string()),
            Just("Invalid data found when processing input".to_string()),
            Just("Format mp3 detected only with low score of 5, misdetection possible!".to_string()),
            "[a-z ]{0,40}",
        ]
    }

    // **Feature: audio-probe, Property 5: Warning Detection Is Deterministic**
    //
    // *For any* diagnostic text, detection SHALL return the same warnings on
    // every call, with no warning repeated.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_detect_deterministic_and_unique(
            lines in prop::collection::vec(diagnostic_line(), 0..20),
            duration in -10.0f64..1000.0,
            score in proptest::option::of(0u32..100),
        ) {
            let rules = RuleTable::standard().unwrap();
            let raw = lines.join("\n");
            let parsed = fields("mp3", duration, score);

            let first = rules.detect(&raw, &parsed);
            let second = rules.detect(&raw, &parsed);
            prop_assert_eq!(&first, &second);

            let mut deduped = first.clone();
            deduped.sort();
            deduped.dedup();
            prop_assert_eq!(deduped.len(), first.len());
        }
    }
}
