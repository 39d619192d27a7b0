//! Parsers for backend output.
//!
//! Structured output is ffprobe JSON and goes through serde. Verbose output is
//! free text and goes through a declarative rule table: each rule maps one
//! regex to one field, and the first rule that yields a value wins.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Error type for structured output parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Output was not valid ffprobe JSON.
    #[error("Failed to parse ffprobe output: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON parsed but carries no format section.
    #[error("Missing format information in ffprobe output")]
    MissingFormat,
}

/// Metadata fields recovered by one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFields {
    pub format_name: Option<String>,
    pub duration_secs: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub channels: Option<u32>,
    /// Demuxer confidence out of 100, structured output only
    pub probe_score: Option<u32>,
}

impl ParsedFields {
    /// Both duration and format were recovered
    pub fn has_duration_and_format(&self) -> bool {
        self.duration_secs.is_some() && self.format_name.is_some()
    }

    /// Fill fields still missing here from `other`.
    ///
    /// A probe score only describes the format it was measured for, so it is
    /// taken over only when both sides agree on the format.
    pub fn merge_missing(&mut self, other: &ParsedFields) {
        if self.format_name.is_none() {
            self.format_name = other.format_name.clone();
        }
        if self.duration_secs.is_none() {
            self.duration_secs = other.duration_secs;
        }
        if self.bitrate_kbps.is_none() {
            self.bitrate_kbps = other.bitrate_kbps;
        }
        if self.channels.is_none() {
            self.channels = other.channels;
        }
        if self.probe_score.is_none() && self.format_name == other.format_name {
            self.probe_score = other.probe_score;
        }
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        pub probe_score: Option<u32>,
    }
}

/// Parse structured ffprobe JSON into fields.
pub fn parse_structured(json_str: &str, known_formats: &[String]) -> Result<ParsedFields, ParseError> {
    let ffprobe: ffprobe_json::FfprobeOutput = serde_json::from_str(json_str)?;
    let format = ffprobe.format.ok_or(ParseError::MissingFormat)?;
    let streams = ffprobe.streams.unwrap_or_default();

    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let bitrate_kbps = audio
        .and_then(|s| s.bit_rate.as_deref())
        .and_then(bits_to_kbps)
        .or_else(|| format.bit_rate.as_deref().and_then(bits_to_kbps));

    Ok(ParsedFields {
        format_name: format
            .format_name
            .as_deref()
            .and_then(|name| normalize_format(name, known_formats)),
        duration_secs: format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .map(round_centis),
        bitrate_kbps,
        channels: audio.and_then(|s| s.channels),
        probe_score: format.probe_score,
    })
}

fn bits_to_kbps(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().map(|bps| bps / 1000.0)
}

/// Reduce a comma-separated demuxer list to one name, preferring the first
/// entry that appears in `known_formats`.
pub fn normalize_format(raw: &str, known_formats: &[String]) -> Option<String> {
    let candidates: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    candidates
        .iter()
        .find(|c| known_formats.iter().any(|k| k.eq_ignore_ascii_case(c)))
        .or_else(|| candidates.first())
        .map(|c| c.to_lowercase())
}

/// Parse `HH:MM:SS.ss` into seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if minutes >= 60.0 || seconds >= 60.0 {
        return None;
    }
    Some(round_centis(hours * 3600.0 + minutes * 60.0 + seconds))
}

fn round_centis(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Field a verbose rule populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Format,
    Duration,
    Bitrate,
    Channels,
}

/// One pattern → field mapping. The `value` capture group holds the text.
#[derive(Debug)]
pub struct VerboseRule {
    pub name: &'static str,
    pub field: Field,
    pub pattern: Regex,
    /// Use the last match instead of the first (progress lines)
    pub last_occurrence: bool,
}

impl VerboseRule {
    fn new(name: &'static str, field: Field, pattern: &str, last_occurrence: bool) -> Option<Self> {
        Some(Self {
            name,
            field,
            pattern: Regex::new(pattern).ok()?,
            last_occurrence,
        })
    }

    /// Raw `value` capture from `text`, if this rule matches.
    pub fn capture<'t>(&self, text: &'t str) -> Option<&'t str> {
        let caps = if self.last_occurrence {
            self.pattern.captures_iter(text).last()
        } else {
            self.pattern.captures(text)
        }?;
        caps.name("value").map(|m| m.as_str())
    }
}

/// Verbose-log rules in priority order.
pub static VERBOSE_RULES: Lazy<Vec<VerboseRule>> = Lazy::new(|| {
    [
        VerboseRule::new("input-format", Field::Format, r"(?m)^Input #0, (?P<value>[\w,]+), from", false),
        VerboseRule::new(
            "progress-time",
            Field::Duration,
            r"size=\s*\S+\s+time=(?P<value>\d+:\d{2}:\d{2}\.\d+)",
            true,
        ),
        VerboseRule::new(
            "header-duration",
            Field::Duration,
            r"Duration: (?P<value>\d+:\d{2}:\d{2}\.\d+)",
            false,
        ),
        VerboseRule::new(
            "stream-bitrate",
            Field::Bitrate,
            r"(?m)^\s*Stream #\d+:\d+.*?Audio:.*?(?P<value>\d+(?:\.\d+)?) kb/s",
            false,
        ),
        VerboseRule::new(
            "file-bitrate",
            Field::Bitrate,
            r"bitrate: (?P<value>\d+(?:\.\d+)?) kb/s",
            false,
        ),
        VerboseRule::new(
            "stream-layout",
            Field::Channels,
            r"(?m)^\s*Stream #\d+:\d+.*?Audio:.*?, (?P<value>mono|stereo|2\.1|quad|5\.0|5\.1|6\.1|7\.1)\b",
            false,
        ),
        VerboseRule::new("channel-count", Field::Channels, r"(?P<value>\d+) channels", false),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// Read failures that make a verbose attempt unusable
const FATAL_MARKERS: &[&str] = &["input/output error"];

/// Fields recovered from verbose diagnostic text.
pub fn parse_verbose(text: &str, known_formats: &[String]) -> ParsedFields {
    let mut fields = ParsedFields::default();
    for rule in VERBOSE_RULES.iter() {
        let filled = match rule.field {
            Field::Format => fields.format_name.is_some(),
            Field::Duration => fields.duration_secs.is_some(),
            Field::Bitrate => fields.bitrate_kbps.is_some(),
            Field::Channels => fields.channels.is_some(),
        };
        if filled {
            continue;
        }
        let Some(value) = rule.capture(text) else {
            continue;
        };
        match rule.field {
            Field::Format => fields.format_name = normalize_format(value, known_formats),
            Field::Duration => fields.duration_secs = parse_timestamp(value),
            Field::Bitrate => fields.bitrate_kbps = value.parse::<f64>().ok(),
            Field::Channels => fields.channels = channels_from(value),
        }
    }
    fields
}

/// True when the text reports an unrecoverable read failure.
pub fn has_fatal_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    FATAL_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn channels_from(value: &str) -> Option<u32> {
    match value {
        "mono" => Some(1),
        "stereo" => Some(2),
        "2.1" => Some(3),
        "quad" => Some(4),
        "5.0" => Some(5),
        "5.1" => Some(6),
        "6.1" => Some(7),
        "7.1" => Some(8),
        other => other.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn known() -> Vec<String> {
        ["flac", "mp3", "m4a", "ogg", "wav", "aac", "asf"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    const MP3_LOG: &str = "Input #0, mp3, from 'song.mp3':\n  Metadata:\n    title           : Song\n  Duration: 00:03:00.05, start: 0.025057, bitrate: 128 kb/s\n  Stream #0:0: Audio: mp3, 44100 Hz, stereo, fltp, 128 kb/s\nOutput #0, null, to 'pipe:':\nsize=N/A time=00:01:30.00 bitrate=N/A speed= 900x\rsize=N/A time=00:03:00.02 bitrate=N/A speed= 912x\n";

    #[test]
    fn test_parse_structured() {
        let json = crate::testing::structured_json("mp3", "180.025057", "128000", 2, 51);
        let fields = parse_structured(&json, &known()).unwrap();
        assert_eq!(fields.format_name.as_deref(), Some("mp3"));
        assert_eq!(fields.duration_secs, Some(180.03));
        assert_eq!(fields.bitrate_kbps, Some(128.0));
        assert_eq!(fields.channels, Some(2));
        assert_eq!(fields.probe_score, Some(51));
    }

    #[test]
    fn test_merge_missing_keeps_score_with_its_format() {
        let structured = ParsedFields {
            format_name: Some("mp3".to_string()),
            duration_secs: None,
            bitrate_kbps: Some(128.0),
            channels: None,
            probe_score: Some(24),
        };

        let mut verbose = ParsedFields {
            format_name: Some("wav".to_string()),
            duration_secs: Some(12.0),
            ..Default::default()
        };
        verbose.merge_missing(&structured);
        assert_eq!(verbose.format_name.as_deref(), Some("wav"));
        assert_eq!(verbose.bitrate_kbps, Some(128.0));
        assert_eq!(verbose.probe_score, None);

        let mut same = ParsedFields {
            format_name: Some("mp3".to_string()),
            duration_secs: Some(180.0),
            ..Default::default()
        };
        same.merge_missing(&structured);
        assert_eq!(same.probe_score, Some(24));

        let mut empty = ParsedFields::default();
        empty.merge_missing(&structured);
        assert_eq!(empty.format_name.as_deref(), Some("mp3"));
        assert_eq!(empty.probe_score, Some(24));
    }

    #[test]
    fn test_parse_structured_missing_format() {
        let result = parse_structured(r#"{"streams": []}"#, &known());
        assert!(matches!(result, Err(ParseError::MissingFormat)));
        assert!(matches!(parse_structured("not json", &known()), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_parse_structured_falls_back_to_format_bitrate() {
        let json = r#"{
            "streams": [{"codec_type": "video", "bit_rate": "900000"}, {"codec_type": "audio", "channels": 1}],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "N/A", "bit_rate": "256000"}
        }"#;
        let fields = parse_structured(json, &known()).unwrap();
        assert_eq!(fields.format_name.as_deref(), Some("m4a"));
        assert_eq!(fields.duration_secs, None);
        assert_eq!(fields.bitrate_kbps, Some(256.0));
        assert_eq!(fields.channels, Some(1));
        assert!(!fields.has_duration_and_format());
    }

    #[test]
    fn test_normalize_format() {
        assert_eq!(normalize_format("mov,mp4,m4a,3gp,3g2,mj2", &known()).as_deref(), Some("m4a"));
        assert_eq!(normalize_format("matroska,webm", &known()).as_deref(), Some("matroska"));
        assert_eq!(normalize_format("FLAC", &known()).as_deref(), Some("flac"));
        assert_eq!(normalize_format("", &known()), None);
    }

    #[test]
    fn test_parse_verbose_mp3() {
        let fields = parse_verbose(MP3_LOG, &known());
        assert_eq!(fields.format_name.as_deref(), Some("mp3"));
        // the last progress line wins over the header
        assert_eq!(fields.duration_secs, Some(180.02));
        assert_eq!(fields.bitrate_kbps, Some(128.0));
        assert_eq!(fields.channels, Some(2));
        assert_eq!(fields.probe_score, None);
    }

    #[test]
    fn test_parse_verbose_header_only() {
        let text = "Input #0, flac, from 'a.flac':\n  Duration: 00:00:42.50, start: 0.000000, bitrate: 901 kb/s\n  Stream #0:0: Audio: flac, 96000 Hz, 5.1, s32 (24 bit)\n";
        let fields = parse_verbose(text, &known());
        assert_eq!(fields.format_name.as_deref(), Some("flac"));
        assert_eq!(fields.duration_secs, Some(42.5));
        // no stream bitrate: file bitrate used
        assert_eq!(fields.bitrate_kbps, Some(901.0));
        assert_eq!(fields.channels, Some(6));
    }

    #[test]
    fn test_parse_verbose_channel_count_and_na() {
        let text = "Input #0, wav, from 'a.wav':\n  Duration: N/A, bitrate: N/A\n  Stream #0:0: Audio: pcm_s16le, 48000 Hz, 3 channels, s16\n";
        let fields = parse_verbose(text, &known());
        assert_eq!(fields.duration_secs, None);
        assert_eq!(fields.bitrate_kbps, None);
        assert_eq!(fields.channels, Some(3));
    }

    #[test]
    fn test_fatal_marker() {
        assert!(has_fatal_marker("a.mp3: Input/output error"));
        assert!(!has_fatal_marker(MP3_LOG));
    }

    #[test]
    fn test_merge_missing_keeps_existing() {
        let mut first = ParsedFields {
            format_name: Some("mp3".into()),
            ..Default::default()
        };
        first.merge_missing(&ParsedFields {
            format_name: Some("wav".into()),
            channels: Some(2),
            ..Default::default()
        });
        assert_eq!(first.format_name.as_deref(), Some("mp3"));
        assert_eq!(first.channels, Some(2));
    }

    #[test]
    fn test_all_rules_compile() {
        assert_eq!(VERBOSE_RULES.len(), 7);
    }

    #[test]
    fn test_each_rule_matches_its_sample() {
        let samples = [
            ("input-format", "Input #0, ogg, from 'x.ogg':", "ogg"),
            ("progress-time", "size=N/A time=00:00:05.12 bitrate=N/A", "00:00:05.12"),
            ("header-duration", "  Duration: 01:02:03.04, start: 0", "01:02:03.04"),
            ("stream-bitrate", "  Stream #0:0: Audio: mp3, 44100 Hz, stereo, fltp, 320 kb/s", "320"),
            ("file-bitrate", "  Duration: 00:00:01.00, start: 0, bitrate: 1411 kb/s", "1411"),
            ("stream-layout", "  Stream #0:0(und): Audio: aac (LC), 44100 Hz, 7.1, fltp", "7.1"),
            ("channel-count", "Audio: pcm_s24le, 96000 Hz, 12 channels", "12"),
        ];
        for (name, text, expected) in samples {
            let rule = VERBOSE_RULES.iter().find(|r| r.name == name).unwrap();
            assert_eq!(rule.capture(text), Some(expected), "rule {}", name);
        }
    }

    // **Feature: audio-probe, Property 4: Timestamp Parsing**
    //
    // *For any* HH:MM:SS.ss timestamp, parsing SHALL yield the matching
    // number of seconds rounded to hundredths.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_timestamp_parsing(
            hours in 0u32..100,
            minutes in 0u32..60,
            seconds in 0u32..60,
            centis in 0u32..100,
        ) {
            let text = format!("{:02}:{:02}:{:02}.{:02}", hours, minutes, seconds, centis);
            let expected = (hours * 360_000 + minutes * 6_000 + seconds * 100 + centis) as f64 / 100.0;
            let parsed = parse_timestamp(&text).unwrap();
            prop_assert!((parsed - expected).abs() < 0.005, "{} -> {}", text, parsed);
        }
    }
}
