//! Progress parsing for ffmpeg diagnostic output.
//!
//! ffmpeg announces the input duration once (`Duration: 01:02:03.45`) and
//! then reports its position repeatedly (`time=00:10:00.00`, or
//! `out_time=00:10:00.000000` with `-progress`). The parser turns that text
//! into a percentage without knowing anything else about the tool.

use regex::Regex;
use std::sync::LazyLock;

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration: (\d{2}):(\d{2}):(\d{2}\.\d{2})").unwrap());
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d{2}):(\d{2}):(\d{2}\.\d{2})").unwrap());

/// Converts `HH`, `MM`, `SS.ff` captures to seconds.
pub fn parse_timestamp(hours: &str, minutes: &str, seconds: &str) -> Option<f64> {
    let h: f64 = hours.parse().ok()?;
    let m: f64 = minutes.parse().ok()?;
    let s: f64 = seconds.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

fn capture_seconds(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line)?;
    parse_timestamp(&caps[1], &caps[2], &caps[3])
}

/// Stateful line parser: one line in, optional percentage out.
#[derive(Debug, Default, Clone)]
pub struct ProgressParser {
    total_seconds: Option<f64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total duration, once announced.
    pub fn total_seconds(&self) -> Option<f64> {
        self.total_seconds
    }

    /// Feeds one line of output.
    ///
    /// Returns `min(100, 100 * position / duration)` for position lines seen
    /// after a non-zero duration announcement, `None` otherwise.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        if self.total_seconds.is_none() {
            if let Some(total) = capture_seconds(&DURATION_RE, line) {
                if total > 0.0 {
                    self.total_seconds = Some(total);
                }
                return None;
            }
        }

        let total = self.total_seconds?;
        let position = capture_seconds(&TIME_RE, line)?;
        Some((100.0 * position / total).clamp(0.0, 100.0))
    }
}

/// Splits a chunk of raw output into lines on both `\n` and `\r`.
///
/// Returns the complete lines and leaves the unterminated tail in `pending`.
/// Decoding happens per line, so a multi-byte character split across two
/// chunks survives intact.
pub fn split_lines(pending: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    pending.extend_from_slice(chunk);
    let mut lines = Vec::new();
    while let Some(idx) = pending.iter().position(|&b| matches!(b, b'\n' | b'\r')) {
        let raw: Vec<u8> = pending.drain(..=idx).collect();
        let line = String::from_utf8_lossy(&raw[..idx]);
        if !line.is_empty() {
            lines.push(line.into_owned());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "\
Input #0, matroska,webm, from '/uploads/in.mkv':
  Duration: 00:01:40.00, start: 0.000000, bitrate: 5012 kb/s
  Stream #0:0: Video: h264 (High), yuv420p, 1920x1080
frame=  240 fps= 48 q=28.0 size=    1024kB time=00:00:10.00 bitrate= 838.9kbits/s speed=2.0x
out_time_ms=25000000
out_time=00:00:25.000000
frame= 1200 fps= 48 q=28.0 size=    5120kB time=00:00:50.00 bitrate= 838.9kbits/s speed=2.0x
progress=continue
";

    #[test]
    fn test_parse_captured_output() {
        let mut parser = ProgressParser::new();
        let values: Vec<f64> = SAMPLE.lines().filter_map(|l| parser.feed(l)).collect();

        assert_eq!(parser.total_seconds(), Some(100.0));
        assert_eq!(values, vec![10.0, 25.0, 50.0]);
    }

    #[test]
    fn test_position_before_duration_is_ignored() {
        let mut parser = ProgressParser::new();
        assert_eq!(parser.feed("time=00:00:05.00"), None);
        assert_eq!(parser.feed("Duration: 00:00:10.00, start: 0"), None);
        assert_eq!(parser.feed("time=00:00:05.00"), Some(50.0));
    }

    #[test]
    fn test_only_first_duration_counts() {
        let mut parser = ProgressParser::new();
        parser.feed("Duration: 00:00:10.00");
        parser.feed("Duration: 00:10:00.00");
        assert_eq!(parser.total_seconds(), Some(10.0));
    }

    #[test]
    fn test_zero_duration_is_not_announced() {
        let mut parser = ProgressParser::new();
        parser.feed("Duration: 00:00:00.00");
        assert_eq!(parser.total_seconds(), None);
        assert_eq!(parser.feed("time=00:00:01.00"), None);
    }

    #[test]
    fn test_progress_is_capped() {
        let mut parser = ProgressParser::new();
        parser.feed("Duration: 00:00:10.00");
        assert_eq!(parser.feed("time=00:00:12.50"), Some(100.0));
    }

    #[test]
    fn test_split_lines_on_carriage_returns() {
        let mut pending = Vec::new();
        let lines = split_lines(&mut pending, b"frame=1 time=00:00:01.00\rframe=2 time=00:0");
        assert_eq!(lines, vec!["frame=1 time=00:00:01.00"]);
        assert_eq!(pending, b"frame=2 time=00:0");

        let lines = split_lines(&mut pending, b"0:02.00\r\nprogress=end\n");
        assert_eq!(lines, vec!["frame=2 time=00:00:02.00", "progress=end"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_split_lines_keeps_characters_across_chunks() {
        let line = "Error opening '/uploads/Amélie 東京.mkv'\n".as_bytes();
        // Cut inside the two-byte 'é'
        let cut = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut pending = Vec::new();
        assert!(split_lines(&mut pending, &line[..cut]).is_empty());
        let lines = split_lines(&mut pending, &line[cut..]);
        assert_eq!(lines, vec!["Error opening '/uploads/Amélie 東京.mkv'"]);
        assert!(!lines[0].contains('\u{FFFD}'));
    }

    proptest! {
        #[test]
        fn prop_progress_stays_in_range(
            total in 1u32..36_000,
            position in 0u32..72_000,
        ) {
            let fmt = |secs: u32| format!(
                "{:02}:{:02}:{:02}.00",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60
            );
            let mut parser = ProgressParser::new();
            parser.feed(&format!("  Duration: {}, start: 0.0", fmt(total)));
            let pct = parser.feed(&format!("out_time={}", fmt(position)));

            let pct = pct.expect("position after duration yields progress");
            prop_assert!((0.0..=100.0).contains(&pct));
            if position <= total {
                let expected = 100.0 * position as f64 / total as f64;
                prop_assert!((pct - expected).abs() < 1e-9);
            }
        }
    }
}
