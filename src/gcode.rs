//! G-code program analysis.
//!
//! Parses a program into motion segments with the accounting a preview
//! plotter needs: move counts, travel and cutting distance, bounds, feed
//! rates and units. The plotter itself lives outside this crate; renderers
//! wrap [`analyze_program`] and attach [`GcodeAnalysis::to_json`] to their
//! output so the summary ends up in the cached preview's descriptor.

use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::cache::{RenderError, RenderParams};

/// Prefix marking a tag as a render hint, e.g. `gcodehint:background=black`.
const HINT_TAG_PREFIX: &str = "gcodehint:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Millimeters,
    Inches,
}

impl Units {
    pub fn as_str(self) -> &'static str {
        match self {
            Units::Millimeters => "mm",
            Units::Inches => "inch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionMode {
    Rapid,
    Cut,
}

impl MotionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MotionMode::Rapid => "rapid",
            MotionMode::Cut => "cut",
        }
    }
}

/// One straight motion extracted from the program. Arc moves (G2/G3) are
/// flattened to their chord.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcodeSegment {
    pub start: [f64; 3],
    pub end: [f64; 3],
    pub mode: MotionMode,
    pub feed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GcodeAnalysis {
    pub segments: Vec<GcodeSegment>,
    pub command_count: usize,
    pub rapid_moves: usize,
    pub cutting_moves: usize,
    pub travel_distance: f64,
    pub cutting_distance: f64,
    /// `[min_x, min_y, max_x, max_y]`.
    pub bounds_xy: [f64; 4],
    /// `[min_z, max_z]`.
    pub bounds_z: [f64; 2],
    /// Distinct finite feed rates, ascending.
    pub feed_rates: Vec<f64>,
    pub units: Units,
}

impl GcodeAnalysis {
    pub fn total_moves(&self) -> usize {
        self.rapid_moves + self.cutting_moves
    }

    /// Summary in the form stored under a preview descriptor's `analysis`
    /// field.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "command_count": self.command_count,
            "rapid_moves": self.rapid_moves,
            "cutting_moves": self.cutting_moves,
            "travel_distance": self.travel_distance,
            "cutting_distance": self.cutting_distance,
            "bounds_xy": self.bounds_xy,
            "bounds_z": self.bounds_z,
            "feed_rates": self.feed_rates,
            "units": self.units.as_str(),
        })
    }
}

/// Parse the program at `path`.
///
/// Supports absolute and relative positioning (G90/G91), unit switches
/// (G20/G21) and linear or arc motion words (G0 through G3). A program with
/// no effective motion is reported as [`RenderError::Unsupported`].
pub fn analyze_program(path: &Path) -> Result<GcodeAnalysis, RenderError> {
    let raw = fs::read(path).map_err(|e| RenderError::unreadable(path, e))?;
    let text = String::from_utf8_lossy(&raw);

    let mut segments: Vec<GcodeSegment> = Vec::new();
    let mut command_count = 0usize;
    let mut rapid_moves = 0usize;
    let mut cutting_moves = 0usize;
    let mut travel_distance = 0.0f64;
    let mut cutting_distance = 0.0f64;
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    let mut feed_rates: Vec<f64> = Vec::new();
    let mut units = Units::Millimeters;
    let mut absolute_mode = true;
    let mut current = [0.0f64; 3];
    let mut last_feed: Option<f64> = None;

    for raw_line in text.lines() {
        let stripped = strip_line(raw_line);
        if stripped.is_empty() {
            continue;
        }

        let words = parse_words(&stripped);
        if words.is_empty() {
            continue;
        }

        let command = words.get(&'G').map(|value| *value as i64);
        match command {
            Some(20) => {
                units = Units::Inches;
                continue;
            }
            Some(21) => {
                units = Units::Millimeters;
                continue;
            }
            Some(90) => {
                absolute_mode = true;
                continue;
            }
            Some(91) => {
                absolute_mode = false;
                continue;
            }
            _ => {}
        }

        if let Some(feed) = words.get(&'F') {
            last_feed = Some(*feed);
            if feed.is_finite() {
                feed_rates.push(*feed);
            }
        }

        if !matches!(command, Some(0..=3)) {
            continue;
        }

        let mut target = current;
        for (index, axis) in ['X', 'Y', 'Z'].into_iter().enumerate() {
            let Some(value) = words.get(&axis) else {
                continue;
            };
            if !value.is_finite() {
                continue;
            }
            if absolute_mode {
                target[index] = *value;
            } else {
                target[index] += *value;
            }
        }

        if target == current {
            continue;
        }

        let distance = distance(current, target);
        let mode = if distance.is_finite() {
            if command == Some(0) {
                travel_distance += distance;
                rapid_moves += 1;
                MotionMode::Rapid
            } else {
                cutting_distance += distance;
                cutting_moves += 1;
                MotionMode::Cut
            }
        } else {
            MotionMode::Cut
        };

        segments.push(GcodeSegment {
            start: current,
            end: target,
            mode,
            feed: last_feed,
        });
        command_count += 1;

        for axis in 0..3 {
            min[axis] = min[axis].min(current[axis]).min(target[axis]);
            max[axis] = max[axis].max(current[axis]).max(target[axis]);
        }
        current = target;
    }

    if segments.is_empty() {
        return Err(RenderError::Unsupported(
            "no motion commands detected in the program".to_string(),
        ));
    }

    let finite = |value: f64| if value.is_finite() { value } else { 0.0 };
    feed_rates.sort_by(f64::total_cmp);
    feed_rates.dedup();

    Ok(GcodeAnalysis {
        segments,
        command_count,
        rapid_moves,
        cutting_moves,
        travel_distance,
        cutting_distance,
        bounds_xy: [finite(min[0]), finite(min[1]), finite(max[0]), finite(max[1])],
        bounds_z: [finite(min[2]), finite(max[2])],
        feed_rates,
        units,
    })
}

/// Pull render hints out of an asset's tags.
///
/// A hint tag reads `gcodehint:key=value` (or `key:value`; a bare key means
/// `"true"`). Keys are lowercased with spaces collapsed to underscores.
pub fn extract_render_hints<I>(tags: I) -> RenderParams
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut hints = RenderParams::new();
    for tag in tags {
        let raw = tag.as_ref().trim();
        if raw.is_empty() || !raw.to_lowercase().starts_with(HINT_TAG_PREFIX) {
            continue;
        }
        let Some((_, body)) = raw.split_once(':') else {
            continue;
        };
        let (key, value) = if let Some(pair) = body.split_once('=') {
            pair
        } else if let Some(pair) = body.split_once(':') {
            pair
        } else {
            (body, "true")
        };
        let key = key.trim().to_lowercase().replace(' ', "_");
        if key.is_empty() {
            continue;
        }
        hints.insert(key, value.trim().to_string());
    }
    hints
}

/// Drop `(...)` block comments and anything after `;`.
fn strip_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_comment = false;
    for c in line.chars() {
        match c {
            '(' => in_comment = true,
            ')' if in_comment => in_comment = false,
            ';' if !in_comment => break,
            _ if in_comment => {}
            _ => out.push(c),
        }
    }
    out.trim().to_string()
}

/// Tokenize letter/value words; on a repeated letter the last value wins.
fn parse_words(line: &str) -> std::collections::BTreeMap<char, f64> {
    let mut words = std::collections::BTreeMap::new();
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_alphabetic() {
            i += 1;
            continue;
        }
        let letter = chars[i].to_ascii_uppercase();
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        let digits_start = j;
        while j < chars.len() && chars[j].is_ascii_digit() {
            j += 1;
        }
        if j == digits_start {
            i += 1;
            continue;
        }
        if j < chars.len() && chars[j] == '.' {
            let mut k = j + 1;
            while k < chars.len() && chars[k].is_ascii_digit() {
                k += 1;
            }
            if k > j + 1 {
                j = k;
            }
        }
        let text: String = chars[i + 1..j].iter().collect();
        if let Ok(value) = text.parse::<f64>() {
            words.insert(letter, value);
        }
        i = j;
    }
    words
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let dz = b[2] - a[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn program(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("job.gcode");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn accounting_covers_moves_distances_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(
            dir.path(),
            "G21\nG90\nG0 X10 Y0\nG1 X10 Y10 F300\nG1 X0 Y10 F150\nF300\n",
        );

        let analysis = analyze_program(&path).unwrap();
        assert_eq!(analysis.units, Units::Millimeters);
        assert_eq!(analysis.command_count, 3);
        assert_eq!(analysis.rapid_moves, 1);
        assert_eq!(analysis.cutting_moves, 2);
        assert_eq!(analysis.total_moves(), 3);
        assert!((analysis.travel_distance - 10.0).abs() < 1e-9);
        assert!((analysis.cutting_distance - 20.0).abs() < 1e-9);
        assert_eq!(analysis.bounds_xy, [0.0, 0.0, 10.0, 10.0]);
        assert_eq!(analysis.bounds_z, [0.0, 0.0]);
        // Duplicate F300 collapses; rates come back ascending.
        assert_eq!(analysis.feed_rates, vec![150.0, 300.0]);
        assert_eq!(analysis.segments[0].mode, MotionMode::Rapid);
        assert_eq!(analysis.segments[1].feed, Some(300.0));
    }

    #[test]
    fn comments_and_unit_switches_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(
            dir.path(),
            "(setup block)\nG20\nG0 X1 ; rapid over\n(done)\n",
        );

        let analysis = analyze_program(&path).unwrap();
        assert_eq!(analysis.units, Units::Inches);
        assert_eq!(analysis.segments.len(), 1);
        assert_eq!(analysis.segments[0].end, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn relative_mode_accumulates_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(dir.path(), "G91\nG1 X5\nG1 X5 Z-1\n");

        let analysis = analyze_program(&path).unwrap();
        assert_eq!(analysis.segments[1].start, [5.0, 0.0, 0.0]);
        assert_eq!(analysis.segments[1].end, [10.0, 0.0, -1.0]);
        assert_eq!(analysis.bounds_z, [-1.0, 0.0]);
    }

    #[test]
    fn zero_length_moves_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(dir.path(), "G90\nG1 X0 Y0\nG1 X3\n");

        let analysis = analyze_program(&path).unwrap();
        assert_eq!(analysis.command_count, 1);
        assert_eq!(analysis.segments[0].end, [3.0, 0.0, 0.0]);
    }

    #[test]
    fn arc_words_count_as_cutting_moves() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(dir.path(), "G0 X10\nG2 X0 Y4 I-5\n");

        let analysis = analyze_program(&path).unwrap();
        assert_eq!(analysis.cutting_moves, 1);
        assert_eq!(analysis.segments[1].mode, MotionMode::Cut);
    }

    #[test]
    fn motionless_program_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(dir.path(), "(just a header)\nG21\nM3 S12000\n");

        let err = analyze_program(&path).unwrap_err();
        assert!(matches!(err, RenderError::Unsupported(_)));
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = analyze_program(&dir.path().join("ghost.nc")).unwrap_err();
        assert!(matches!(err, RenderError::Unreadable { .. }));
    }

    #[test]
    fn analysis_json_uses_stable_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(dir.path(), "G1 X2 F100\n");

        let summary = analyze_program(&path).unwrap().to_json();
        assert_eq!(summary["command_count"], 1);
        assert_eq!(summary["bounds_xy"], serde_json::json!([0.0, 0.0, 2.0, 0.0]));
        assert_eq!(summary["feed_rates"], serde_json::json!([100.0]));
        assert_eq!(summary["units"], "mm");
    }

    #[test]
    fn hint_tags_normalize_keys_and_default_values() {
        let tags = [
            "GcodeHint:Line Width=3",
            "gcodehint:dark",
            "gcodehint:tool:flat 6mm",
            "material:wood",
            "   ",
        ];
        let hints = extract_render_hints(tags);

        assert_eq!(hints.get("line_width").map(String::as_str), Some("3"));
        assert_eq!(hints.get("dark").map(String::as_str), Some("true"));
        assert_eq!(hints.get("tool").map(String::as_str), Some("flat 6mm"));
        assert_eq!(hints.len(), 3);
    }
}
