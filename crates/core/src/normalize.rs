//! Turns whatever `czkawka_cli` produced into [`ScanResults`].
//!
//! The tool's output shape depends on the scan type, the tool version and on
//! whether a results file was written at all. Raw output is first classified
//! into a [`RawOutput`] and only then normalized, so consumers never branch on
//! ad hoc JSON shapes.

use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat};
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::models::{FileEntry, FileGroup, ScanResults, ScanType};

static SIZE_PATH_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?(?:\s*[KMGT]?B)?)\s*-\s*(.+)$").expect("valid size/path regex")
});

#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    /// No results file and nothing usable on stdout.
    Absent,
    /// Output that is already in normalized form, e.g. a reloaded record.
    Normalized(ScanResults),
    /// Clusters of entries; bucket keys have already been discarded.
    Groups(Vec<Vec<Value>>),
    /// A flat list of entries, either bare path strings or records.
    Entries(Vec<Value>),
}

impl RawOutput {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        if text.trim().is_empty() {
            return Ok(RawOutput::Absent);
        }
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::classify(value))
    }

    /// Stdout fallback: JSON when it parses, the plain-text listing otherwise.
    pub fn from_stdout(stdout: &[u8], scan_type: ScanType) -> Self {
        let text = String::from_utf8_lossy(stdout);
        let text = text.trim();
        if text.is_empty() {
            return RawOutput::Absent;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Self::classify(value),
            Err(_) => parse_text_output(text, scan_type),
        }
    }

    pub fn classify(value: Value) -> Self {
        match value {
            Value::Object(map) => {
                if let Some(results) = as_normalized(&map) {
                    return RawOutput::Normalized(results);
                }
                let mut groups = Vec::new();
                for (_bucket, inner) in map {
                    if let Value::Array(items) = inner {
                        collect_groups(items, &mut groups);
                    }
                }
                RawOutput::Groups(groups)
            }
            Value::Array(items) => {
                let nested = items
                    .iter()
                    .any(|item| item.is_array() || item.get("files").is_some_and(Value::is_array));
                if nested {
                    let mut groups = Vec::new();
                    collect_groups(items, &mut groups);
                    RawOutput::Groups(groups)
                } else {
                    RawOutput::Entries(items)
                }
            }
            _ => RawOutput::Absent,
        }
    }
}

fn as_normalized(map: &Map<String, Value>) -> Option<ScanResults> {
    if map.is_empty() || !map.keys().all(|key| key == "groups" || key == "files") {
        return None;
    }
    serde_json::from_value(Value::Object(map.clone())).ok()
}

fn collect_groups(items: Vec<Value>, groups: &mut Vec<Vec<Value>>) {
    if !items.iter().any(|item| item.is_array() || item.get("files").is_some()) {
        groups.push(items);
        return;
    }
    for item in items {
        match item {
            Value::Array(entries) => groups.push(entries),
            Value::Object(mut record) => {
                if let Some(Value::Array(entries)) = record.remove("files") {
                    groups.push(entries);
                }
            }
            _ => {}
        }
    }
}

/// Produces the stable result shape for `scan_type`.
pub fn normalize(scan_type: ScanType, raw: RawOutput) -> ScanResults {
    match raw {
        RawOutput::Absent => ScanResults::default(),
        RawOutput::Normalized(results) => results,
        RawOutput::Groups(groups) => {
            if scan_type.is_grouped() {
                build_groups(groups)
            } else {
                ScanResults {
                    groups: Vec::new(),
                    files: groups.iter().flatten().filter_map(parse_entry).collect(),
                }
            }
        }
        RawOutput::Entries(entries) => {
            if scan_type.is_grouped() {
                build_groups(vec![entries])
            } else {
                ScanResults {
                    groups: Vec::new(),
                    files: entries.iter().filter_map(parse_entry).collect(),
                }
            }
        }
    }
}

fn build_groups(raw_groups: Vec<Vec<Value>>) -> ScanResults {
    let groups = raw_groups
        .iter()
        .map(|entries| entries.iter().filter_map(parse_entry).collect::<Vec<_>>())
        .filter(|files| !files.is_empty())
        .enumerate()
        .map(|(idx, files)| FileGroup {
            id: idx as u64 + 1,
            total_size: files
                .iter()
                .map(|file| file.size)
                .fold(0u64, u64::saturating_add),
            files,
        })
        .collect();
    ScanResults {
        groups,
        files: Vec::new(),
    }
}

fn parse_entry(value: &Value) -> Option<FileEntry> {
    match value {
        Value::String(path) if !path.trim().is_empty() => Some(FileEntry {
            path: path.clone(),
            ..FileEntry::default()
        }),
        Value::Object(record) => {
            let path = record.get("path").and_then(Value::as_str)?.to_string();
            let size = record.get("size").map(parse_size).unwrap_or(0);
            let modified = record
                .get("modified_date")
                .or_else(|| record.get("modified"))
                .map(format_modified)
                .unwrap_or_default();
            let hash = record
                .get("hash")
                .and_then(Value::as_str)
                .filter(|hash| !hash.is_empty())
                .map(str::to_string);
            Some(FileEntry {
                path,
                size,
                modified,
                hash,
            })
        }
        _ => None,
    }
}

fn parse_size(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Tool-native timestamps are Unix epoch seconds.
fn format_modified(value: &Value) -> String {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn is_noise_line(line: &str) -> bool {
    line.is_empty()
        || line.starts_with("----")
        || line.starts_with("Found")
        || line.starts_with("Searching")
}

/// Parses the plain-text listing older tool versions print instead of JSON.
///
/// Grouped scans separate groups with blank or header lines and may prefix
/// each path with its size (`SIZE - PATH`); flat scans print one path per line.
pub fn parse_text_output(text: &str, scan_type: ScanType) -> RawOutput {
    let lines = text.lines().map(str::trim);

    if !scan_type.is_grouped() {
        let entries = lines
            .filter(|line| !is_noise_line(line))
            .map(|line| Value::String(line.to_string()))
            .collect::<Vec<_>>();
        return if entries.is_empty() {
            RawOutput::Absent
        } else {
            RawOutput::Entries(entries)
        };
    }

    let mut groups = Vec::new();
    let mut current = Vec::new();
    for line in lines {
        if is_noise_line(line) {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            continue;
        }
        let entry = match SIZE_PATH_LINE.captures(line) {
            Some(caps) => {
                let size = caps[1].trim().parse::<u64>().unwrap_or(0);
                json!({ "path": caps[2].trim(), "size": size })
            }
            None => json!({ "path": line }),
        };
        current.push(entry);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    if groups.is_empty() {
        RawOutput::Absent
    } else {
        RawOutput::Groups(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_json(scan_type: ScanType, value: Value) -> ScanResults {
        normalize(scan_type, RawOutput::classify(value))
    }

    #[test]
    fn duplicates_bucketed_by_size() {
        let raw = json!({
            "1048576": [[
                {"path": "/a", "size": 1048576},
                {"path": "/b", "size": 1048576}
            ]]
        });
        let results = normalize_json(ScanType::Duplicates, raw);
        assert_eq!(results.groups.len(), 1);
        assert_eq!(results.groups[0].total_size, 2_097_152);
        assert_eq!(results.findings_count(), 1);
        assert_eq!(results.total_size(), 2_097_152);
        assert!(results.files.is_empty());
    }

    #[test]
    fn bucket_keys_are_discarded() {
        let raw = json!({
            "10": [[{"path": "/x1", "size": 10}, {"path": "/x2", "size": 10}]],
            "20": [
                [{"path": "/y1", "size": 20}, {"path": "/y2", "size": 20}],
                [{"path": "/z1", "size": 20}, {"path": "/z2", "size": 20}, {"path": "/z3", "size": 20}]
            ]
        });
        let results = normalize_json(ScanType::Duplicates, raw);
        assert_eq!(results.groups.len(), 3);
        let ids: Vec<u64> = results.groups.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        for group in &results.groups {
            let sum: u64 = group.files.iter().map(|f| f.size).sum();
            assert_eq!(group.total_size, sum);
        }
        assert_eq!(results.total_size(), 20 + 40 + 60);
    }

    #[test]
    fn similar_images_as_array_of_groups() {
        let raw = json!([
            [{"path": "/img/a.jpg", "size": 100, "hash": "abc"}, {"path": "/img/b.jpg", "size": 120}],
            []
        ]);
        let results = normalize_json(ScanType::SimilarImages, raw);
        assert_eq!(results.groups.len(), 1);
        assert_eq!(results.groups[0].files[0].hash.as_deref(), Some("abc"));
        assert_eq!(results.groups[0].files[1].hash, None);
        assert_eq!(results.groups[0].total_size, 220);
    }

    #[test]
    fn flat_bare_strings() {
        let results = normalize_json(ScanType::EmptyFiles, json!(["/empty1", "/empty2"]));
        assert_eq!(
            serde_json::to_value(&results.files).unwrap(),
            json!([
                {"path": "/empty1", "size": 0, "modified": ""},
                {"path": "/empty2", "size": 0, "modified": ""}
            ])
        );
        assert_eq!(results.findings_count(), 2);
        assert!(results.groups.is_empty());
    }

    #[test]
    fn flat_records_and_mixed_entries() {
        let raw = json!([
            {"path": "/tmp/a.tmp", "size": 12, "modified_date": 1_700_000_000},
            "/tmp/b.bak",
            {"size": 5},
            42
        ]);
        let results = normalize_json(ScanType::Temporary, raw);
        assert_eq!(results.files.len(), 2);
        assert_eq!(results.files[0].modified, "2023-11-14T22:13:20Z");
        assert_eq!(results.files[0].size, 12);
        assert_eq!(results.files[1].size, 0);
        assert_eq!(results.total_size(), 12);
    }

    #[test]
    fn unconvertible_timestamp_defaults_to_empty() {
        let raw = json!([{"path": "/a", "modified_date": i64::MAX}, {"path": "/b", "modified_date": true}]);
        let results = normalize_json(ScanType::EmptyFiles, raw);
        assert_eq!(results.files[0].modified, "");
        assert_eq!(results.files[1].modified, "");
    }

    #[test]
    fn flat_scan_flattens_grouped_output() {
        let raw = json!({"bucket": [["/a", "/b"], ["/c"]]});
        let results = normalize_json(ScanType::EmptyDirs, raw);
        assert_eq!(results.files.len(), 3);
        assert!(results.groups.is_empty());
    }

    #[test]
    fn absent_output_yields_empty_shape() {
        let results = normalize(ScanType::Duplicates, RawOutput::Absent);
        assert_eq!(serde_json::to_value(&results).unwrap(), json!({"groups": [], "files": []}));
        assert_eq!(results.findings_count(), 0);
        assert_eq!(RawOutput::parse("   ").unwrap(), RawOutput::Absent);
        assert_eq!(RawOutput::classify(Value::Null), RawOutput::Absent);
    }

    #[test]
    fn normalization_is_idempotent() {
        let cases = [
            (
                ScanType::Duplicates,
                json!({"5": [[{"path": "/a", "size": 5, "modified_date": 1}, {"path": "/b", "size": 5}]]}),
            ),
            (ScanType::EmptyFiles, json!(["/x", {"path": "/y", "size": 3}])),
            (ScanType::SimilarMusic, Value::Null),
        ];
        for (scan_type, raw) in cases {
            let once = normalize_json(scan_type, raw);
            let twice = normalize_json(scan_type, serde_json::to_value(&once).unwrap());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn unparsable_json_is_an_error() {
        assert!(RawOutput::parse("{not json").is_err());
    }

    #[test]
    fn stdout_falls_back_to_text() {
        let raw = RawOutput::from_stdout(b"/a\n/b\n", ScanType::EmptyDirs);
        assert_eq!(normalize(ScanType::EmptyDirs, raw).files.len(), 2);

        let raw = RawOutput::from_stdout(br#"["/a"]"#, ScanType::EmptyDirs);
        assert_eq!(normalize(ScanType::EmptyDirs, raw).files.len(), 1);

        assert_eq!(RawOutput::from_stdout(b"\n", ScanType::EmptyDirs), RawOutput::Absent);
    }

    #[test]
    fn text_empty_input() {
        assert_eq!(parse_text_output("", ScanType::Duplicates), RawOutput::Absent);
        assert_eq!(parse_text_output("   ", ScanType::EmptyFiles), RawOutput::Absent);
    }

    #[test]
    fn text_flat_with_headers() {
        let text = "---- Empty Files ----\nFound 2 empty files\n/storage/media/empty.txt\n/storage/docs/blank.log";
        let results = normalize(ScanType::EmptyFiles, parse_text_output(text, ScanType::EmptyFiles));
        assert_eq!(results.files.len(), 2);
        assert_eq!(results.files[0].path, "/storage/media/empty.txt");
    }

    #[test]
    fn text_duplicates_groups() {
        let text = "1048576 - /storage/video/movie.mp4\n1048576 - /storage/backup/movie.mp4\n\n\
                    2097152 - /storage/music/song.mp3\n2097152 - /storage/old/song.mp3\n2097152 - /storage/temp/song.mp3";
        let results = normalize(ScanType::Duplicates, parse_text_output(text, ScanType::Duplicates));
        assert_eq!(results.groups.len(), 2);
        assert_eq!(results.groups[0].files.len(), 2);
        assert_eq!(results.groups[1].files.len(), 3);
        assert_eq!(results.groups[0].files[0].size, 1_048_576);
        assert_eq!(results.groups[0].files[0].path, "/storage/video/movie.mp4");
        assert_eq!(results.groups[1].total_size, 3 * 2_097_152);
    }

    #[test]
    fn text_groups_with_headers_and_units() {
        let text = "---- Duplicate Files ----\nSearching for duplicates\n\n\
                    1.5 KB - /storage/a.txt\n1.5 KB - /storage/b.txt\n\nFound 1 group";
        let results = normalize(ScanType::Duplicates, parse_text_output(text, ScanType::Duplicates));
        assert_eq!(results.groups.len(), 1);
        assert_eq!(results.groups[0].files[1].path, "/storage/b.txt");
        assert_eq!(results.groups[0].total_size, 0);
    }

    #[test]
    fn huge_sizes_saturate_instead_of_overflowing() {
        let raw = json!({
            "a": [
                [{"path": "/x", "size": 18446744073709551615u64}, {"path": "/x2", "size": 7}],
                [{"path": "/y", "size": 5}]
            ]
        });
        let results = normalize_json(ScanType::Duplicates, raw);
        assert_eq!(results.groups[0].total_size, u64::MAX);
        assert_eq!(results.groups[1].total_size, 5);
        assert_eq!(results.total_size(), u64::MAX);
    }
}
