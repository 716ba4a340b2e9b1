use std::path::Path;

use crate::models::{ScanJob, ScanType};

/// Builds the `czkawka_cli` argument vector (without the program itself) for a job.
///
/// Never fails: directories that do not exist are filtered out, but when none
/// remain the original list is passed through so the tool reports the problem.
pub fn build_args(job: &ScanJob, results_file: &Path) -> Vec<String> {
    let mut args = vec![job.scan_type.subcommand().to_string()];

    let existing: Vec<&str> = job
        .directories
        .iter()
        .map(String::as_str)
        .filter(|dir| Path::new(dir).exists())
        .collect();
    let directories = if existing.is_empty() {
        job.directories.iter().map(String::as_str).collect()
    } else {
        existing
    };
    if !directories.is_empty() {
        args.push("--directories".into());
        args.push(directories.join(","));
    }

    let (absolute, patterns) = split_exclusions(&job.excluded_directories);
    if !absolute.is_empty() {
        args.push("--excluded-directories".into());
        args.push(absolute.join(","));
    }
    if !patterns.is_empty() {
        args.push("--excluded-items".into());
        args.push(patterns.join(","));
    }

    args.push("--compact-file-to-save".into());
    args.push(results_file.to_string_lossy().into_owned());
    args.push("--do-not-print-results".into());
    args.push("--ignore-error-code-on-found".into());

    let opts = &job.options;
    match job.scan_type {
        ScanType::Duplicates => {
            if let Some(method) = opts.search_method.as_deref() {
                args.push("--search-method".into());
                args.push(method.to_ascii_uppercase());
            }
        }
        ScanType::SimilarImages => {
            if let Some(max_difference) = opts.max_difference {
                args.push("--max-difference".into());
                args.push(max_difference.to_string());
            }
        }
        ScanType::SimilarVideos => {
            if let Some(tolerance) = opts.tolerance {
                args.push("--tolerance".into());
                args.push(tolerance.to_string());
            }
        }
        ScanType::SimilarMusic => {
            if let Some(similarity) = opts.music_similarity.as_deref() {
                args.push("--music-similarity".into());
                args.push(similarity.to_string());
            }
        }
        ScanType::Broken => {
            if let Some(types) = opts.checked_types.as_ref().filter(|t| !t.is_empty()) {
                args.push("--checked-types".into());
                args.push(types.join(","));
            }
        }
        _ => {}
    }

    if let Some(min_size) = opts.min_size {
        args.push("--minimal-file-size".into());
        args.push(min_size.to_string());
    }

    args
}

fn split_exclusions(excluded: &[String]) -> (Vec<String>, Vec<String>) {
    let mut absolute = Vec::new();
    let mut patterns = Vec::new();
    for entry in excluded {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if Path::new(entry).is_absolute() {
            absolute.push(entry.to_string());
        } else if entry.contains('*') {
            patterns.push(entry.to_string());
        } else {
            patterns.push(format!("*/{entry}"));
        }
    }
    (absolute, patterns)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::models::{ScanOptions, ScanRequest};

    fn job(scan_type: ScanType, directories: Vec<String>, options: ScanOptions) -> ScanJob {
        let mut request = ScanRequest::new(scan_type, directories);
        request.excluded_directories = vec!["@eaDir".into()];
        request.options = options;
        ScanJob::pending("test123".into(), request)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let idx = args.iter().position(|arg| arg == flag)?;
        args.get(idx + 1).map(String::as_str)
    }

    fn results_path() -> PathBuf {
        PathBuf::from("/tmp/results.json")
    }

    #[test]
    fn duplicates_basic() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_string_lossy().into_owned();
        let args = build_args(
            &job(ScanType::Duplicates, vec![dir_str.clone()], ScanOptions::default()),
            &results_path(),
        );

        assert_eq!(args[0], "dup");
        assert_eq!(value_after(&args, "--directories"), Some(dir_str.as_str()));
        assert_eq!(value_after(&args, "--excluded-items"), Some("*/@eaDir"));
        assert_eq!(
            value_after(&args, "--compact-file-to-save"),
            Some("/tmp/results.json")
        );
        assert!(args.contains(&"--do-not-print-results".to_string()));
        assert!(args.contains(&"--ignore-error-code-on-found".to_string()));
        assert!(!args.contains(&"--search-method".to_string()));
        assert!(!args.contains(&"--excluded-directories".to_string()));
    }

    #[test]
    fn duplicates_with_options() {
        let options = ScanOptions {
            search_method: Some("hash".into()),
            min_size: Some(1_048_576),
            ..ScanOptions::default()
        };
        let args = build_args(
            &job(ScanType::Duplicates, vec!["/storage".into()], options),
            &results_path(),
        );
        assert_eq!(value_after(&args, "--search-method"), Some("HASH"));
        assert_eq!(value_after(&args, "--minimal-file-size"), Some("1048576"));
    }

    #[test]
    fn missing_directories_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().to_string_lossy().into_owned();
        let args = build_args(
            &job(
                ScanType::EmptyFiles,
                vec!["/definitely/not/here".into(), present.clone()],
                ScanOptions::default(),
            ),
            &results_path(),
        );
        assert_eq!(value_after(&args, "--directories"), Some(present.as_str()));
    }

    #[test]
    fn all_missing_directories_pass_through() {
        let args = build_args(
            &job(
                ScanType::EmptyFiles,
                vec!["/nope/a".into(), "/nope/b".into()],
                ScanOptions::default(),
            ),
            &results_path(),
        );
        assert_eq!(value_after(&args, "--directories"), Some("/nope/a,/nope/b"));
    }

    #[test]
    fn exclusions_split_into_directories_and_items() {
        let mut scan = job(ScanType::Temporary, vec!["/storage".into()], ScanOptions::default());
        scan.excluded_directories = vec![
            "/storage/skip".into(),
            "node_modules".into(),
            ".Trash-*".into(),
            "/mnt/other".into(),
        ];
        let args = build_args(&scan, &results_path());
        assert_eq!(
            value_after(&args, "--excluded-directories"),
            Some("/storage/skip,/mnt/other")
        );
        assert_eq!(
            value_after(&args, "--excluded-items"),
            Some("*/node_modules,.Trash-*")
        );
    }

    #[test]
    fn type_specific_flags() {
        let options = ScanOptions {
            max_difference: Some(3),
            tolerance: Some(5),
            music_similarity: Some("TRACK_TITLE".into()),
            checked_types: Some(vec!["PDF".into(), "ARCHIVE".into()]),
            ..ScanOptions::default()
        };

        let images = build_args(
            &job(ScanType::SimilarImages, vec!["/s".into()], options.clone()),
            &results_path(),
        );
        assert_eq!(images[0], "image");
        assert_eq!(value_after(&images, "--max-difference"), Some("3"));
        assert!(!images.contains(&"--tolerance".to_string()));

        let videos = build_args(
            &job(ScanType::SimilarVideos, vec!["/s".into()], options.clone()),
            &results_path(),
        );
        assert_eq!(videos[0], "video");
        assert_eq!(value_after(&videos, "--tolerance"), Some("5"));

        let music = build_args(
            &job(ScanType::SimilarMusic, vec!["/s".into()], options.clone()),
            &results_path(),
        );
        assert_eq!(music[0], "music");
        assert_eq!(value_after(&music, "--music-similarity"), Some("TRACK_TITLE"));

        let broken = build_args(
            &job(ScanType::Broken, vec!["/s".into()], options),
            &results_path(),
        );
        assert_eq!(broken[0], "broken");
        assert_eq!(value_after(&broken, "--checked-types"), Some("PDF,ARCHIVE"));
    }

    #[test]
    fn min_size_applies_to_other_types() {
        let options = ScanOptions {
            min_size: Some(4096),
            ..ScanOptions::default()
        };
        let args = build_args(
            &job(ScanType::BadExtensions, vec!["/s".into()], options),
            &results_path(),
        );
        assert_eq!(args[0], "ext");
        assert_eq!(value_after(&args, "--minimal-file-size"), Some("4096"));
    }

    #[test]
    fn args_are_deterministic() {
        let scan = job(ScanType::Symlinks, vec!["/s".into()], ScanOptions::default());
        assert_eq!(
            build_args(&scan, &results_path()),
            build_args(&scan, &results_path())
        );
    }
}
