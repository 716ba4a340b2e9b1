use std::path::PathBuf;
use std::str::FromStr;

use czkawka_web_core::config::Settings;
use czkawka_web_core::db::SqliteScanStore;
use czkawka_web_core::relay::ProgressMessage;
use czkawka_web_core::{
    Error, Result, ScanJob, ScanManager, ScanRequest, ScanStatus, ScanType,
};
use tracing::info;

mod logging;
mod web;

fn main() {
    match real_main() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    }
}

fn real_main() -> Result<bool> {
    dotenvy::dotenv().ok();
    logging::init_logger();

    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(true);
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(true)
        }
        "serve" => {
            let mut port: Option<u16> = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--port" => port = Some(number(&arg, args.next())?),
                    _ => return Err(unknown_arg(&arg)),
                }
            }

            let settings = load_settings()?;
            let port = port.unwrap_or(settings.port);
            let manager = open_manager(&settings, SqliteScanStore::open(&settings.database_path())?)?;
            runtime()?.block_on(web::serve(manager, port))?;
            Ok(true)
        }
        "scan" => {
            let mut scan_type: Option<ScanType> = None;
            let mut request = ScanRequest::new(ScanType::Duplicates, Vec::new());
            let mut json = false;

            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--type" => {
                        let value = required(&arg, args.next())?;
                        scan_type = Some(ScanType::parse(&value).ok_or_else(|| {
                            Error::InvalidArgument(format!("unknown scan type: {value}"))
                        })?);
                    }
                    "--dir" => request.directories.push(required(&arg, args.next())?),
                    "--exclude" => request
                        .excluded_directories
                        .push(required(&arg, args.next())?),
                    "--search-method" => {
                        request.options.search_method = Some(required(&arg, args.next())?)
                    }
                    "--min-size" => request.options.min_size = Some(number(&arg, args.next())?),
                    "--max-difference" => {
                        request.options.max_difference = Some(number(&arg, args.next())?)
                    }
                    "--tolerance" => request.options.tolerance = Some(number(&arg, args.next())?),
                    "--music-similarity" => {
                        request.options.music_similarity = Some(required(&arg, args.next())?)
                    }
                    "--checked-types" => {
                        let value = required(&arg, args.next())?;
                        request.options.checked_types = Some(
                            value
                                .split(',')
                                .map(str::trim)
                                .filter(|ext| !ext.is_empty())
                                .map(str::to_string)
                                .collect(),
                        );
                    }
                    "--json" => json = true,
                    _ => return Err(unknown_arg(&arg)),
                }
            }

            request.scan_type = scan_type
                .ok_or_else(|| Error::InvalidArgument("missing --type <scan type>".to_string()))?;

            let settings = load_settings()?;
            // Foreground scans are not recorded in the server's history.
            let manager = open_manager(&settings, SqliteScanStore::open_in_memory()?)?;
            let job = runtime()?.block_on(run_foreground_scan(manager, request))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job_report(&job);
            }
            Ok(job.status == ScanStatus::Completed)
        }
        "list" => {
            if let Some(arg) = args.next() {
                return Err(unknown_arg(&arg));
            }
            let settings = load_settings()?;
            let store = SqliteScanStore::open(&settings.database_path())?;
            let mut jobs = store.load_all()?;
            jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            if jobs.is_empty() {
                println!("no scans recorded in {}", settings.database_path().display());
            }
            for job in &jobs {
                println!(
                    "{}  {:<9}  {:<14}  {:>5} findings  {:>12} bytes  {}  {}",
                    job.id,
                    job.status.as_str(),
                    job.scan_type.as_str(),
                    job.findings_count,
                    job.total_size,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.directories.join(", ")
                );
            }
            Ok(true)
        }
        _ => Err(Error::InvalidArgument(format!("unknown command: {cmd}"))),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)
}

fn default_config_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("czkawka-web")
}

fn load_settings() -> Result<Settings> {
    let settings = Settings::load(&default_config_dir())?;
    info!(
        czkawka_bin = %settings.czkawka_bin.display(),
        config_dir = %settings.config_dir.display(),
        "settings loaded"
    );
    Ok(settings)
}

fn open_manager(settings: &Settings, store: SqliteScanStore) -> Result<ScanManager> {
    let config = settings.manager_config();
    std::fs::create_dir_all(&config.results_dir)?;
    ScanManager::open(config, store)
}

async fn run_foreground_scan(manager: ScanManager, request: ScanRequest) -> Result<ScanJob> {
    let job = manager.start_scan(request).await?;
    let mut subscription = manager.subscribe_progress(&job.id).await?;

    loop {
        tokio::select! {
            message = subscription.next() => match message {
                Some(ProgressMessage::Progress { stage, files_processed, elapsed_seconds, .. }) => {
                    eprintln!("[{elapsed_seconds:>6.1}s] {stage} ({files_processed} files)");
                }
                Some(ProgressMessage::Ping) => {}
                Some(ProgressMessage::Done { .. }) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("cancelling scan {}", job.id);
                manager.cancel_scan(&job.id).await?;
            }
        }
    }

    manager.unsubscribe_progress(subscription);
    manager.get_scan(&job.id).await
}

fn print_job_report(job: &ScanJob) {
    println!(
        "scan {} ({}) {} in {:.1}s",
        job.id,
        job.scan_type.as_str(),
        job.status.as_str(),
        job.progress.elapsed_seconds
    );
    if let Some(error) = &job.error {
        println!("error: {error}");
    }
    let Some(results) = &job.results else {
        return;
    };

    for group in &results.groups {
        println!(
            "group {} ({} files, {} bytes)",
            group.id,
            group.files.len(),
            group.total_size
        );
        for file in &group.files {
            println!("  {:>12}  {}", file.size, file.path);
        }
    }
    for file in &results.files {
        println!("{:>12}  {}", file.size, file.path);
    }
    println!(
        "{} findings, {} bytes total",
        job.findings_count, job.total_size
    );
}

fn required(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| Error::InvalidArgument(format!("missing value for {flag}")))
}

fn number<T: FromStr>(flag: &str, value: Option<String>) -> Result<T> {
    let value = required(flag, value)?;
    value
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("{flag} expects a number, got {value}")))
}

fn unknown_arg(arg: &str) -> Error {
    Error::InvalidArgument(format!("unknown arg: {arg}"))
}

fn print_help() {
    let types = ScanType::ALL
        .iter()
        .map(|scan_type| scan_type.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    println!(
        r#"czkawka-web

USAGE:
  czkawka-web serve [--port <port>]
  czkawka-web scan --type <scan type> --dir <path> [--dir <path>...]
                   [--exclude <path>...] [--search-method HASH|SIZE|NAME]
                   [--min-size <bytes>] [--max-difference <n>] [--tolerance <n>]
                   [--music-similarity <tags>] [--checked-types <ext,ext>] [--json]
  czkawka-web list

SCAN TYPES:
  {types}

NOTES:
  - Settings come from czkawka-web.toml and the environment (CZKAWKA_BIN,
    CONFIG_DIR, RESULTS_DIR, PORT, HEARTBEAT_SECS, CANCEL_GRACE_SECS).
  - `scan` runs in the foreground and exits non-zero unless the scan completes.
  - Log verbosity follows RUST_LOG (default: info).
"#
    );
}
