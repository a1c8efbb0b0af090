use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rangefetch_core::strategy;
use rangefetch_core::{
    ChecksumRequest, ChunkPlan, CoreError, DownloadConfig, DownloadEngine, DownloadListener,
    DownloadRequest, DownloadState, NetworkClass,
};
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "RANGEFETCH_CONFIG";

fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::from(2);
    }

    let options = match Options::parse(&args[2..]) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("error: {}", message);
            print_usage();
            return ExitCode::from(2);
        }
    };
    let config = match load_config(options.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match args[1].as_str() {
        "get" => run_get(config, options),
        "plan" => run_plan(&config, &options),
        _ => {
            print_usage();
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Default)]
struct Options {
    positional: Vec<String>,
    name: Option<String>,
    network: NetworkClass,
    checksum: Option<ChecksumRequest>,
    config: Option<PathBuf>,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = Options::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--name" => options.name = Some(flag_value(&mut iter, arg)?.to_string()),
                "--network" => {
                    let value = flag_value(&mut iter, arg)?;
                    options.network = NetworkClass::from_str(value)
                        .ok_or_else(|| format!("unknown network class: {}", value))?;
                }
                "--checksum" => {
                    let value = flag_value(&mut iter, arg)?;
                    options.checksum = Some(
                        ChecksumRequest::parse(value)
                            .ok_or_else(|| format!("expected ALGO:HEX, got {}", value))?,
                    );
                }
                "--config" => options.config = Some(PathBuf::from(flag_value(&mut iter, arg)?)),
                other if other.starts_with("--") => return Err(format!("unknown option: {}", other)),
                other => options.positional.push(other.to_string()),
            }
        }
        Ok(options)
    }
}

fn flag_value<'a>(iter: &mut std::slice::Iter<'a, String>, flag: &str) -> Result<&'a str, String> {
    iter.next()
        .map(String::as_str)
        .ok_or_else(|| format!("{} needs a value", flag))
}

fn load_config(path: Option<&Path>) -> Result<DownloadConfig, CoreError> {
    let from_env = env::var_os(CONFIG_ENV).map(PathBuf::from);
    match path.map(Path::to_path_buf).or(from_env) {
        Some(path) => DownloadConfig::from_toml_file(path),
        None => Ok(DownloadConfig::default()),
    }
}

fn run_get(config: DownloadConfig, options: Options) -> ExitCode {
    let Some(url) = options.positional.first() else {
        print_usage();
        return ExitCode::from(2);
    };
    let dest = options
        .positional
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let engine = match DownloadEngine::new(config, Arc::new(ConsoleListener::default())) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::FAILURE;
        }
    };
    engine.set_network_class(options.network);

    let mut request = DownloadRequest::new(url.as_str(), dest);
    if let Some(name) = options.name {
        request = request.with_file_name(name);
    }
    if let Some(checksum) = options.checksum {
        request = request.with_checksum(checksum);
    }

    // Rejections are already reported through the listener.
    if engine.start(request).is_err() {
        return ExitCode::FAILURE;
    }
    match engine.wait() {
        DownloadState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

fn run_plan(config: &DownloadConfig, options: &Options) -> ExitCode {
    let total = match options.positional.first().map(|value| value.parse::<u64>()) {
        Some(Ok(total)) if total > 0 => total,
        _ => {
            eprintln!("error: plan needs a positive byte count");
            return ExitCode::from(2);
        }
    };

    let workers = strategy::worker_count(total, options.network).min(config.max_workers);
    let plan = ChunkPlan::for_download(total, options.network, config);
    println!("network:     {}", options.network);
    println!("file size:   {} ({})", total, format_bytes(total));
    println!("workers:     {} requested, {} planned", workers, plan.len());
    println!("chunk size:  {} ({})", plan.chunk_size, format_bytes(plan.chunk_size));
    for chunk in &plan.chunks {
        println!(
            "  #{:<3} {:>12}-{:<12} {}",
            chunk.index,
            chunk.start,
            chunk.end,
            format_bytes(chunk.len())
        );
    }
    ExitCode::SUCCESS
}

#[derive(Default)]
struct ConsoleListener {
    last_line: Mutex<Option<Instant>>,
}

impl DownloadListener for ConsoleListener {
    fn on_start(&self, total_size: u64, file_name: &str) {
        println!("downloading {} ({})", file_name, format_bytes(total_size));
    }

    fn on_progress(&self, downloaded: u64, total: u64, speed_bytes_per_sec: f64, percent: f64) {
        let mut last = self
            .last_line
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if last.map_or(false, |at| now.duration_since(at) < Duration::from_secs(1)) {
            return;
        }
        *last = Some(now);

        let speed = speed_bytes_per_sec as u64;
        let eta = if speed > 0 {
            format_duration(total.saturating_sub(downloaded) / speed)
        } else {
            "--:--".to_string()
        };
        println!(
            "{:5.1}% {}/{} ({}/s) eta {}",
            percent,
            format_bytes(downloaded),
            format_bytes(total),
            format_bytes(speed),
            eta
        );
    }

    fn on_complete(&self, path: &Path) {
        println!("saved {}", path.display());
    }

    fn on_error(&self, message: &str) {
        eprintln!("error: {}", message);
    }

    fn on_pause(&self, downloaded: u64, total: u64) {
        println!("paused at {}/{}", format_bytes(downloaded), format_bytes(total));
    }

    fn on_resume(&self, downloaded: u64, total: u64) {
        println!("resuming from {}/{}", format_bytes(downloaded), format_bytes(total));
    }

    fn on_cancel(&self) {
        println!("cancelled");
    }
}

fn print_usage() {
    eprintln!(
        "Usage: rangefetch <command> [args]\n\
Commands:\n\
  get <url> [dest_dir]     Download one file (dest_dir defaults to .)\n\
      --name NAME          Save under NAME instead of the server's name\n\
      --network CLASS      wifi | 5g | 4g | 3g | unknown (default wifi)\n\
      --checksum ALGO:HEX  Verify md5, sha1 or sha256 before finishing\n\
  plan <total_bytes>       Show the chunk plan for a file of that size\n\
      --network CLASS\n\
Common options:\n\
  --config PATH            TOML config (or set {}=PATH)\n\
Environment:\n\
  RUST_LOG=debug           Log verbosity (stderr)",
        CONFIG_ENV
    );
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
