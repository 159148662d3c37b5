use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mediarc_core::checksum::{files_equal, Checksum};
use mediarc_core::{date, server, sums, writer, ArchiveOptions, VerifierConfig};

#[derive(Parser)]
#[command(name = "mediarc", version, about = "Archive photos and videos into a YYYY/MM/DD tree by original creation time")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy media files into DESTINATION/YYYY/MM/DD
    Archive {
        source: PathBuf,
        destination: PathBuf,

        /// Workers per pipeline stage
        #[arg(short, long, default_value_t = 1)]
        concurrency: usize,

        /// Move files instead of copying them
        #[arg(long = "move")]
        move_files: bool,

        /// Verify duplicates on a `mediarc serve` peer that owns DESTINATION
        #[arg(long, value_name = "HOST:PORT", value_parser = parse_remote)]
        remote: Option<VerifierConfig>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Answer checksum requests for files under ROOT
    Serve {
        root: PathBuf,

        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = 3333)]
        port: u16,

        /// List checksums for requested paths instead of verifying them
        #[arg(long)]
        sums: bool,
    },

    /// Fetch checksums of every file under DIR from a `mediarc serve --sums` peer
    Sums {
        #[arg(value_name = "HOST:PORT")]
        remote: String,

        dir: PathBuf,

        /// Only report files whose remote copy is missing or differs
        #[arg(long)]
        check: bool,
    },

    /// Print the original creation time of each file
    Time {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Report whether two files differ
    Compare {
        a: PathBuf,
        b: PathBuf,

        /// Also print both checksums
        #[arg(long)]
        checksum: bool,
    },

    /// Copy a file without ever leaving a partial destination
    Cp { src: PathBuf, dst: PathBuf },
}

fn parse_remote(s: &str) -> Result<VerifierConfig, String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got {s:?}"))?;
    let port = port.parse().map_err(|e| format!("bad port {port:?}: {e}"))?;
    Ok(VerifierConfig::Remote {
        host: host.to_string(),
        port,
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Archive {
            source,
            destination,
            concurrency,
            move_files,
            remote,
            json,
        } => {
            let options = ArchiveOptions {
                source,
                destination,
                concurrency,
                move_files,
                verifier: remote.unwrap_or_default(),
            };
            archive(&options, json)
        }
        Command::Serve { root, host, port, sums } => {
            anyhow::ensure!(root.is_dir(), "not a directory: {}", root.display());
            let listener = TcpListener::bind((host.as_str(), port))
                .with_context(|| format!("cannot listen on {host}:{port}"))?;
            if sums {
                server::serve_sums(listener, &root)?;
            } else {
                server::serve(listener, &root)?;
            }
            Ok(())
        }
        Command::Sums { remote, dir, check } => remote_sums(&remote, &dir, check),
        Command::Time { files } => print_times(&files),
        Command::Compare { a, b, checksum } => compare(&a, &b, checksum),
        Command::Cp { src, dst } => {
            writer::copy_atomic(&src, &dst)
                .with_context(|| format!("cannot copy {} to {}", src.display(), dst.display()))?;
            info!("copied {} to {}", src.display(), dst.display());
            Ok(())
        }
    }
}

fn archive(options: &ArchiveOptions, json: bool) -> anyhow::Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner} [{elapsed}] {msg}").unwrap());
    pb.enable_steady_tick(Duration::from_millis(120));

    let callback = |stage: &str, current: u64, total: u64, message: &str| match stage {
        "archived" if !json => pb.suspend(|| println!("{message}")),
        "archived" => {}
        "failed" => pb.suspend(|| eprintln!("{message}")),
        _ if total > 0 => pb.set_message(format!("{stage} {current}/{total}")),
        _ => pb.set_message(format!("{stage} {current}")),
    };
    debug!(
        "archiving {} into {} with {} worker(s) per stage",
        options.source.display(),
        options.destination.display(),
        options.workers()
    );
    let result = mediarc_core::archive(options, &callback);
    pb.finish_and_clear();
    let summary = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.write_report(&mut io::stdout().lock())?;
    }
    Ok(())
}

fn print_times(files: &[PathBuf]) -> anyhow::Result<()> {
    let times: Vec<_> = files.par_iter().map(|path| date::original_time(path)).collect();

    let mut failed = 0;
    for (path, time) in files.iter().zip(times) {
        match time {
            Ok(time) => println!("{} {}", time.to_rfc3339(), path.display()),
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} file(s) without an original time");
    }
    Ok(())
}

fn remote_sums(addr: &str, dir: &Path, check: bool) -> anyhow::Result<()> {
    let paths = sums::relative_files(dir).with_context(|| format!("cannot walk {}", dir.display()))?;
    info!("requesting {} checksum(s) from {}", paths.len(), addr);
    let mut remote = sums::fetch(addr, &paths)?;
    remote.sort_by(|a, b| a.path.cmp(&b.path));

    if !check {
        for sum in &remote {
            println!("{}  {}", sum.checksum.as_deref().unwrap_or("-"), sum.path);
        }
        return Ok(());
    }

    let pb = ProgressBar::new(remote.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} hashing")
            .unwrap(),
    );
    let mismatched: Vec<_> = remote
        .par_iter()
        .filter_map(|sum| {
            let local = Checksum::of_file(&dir.join(&sum.path));
            pb.inc(1);
            match (local, sum.checksum.as_deref()) {
                (Ok(local), Some(theirs)) if local.matches_hex(theirs) => None,
                (Ok(_), Some(_)) => Some(("differs", sum.path.as_str())),
                (Ok(_), None) => Some(("missing", sum.path.as_str())),
                (Err(_), _) => Some(("unreadable", sum.path.as_str())),
            }
        })
        .collect();
    pb.finish_and_clear();

    for (status, path) in &mismatched {
        println!("{status}  {path}");
    }
    if !mismatched.is_empty() {
        anyhow::bail!("{} of {} file(s) not matched on {}", mismatched.len(), remote.len(), addr);
    }
    info!("all {} file(s) matched on {}", remote.len(), addr);
    Ok(())
}

fn compare(a: &Path, b: &Path, checksum: bool) -> anyhow::Result<()> {
    if checksum {
        let pb = ProgressBar::new(2);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40}] {pos}/{len} hashing")
                .unwrap(),
        );
        let sums = [a, b]
            .par_iter()
            .map(|path| {
                let sum = Checksum::of_file(path).with_context(|| format!("cannot read {}", path.display()));
                pb.inc(1);
                sum
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        pb.finish_and_clear();
        println!("{}  {}", sums[0], a.display());
        println!("{}  {}", sums[1], b.display());
    }

    let equal = files_equal(a, b).with_context(|| format!("cannot compare {} with {}", a.display(), b.display()))?;
    if !equal {
        println!("Files differ: {} {}", a.display(), b.display());
    }
    Ok(())
}
