use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use thumbnail_cache::{CacheConfig, Dimensions, Engine, Error, Format, Mode, ThumbInfo};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "thumbvault")]
#[command(about = "Thumbnail cache service: resolves source images to cached thumbnails")]
struct Cli {
    /// Directory holding the thumbnail cache tree
    #[arg(short = 'd', long, default_value = "./thumbvault-cache")]
    cache_dir: PathBuf,

    /// Disk budget for the cache, in bytes
    #[arg(short = 'L', long, default_value_t = 1 << 30)]
    limit: i64,

    /// Fraction of the limit at which eviction starts
    #[arg(long, default_value_t = 0.90)]
    high_ratio: f64,

    /// Fraction of the limit at which eviction stops
    #[arg(long, default_value_t = 0.75)]
    low_ratio: f64,

    /// Worker threads running the converter
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Task buffer capacity; requests beyond it are rejected
    #[arg(short, long, default_value_t = 128)]
    buffer: usize,

    /// External converter program
    #[arg(long, default_value = "convert")]
    convert: String,

    /// Root directories requests may read from (repeatable; empty = allow all)
    #[arg(short, long)]
    allow: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve one thumbnail and print its cache path
    Get {
        /// Source image path
        source: PathBuf,

        /// Target size, "WxH" or a bare edge length for a square
        #[arg(short, long, default_value = "128")]
        size: String,

        /// Resize mode: crop, shrink, or stretch
        #[arg(short, long, default_value = "shrink")]
        mode: String,

        /// Output format: jpg, png, or webp
        #[arg(short, long, default_value = "jpg")]
        format: String,
    },

    /// Serve whitespace-separated "source size mode format" requests from stdin
    Serve {
        /// Seconds to wait for in-flight work at shutdown
        #[arg(long, default_value_t = 10)]
        shutdown_timeout: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = CacheConfig::default();
    config.limit_bytes = cli.limit;
    config.high_ratio = cli.high_ratio;
    config.low_ratio = cli.low_ratio;
    config.workers = cli.workers;
    config.buffer = cli.buffer;
    config.convert_program = cli.convert.clone();
    let engine = Engine::with_config(&cli.cache_dir, config)
        .with_context(|| format!("open cache at {}", cli.cache_dir.display()))?;

    match &cli.command {
        Commands::Get {
            source,
            size,
            mode,
            format,
        } => {
            let request = RawRequest {
                source: source.clone(),
                size: size.clone(),
                mode: mode.clone(),
                format: format.clone(),
            };
            let ti = resolve(&engine, &cli.allow, &request)?;
            let path = engine.get(&ti)?;
            println!("{}", path.display());
            engine
                .shutdown(Duration::from_secs(10))
                .context("shutdown")?;
            Ok(())
        }
        Commands::Serve { shutdown_timeout } => {
            serve(&engine, &cli.allow)?;
            info!("stdin closed; draining");
            match engine.shutdown(Duration::from_secs(*shutdown_timeout)) {
                Ok(()) => Ok(()),
                Err(Error::ShutdownTimeout) => {
                    warn!("shutdown deadline hit; some work was discarded");
                    Ok(())
                }
                Err(e) => bail!(e),
            }
        }
    }
}

/// One unparsed request line as received from the transport.
struct RawRequest {
    source: PathBuf,
    size: String,
    mode: String,
    format: String,
}

/// Parse the descriptor, enforce the whitelist, and build the cache key.
fn resolve(
    engine: &Engine,
    allow: &[PathBuf],
    request: &RawRequest,
) -> std::result::Result<ThumbInfo, Error> {
    let dimensions: Dimensions = request.size.parse()?;
    let mode: Mode = request.mode.parse()?;
    // Unknown format names fall back to JPEG rather than erroring, so
    // transports can omit the field entirely.
    let format = match Format::from_name(&request.format) {
        Format::Unknown => Format::Jpeg,
        known => known,
    };
    if !source_allowed(allow, &request.source) {
        return Err(Error::SourceUnreadable(
            request.source.display().to_string(),
        ));
    }
    engine
        .factory()
        .from_file(&request.source, dimensions, mode, format)
}

/// A source is admissible when the whitelist is empty or some allowed root
/// is a prefix of it. Paths are compared lexically; `..` segments are
/// rejected outright so a request cannot escape a root.
fn source_allowed(allow: &[PathBuf], source: &Path) -> bool {
    if source
        .components()
        .any(|c| c == std::path::Component::ParentDir)
    {
        return false;
    }
    if allow.is_empty() {
        return true;
    }
    allow.iter().any(|root| source.starts_with(root))
}

fn serve(engine: &Engine, allow: &[PathBuf]) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("read request line")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_line(engine, allow, line) {
            Ok(path) => writeln!(stdout, "OK {}", path.display())?,
            Err(e) => {
                warn!("request failed: {e}");
                writeln!(stdout, "ERR {}", client_error(&e))?;
            }
        }
        stdout.flush()?;
    }
    Ok(())
}

fn handle_line(
    engine: &Engine,
    allow: &[PathBuf],
    line: &str,
) -> std::result::Result<PathBuf, Error> {
    let mut fields = line.split_whitespace();
    let source = fields
        .next()
        .ok_or_else(|| Error::InvalidDescriptor("empty request".into()))?;
    let request = RawRequest {
        source: PathBuf::from(source),
        size: fields.next().unwrap_or("128").to_string(),
        mode: fields.next().unwrap_or("shrink").to_string(),
        format: fields.next().unwrap_or("jpg").to_string(),
    };
    let ti = resolve(engine, allow, &request)?;
    engine.get(&ti)
}

/// Stable kind tokens for the line protocol, mirroring the HTTP statuses a
/// fronting transport would map them to.
fn kind_name(e: &Error) -> &'static str {
    match e {
        Error::SourceNotFound(_) => "not-found",
        Error::SourceUnreadable(_) => "forbidden",
        Error::InvalidDescriptor(_) => "bad-request",
        Error::QueueFull => "overloaded",
        Error::EngineClosed => "shutting-down",
        Error::GenerationFailed(_) => "generation-failed",
        _ => "internal",
    }
}

/// Client-facing rendering of an error. Converter diagnostics and internal
/// failures are reduced to the bare kind token — stderr from the external
/// binary stays in the server log, never on the wire. Request-shaped kinds
/// keep their message, which only echoes the caller's own input.
fn client_error(e: &Error) -> String {
    match e {
        Error::GenerationFailed(_) | Error::Internal(_) | Error::Io { .. } => {
            kind_name(e).to_string()
        }
        _ => format!("{} {e}", kind_name(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_allows_everything_when_empty() {
        assert!(source_allowed(&[], Path::new("/anywhere/img.jpg")));
    }

    #[test]
    fn whitelist_restricts_to_roots() {
        let allow = vec![PathBuf::from("/photos"), PathBuf::from("/srv/media")];
        assert!(source_allowed(&allow, Path::new("/photos/cat.jpg")));
        assert!(source_allowed(&allow, Path::new("/srv/media/a/b.png")));
        assert!(!source_allowed(&allow, Path::new("/etc/passwd")));
        // Prefix matching is per component, not per byte.
        assert!(!source_allowed(&allow, Path::new("/photosx/cat.jpg")));
    }

    #[test]
    fn parent_segments_are_rejected() {
        let allow = vec![PathBuf::from("/photos")];
        assert!(!source_allowed(&allow, Path::new("/photos/../etc/passwd")));
        assert!(!source_allowed(&[], Path::new("/photos/../etc/passwd")));
    }

    #[test]
    fn converter_diagnostics_stay_out_of_responses() {
        let leaky = Error::GenerationFailed("convert: /srv/private/img.jpg: no decode".into());
        assert_eq!(client_error(&leaky), "generation-failed");

        let internal = Error::Internal("worker panicked".into());
        assert_eq!(client_error(&internal), "internal");

        // Request-shaped kinds still explain themselves to the caller.
        let missing = Error::SourceNotFound("/photos/cat.jpg".into());
        assert!(client_error(&missing).starts_with("not-found "));
        assert!(client_error(&missing).contains("/photos/cat.jpg"));
    }
}
