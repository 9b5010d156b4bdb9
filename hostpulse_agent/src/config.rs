//! Runtime configuration from CLI flags and HOSTPULSE_* environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

pub const USAGE: &str = "Usage: hostpulse_agent [--port PORT|-p PORT] [--bind ADDR] [--db PATH]";

/// Bounds applied to the client-requested sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBounds {
    pub min_ms: u64,
    pub max_ms: u64,
    pub default_ms: u64,
}

impl Default for IntervalBounds {
    fn default() -> Self {
        Self {
            min_ms: 500,
            max_ms: 10_000,
            default_ms: 1_000,
        }
    }
}

impl IntervalBounds {
    /// Swaps inverted bounds; the floor is at least 1 ms since a zero period
    /// cannot drive a timer.
    pub fn new(min_ms: u64, max_ms: u64, default_ms: u64) -> Self {
        let (min_ms, max_ms) = if min_ms <= max_ms {
            (min_ms, max_ms)
        } else {
            (max_ms, min_ms)
        };
        let (min_ms, max_ms) = (min_ms.max(1), max_ms.max(1));
        Self {
            min_ms,
            max_ms,
            default_ms: default_ms.clamp(min_ms, max_ms),
        }
    }

    /// Missing, unparsable or zero requests use the default; everything else is
    /// clamped into `[min_ms, max_ms]`. Only the leading integer counts, so
    /// `750ms` is 750 and `1500.5` is 1500.
    pub fn resolve(&self, requested: Option<&str>) -> Duration {
        let ms = match requested.and_then(leading_int) {
            None | Some(0) => self.default_ms,
            Some(n) if n < 0 => self.min_ms,
            Some(n) => (n as u64).clamp(self.min_ms, self.max_ms),
        };
        Duration::from_millis(ms)
    }
}

fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let n = digits[..end].bytes().fold(0i64, |acc, b| {
        acc.saturating_mul(10).saturating_add(i64::from(b - b'0'))
    });
    Some(if neg { -n } else { n })
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    pub db_path: PathBuf,
    pub intervals: IntervalBounds,
    pub gpu_enabled: bool,
    pub temp_enabled: bool,
    pub retention: Option<Duration>,
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            db_path: PathBuf::from("data").join("metrics.db"),
            intervals: IntervalBounds::default(),
            gpu_enabled: true,
            temp_enabled: true,
            retention: None,
            shutdown_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Result of reading argv: either run with overrides or print usage.
#[derive(Debug, PartialEq, Eq)]
pub enum ParsedArgs {
    Help,
    Run {
        port: Option<u16>,
        bind: Option<IpAddr>,
        db: Option<PathBuf>,
    },
}

pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let _ = it.next(); // program name
    let mut port: Option<String> = None;
    let mut bind: Option<String> = None;
    let mut db: Option<String> = None;
    while let Some(a) = it.next() {
        match a.as_str() {
            "-h" | "--help" => return Ok(ParsedArgs::Help),
            "--port" | "-p" => port = it.next(),
            "--bind" => bind = it.next(),
            "--db" => db = it.next(),
            _ if a.starts_with("--port=") => port = a.split_once('=').map(|(_, v)| v.to_string()),
            _ if a.starts_with("--bind=") => bind = a.split_once('=').map(|(_, v)| v.to_string()),
            _ if a.starts_with("--db=") => db = a.split_once('=').map(|(_, v)| v.to_string()),
            _ => return Err(format!("Unexpected argument: {a}\n{USAGE}")),
        }
    }
    let port = port
        .map(|p| p.parse::<u16>().map_err(|_| format!("Invalid port: {p}\n{USAGE}")))
        .transpose()?;
    let bind = bind
        .map(|b| b.parse::<IpAddr>().map_err(|_| format!("Invalid bind address: {b}\n{USAGE}")))
        .transpose()?;
    Ok(ParsedArgs::Run {
        port,
        bind,
        db: db.filter(|d| !d.is_empty()).map(PathBuf::from),
    })
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name).map(|v| v != "0").unwrap_or(default)
}

impl Config {
    /// Environment first, then CLI overrides.
    pub fn from_env(overrides: ParsedArgs) -> Self {
        let d = Config::default();
        let (port, bind, db) = match overrides {
            ParsedArgs::Run { port, bind, db } => (port, bind, db),
            ParsedArgs::Help => (None, None, None),
        };
        let d_iv = d.intervals;
        let intervals = IntervalBounds::new(
            env_u64("HOSTPULSE_MIN_INTERVAL_MS").unwrap_or(d_iv.min_ms),
            env_u64("HOSTPULSE_MAX_INTERVAL_MS").unwrap_or(d_iv.max_ms),
            env_u64("HOSTPULSE_DEFAULT_INTERVAL_MS").unwrap_or(d_iv.default_ms),
        );
        Self {
            bind: bind
                .or_else(|| std::env::var("HOSTPULSE_BIND").ok().and_then(|v| v.parse().ok()))
                .unwrap_or(d.bind),
            port: port
                .or_else(|| env_u64("HOSTPULSE_PORT").and_then(|p| u16::try_from(p).ok()))
                .unwrap_or(d.port),
            db_path: db
                .or_else(|| std::env::var_os("HOSTPULSE_DB").map(PathBuf::from))
                .unwrap_or(d.db_path),
            intervals,
            gpu_enabled: env_flag("HOSTPULSE_GPU", d.gpu_enabled),
            temp_enabled: env_flag("HOSTPULSE_TEMP", d.temp_enabled),
            retention: env_u64("HOSTPULSE_RETENTION_DAYS")
                .filter(|days| *days > 0)
                .map(|days| Duration::from_secs(days * 24 * 3600)),
            shutdown_timeout: env_u64("HOSTPULSE_SHUTDOWN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.shutdown_timeout),
        }
    }
}
