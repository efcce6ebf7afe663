use std::path::PathBuf;

use chrono::FixedOffset;

use crate::hours::{default_fallback_offset, LocalZone, DEFAULT_TIMEZONE};

/// Server settings, read from `SEATD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    /// `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub password: String,
    pub admins: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub timezone: String,
    pub tz_fallback: FixedOffset,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|s| s.trim().parse().ok())
        }

        Self {
            port: parsed(get("SEATD_PORT")).unwrap_or(5433),
            bind: get("SEATD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("SEATD_DATA_DIR").filter(|s| !s.trim().is_empty()).map(PathBuf::from),
            password: get("SEATD_PASSWORD").unwrap_or_else(|| "seatd".into()),
            admins: get("SEATD_ADMINS").unwrap_or_else(|| "admin".into()),
            max_connections: parsed(get("SEATD_MAX_CONNECTIONS")).unwrap_or(256),
            compact_threshold: parsed(get("SEATD_COMPACT_THRESHOLD")).unwrap_or(1000),
            timezone: get("SEATD_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.into()),
            tz_fallback: get("SEATD_TZ_FALLBACK_OFFSET")
                .as_deref()
                .and_then(parse_offset)
                .unwrap_or_else(default_fallback_offset),
            metrics_port: parsed(get("SEATD_METRICS_PORT")),
        }
    }

    pub fn zone(&self) -> LocalZone {
        LocalZone::resolve(&self.timezone, self.tz_fallback)
    }

    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("seatd.wal"))
    }
}

/// "+HH:MM" / "-HH:MM" / "Z".
pub fn parse_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (h, m) = rest.split_once(':')?;
    let (h, m): (i32, i32) = (h.parse().ok()?, m.parse().ok()?);
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}
