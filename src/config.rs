/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Line-oriented `key: value` configuration loader. Deliberately a simple
//! parser — richer config formats (YAML/TOML layering, includes) are out
//! of scope, not config loading itself.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::digest::HashAlgo;
use crate::error::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectAction {
    Reject,
    Tempfail,
    Discard,
    None,
}

impl RejectAction {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "tempfail" => Some(Self::Tempfail),
            "discard" => Some(Self::Discard),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    pub fn as_tracing_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// The raw `key -> value` map, one assignment per non-comment line. `#`
/// starts a full-line comment; `key: value` or `key=value` both accepted.
struct RawConfig {
    entries: HashMap<String, String>,
}

impl RawConfig {
    fn parse(contents: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for (lineno, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let sep_pos = line
                .find(':')
                .into_iter()
                .chain(line.find('='))
                .min()
                .ok_or_else(|| Status::Config(format!("line {}: missing ':' or '='", lineno + 1)))?;
            let key = line[..sep_pos].trim().to_ascii_lowercase();
            let value = line[sep_pos + 1..].trim().to_string();
            if key.is_empty() {
                return Err(Status::Config(format!("line {}: empty key", lineno + 1)));
            }
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                other => Err(Status::Config(format!("{key}: invalid bool {other:?}"))),
            },
        }
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// `K/k/M/m/G/g`-suffixed integers.
    fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => parse_scaled_u64(v).ok_or_else(|| Status::Config(format!("{key}: invalid integer {v:?}"))),
        }
    }

    fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        Ok(self.get_u64(key, default as u64)? as usize)
    }

    /// `s/m/h/d/w`-suffixed durations.
    fn get_duration(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => parse_duration(v).ok_or_else(|| Status::Config(format!("{key}: invalid duration {v:?}"))),
        }
    }
}

fn parse_scaled_u64(v: &str) -> Option<u64> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    let (digits, scale) = match v.chars().last().unwrap() {
        'K' | 'k' => (&v[..v.len() - 1], 1_000u64),
        'M' | 'm' => (&v[..v.len() - 1], 1_000_000u64),
        'G' | 'g' => (&v[..v.len() - 1], 1_000_000_000u64),
        _ => (v, 1u64),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * scale)
}

fn parse_duration(v: &str) -> Option<Duration> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    let (digits, unit) = match v.chars().last().unwrap() {
        's' => (&v[..v.len() - 1], 1u64),
        'm' => (&v[..v.len() - 1], 60u64),
        'h' => (&v[..v.len() - 1], 3600u64),
        'd' => (&v[..v.len() - 1], 86_400u64),
        'w' => (&v[..v.len() - 1], 604_800u64),
        _ => (v, 1u64),
    };
    digits.trim().parse::<u64>().ok().map(|n| Duration::from_secs(n * unit))
}

/// The parsed, typed configuration surface.
#[derive(Debug, Clone)]
pub struct Config {
    pub milter_socket: String,
    pub control_socket: String,
    pub authserv_id: String,

    pub resolver_pool_size: usize,
    pub resolver_timeout: Duration,
    pub resolver_retry_count: usize,

    pub spf_enable: bool,
    pub sender_id_enable: bool,
    pub dkim_enable: bool,
    pub dkim_adsp_enable: bool,
    pub dkim_atps_enable: bool,
    /// RFC 6541 pins this to sha1; the source accepts a configurable hash,
    /// so the key is honored but a non-sha1 value is warned on at context
    /// build time.
    pub dkim_atps_hash_algo: HashAlgo,
    pub dmarc_enable: bool,

    pub dkim_signheader_limit: usize,
    pub dkim_min_rsa_key_bits: usize,
    pub dkim_clock_skew: Duration,
    pub dkim_accept_expired: bool,
    pub dkim_accept_future: bool,
    pub rfc4871_compat: bool,

    pub dmarc_reject_action: RejectAction,
    pub dmarc_reject_reply_code: String,
    pub dmarc_reject_enhanced_status: String,
    pub dmarc_reject_message: String,

    pub public_suffix_list_path: Option<String>,

    /// Comma-separated CIDR blocks (or bare hosts) to bypass authentication
    /// for entirely. Parsed here as a flat string list;
    /// `ExclusionTree::parse` (`src/context.rs`) compiles it into the
    /// lookup structure the session consults at connect time.
    pub ip_exclusion: Vec<String>,

    pub context_lock_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,

    pub log_level: LogLevel,

    /// The path this config was loaded from, transplanted into reload
    /// candidates rather than re-derived from the new one.
    pub config_file: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Status::Config(format!("failed to read config {path:?}: {e}")))?;
        Self::parse(&contents, path.to_string_lossy().into_owned())
    }

    /// Parse an in-memory config snapshot without touching the filesystem.
    /// Exists for tests (unit tests in this crate and the black-box tests
    /// under `tests/`) that need a `Config` without a config file on disk.
    pub fn load_from_str_for_tests(contents: &str) -> Self {
        Self::parse(contents, "test.conf".into()).expect("valid test config")
    }

    fn parse(contents: &str, config_file: String) -> Result<Self> {
        let raw = RawConfig::parse(contents)?;

        let dmarc_enable = raw.get_bool("dmarc_enable", false)?;
        let cfg = Self {
            milter_socket: raw.get_string("milter_socket", "inet:8899@127.0.0.1"),
            control_socket: raw.get_string("control_socket", "/var/run/milter-authd/control.sock"),
            authserv_id: raw.get_string("authserv_id", "localhost"),

            resolver_pool_size: raw.get_usize("resolver_pool_size", 16)?,
            resolver_timeout: raw.get_duration("resolver_timeout", Duration::from_secs(5))?,
            resolver_retry_count: raw.get_usize("resolver_retry_count", 2)?,

            // DMARC needs SPF and DKIM results to align; enabling it implies them.
            spf_enable: raw.get_bool("spf_enable", true)? || dmarc_enable,
            sender_id_enable: raw.get_bool("sender_id_enable", false)?,
            dkim_enable: raw.get_bool("dkim_enable", true)? || dmarc_enable,
            dkim_adsp_enable: raw.get_bool("dkim_adsp_enable", false)?,
            dkim_atps_enable: raw.get_bool("dkim_atps_enable", false)?,
            dkim_atps_hash_algo: match raw.get("dkim_atps_hash_algo") {
                Some(v) => HashAlgo::parse(v).ok_or_else(|| Status::Config(format!("dkim_atps_hash_algo: invalid {v:?}")))?,
                None => HashAlgo::Sha1,
            },
            dmarc_enable,

            dkim_signheader_limit: raw.get_usize("dkim_signheader_limit", 5)?,
            dkim_min_rsa_key_bits: raw.get_usize("dkim_min_rsa_key_bits", 1024)?,
            dkim_clock_skew: raw.get_duration("dkim_clock_skew", Duration::from_secs(300))?,
            dkim_accept_expired: raw.get_bool("dkim_accept_expired", false)?,
            dkim_accept_future: raw.get_bool("dkim_accept_future", false)?,
            rfc4871_compat: raw.get_bool("rfc4871_compat", false)?,

            dmarc_reject_action: match raw.get("dmarc_reject_action") {
                Some(v) => RejectAction::parse(v)
                    .ok_or_else(|| Status::Config(format!("dmarc_reject_action: invalid {v:?}")))?,
                None => RejectAction::Reject,
            },
            dmarc_reject_reply_code: raw.get_string("dmarc_reject_reply_code", "550"),
            dmarc_reject_enhanced_status: raw.get_string("dmarc_reject_enhanced_status", "5.7.1"),
            dmarc_reject_message: raw.get_string("dmarc_reject_message", "Email rejected per DMARC policy"),

            public_suffix_list_path: raw.get("public_suffix_list_path").map(|s| s.to_string()),

            ip_exclusion: raw
                .get("ip_exclusion")
                .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),

            context_lock_timeout: raw.get_duration("context_lock_timeout", Duration::from_secs(60))?,
            graceful_shutdown_timeout: raw.get_duration("graceful_shutdown_timeout", Duration::from_secs(30))?,

            log_level: match raw.get("log_level") {
                Some(v) => LogLevel::parse(v).ok_or_else(|| Status::Config(format!("log_level: invalid {v:?}")))?,
                None => LogLevel::Info,
            },

            config_file,
        };

        if cfg.dmarc_enable && cfg.public_suffix_list_path.is_none() {
            return Err(Status::Config(
                "dmarc_enable is true but public_suffix_list_path is not set".into(),
            ));
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_values_with_suffixes() {
        let cfg = Config::parse(
            "authserv_id: mx.example.net\n\
             resolver_pool_size: 4\n\
             resolver_timeout: 10s\n\
             dkim_clock_skew: 5m\n\
             dkim_min_rsa_key_bits: 2K\n",
            "test.conf".into(),
        )
        .unwrap();
        assert_eq!(cfg.authserv_id, "mx.example.net");
        assert_eq!(cfg.resolver_pool_size, 4);
        assert_eq!(cfg.resolver_timeout, Duration::from_secs(10));
        assert_eq!(cfg.dkim_clock_skew, Duration::from_secs(300));
        assert_eq!(cfg.dkim_min_rsa_key_bits, 2000);
    }

    #[test]
    fn comment_and_blank_lines_are_ignored() {
        let cfg = Config::parse("# comment\n\n  \nauthserv_id: x\n", "t".into()).unwrap();
        assert_eq!(cfg.authserv_id, "x");
    }

    #[test]
    fn dmarc_enable_without_psl_path_is_a_config_error() {
        let err = Config::parse("dmarc_enable: true\n", "t".into()).unwrap_err();
        assert!(matches!(err, Status::Config(_)));
    }

    #[test]
    fn dmarc_enable_implies_spf_and_dkim() {
        let cfg = Config::parse(
            "dmarc_enable: true\npublic_suffix_list_path: /etc/psl.dat\nspf_enable: false\ndkim_enable: false\n",
            "t".into(),
        )
        .unwrap();
        assert!(cfg.spf_enable);
        assert!(cfg.dkim_enable);
    }

    #[test]
    fn invalid_bool_is_a_config_error() {
        let err = Config::parse("spf_enable: maybe\n", "t".into()).unwrap_err();
        assert!(matches!(err, Status::Config(_)));
    }

    #[test]
    fn atps_hash_algo_defaults_to_sha1() {
        let cfg = Config::parse("authserv_id: x\n", "t".into()).unwrap();
        assert_eq!(cfg.dkim_atps_hash_algo, HashAlgo::Sha1);
    }

    #[test]
    fn atps_hash_algo_accepts_sha256_override() {
        let cfg = Config::parse("dkim_atps_hash_algo: sha256\n", "t".into()).unwrap();
        assert_eq!(cfg.dkim_atps_hash_algo, HashAlgo::Sha256);
    }
}
