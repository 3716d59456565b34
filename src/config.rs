use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;

use crate::constants::{
    DEFAULT_MAX_RETRIES, DEFAULT_PROXY_USE_IPV4, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_TZ_OFFSET_HOURS, DEFAULT_UPSTREAM_TIMEOUT_SECS, SESSION_RENEWAL_THRESHOLD_DAYS,
    SESSION_TTL_DAYS,
};

/// CORS configuration mode. The admin surface this gates is a minimal
/// stand-in, not a design subject in its own right.
#[derive(Debug, Clone)]
pub enum CorsMode {
    LocalhostOnly,
    AllowAll,
    AllowList(Vec<String>),
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub admin_username: String,
    pub admin_password: String,
    pub cors_mode: CorsMode,
    pub disable_auth: bool,

    /// Process-wide secret mixed into API-key fingerprints and used to
    /// derive the at-rest encryption key.
    pub process_secret: String,

    pub upstream_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub session_ttl_days: i64,
    pub session_renewal_threshold_days: i64,
    pub max_retries: u32,
    pub proxy_use_ipv4_default: bool,
    /// Fixed UTC offset in hours, range [-12, 14].
    pub tz_offset_hours: i32,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("RELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4096);

        let data_dir = env::var("RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let disable_auth = env::var("RELAY_DISABLE_ADMIN_AUTH")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let admin_username = if disable_auth {
            env::var("RELAY_ADMIN_USERNAME").unwrap_or_default()
        } else {
            env::var("RELAY_ADMIN_USERNAME").expect("RELAY_ADMIN_USERNAME must be set")
        };
        let admin_password = if disable_auth {
            env::var("RELAY_ADMIN_PASSWORD").unwrap_or_default()
        } else {
            env::var("RELAY_ADMIN_PASSWORD").expect("RELAY_ADMIN_PASSWORD must be set")
        };

        let process_secret = env::var("RELAY_PROCESS_SECRET")
            .expect("RELAY_PROCESS_SECRET must be set (used to fingerprint and encrypt secrets)");

        let cors_mode = match env::var("RELAY_CORS_ORIGINS").as_deref() {
            Ok("*") => CorsMode::AllowAll,
            Ok(origins) if !origins.is_empty() => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => CorsMode::LocalhostOnly,
        };

        let upstream_timeout_secs = env::var("RELAY_UPSTREAM_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|ms| ms / 1000)
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);

        let request_timeout_secs = env::var("RELAY_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|ms| ms / 1000)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        let max_retries = env::var("RELAY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let proxy_use_ipv4_default = env::var("PROXY_USE_IPV4")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(DEFAULT_PROXY_USE_IPV4);

        let tz_offset_hours = env::var("RELAY_TZ_OFFSET_HOURS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .map(|v| v.clamp(-12, 14))
            .unwrap_or(DEFAULT_TZ_OFFSET_HOURS);

        Self {
            host,
            port,
            data_dir,
            admin_username,
            admin_password,
            cors_mode,
            disable_auth,
            process_secret,
            upstream_timeout_secs,
            request_timeout_secs,
            session_ttl_days: SESSION_TTL_DAYS,
            session_renewal_threshold_days: SESSION_RENEWAL_THRESHOLD_DAYS,
            max_retries,
            proxy_use_ipv4_default,
            tz_offset_hours,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("relay.db")
    }
}
