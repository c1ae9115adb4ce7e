use anyhow::{Context, Result};
use std::time::Duration;

use crate::cli::Args;

/// Runtime configuration, assembled from CLI flags with environment-variable
/// fallbacks for the handful of settings an operator might want to pin in a
/// unit file rather than a command line (mirrors this codebase's env-first
/// configuration style, scaled down to what a single-job replay tool needs).
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub db_url: String,
    pub confile: Option<std::path::PathBuf>,
    pub slist: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub step: Duration,
    pub window: Duration,
    pub speed: f64,
    pub batch_size: usize,
    pub output: String,
    pub http_addr: Option<String>,
    pub control_timeout: Duration,
    pub show_range: bool,
}

impl ReplayConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        if args.step <= 0.0 {
            anyhow::bail!("--step must be greater than zero");
        }
        if args.window <= 0.0 {
            anyhow::bail!("--window must be greater than zero");
        }
        if args.speed <= 0.0 {
            anyhow::bail!("--speed must be greater than zero");
        }
        if args.batch_size == 0 {
            anyhow::bail!("--batch-size must be greater than zero");
        }

        let db_url = env_override("TIMEREPLAY_DB", args.db);
        let http_addr = args
            .http_addr
            .or_else(|| std::env::var("TIMEREPLAY_HTTP_ADDR").ok());

        Ok(Self {
            db_url,
            confile: args.confile,
            slist: args.slist,
            from: args.from,
            to: args.to,
            step: Duration::from_secs_f64(args.step),
            window: Duration::from_secs_f64(args.window),
            speed: args.speed,
            batch_size: args.batch_size,
            output: args.output,
            http_addr,
            control_timeout: Duration::from_secs(args.control_timeout),
            show_range: args.show_range,
        })
    }
}

fn env_override(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

/// Parses an RFC3339 timestamp, producing an error message an operator can act on.
pub fn parse_timestamp(label: &str, value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .with_context(|| format!("{label} is not a valid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            db: "memory".to_string(),
            confile: None,
            slist: "ALL".to_string(),
            from: None,
            to: None,
            step: 1.0,
            window: 60.0,
            speed: 1.0,
            batch_size: 256,
            output: "stdout".to_string(),
            http_addr: None,
            control_timeout: 30,
            show_range: false,
        }
    }

    #[test]
    fn rejects_non_positive_step() {
        let mut args = base_args();
        args.step = 0.0;
        assert!(ReplayConfig::from_args(args).is_err());
    }

    #[test]
    fn rejects_non_positive_speed() {
        let mut args = base_args();
        args.speed = -1.0;
        assert!(ReplayConfig::from_args(args).is_err());
    }

    #[test]
    fn accepts_minimal_args() {
        let config = ReplayConfig::from_args(base_args()).unwrap();
        assert_eq!(config.db_url, "memory");
        assert_eq!(config.batch_size, 256);
    }

    #[test]
    fn parses_valid_timestamp() {
        let ts = parse_timestamp("from", "2024-06-01T00:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-06-01T00:00:00+00:00");
    }

    #[test]
    fn rejects_invalid_timestamp() {
        assert!(parse_timestamp("from", "not-a-date").is_err());
    }
}
