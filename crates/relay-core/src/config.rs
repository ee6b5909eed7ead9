use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;

/// Configuration for the scheduling engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently running worker activities.
    pub worker_pool_size: usize,
    /// How often the schedule source checks for due triggers.
    pub tick_interval: Duration,
    /// How often the recovery sweeper scans for orphaned executions.
    pub sweeper_interval: Duration,
    /// Missed fires older than this are coalesced away instead of fired.
    pub misfire_grace: Duration,
    /// Wall-clock budget for script commands without `timeout_seconds`.
    pub default_command_timeout: Duration,
    /// Directory commands run in when their first token does not name an
    /// existing file. Embedders deployed outside the project tree (a
    /// supervisor, cron, `WorkingDirectory=`) should set this to the
    /// project root; the default is the process working directory at
    /// config construction.
    pub project_root: PathBuf,
    /// Hard cap on persisted `result_json`, in characters.
    pub max_result_chars: usize,
    /// Timezone cron expressions are evaluated in. Fixed for the lifetime
    /// of the engine.
    pub timezone: FixedOffset,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            tick_interval: Duration::from_secs(1),
            sweeper_interval: Duration::from_secs(60),
            misfire_grace: Duration::from_secs(300),
            default_command_timeout: Duration::from_secs(3600),
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            max_result_chars: relay_db::compact::DEFAULT_MAX_RESULT_CHARS,
            timezone: FixedOffset::east_opt(0).expect("UTC offset is valid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.worker_pool_size, 10);
        assert_eq!(cfg.sweeper_interval, Duration::from_secs(60));
        assert_eq!(cfg.misfire_grace, Duration::from_secs(300));
        assert_eq!(cfg.default_command_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.max_result_chars, 60_000);
        assert_eq!(cfg.timezone.local_minus_utc(), 0);
        assert_eq!(cfg.project_root, std::env::current_dir().unwrap());
    }

    #[test]
    fn project_root_is_an_explicit_knob() {
        let cfg = SchedulerConfig {
            project_root: PathBuf::from("/srv/relay"),
            ..Default::default()
        };
        assert_eq!(cfg.project_root, PathBuf::from("/srv/relay"));
    }
}
