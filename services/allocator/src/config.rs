//! Service configuration, loaded from the environment.
//!
//! Domain durations have no defaults: the hold duration and the renewal
//! calendar are policy, so the service refuses to start without them.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use chrono_tz::Tz;
use thiserror::Error;

use crate::calendar::MonthDay;
use crate::engine::{EngineConfig, RenewalConfig};
use crate::intake::IntakeConfig;
use crate::jobs::{CLOSE_ASSIGNMENTS, EXPIRE_RESERVATIONS, OPEN_RENEWALS};
use crate::store::DbConfig;

/// Upper bound for hour settings: one year.
const MAX_HOURS: i64 = 366 * 24;
/// Upper bound for day settings: one year.
const MAX_DAYS: i64 = 366;
const MAX_POLL_MS: i64 = 3_600_000;
const MAX_BATCH: i64 = 10_000;
const MAX_DISPATCH_ATTEMPTS: i64 = 1_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: '{value}' ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Cron expressions per job id, six fields with seconds first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedules {
    pub expire_reservations: String,
    pub open_renewals: String,
    pub close_assignments: String,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            expire_reservations: "0 */1 * * * *".to_string(),
            open_renewals: "0 0 9 * * *".to_string(),
            close_assignments: "0 0 9 1 8 *".to_string(),
        }
    }
}

impl Schedules {
    pub fn for_job(&self, id: &str) -> Option<&str> {
        match id {
            EXPIRE_RESERVATIONS => Some(&self.expire_reservations),
            OPEN_RENEWALS => Some(&self.open_renewals),
            CLOSE_ASSIGNMENTS => Some(&self.close_assignments),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub engine: EngineConfig,
    pub schedules: Schedules,
    pub intake: IntakeConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any name-to-value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let renewal = RenewalConfig {
            open_date: env.required("SPINDIT_RENEWAL_OPEN_DATE")?,
            cycle_start: env.required("SPINDIT_CYCLE_START_DATE")?,
            deadline_offset: Duration::days(
                env.required_positive("SPINDIT_RENEWAL_DEADLINE_DAYS", MAX_DAYS)?,
            ),
            reminder_lead: env
                .optional_positive("SPINDIT_RENEWAL_REMINDER_DAYS", MAX_DAYS)?
                .map(Duration::days),
        };
        if renewal.open_date == renewal.cycle_start {
            return Err(ConfigError::Invalid {
                name: "SPINDIT_RENEWAL_OPEN_DATE",
                value: renewal.open_date.to_string(),
                reason: "must differ from SPINDIT_CYCLE_START_DATE".to_string(),
            });
        }

        let mut engine = EngineConfig::new(
            Duration::hours(env.required_positive("SPINDIT_HOLD_HOURS", MAX_HOURS)?),
            renewal,
        );
        if let Some(hours) = env.optional_positive("SPINDIT_HOLD_WARNING_HOURS", MAX_HOURS)? {
            engine = engine.with_hold_warning(Duration::hours(hours));
        }
        if let Some(retries) = env.optional::<u32>("SPINDIT_ALLOCATION_RETRIES")? {
            engine = engine.with_allocation_retries(retries);
        }
        if let Some(timezone) = env.optional::<Tz>("SPINDIT_TIMEZONE")? {
            engine = engine.with_timezone(timezone);
        }

        let defaults = Schedules::default();
        let schedules = Schedules {
            expire_reservations: env
                .raw("SPINDIT_CRON_EXPIRE")
                .unwrap_or(defaults.expire_reservations),
            open_renewals: env.raw("SPINDIT_CRON_OPEN").unwrap_or(defaults.open_renewals),
            close_assignments: env
                .raw("SPINDIT_CRON_CLOSE")
                .unwrap_or(defaults.close_assignments),
        };

        let mut intake = IntakeConfig::default();
        if let Some(ms) = env.optional_positive("SPINDIT_INTAKE_POLL_MS", MAX_POLL_MS)? {
            intake.poll_interval = StdDuration::from_millis(ms.unsigned_abs());
        }
        if let Some(batch) = env.optional_positive("SPINDIT_INTAKE_BATCH", MAX_BATCH)? {
            intake.batch_size = batch;
        }
        if let Some(attempts) =
            env.optional_positive("SPINDIT_INTAKE_MAX_ATTEMPTS", MAX_DISPATCH_ATTEMPTS)?
        {
            intake.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }

        let mut database = DbConfig::default();
        if let Some(url) = env.raw("DATABASE_URL") {
            database.database_url = url;
        }
        if let Some(max) = env.optional("DB_MAX_CONNECTIONS")? {
            database.max_connections = max;
        }
        if let Some(min) = env.optional("DB_MIN_CONNECTIONS")? {
            database.min_connections = min;
        }

        let log_level = env.raw("SPINDIT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let dev_mode = env
            .raw("SPINDIT_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            log_level,
            dev_mode,
            database,
            engine,
            schedules,
            intake,
        })
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    /// Trimmed value; blank counts as unset.
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn optional<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(name)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    name,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn required<T>(&self, name: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(name)?.ok_or(ConfigError::Missing(name))
    }

    /// A whole number in `1..=max`.
    fn optional_positive(&self, name: &'static str, max: i64) -> Result<Option<i64>, ConfigError> {
        match self.optional::<i64>(name)? {
            Some(n) if !(1..=max).contains(&n) => Err(ConfigError::Invalid {
                name,
                value: n.to_string(),
                reason: format!("must be between 1 and {max}"),
            }),
            other => Ok(other),
        }
    }

    fn required_positive(&self, name: &'static str, max: i64) -> Result<i64, ConfigError> {
        self.optional_positive(name, max)?
            .ok_or(ConfigError::Missing(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("SPINDIT_HOLD_HOURS", "48"),
        ("SPINDIT_RENEWAL_OPEN_DATE", "06-01"),
        ("SPINDIT_RENEWAL_DEADLINE_DAYS", "21"),
        ("SPINDIT_CYCLE_START_DATE", "08-01"),
    ];

    fn with(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend_from_slice(extra);
        pairs
    }

    #[test]
    fn required_settings_only() {
        let config = Config::from_lookup(lookup(REQUIRED)).unwrap();

        assert_eq!(config.engine.hold_duration, Duration::hours(48));
        assert_eq!(config.engine.hold_warning_lead, None);
        assert_eq!(config.engine.allocation_retries, 3);
        assert_eq!(config.engine.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(config.engine.renewal.open_date, MonthDay::new(6, 1).unwrap());
        assert_eq!(config.engine.renewal.cycle_start, MonthDay::new(8, 1).unwrap());
        assert_eq!(config.engine.renewal.deadline_offset, Duration::days(21));
        assert_eq!(config.schedules, Schedules::default());
        assert_eq!(config.log_level, "info");
        assert!(!config.dev_mode);
        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn each_domain_setting_is_required() {
        for (name, _) in REQUIRED {
            let pairs: Vec<_> = REQUIRED.iter().filter(|(k, _)| k != name).copied().collect();
            let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
            assert_eq!(err, ConfigError::Missing(*name));
        }
    }

    #[test]
    fn blank_counts_as_missing() {
        let mut pairs = REQUIRED.to_vec();
        pairs[0] = ("SPINDIT_HOLD_HOURS", "  ");
        assert_eq!(
            Config::from_lookup(lookup(&pairs)).unwrap_err(),
            ConfigError::Missing("SPINDIT_HOLD_HOURS")
        );
    }

    #[test]
    fn optional_settings_override_defaults() {
        let pairs = with(&[
            ("SPINDIT_HOLD_WARNING_HOURS", "6"),
            ("SPINDIT_RENEWAL_REMINDER_DAYS", "3"),
            ("SPINDIT_ALLOCATION_RETRIES", "5"),
            ("SPINDIT_TIMEZONE", "America/New_York"),
            ("SPINDIT_CRON_EXPIRE", "*/30 * * * * *"),
            ("SPINDIT_INTAKE_POLL_MS", "250"),
            ("SPINDIT_INTAKE_BATCH", "10"),
            ("SPINDIT_INTAKE_MAX_ATTEMPTS", "8"),
            ("SPINDIT_DEV", "true"),
            ("DATABASE_URL", "postgres://db/lockers"),
            ("DB_MAX_CONNECTIONS", "4"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.engine.hold_warning_lead, Some(Duration::hours(6)));
        assert_eq!(config.engine.renewal.reminder_lead, Some(Duration::days(3)));
        assert_eq!(config.engine.allocation_retries, 5);
        assert_eq!(config.engine.timezone, chrono_tz::America::New_York);
        assert_eq!(config.schedules.expire_reservations, "*/30 * * * * *");
        assert_eq!(config.schedules.for_job(OPEN_RENEWALS), Some("0 0 9 * * *"));
        assert_eq!(config.intake.poll_interval, StdDuration::from_millis(250));
        assert_eq!(config.intake.batch_size, 10);
        assert_eq!(config.intake.max_attempts, 8);
        assert!(config.dev_mode);
        assert_eq!(config.database.database_url, "postgres://db/lockers");
        assert_eq!(config.database.max_connections, 4);
    }

    #[test]
    fn rejects_bad_values() {
        let cases: &[(&'static str, &'static str)] = &[
            ("SPINDIT_HOLD_HOURS", "0"),
            ("SPINDIT_HOLD_HOURS", "two days"),
            ("SPINDIT_HOLD_HOURS", "10000000000"),
            ("SPINDIT_HOLD_WARNING_HOURS", "8785"),
            ("SPINDIT_RENEWAL_DEADLINE_DAYS", "367"),
            ("SPINDIT_RENEWAL_REMINDER_DAYS", "9223372036854775807"),
            ("SPINDIT_INTAKE_BATCH", "0"),
            ("SPINDIT_RENEWAL_OPEN_DATE", "06/01"),
            ("SPINDIT_TIMEZONE", "Mars/Olympus_Mons"),
            ("SPINDIT_ALLOCATION_RETRIES", "-1"),
        ];
        for (name, value) in cases {
            let mut pairs: Vec<_> = REQUIRED.iter().filter(|(k, _)| k != name).copied().collect();
            pairs.push((*name, *value));
            let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { name: n, .. } if n == *name),
                "{name}={value} gave {err:?}"
            );
        }
    }

    #[test]
    fn a_year_is_the_longest_accepted_duration() {
        let pairs = with(&[("SPINDIT_HOLD_WARNING_HOURS", "8784")]);
        let mut pairs: Vec<_> = pairs
            .into_iter()
            .filter(|(k, _)| *k != "SPINDIT_HOLD_HOURS" && *k != "SPINDIT_RENEWAL_DEADLINE_DAYS")
            .collect();
        pairs.push(("SPINDIT_HOLD_HOURS", "8784"));
        pairs.push(("SPINDIT_RENEWAL_DEADLINE_DAYS", "366"));

        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.engine.hold_duration, Duration::days(366));
        assert_eq!(config.engine.renewal.deadline_offset, Duration::days(366));
    }

    #[test]
    fn open_date_must_differ_from_cycle_start() {
        let mut pairs = REQUIRED.to_vec();
        pairs[1] = ("SPINDIT_RENEWAL_OPEN_DATE", "08-01");
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid { name: "SPINDIT_RENEWAL_OPEN_DATE", .. })
        ));
    }
}
