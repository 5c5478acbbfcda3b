use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use serde::Serialize;

use crate::config::SkywatchConfig;
use crate::observation::Domain;

/// Longest dry-run window accepted.
pub const MAX_PREVIEW_HOURS: u64 = 24 * 31;

/// One domain's scan cadence.
#[derive(Debug, Clone)]
pub struct DomainSchedule {
    pub domain: Domain,
    pub cron_expr: String,
    schedule: CronSchedule,
}

impl DomainSchedule {
    pub fn new(domain: Domain, cron_expr: &str) -> Result<Self> {
        let schedule = CronSchedule::from_str(cron_expr)
            .map_err(|e| anyhow!("Invalid cron expression '{}' for {}: {}", cron_expr, domain, e))?;
        Ok(Self {
            domain,
            cron_expr: cron_expr.to_string(),
            schedule,
        })
    }

    /// First tick strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

/// A planned scan, as shown by the dry-run preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub domain: Domain,
}

/// Cadences for every domain, validated up front.
#[derive(Debug, Clone)]
pub struct Scheduler {
    schedules: Vec<DomainSchedule>,
}

impl Scheduler {
    pub fn from_config(config: &SkywatchConfig) -> Result<Self> {
        let schedules = Domain::ALL
            .iter()
            .map(|d| DomainSchedule::new(*d, &config.domain(*d).cadence))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { schedules })
    }

    pub fn schedules(&self) -> &[DomainSchedule] {
        &self.schedules
    }

    /// Every scan due in the next `hours` after `from`, in time order.
    /// This is strictly a dry-run preview, not the execution loop.
    /// `hours` is capped at [`MAX_PREVIEW_HOURS`].
    pub fn preview_next_runs(&self, from: DateTime<Utc>, hours: u64) -> Vec<PlannedRun> {
        let end = from + Duration::hours(hours.min(MAX_PREVIEW_HOURS) as i64);
        let mut preview = Vec::new();
        for s in &self.schedules {
            for at in s.schedule.after(&from) {
                if at > end {
                    break;
                }
                preview.push(PlannedRun { at, domain: s.domain });
            }
        }
        preview.sort_by(|a, b| a.at.cmp(&b.at).then(a.domain.cmp(&b.domain)));
        preview
    }
}
