use crate::detect::engine::ScanEngine;
use crate::scheduler::{DomainSchedule, Scheduler};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Scan loop for one domain: sleep until the next tick, scan, repeat.
/// Domains never share a loop, so a slow scan only delays its own domain.
pub async fn run_domain_loop(engine: ScanEngine, schedule: DomainSchedule) {
    info!(domain = %schedule.domain, cadence = %schedule.cron_expr, "scan loop started");

    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            warn!(domain = %schedule.domain, "cadence has no future ticks, stopping loop");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        match engine.run_scan(schedule.domain).await {
            Ok(report) => info!(
                domain = %schedule.domain,
                created = report.signals_created,
                refreshed = report.signals_refreshed,
                "scheduled scan finished"
            ),
            Err(e) => error!(domain = %schedule.domain, "scheduled scan failed: {:#}", e),
        }
    }
}

/// Spawn one background loop per domain.
pub fn spawn_scan_loops(scheduler: &Scheduler, engine: &ScanEngine) -> Vec<JoinHandle<()>> {
    scheduler
        .schedules()
        .iter()
        .cloned()
        .map(|schedule| tokio::spawn(run_domain_loop(engine.clone(), schedule)))
        .collect()
}
