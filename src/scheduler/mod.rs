pub mod cron;
pub mod engine;

// Re-export common types
pub use self::cron::{DomainSchedule, PlannedRun, Scheduler, MAX_PREVIEW_HOURS};
pub use self::engine::spawn_scan_loops;
