//! Rotation schedules and deferred rotation jobs
//!
//! Jobs carry the version they expect to rotate. A job that fires after the
//! key already moved on is stale and the lifecycle manager skips it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FinguardResult;

/// Default rotation interval
pub const DEFAULT_ROTATION_INTERVAL_DAYS: i64 = 90;

/// Rotation plan for one key id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSchedule {
    pub key_id: String,
    pub current_version: u32,
    pub next_rotation_at: DateTime<Utc>,
    pub interval_days: i64,
    pub auto_rotate: bool,
}

impl RotationSchedule {
    pub fn interval(&self) -> Duration {
        Duration::days(self.interval_days)
    }
}

/// A deferred rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRotation {
    pub key_id: String,
    /// Version the key must still be at for the job to run
    pub expected_version: u32,
    pub due_at: DateTime<Utc>,
}

#[derive(Default)]
struct SchedulerState {
    schedules: BTreeMap<String, RotationSchedule>,
    jobs: Vec<ScheduledRotation>,
}

/// Holds schedules and pending rotation jobs
#[derive(Default)]
pub struct RotationScheduler {
    state: Mutex<SchedulerState>,
}

impl RotationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a schedule, replacing any pending job for its key id
    ///
    /// With `auto_rotate` a job is queued for `next_rotation_at`.
    pub fn schedule(&self, schedule: RotationSchedule) {
        let mut state = self.lock();
        state.jobs.retain(|job| job.key_id != schedule.key_id);
        if schedule.auto_rotate {
            state.jobs.push(ScheduledRotation {
                key_id: schedule.key_id.clone(),
                expected_version: schedule.current_version,
                due_at: schedule.next_rotation_at,
            });
        }
        state.schedules.insert(schedule.key_id.clone(), schedule);
    }

    /// Queue a rotation that is due immediately
    pub fn schedule_now(&self, key_id: &str, expected_version: u32, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.jobs.retain(|job| job.key_id != key_id);
        state.jobs.push(ScheduledRotation {
            key_id: key_id.to_string(),
            expected_version,
            due_at: now,
        });
    }

    /// Drain every job due at `now`, earliest first
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ScheduledRotation> {
        let mut state = self.lock();
        let (mut due, pending): (Vec<_>, Vec<_>) =
            state.jobs.drain(..).partition(|job| job.due_at <= now);
        state.jobs = pending;
        due.sort_by_key(|job| job.due_at);
        due
    }

    pub fn schedule_for(&self, key_id: &str) -> Option<RotationSchedule> {
        self.lock().schedules.get(key_id).cloned()
    }

    /// Every schedule, soonest rotation first
    pub fn upcoming(&self) -> Vec<RotationSchedule> {
        let mut schedules: Vec<_> = self.lock().schedules.values().cloned().collect();
        schedules.sort_by_key(|s| s.next_rotation_at);
        schedules
    }

    pub fn pending_jobs(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Forget a key id's schedule and jobs
    pub fn unschedule(&self, key_id: &str) {
        let mut state = self.lock();
        state.schedules.remove(key_id);
        state.jobs.retain(|job| job.key_id != key_id);
    }
}

/// Handle to a background ticker thread; stops it on drop
pub struct TickerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TickerHandle {
    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Call `tick` every `period` on a background thread
pub fn spawn_ticker<F>(period: std::time::Duration, mut tick: F) -> FinguardResult<TickerHandle>
where
    F: FnMut() + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);

    let thread = thread::Builder::new()
        .name("finguard-rotation".to_string())
        .spawn(move || loop {
            thread::park_timeout(period);
            if flag.load(Ordering::SeqCst) {
                break;
            }
            tick();
        })?;

    Ok(TickerHandle {
        stop,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn schedule(key_id: &str, version: u32, at: DateTime<Utc>, auto: bool) -> RotationSchedule {
        RotationSchedule {
            key_id: key_id.to_string(),
            current_version: version,
            next_rotation_at: at,
            interval_days: DEFAULT_ROTATION_INTERVAL_DAYS,
            auto_rotate: auto,
        }
    }

    #[test]
    fn test_due_drains_only_due_jobs() {
        let scheduler = RotationScheduler::new();
        let now = Utc::now();
        scheduler.schedule(schedule("default", 1, now - Duration::days(1), true));
        scheduler.schedule(schedule("documents", 4, now + Duration::days(10), true));

        let due = scheduler.due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key_id, "default");
        assert_eq!(due[0].expected_version, 1);

        assert!(scheduler.due(now).is_empty());
        assert_eq!(scheduler.pending_jobs(), 1);
    }

    #[test]
    fn test_manual_schedule_queues_nothing() {
        let scheduler = RotationScheduler::new();
        scheduler.schedule(schedule("default", 1, Utc::now(), false));
        assert_eq!(scheduler.pending_jobs(), 0);
        assert!(scheduler.schedule_for("default").is_some());
    }

    #[test]
    fn test_reschedule_replaces_job() {
        let scheduler = RotationScheduler::new();
        let now = Utc::now();
        scheduler.schedule(schedule("default", 1, now, true));
        scheduler.schedule(schedule("default", 2, now + Duration::days(90), true));

        assert_eq!(scheduler.pending_jobs(), 1);
        assert!(scheduler.due(now).is_empty());
        assert_eq!(scheduler.schedule_for("default").unwrap().current_version, 2);
    }

    #[test]
    fn test_schedule_now() {
        let scheduler = RotationScheduler::new();
        let now = Utc::now();
        scheduler.schedule(schedule("default", 1, now + Duration::days(30), true));
        scheduler.schedule_now("default", 1, now);

        let due = scheduler.due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(scheduler.pending_jobs(), 0);
    }

    #[test]
    fn test_upcoming_sorted() {
        let scheduler = RotationScheduler::new();
        let now = Utc::now();
        scheduler.schedule(schedule("b", 1, now + Duration::days(20), true));
        scheduler.schedule(schedule("a", 1, now + Duration::days(5), true));

        let upcoming = scheduler.upcoming();
        assert_eq!(upcoming[0].key_id, "a");
        assert_eq!(upcoming[1].key_id, "b");

        scheduler.unschedule("a");
        assert_eq!(scheduler.upcoming().len(), 1);
    }

    #[test]
    fn test_ticker_runs_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let mut handle = spawn_ticker(std::time::Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        handle.stop();
        assert!(!handle.is_running());

        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }
}
