//! The schedule source: turns cron and interval triggers into fire events
//! for the dispatcher.
//!
//! A fire never starts work by itself; it only signals the dispatcher. The
//! in-memory entry map is kept in sync with the store by the facade on
//! every task mutation, and the tick loop compares due times against the
//! wall clock. Missed fires coalesce: a task that is overdue produces at
//! most one fire (none at all past the misfire grace), and its next due
//! time always advances past now.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_db::models::{Task, TaskKind};

use crate::config::SchedulerConfig;
use crate::cron::{next_fire_after, parse_cron_expression};
use crate::error::{EngineError, EngineResult};

/// A due-time event: a request that the dispatcher start `task_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fire {
    pub task_id: i64,
    pub due_at: DateTime<Utc>,
}

enum Trigger {
    Cron(CronSchedule),
    Interval(ChronoDuration),
}

struct ScheduleEntry {
    trigger: Trigger,
    next_due: DateTime<Utc>,
    paused: bool,
}

/// Produces timely fires for every enabled, non-paused scheduled task.
pub struct ScheduleSource {
    entries: Mutex<HashMap<i64, ScheduleEntry>>,
    fires: mpsc::Sender<Fire>,
    config: SchedulerConfig,
}

impl ScheduleSource {
    pub fn new(config: SchedulerConfig, fires: mpsc::Sender<Fire>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fires,
            config,
        }
    }

    /// Register (or replace) a task's trigger. Replacement is atomic under
    /// the entry lock, so a schedule update cannot double-fire.
    ///
    /// Manual tasks are never scheduled and are accepted as a no-op.
    pub fn add_task(&self, task: &Task) -> EngineResult<()> {
        if task.kind == TaskKind::Manual {
            debug!(task_id = task.id, "manual task not entered into schedule source");
            return Ok(());
        }

        let now = Utc::now();
        let (trigger, next_due) = self.build_trigger(task, now)?;

        let mut entries = self.entries.lock().expect("schedule entries poisoned");
        entries.insert(
            task.id,
            ScheduleEntry {
                trigger,
                next_due,
                paused: task.paused,
            },
        );
        info!(
            task_id = task.id,
            task = %task.name,
            next_due = %next_due,
            paused = task.paused,
            "task entered into schedule source"
        );
        Ok(())
    }

    /// Remove a task's trigger (disable/delete path).
    pub fn remove_task(&self, task_id: i64) {
        let removed = self
            .entries
            .lock()
            .expect("schedule entries poisoned")
            .remove(&task_id)
            .is_some();
        if removed {
            info!(task_id, "task removed from schedule source");
        }
    }

    /// Suppress or re-allow fires for a task. Un-pausing recomputes the due
    /// time from now so the paused stretch does not replay as a backlog.
    pub fn set_paused(&self, task_id: i64, paused: bool) {
        let mut entries = self.entries.lock().expect("schedule entries poisoned");
        if let Some(entry) = entries.get_mut(&task_id) {
            entry.paused = paused;
            if !paused {
                let now = Utc::now();
                if let Some(next_due) = Self::advance(&entry.trigger, now, &self.config) {
                    entry.next_due = next_due;
                }
            }
            info!(task_id, paused, "schedule entry pause flag updated");
        }
    }

    /// Is this task currently registered?
    pub fn contains(&self, task_id: i64) -> bool {
        self.entries
            .lock()
            .expect("schedule entries poisoned")
            .contains_key(&task_id)
    }

    /// The tick loop: check for due entries and forward fires until
    /// shutdown or the dispatcher hangs up.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        info!("schedule source started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for fire in self.collect_due(Utc::now()) {
                        if self.fires.send(fire).await.is_err() {
                            warn!("dispatcher channel closed, stopping schedule source");
                            return;
                        }
                    }
                }
            }
        }
        info!("schedule source stopped");
    }

    /// Collect at most one fire per due entry and advance every due entry
    /// past `now`. Overdue entries beyond the misfire grace advance
    /// silently (the missed fire is coalesced away).
    pub(crate) fn collect_due(&self, now: DateTime<Utc>) -> Vec<Fire> {
        let mut fires = Vec::new();
        let mut exhausted = Vec::new();

        let mut entries = self.entries.lock().expect("schedule entries poisoned");
        for (&task_id, entry) in entries.iter_mut() {
            if entry.paused || entry.next_due > now {
                continue;
            }

            let overdue = now - entry.next_due;
            if overdue <= ChronoDuration::from_std(self.config.misfire_grace).unwrap_or_default()
            {
                fires.push(Fire {
                    task_id,
                    due_at: entry.next_due,
                });
            } else {
                warn!(
                    task_id,
                    overdue_secs = overdue.num_seconds(),
                    "missed fire beyond grace, coalescing away"
                );
            }

            match Self::advance(&entry.trigger, now, &self.config) {
                Some(next_due) => entry.next_due = next_due,
                None => {
                    warn!(task_id, "trigger has no future fire, dropping entry");
                    exhausted.push(task_id);
                }
            }
        }
        for task_id in exhausted {
            entries.remove(&task_id);
        }

        fires
    }

    /// The first due time strictly after `now` for a trigger.
    fn advance(
        trigger: &Trigger,
        now: DateTime<Utc>,
        config: &SchedulerConfig,
    ) -> Option<DateTime<Utc>> {
        match trigger {
            Trigger::Cron(schedule) => next_fire_after(schedule, now, &config.timezone),
            Trigger::Interval(interval) => Some(now + *interval),
        }
    }

    fn build_trigger(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> EngineResult<(Trigger, DateTime<Utc>)> {
        if let Some(expr) = &task.cron_expression {
            let schedule = parse_cron_expression(expr)?;
            let first = next_fire_after(&schedule, now, &self.config.timezone).ok_or_else(|| {
                EngineError::Validation(format!("cron expression {expr:?} never fires"))
            })?;
            Ok((Trigger::Cron(schedule), first))
        } else if let Some(secs) = task.interval_seconds {
            if secs < 1 {
                return Err(EngineError::Validation(
                    "interval_seconds must be at least 1".to_string(),
                ));
            }
            let interval = ChronoDuration::seconds(secs);
            Ok((Trigger::Interval(interval), now + interval))
        } else {
            Err(EngineError::Validation(format!(
                "task {:?} has no cron or interval schedule",
                task.name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source() -> ScheduleSource {
        let (tx, _rx) = mpsc::channel(8);
        ScheduleSource::new(SchedulerConfig::default(), tx)
    }

    fn interval_task(id: i64, secs: i64) -> Task {
        let now = Utc::now();
        Task {
            id,
            name: format!("task-{id}"),
            job_id: format!("common_task-{id}_test"),
            kind: TaskKind::Common,
            cron_expression: None,
            interval_seconds: Some(secs),
            enabled: true,
            paused: false,
            description: None,
            config_json: None,
            max_retries: 0,
            retry_interval: 60,
            created_by: None,
            created_time: now,
            updated_by: None,
            updated_time: now,
        }
    }

    #[test]
    fn manual_tasks_are_not_scheduled() {
        let src = source();
        let mut task = interval_task(1, 10);
        task.kind = TaskKind::Manual;
        task.interval_seconds = None;
        src.add_task(&task).unwrap();
        assert!(!src.contains(1));
    }

    #[test]
    fn tasks_without_schedule_are_rejected() {
        let src = source();
        let mut task = interval_task(1, 10);
        task.interval_seconds = None;
        assert!(src.add_task(&task).is_err());
    }

    #[test]
    fn interval_fires_once_per_period() {
        let src = source();
        src.add_task(&interval_task(1, 60)).unwrap();

        let now = Utc::now();
        // Not yet due.
        assert!(src.collect_due(now + ChronoDuration::seconds(30)).is_empty());

        // Due once after the interval elapses, then re-armed.
        let fires = src.collect_due(now + ChronoDuration::seconds(61));
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].task_id, 1);
        assert!(src.collect_due(now + ChronoDuration::seconds(62)).is_empty());
    }

    #[test]
    fn overdue_within_grace_coalesces_to_one_fire() {
        let src = source();
        src.add_task(&interval_task(1, 60)).unwrap();

        // Several periods pass unobserved, but still inside the grace.
        let late = Utc::now() + ChronoDuration::seconds(60 * 4);
        let fires = src.collect_due(late);
        assert_eq!(fires.len(), 1);

        // And the entry advanced past `late`, so no immediate replay.
        assert!(src.collect_due(late + ChronoDuration::seconds(1)).is_empty());
    }

    #[test]
    fn overdue_beyond_grace_fires_nothing() {
        let (tx, _rx) = mpsc::channel(8);
        let config = SchedulerConfig {
            misfire_grace: Duration::from_secs(300),
            ..Default::default()
        };
        let src = ScheduleSource::new(config, tx);
        src.add_task(&interval_task(1, 60)).unwrap();

        let much_later = Utc::now() + ChronoDuration::seconds(3600);
        assert!(src.collect_due(much_later).is_empty());

        // Re-armed relative to the late observation.
        let fires = src.collect_due(much_later + ChronoDuration::seconds(61));
        assert_eq!(fires.len(), 1);
    }

    #[test]
    fn paused_entries_do_not_fire() {
        let src = source();
        src.add_task(&interval_task(1, 60)).unwrap();
        src.set_paused(1, true);

        let late = Utc::now() + ChronoDuration::seconds(120);
        assert!(src.collect_due(late).is_empty());

        // Un-pausing re-arms from now rather than replaying the backlog.
        src.set_paused(1, false);
        assert!(src.collect_due(Utc::now() + ChronoDuration::seconds(1)).is_empty());
    }

    #[test]
    fn removed_entries_stop_firing() {
        let src = source();
        src.add_task(&interval_task(1, 60)).unwrap();
        src.remove_task(1);
        assert!(src.collect_due(Utc::now() + ChronoDuration::seconds(120)).is_empty());
    }

    #[test]
    fn replacing_a_trigger_is_atomic() {
        let src = source();
        src.add_task(&interval_task(1, 60)).unwrap();

        // Same task, new interval: the old trigger is gone.
        src.add_task(&interval_task(1, 3600)).unwrap();
        assert!(src.collect_due(Utc::now() + ChronoDuration::seconds(120)).is_empty());
        assert_eq!(src.collect_due(Utc::now() + ChronoDuration::seconds(3601)).len(), 1);
    }

    #[test]
    fn cron_entry_fires_at_the_cron_minute() {
        let src = source();
        let mut task = interval_task(1, 0);
        task.interval_seconds = None;
        task.cron_expression = Some("*/5 * * * *".to_string());
        src.add_task(&task).unwrap();

        // Within the next five minutes there is exactly one boundary.
        let fires = src.collect_due(Utc::now() + ChronoDuration::seconds(300));
        assert_eq!(fires.len(), 1);
    }
}
