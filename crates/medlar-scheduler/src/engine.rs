//! Schedule tick engine — turns due cron schedules into task instances.
//!
//! Each tick: prime fresh schedules, query due ones, apply the overlap
//! policy against live instances, deep-copy the template, advance
//! `next_run_at` in the schedule's timezone.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use medlar_core::config::MedlarConfig;
use medlar_core::error::Result;
use medlar_core::traits::TaskStore;
use medlar_core::types::{OverlapPolicy, Schedule};

use crate::cron::CronExpr;

/// The scheduler — stateless between ticks; the store owns everything.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    config: Arc<MedlarConfig>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, config: Arc<MedlarConfig>) -> Self {
        Self { store, config }
    }

    /// One pass over due schedules. Returns ids of tasks instantiated.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        self.prime_schedules(now).await?;

        // Backpressure: warn and continue — never drop scheduled work.
        let depth = self.store.ready_queue_depth(now).await?;
        if depth > self.config.engine.ready_queue_warn_depth {
            tracing::warn!(
                "ready queue depth {depth} exceeds threshold {} — scheduler continuing",
                self.config.engine.ready_queue_warn_depth
            );
        }

        let due = self.store.list_due_schedules(now).await?;
        let mut instantiated = Vec::new();
        for schedule in due {
            match self.fire(&schedule, now).await {
                Ok(Some(task_id)) => instantiated.push(task_id),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("schedule {} fire failed: {e}", schedule.id);
                }
            }
        }
        Ok(instantiated)
    }

    /// Fire one due schedule. Returns the new task id, or None when the
    /// overlap policy dropped the tick.
    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<i64>> {
        let active = self.store.count_active_instances(schedule.id).await?;

        let spawn = match schedule.overlap_policy {
            OverlapPolicy::Skip => {
                if active >= schedule.max_instances {
                    tracing::info!(
                        "schedule {}: {active} active instance(s), skipping tick",
                        schedule.id
                    );
                    false
                } else {
                    true
                }
            }
            OverlapPolicy::Queue => true,
            OverlapPolicy::Replace => {
                if active > 0 {
                    let cancelled = self.store.cancel_active_instances(schedule.id).await?;
                    tracing::info!(
                        "schedule {}: replaced {cancelled} active instance(s)",
                        schedule.id
                    );
                }
                true
            }
        };

        let task_id = if spawn {
            let id = self.store.instantiate_template(schedule).await?;
            tracing::info!(
                "schedule {} fired: task {id} from template {}",
                schedule.id,
                schedule.template_task_id
            );
            Some(id)
        } else {
            None
        };

        // Advance bookkeeping whether or not the tick spawned work.
        let next = self.next_run(schedule, now);
        self.store
            .update_schedule_run(schedule.id, next, now)
            .await?;
        Ok(task_id)
    }

    /// Initialize `next_run_at` for schedules that have never been primed.
    async fn prime_schedules(&self, now: DateTime<Utc>) -> Result<()> {
        for schedule in self.store.list_schedules().await? {
            if schedule.enabled && schedule.next_run_at.is_none() {
                if let Some(next) = self.next_run(&schedule, now) {
                    self.store
                        .set_schedule_next_run(schedule.id, Some(next))
                        .await?;
                    tracing::debug!("schedule {} primed for {next}", schedule.id);
                } else {
                    tracing::warn!(
                        "schedule {}: expression '{}' has no future fire time",
                        schedule.id,
                        schedule.cron_expression
                    );
                }
            }
        }
        Ok(())
    }

    fn next_run(&self, schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz = Tz::from_str(&schedule.timezone).unwrap_or_else(|_| {
            tracing::warn!(
                "schedule {}: unknown timezone '{}', using UTC",
                schedule.id,
                schedule.timezone
            );
            Tz::UTC
        });
        match CronExpr::parse(&schedule.cron_expression) {
            Ok(expr) => expr.next_execution(now, tz),
            Err(e) => {
                tracing::error!("schedule {}: {e}", schedule.id);
                None
            }
        }
    }
}

/// Run the scheduler as a background loop until cancelled.
pub async fn spawn_scheduler(scheduler: Arc<Scheduler>, cancel: CancellationToken, tick_secs: u64) {
    tracing::info!("scheduler started (tick every {tick_secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => {
                tracing::info!("scheduler stopped");
                return;
            }
        }
        if let Err(e) = scheduler.tick(Utc::now()).await {
            tracing::error!("scheduler tick failed: {e}");
        }
    }
}
