//! Scheduled ingestion - cron-driven saved queries
//!
//! A companion to the retrieval queue: each entry holds a validated cron
//! schedule and a saved process-search query. The tick task fires due
//! entries by enqueueing a `FetchQuery` job on `binary_retrieval`,
//! decrements finite repeat counts, and drops exhausted entries.

use crate::queue::{Enqueue, JobKind, QueueName, Queues};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How many times a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Forever,
    Times(u32),
}

#[derive(Debug, Clone)]
struct ScheduledIngest {
    schedule: Schedule,
    query: String,
    limit: Option<usize>,
    repeat: Repeat,
    next_run: DateTime<Utc>,
}

/// Registry of cron entries plus the tick loop that fires them.
pub struct Scheduler {
    queues: Arc<Queues>,
    entries: Mutex<HashMap<String, ScheduledIngest>>,
}

impl Scheduler {
    pub fn new(queues: Arc<Queues>) -> Self {
        Self {
            queues,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a cron-scheduled query. The expression is validated here;
    /// an invalid one never makes it onto the board.
    pub fn add(
        &self,
        cron_expr: &str,
        query: String,
        limit: Option<usize>,
        repeat: Repeat,
    ) -> anyhow::Result<String> {
        let schedule = parse_schedule(cron_expr)?;
        let next_run = schedule
            .upcoming(Utc)
            .next()
            .ok_or_else(|| anyhow::anyhow!("schedule {cron_expr} never fires"))?;

        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(job = %id, schedule = cron_expr, query = %query, "added scheduled query");
        self.entries.lock().unwrap().insert(
            id.clone(),
            ScheduledIngest {
                schedule,
                query,
                limit,
                repeat,
                next_run,
            },
        );
        Ok(id)
    }

    /// Cancel a schedule. Returns false if the id is unknown.
    pub fn cancel(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    /// Scheduled jobs with their next run time, soonest first. `None`
    /// means "forever": every entry is returned.
    pub fn jobs_until(&self, until: Option<DateTime<Utc>>) -> Vec<(String, DateTime<Utc>)> {
        let entries = self.entries.lock().unwrap();
        let mut jobs: Vec<(String, DateTime<Utc>)> = entries
            .iter()
            .filter(|(_, entry)| until.map(|t| entry.next_run <= t).unwrap_or(true))
            .map(|(id, entry)| (id.clone(), entry.next_run))
            .collect();
        jobs.sort_by_key(|(_, at)| *at);
        jobs
    }

    /// Fire everything due at `now`. Exposed for tests; the run loop calls
    /// it once a second.
    fn tick_at(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        let mut exhausted = Vec::new();

        for (id, entry) in entries.iter_mut() {
            if entry.next_run > now {
                continue;
            }

            tracing::debug!(job = %id, query = %entry.query, "firing scheduled query");
            self.queues.enqueue(
                QueueName::BinaryRetrieval,
                JobKind::FetchQuery {
                    query: entry.query.clone(),
                    limit: entry.limit,
                },
                Enqueue::default(),
            );

            match entry.repeat {
                Repeat::Times(1) => {
                    exhausted.push(id.clone());
                    continue;
                }
                Repeat::Times(n) => entry.repeat = Repeat::Times(n - 1),
                Repeat::Forever => {}
            }

            match entry.schedule.after(&now).next() {
                Some(next) => entry.next_run = next,
                None => exhausted.push(id.clone()),
            }
        }

        for id in exhausted {
            tracing::info!(job = %id, "schedule exhausted, removing");
            entries.remove(&id);
        }
    }

    /// The scheduler loop. Runs until the process exits.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            self.tick_at(Utc::now());
        }
    }
}

/// Parse a cron expression. Operators write classic 5-field expressions;
/// the cron crate wants a seconds column, so one is prepended.
fn parse_schedule(expr: &str) -> anyhow::Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| anyhow::anyhow!("invalid schedule {expr:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scheduler() -> (Arc<Queues>, Scheduler) {
        let queues = Arc::new(Queues::new());
        let sched = Scheduler::new(queues.clone());
        (queues, sched)
    }

    #[test]
    fn test_add_validates_expression() {
        let (_queues, sched) = scheduler();
        assert!(sched
            .add("*/5 * * * *", "process_name:evil.exe".into(), None, Repeat::Forever)
            .is_ok());
        assert!(sched
            .add("every five minutes", "q".into(), None, Repeat::Forever)
            .is_err());
    }

    #[test]
    fn test_cancel_and_contains() {
        let (_queues, sched) = scheduler();
        let id = sched
            .add("*/5 * * * *", "q".into(), None, Repeat::Forever)
            .unwrap();
        assert!(sched.contains(&id));
        assert!(sched.cancel(&id));
        assert!(!sched.contains(&id));
        assert!(!sched.cancel(&id));
    }

    #[test]
    fn test_finite_repeat_fires_then_disappears() {
        let (queues, sched) = scheduler();
        let id = sched
            .add("*/5 * * * *", "q".into(), Some(20), Repeat::Times(3))
            .unwrap();

        // Drive time forward past three consecutive fire times
        let mut now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for _ in 0..3 {
            now += chrono::Duration::minutes(5);
            // Force the entry due regardless of wall clock
            {
                let mut entries = sched.entries.lock().unwrap();
                entries.get_mut(&id).unwrap().next_run = now;
            }
            sched.tick_at(now);
        }

        assert!(!sched.contains(&id));
        // One FetchQuery enqueued per firing
        let fetches = queues
            .all_jobs()
            .into_iter()
            .filter(|j| matches!(j.kind, JobKind::FetchQuery { .. }))
            .count();
        assert_eq!(fetches, 3);
    }

    #[test]
    fn test_forever_repeat_survives_firing() {
        let (queues, sched) = scheduler();
        let id = sched
            .add("*/5 * * * *", "q".into(), None, Repeat::Forever)
            .unwrap();

        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();
        {
            let mut entries = sched.entries.lock().unwrap();
            entries.get_mut(&id).unwrap().next_run = now;
        }
        sched.tick_at(now);

        assert!(sched.contains(&id));
        assert_eq!(queues.all_jobs().len(), 1);
        // next_run advanced past `now`
        let next = sched.entries.lock().unwrap()[&id].next_run;
        assert!(next > now);
    }

    #[test]
    fn test_jobs_until_filters_and_sorts() {
        let (_queues, sched) = scheduler();
        let hourly = sched
            .add("0 * * * *", "a".into(), None, Repeat::Forever)
            .unwrap();
        let five = sched
            .add("*/5 * * * *", "b".into(), None, Repeat::Forever)
            .unwrap();

        let all = sched.jobs_until(None);
        assert_eq!(all.len(), 2);
        assert!(all[0].1 <= all[1].1);

        // A cutoff before every next_run returns nothing
        let past = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert!(sched.jobs_until(Some(past)).is_empty());

        // Sanity: both ids are present in the unfiltered listing
        let ids: Vec<&String> = all.iter().map(|(id, _)| id).collect();
        assert!(ids.contains(&&hourly) && ids.contains(&&five));
    }

    #[test]
    fn test_unfireable_entry_is_not_due_early() {
        let (queues, sched) = scheduler();
        sched
            .add("*/5 * * * *", "q".into(), None, Repeat::Times(1))
            .unwrap();
        // Nothing is due the instant after registration
        sched.tick_at(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
        assert!(queues.all_jobs().is_empty());
    }
}
