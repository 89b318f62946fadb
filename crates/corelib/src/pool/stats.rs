//! Per-task-class execution statistics.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::error;

#[derive(Default)]
struct StatsEntry {
    active: usize,
    max_parallel: usize,
    completed: u64,
    panics: u64,
    total_time: Duration,
    max_normal_time: Duration,
}

/// Point-in-time copy of one task class's counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskStatsSnapshot {
    pub description: &'static str,
    pub active: usize,
    pub max_parallel: usize,
    pub completed: u64,
    pub panics: u64,
    pub total_time: Duration,
    pub max_normal_time: Duration,
}

impl TaskStatsSnapshot {
    pub fn average_time(&self) -> Option<Duration> {
        if self.completed == 0 {
            return None;
        }
        let nanos = self.total_time.as_nanos() / u128::from(self.completed);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

/// Statistics keyed by task description.
#[derive(Default)]
pub struct TaskStatistics {
    entries: Mutex<HashMap<&'static str, StatsEntry>>,
}

impl TaskStatistics {
    /// Run `task`, recording its duration and catching panics.
    ///
    /// Returns the task's result, or the panic payload.
    pub(crate) fn run_tracked<T>(&self, description: &'static str, task: impl FnOnce() -> T) -> std::thread::Result<T> {
        {
            let mut entries = self.entries.lock();
            let entry = entries.entry(description).or_default();
            entry.active += 1;
            entry.max_parallel = entry.max_parallel.max(entry.active);
        }

        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(task));
        let elapsed = start.elapsed();

        let mut entries = self.entries.lock();
        let entry = entries.entry(description).or_default();
        entry.active -= 1;
        entry.completed += 1;
        entry.total_time += elapsed;
        match &result {
            Ok(_) => entry.max_normal_time = entry.max_normal_time.max(elapsed),
            Err(payload) => {
                entry.panics += 1;
                error!(task = description, panic = %panic_message(payload.as_ref()), "Pool task panicked");
            }
        }
        result
    }

    pub fn snapshot(&self, description: &str) -> Option<TaskStatsSnapshot> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|(key, _)| **key == description)
            .map(|(key, entry)| to_snapshot(key, entry))
    }

    /// All entries, sorted by description.
    pub fn snapshots(&self) -> Vec<TaskStatsSnapshot> {
        let entries = self.entries.lock();
        let mut result: Vec<_> = entries.iter().map(|(key, entry)| to_snapshot(key, entry)).collect();
        result.sort_by(|a, b| a.description.cmp(b.description));
        result
    }

    /// Human-readable report, one line per task class.
    pub fn format_report(&self) -> String {
        let mut out = String::new();
        for snapshot in self.snapshots() {
            let _ = write!(
                out,
                "{}\n  Active: {}, Completed: {}, MaxParallel: {}",
                snapshot.description, snapshot.active, snapshot.completed, snapshot.max_parallel
            );
            if let Some(avg) = snapshot.average_time() {
                let _ = write!(
                    out,
                    ", AvgTime: {:.3} msec, MaxTime: {:.3} msec",
                    avg.as_secs_f64() * 1000.0,
                    snapshot.max_normal_time.as_secs_f64() * 1000.0
                );
            }
            if snapshot.panics > 0 {
                let _ = write!(out, ", Panics: {}", snapshot.panics);
            }
            out.push('\n');
        }
        out
    }
}

fn to_snapshot(description: &'static str, entry: &StatsEntry) -> TaskStatsSnapshot {
    TaskStatsSnapshot {
        description,
        active: entry.active,
        max_parallel: entry.max_parallel,
        completed: entry.completed,
        panics: entry.panics,
        total_time: entry.total_time,
        max_normal_time: entry.max_normal_time,
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
