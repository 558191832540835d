//! ============================================================================
//! Task Scheduler - Periodic Housekeeping
//! ============================================================================
//! Runs every registered task once immediately, then on its own interval.
//! - Each run is a separate tracked tokio task, so a slow task never delays
//!   another task's ticks
//! - A task never overlaps itself: a tick that fires while the previous run
//!   is still going is skipped and logged
//! - Panics are caught and counted; the scheduler and other tasks keep going
//! - Shutdown stops the tickers, cancels in-flight runs and waits for them
//! ============================================================================

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::panic_message;

/// Task body. Receives a token that is cancelled on stop or shutdown.
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Task {
    pub name: String,
    pub interval: Duration,
    pub init: Option<TaskFn>,
    pub tick: TaskFn,
}

fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |cancel| f(cancel).boxed())
}

impl Task {
    /// A task whose startup run is the same as its tick
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, tick: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tick = task_fn(tick);
        Self {
            name: name.into(),
            interval,
            init: Some(Arc::clone(&tick)),
            tick,
        }
    }

    /// Replace the startup run
    pub fn with_init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.init = Some(task_fn(init));
        self
    }

    /// Only run on the interval, not at startup
    pub fn without_init(mut self) -> Self {
        self.init = None;
        self
    }
}

/// Counters for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStats {
    pub name: String,
    pub interval: Duration,
    pub runs: u64,
    pub skipped: u64,
    pub panics: u64,
    pub running: bool,
    pub stopped: bool,
}

struct TaskSlot {
    name: String,
    interval: Duration,
    running: AtomicBool,
    runs: AtomicU64,
    skipped: AtomicU64,
    panics: AtomicU64,
    stop: CancellationToken,
    /// Runs of this task only, so one task can be stopped and awaited
    runs_tracker: TaskTracker,
}

impl TaskSlot {
    fn stats(&self) -> TaskStats {
        TaskStats {
            name: self.name.clone(),
            interval: self.interval,
            runs: self.runs.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            panics: self.panics.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            stopped: self.stop.is_cancelled(),
        }
    }
}

pub struct TaskScheduler {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    slots: DashMap<String, Arc<TaskSlot>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            slots: DashMap::new(),
        }
    }

    /// Register tasks: start each one's init run and its ticker.
    /// The batch is all-or-nothing; registration never waits for an init run.
    pub fn setup(&self, tasks: Vec<Task>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(anyhow!("Scheduler is shut down"));
        }

        let mut names = HashSet::new();
        for task in &tasks {
            if task.interval.is_zero() {
                return Err(anyhow!("Task {} has a zero interval", task.name));
            }
            if self.slots.contains_key(&task.name) || !names.insert(task.name.as_str()) {
                return Err(anyhow!("Task {} is already registered", task.name));
            }
        }

        for task in tasks {
            let slot = Arc::new(TaskSlot {
                name: task.name.clone(),
                interval: task.interval,
                running: AtomicBool::new(false),
                runs: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                panics: AtomicU64::new(0),
                stop: self.shutdown.child_token(),
                runs_tracker: TaskTracker::new(),
            });
            self.slots.insert(task.name.clone(), Arc::clone(&slot));

            if let Some(init) = task.init {
                dispatch(&self.tracker, &slot, &init, "init");
            }

            let tracker = self.tracker.clone();
            let tick = task.tick;
            self.tracker.spawn(async move {
                let mut ticker = interval_at(Instant::now() + slot.interval, slot.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = slot.stop.cancelled() => break,
                        _ = ticker.tick() => dispatch(&tracker, &slot, &tick, "tick"),
                    }
                }
                debug!("Ticker for {} stopped", slot.name);
            });

            info!("Scheduled {} every {:?}", task.name, task.interval);
        }

        Ok(())
    }

    /// Stop one task's ticker, cancel its current run and wait for it.
    /// Returns false if no such task is registered.
    pub async fn stop_task(&self, name: &str) -> bool {
        let Some(slot) = self.slots.get(name).map(|s| Arc::clone(s.value())) else {
            return false;
        };

        slot.stop.cancel();
        slot.runs_tracker.close();
        slot.runs_tracker.wait().await;
        info!("Stopped task {}", name);
        true
    }

    /// Counters for every task, sorted by name
    pub fn stats(&self) -> Vec<TaskStats> {
        let mut stats: Vec<TaskStats> = self.slots.iter().map(|s| s.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop all tickers, cancel in-flight runs and wait for them to finish
    pub async fn shutdown(&self) {
        info!("Shutting down scheduler ({} tasks)", self.slots.len());
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Scheduler stopped");
    }
}

/// Start one run of a task unless the previous run is still going
fn dispatch(tracker: &TaskTracker, slot: &Arc<TaskSlot>, job: &TaskFn, phase: &'static str) {
    // Counted by `stop_task` before the stop check, so a stop either
    // prevents this run or waits for it.
    let run_token = slot.runs_tracker.token();
    if slot.stop.is_cancelled() {
        return;
    }

    if slot
        .running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        slot.skipped.fetch_add(1, Ordering::SeqCst);
        warn!("{} still running, skipping {}", slot.name, phase);
        return;
    }

    slot.runs.fetch_add(1, Ordering::SeqCst);
    let slot = Arc::clone(slot);
    let job = Arc::clone(job);
    let cancel = slot.stop.clone();

    let run = async move {
        let _run_token = run_token;
        debug!("Running {} ({})", slot.name, phase);
        let body = async move { job(cancel).await };
        if let Err(panic_info) = AssertUnwindSafe(body).catch_unwind().await {
            slot.panics.fetch_add(1, Ordering::SeqCst);
            error!(
                task = %slot.name,
                phase = phase,
                panic = %panic_message(panic_info),
                "Scheduled task panicked"
            );
        }
        slot.running.store(false, Ordering::SeqCst);
    };

    tracker.spawn(run);
}
