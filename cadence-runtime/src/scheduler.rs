//! Rerender batching
//!
//! Many store callbacks can fire for a single logical change. Instead of
//! rendering on each, callbacks call `RerenderScheduler::schedule`, which
//! adds the actor to a pending set and schedules at most one flush per tick.
//! The flush renders every pending actor exactly once.

use cadence_types::ActorId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Recomputes an actor's visible output
pub trait Renderer: Send + Sync {
    fn render(&self, actor: &ActorId);
}

/// Renderer that does nothing
pub struct NoopRenderer;

impl Renderer for NoopRenderer {
    fn render(&self, _actor: &ActorId) {}
}

/// Renderer that records every render call
#[derive(Debug, Default)]
pub struct RenderLog {
    renders: Mutex<Vec<ActorId>>,
}

impl RenderLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renders(&self) -> Vec<ActorId> {
        self.renders.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.renders.lock().len()
    }

    pub fn count_for(&self, actor: &ActorId) -> usize {
        self.renders.lock().iter().filter(|a| *a == actor).count()
    }

    pub fn clear(&self) {
        self.renders.lock().clear();
    }
}

impl Renderer for RenderLog {
    fn render(&self, actor: &ActorId) {
        self.renders.lock().push(actor.clone());
    }
}

pub type Task = Box<dyn FnOnce() + Send>;

/// Runs a task on the next tick
pub trait TickExecutor: Send + Sync {
    fn defer(&self, task: Task);
}

/// Defers to a task on the ambient tokio runtime
///
/// The task yields once before running, so everything already queued on
/// the current tick gets to run first. Without a runtime the task runs
/// inline.
pub struct TokioTick;

impl TickExecutor for TokioTick {
    fn defer(&self, task: Task) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    task();
                });
            }
            Err(_) => task(),
        }
    }
}

/// Queues tasks until `run_pending` is called
#[derive(Default)]
pub struct ManualTick {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualTick {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run queued tasks, including any they queue, returning how many ran
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl TickExecutor for ManualTick {
    fn defer(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

pub struct RerenderScheduler {
    pending: Mutex<BTreeSet<ActorId>>,
    flush_scheduled: AtomicBool,
    flushes: AtomicU64,
    executor: Arc<dyn TickExecutor>,
    renderer: Arc<dyn Renderer>,
}

impl RerenderScheduler {
    pub fn new(executor: Arc<dyn TickExecutor>, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            pending: Mutex::new(BTreeSet::new()),
            flush_scheduled: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            executor,
            renderer,
        }
    }

    /// Mark an actor for rerender on the next flush
    pub fn schedule(self: &Arc<Self>, actor: &ActorId) {
        self.pending.lock().insert(actor.clone());
        if !self.flush_scheduled.swap(true, Ordering::SeqCst) {
            let scheduler = Arc::downgrade(self);
            self.executor.defer(Box::new(move || {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.flush();
                }
            }));
        }
    }

    /// Render every pending actor once, in id order
    pub fn flush(&self) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(actors = batch.len(), "rerender flush");
        for actor in &batch {
            self.renderer.render(actor);
        }
    }

    /// Drop a pending rerender, e.g. for a destroyed actor
    pub fn forget(&self, actor: &ActorId) {
        self.pending.lock().remove(actor);
    }

    pub fn is_pending(&self, actor: &ActorId) -> bool {
        self.pending.lock().contains(actor)
    }

    /// Number of flushes that rendered at least one actor
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}
