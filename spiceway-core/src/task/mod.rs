//! Cooperative scheduling primitives shared by a session and its channels.
//!
//! - [`MainContext`] is the owning event loop. It runs closures posted by
//!   channel tasks one at a time; [`MainContext::invoke`] is the rendezvous
//!   that suspends a task until its closure has run there.
//! - Every processed job, and every observable state change, advances the
//!   context's tick. [`MainContext::condition_wait`] re-checks its predicate
//!   on each tick.
//! - A [`WaitCanceller`] lets the owning side cancel a pending condition
//!   wait. A cancelled wait reports whether the predicate held at that
//!   moment; it is never an error.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::SpiceError;

type Job = Box<dyn FnOnce() + Send + 'static>;

// ── MainContext ──────────────────────────────────────────────────

/// The owning event loop of a session (and of its migration shadows).
pub struct MainContext {
    jobs: mpsc::UnboundedSender<Job>,
    tick: Arc<watch::Sender<u64>>,
}

impl MainContext {
    /// Start the loop on the current tokio runtime.
    ///
    /// The loop ends once every handle to the context has been dropped.
    pub fn start() -> Arc<Self> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let (tick, _) = watch::channel(0u64);
        let tick = Arc::new(tick);

        let loop_tick = Arc::clone(&tick);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
                loop_tick.send_modify(|t| *t = t.wrapping_add(1));
            }
            tracing::trace!("main context loop finished");
        });

        Arc::new(Self { jobs, tick })
    }

    /// Queue `f` on the loop without waiting for it.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.jobs.send(Box::new(f)).is_err() {
            tracing::debug!("main context stopped, dropping job");
        }
    }

    /// Run `f` on the loop and suspend until it has completed.
    pub async fn invoke<F, R>(&self, f: F) -> Result<R, SpiceError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move || {
                let _ = done_tx.send(f());
            }))
            .map_err(|_| SpiceError::ChannelClosed)?;
        Ok(done_rx.await?)
    }

    /// Advance the tick so pending condition waits re-check.
    pub fn iterate(&self) {
        self.tick.send_modify(|t| *t = t.wrapping_add(1));
    }

    /// Suspend until `pred` holds, re-evaluating it on every tick.
    ///
    /// Returns `true` once `pred` holds. If `canceller` fires first, returns
    /// the value of `pred` at that moment.
    pub async fn condition_wait<F>(&self, mut pred: F, canceller: &WaitCanceller) -> bool
    where
        F: FnMut() -> bool,
    {
        let mut ticks = self.tick.subscribe();
        ticks.borrow_and_update();
        if pred() {
            return true;
        }

        let mut cancelled = canceller.arm();
        let satisfied = loop {
            tokio::select! {
                changed = ticks.changed() => {
                    if pred() {
                        break true;
                    }
                    if changed.is_err() {
                        break false;
                    }
                }
                _ = &mut cancelled => {
                    tracing::debug!("condition wait cancelled");
                    break pred();
                }
            }
        };
        canceller.disarm();
        satisfied
    }

    /// Spawn a channel task on the runtime.
    pub fn spawn<Fut>(&self, fut: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut)
    }
}

impl std::fmt::Debug for MainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainContext")
            .field("tick", &*self.tick.borrow())
            .finish()
    }
}

// ── WaitCanceller ────────────────────────────────────────────────

/// Owner-side handle that cancels the pending condition wait of one task.
#[derive(Debug, Default)]
pub struct WaitCanceller {
    slot: Mutex<Option<oneshot::Sender<()>>>,
}

impl WaitCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock() = Some(tx);
        rx
    }

    fn disarm(&self) {
        self.slot.lock().take();
    }

    /// `true` while a condition wait is pending.
    pub fn is_waiting(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Cancel the pending wait, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}
