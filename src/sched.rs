//! Cooperative scheduler for supervisor routines.
//!
//! Every routine of a supervisor process runs on one thread, interleaved
//! only at its suspension points. The scheduler is a tokio current-thread
//! runtime driving a [`LocalSet`]: routines are `!Send` futures and shared
//! state lives in `Rc`/`RefCell` without further synchronization.
//!
//! The suspensions a routine may request map onto futures:
//!
//! | Suspension            | Future                                     |
//! |-----------------------|--------------------------------------------|
//! | sleep                 | [`sleep`]                                  |
//! | read/write readiness  | tokio `UnixStream`/`UnixListener` I/O      |
//! | process exit          | [`crate::process::LiveHandle::wait`]       |
//! | lock acquire          | [`Lock::lock`]                             |
//! | latch wait            | [`Latch::wait_for`]                        |
//! | spawn child           | [`crate::process::Process`] spawn          |
//! | run sub-routine       | `.await`                                   |
//! | run all / run any     | [`run_all`] / [`run_any`]                  |
//! | trigger / listen for  | [`Trigger::fire`] / [`Trigger::fired`]     |
//!
//! The runtime wakes tasks in FIFO order of readiness, so routines that
//! become runnable together resume in the order they were registered.

use crate::error::{Error, Result};
use futures::future::{self, LocalBoxFuture};
use std::cell::RefCell;
use std::fmt::Debug;
use std::future::Future;
use std::rc::Rc;
use std::sync::OnceLock;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tokio::task::{JoinHandle, LocalSet};
use tracing::error;

pub use tokio::time::sleep;

/// Mutual exclusion between routines. Waiters are served FIFO.
pub type Lock = tokio::sync::Mutex<()>;

/// A boxed top-level routine.
pub type Routine<T> = LocalBoxFuture<'static, Result<T>>;

type ErrorHandler = Box<dyn Fn(&Error) + Send + Sync>;

static ERROR_HANDLER: OnceLock<ErrorHandler> = OnceLock::new();

/// Install the process-wide handler for failures nobody awaited.
///
/// Returns `false` if a handler was already installed.
pub fn set_error_handler<F>(handler: F) -> bool
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    ERROR_HANDLER.set(Box::new(handler)).is_ok()
}

/// Pass an uncaught routine failure to the error handler, if any.
pub fn report_error(err: &Error) {
    if let Some(handler) = ERROR_HANDLER.get() {
        handler(err);
    }
}

/// Single-threaded executor owning the only control-flow loop.
pub struct Scheduler {
    runtime: Runtime,
    local: LocalSet,
    routines: RefCell<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler with I/O, timers and child-process support.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;

        Ok(Self {
            runtime,
            local: LocalSet::new(),
            routines: RefCell::new(Vec::new()),
        })
    }

    /// Register a top-level routine. Its failure goes to the error handler.
    pub fn add<F>(&self, routine: F)
    where
        F: Future<Output = Result<()>> + 'static,
    {
        let handle = self.local.spawn_local(async move {
            if let Err(e) = routine.await {
                report_error(&e);
            }
        });
        self.routines.borrow_mut().push(handle);
    }

    /// Drive all registered routines until every one of them has finished.
    pub fn run(&self) {
        self.local.block_on(&self.runtime, async {
            loop {
                let next = {
                    let mut routines = self.routines.borrow_mut();
                    if routines.is_empty() {
                        None
                    } else {
                        Some(routines.remove(0))
                    }
                };

                match next {
                    Some(handle) => {
                        if let Err(e) = handle.await {
                            error!(error = %e, "Routine panicked");
                        }
                    }
                    None => break,
                }
            }
        });
    }

    /// Run one routine to completion, interleaved with the registered ones,
    /// and return its value.
    pub fn block_on<F: Future>(&self, routine: F) -> F::Output {
        self.local.block_on(&self.runtime, routine)
    }
}

/// Spawn a detached routine on the current scheduler.
///
/// Must be called from inside a running [`Scheduler`].
pub fn spawn<F>(routine: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + 'static,
{
    tokio::task::spawn_local(async move {
        if let Err(e) = routine.await {
            report_error(&e);
        }
    })
}

/// Run routines concurrently and collect every result, in input order.
pub async fn run_all<T, F, I>(routines: I) -> Vec<Result<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    future::join_all(routines).await
}

/// Race routines; the first one to finish, successful or not, wins and the
/// others are dropped. An empty race never finishes.
pub async fn run_any<T, F, I>(routines: I) -> Result<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    let racers: Vec<_> = routines.into_iter().map(Box::pin).collect();
    if racers.is_empty() {
        return future::pending().await;
    }

    let (winner, _index, _rest) = future::select_all(racers).await;
    winner
}

/// One-shot broadcast signal, e.g. for shutdown.
#[derive(Clone)]
pub struct Trigger {
    tx: Rc<watch::Sender<bool>>,
}

impl Trigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Rc::new(tx) }
    }

    /// Fire the trigger, waking every listener. Idempotent.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the trigger fires.
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Run `routine` unless the trigger fires first.
    pub async fn guard<F: Future>(&self, routine: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.fired() => None,
            out = routine => Some(out),
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

/// State cell that routines can wait on.
pub struct Latch<S> {
    tx: watch::Sender<S>,
}

impl<S: Copy + PartialEq + Debug> Latch<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> S {
        *self.tx.borrow()
    }

    pub fn set(&self, state: S) {
        self.tx.send_replace(state);
    }

    /// Move from `from` to `to`; returns `false` if the latch was elsewhere.
    pub fn transition(&self, from: S, to: S) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the latch holds `state`.
    pub async fn wait_for(&self, state: S) {
        self.wait_until(|s| s == state).await;
    }

    /// Wait until `pred` accepts the latch state and return that state.
    pub async fn wait_until<P>(&self, mut pred: P) -> S
    where
        P: FnMut(S) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let changed = rx.wait_for(|s| pred(*s)).await;
        match changed {
            Ok(state) => *state,
            // Unreachable while `self` holds the sender.
            Err(_) => self.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sched() -> Scheduler {
        Scheduler::new().unwrap()
    }

    #[test]
    fn test_run_drives_routines_in_order() {
        let s = sched();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let log = Rc::clone(&log);
            s.add(async move {
                log.borrow_mut().push(i);
                Ok(())
            });
        }

        s.run();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failed_routine_does_not_stop_others() {
        let s = sched();
        let done = Rc::new(RefCell::new(false));

        s.add(async { Err(Error::NotRunning("x".into())) });
        let flag = Rc::clone(&done);
        s.add(async move {
            sleep(Duration::from_millis(5)).await;
            *flag.borrow_mut() = true;
            Ok(())
        });

        s.run();
        assert!(*done.borrow());
    }

    #[test]
    fn test_run_all_collects_failures() {
        let s = sched();
        let results = s.block_on(run_all(vec![
            Box::pin(async { Ok(1) }) as Routine<i32>,
            Box::pin(async { Err(Error::NotRunning("b".into())) }),
            Box::pin(async {
                sleep(Duration::from_millis(5)).await;
                Ok(3)
            }),
        ]));

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(matches!(results[1], Err(Error::NotRunning(_))));
        assert_eq!(*results[2].as_ref().unwrap(), 3);
    }

    #[test]
    fn test_run_any_propagates_first_failure() {
        let s = sched();
        let result = s.block_on(run_any(vec![
            Box::pin(async {
                sleep(Duration::from_millis(200)).await;
                Ok(1)
            }) as Routine<i32>,
            Box::pin(async {
                sleep(Duration::from_millis(1)).await;
                Err(Error::AlreadyRunning("fast".into()))
            }),
        ]));

        assert!(matches!(result, Err(Error::AlreadyRunning(_))));
    }

    #[test]
    fn test_trigger_wakes_listeners() {
        let s = sched();
        let trigger = Trigger::new();

        let out = s.block_on(async {
            let t = trigger.clone();
            let waiter = tokio::task::spawn_local(async move {
                t.guard(future::pending::<()>()).await
            });
            sleep(Duration::from_millis(1)).await;
            trigger.fire();
            waiter.await.unwrap()
        });

        assert!(out.is_none());
        assert!(trigger.is_fired());
        // Listening after the fact completes immediately.
        s.block_on(trigger.fired());
    }

    #[test]
    fn test_latch_transitions() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        enum State {
            A,
            B,
            C,
        }

        let s = sched();
        let latch = Rc::new(Latch::new(State::A));

        assert!(!latch.transition(State::B, State::C));
        assert!(latch.transition(State::A, State::B));
        assert_eq!(latch.get(), State::B);

        let reached = s.block_on(async {
            let l = Rc::clone(&latch);
            let waiter = tokio::task::spawn_local(async move {
                l.wait_for(State::C).await;
                true
            });
            sleep(Duration::from_millis(1)).await;
            latch.set(State::C);
            waiter.await.unwrap()
        });
        assert!(reached);
    }

    #[test]
    fn test_lock_serializes_routines() {
        let s = sched();
        let lock = Rc::new(Lock::new(()));
        let log = Rc::new(RefCell::new(Vec::new()));

        let make = |tag: &'static str| {
            let lock = Rc::clone(&lock);
            let log = Rc::clone(&log);
            async move {
                let _guard = lock.lock().await;
                log.borrow_mut().push(format!("{tag}-in"));
                sleep(Duration::from_millis(5)).await;
                log.borrow_mut().push(format!("{tag}-out"));
                Ok::<_, Error>(())
            }
        };

        s.block_on(run_all(vec![
            Box::pin(make("a")) as Routine<()>,
            Box::pin(make("b")),
        ]));
        assert_eq!(*log.borrow(), vec!["a-in", "a-out", "b-in", "b-out"]);
    }
}
