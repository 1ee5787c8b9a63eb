//! Cooperative task runtime.
//!
//! The engine runs on a current-thread tokio runtime with a `LocalSet`: a
//! "fiber" is a `spawn_local` task, and every suspension point is an
//! `.await` on socket readiness, a timer, or a named signal. Nothing
//! crosses threads, so host state is shared with `Rc<RefCell<..>>` and no
//! locks exist anywhere in the engine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{WebError, WebResult};

/// Build the single-threaded runtime, run `main_fut` inside a `LocalSet`
/// and return its output. This is the only place a runtime is created;
/// everything else assumes it is already inside one.
pub fn run<F: Future>(main_fut: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime init");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, main_fut)
}

/// Spawn a fiber. Must be called from inside [`run`] (or a `LocalSet`).
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    tokio::task::spawn_local(fut)
}

/// Suspend the calling fiber for `ms` milliseconds.
pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Yield the calling fiber once, letting other ready fibers run.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

/// An absolute deadline for an I/O operation. `Deadline::none()` never
/// lapses. Lapse surfaces to the suspended fiber as `WebError::Timeout`,
/// never as a panic.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Deadline(None)
    }

    /// A deadline `ms` milliseconds from now. Zero means no deadline.
    pub fn in_ms(ms: u64) -> Self {
        if ms == 0 {
            Deadline(None)
        } else {
            Deadline(Some(Instant::now() + Duration::from_millis(ms)))
        }
    }

    pub fn in_secs(secs: u64) -> Self {
        Self::in_ms(secs.saturating_mul(1000))
    }

    pub fn expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) => Deadline(Some(a)),
            (None, b) => Deadline(b),
        }
    }

    pub(crate) fn instant(&self) -> Option<Instant> {
        self.0
    }
}

/// Run a future against a deadline. Lapse maps to `WebError::Timeout`.
pub async fn timed<F, T>(deadline: Deadline, fut: F) -> WebResult<T>
where
    F: Future<Output = WebResult<T>>,
{
    match deadline.instant() {
        None => fut.await,
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(res) => res,
            Err(_) => Err(WebError::Timeout),
        },
    }
}

thread_local! {
    static SIGNALS: RefCell<HashMap<String, Rc<Notify>>> = RefCell::new(HashMap::new());
}

fn signal_entry(name: &str) -> Rc<Notify> {
    SIGNALS.with(|s| {
        s.borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(Notify::new()))
            .clone()
    })
}

/// Suspend until another fiber raises `signal(name)`.
pub async fn watch(name: &str) {
    let notify = signal_entry(name);
    notify.notified().await;
}

/// Wake every fiber watching `name`.
pub fn signal(name: &str) {
    let notify = signal_entry(name);
    notify.notify_waiters();
}

/// Run `f` once after `delay_ms`. Returns the fiber handle so callers can
/// abort the event before it fires.
pub fn start_event<F>(delay_ms: u64, f: F) -> JoinHandle<()>
where
    F: FnOnce() + 'static,
{
    spawn(async move {
        sleep_ms(delay_ms).await;
        f();
    })
}

/// Run `f` every `period_ms` until it returns false. Sweepers (sessions,
/// nonces) are built on this; their errors stay inside `f`.
pub fn start_ticker<F>(period_ms: u64, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> bool + 'static,
{
    spawn(async move {
        loop {
            sleep_ms(period_ms).await;
            if !f() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_min_and_expiry() {
        let never = Deadline::none();
        let soon = Deadline::in_ms(50);
        assert!(!never.expired());
        assert!(!soon.expired());
        assert!(never.min(soon).instant().is_some());
        assert_eq!(soon.min(never).instant(), soon.instant());
        assert!(Deadline::in_ms(0).instant().is_none());
    }

    #[test]
    fn test_timed_lapses_to_timeout() {
        run(async {
            let res: WebResult<()> = timed(Deadline::in_ms(10), async {
                sleep_ms(10_000).await;
                Ok(())
            })
            .await;
            assert!(matches!(res, Err(WebError::Timeout)));
        });
    }

    #[test]
    fn test_signal_wakes_watcher() {
        run(async {
            let waiter = spawn(async {
                watch("test-ready").await;
                7
            });
            yield_now().await;
            signal("test-ready");
            assert_eq!(waiter.await.unwrap(), 7);
        });
    }

    #[test]
    fn test_start_event_fires_once() {
        run(async {
            let fired = Rc::new(RefCell::new(0));
            let fired2 = fired.clone();
            let handle = start_event(5, move || *fired2.borrow_mut() += 1);
            handle.await.unwrap();
            assert_eq!(*fired.borrow(), 1);
        });
    }
}
