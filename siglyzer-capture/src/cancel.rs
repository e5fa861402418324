use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

/// Hierarchical cancellation levels observed by the acquisition loop.
///
/// `Quit` makes the loop return cleanly between two USB submissions;
/// `Abort` additionally cancels the submission in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
    None = 0,
    Quit = 1,
    Abort = 2,
}

impl CancelLevel {
    fn from_raw(raw: u8) -> CancelLevel {
        match raw {
            0 => CancelLevel::None,
            1 => CancelLevel::Quit,
            _ => CancelLevel::Abort,
        }
    }
}

/// Shared cancellation token.
///
/// Raising a level is sticky until `reset`; observers only ever see the
/// maximum level raised so far.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    level: AtomicU8,
    waker: AtomicWaker,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn level(&self) -> CancelLevel {
        CancelLevel::from_raw(self.inner.level.load(Ordering::SeqCst))
    }

    pub fn reached(&self, level: CancelLevel) -> bool {
        self.level() >= level
    }

    pub fn raise(&self, level: CancelLevel) {
        self.inner.level.fetch_max(level as u8, Ordering::SeqCst);
        self.inner.waker.wake();
    }

    /// Rearms the token for a new acquisition run.
    pub fn reset(&self) {
        self.inner.level.store(CancelLevel::None as u8, Ordering::SeqCst);
    }

    /// Resolves once the token reaches `level`.
    pub fn wait_for(&self, level: CancelLevel) -> WaitLevel<'_> {
        WaitLevel { token: self, level }
    }
}

pub struct WaitLevel<'a> {
    token: &'a CancelToken,
    level: CancelLevel,
}

impl Future for WaitLevel<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Register before checking so a concurrent raise cannot slip
        // between the check and the registration.
        self.token.inner.waker.register(cx.waker());
        if self.token.reached(self.level) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
