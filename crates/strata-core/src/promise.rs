use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// A write-once value shared by any number of waiters.
///
/// Waiters may block with [`Promise::join`] or `.await` the promise from async code. Every waiter observes the same
/// value, so `T` is cloned out on each read; wrap large values in an `Arc`.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    completed: Condvar,
}

enum State<T> {
    Pending(Vec<Waker>),
    Ready(T),
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self::with_state(State::Pending(Vec::new()))
    }

    pub fn ready(value: T) -> Self {
        Self::with_state(State::Ready(value))
    }

    fn with_state(state: State<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                completed: Condvar::new(),
            }),
        }
    }

    /// Returns `false` (and drops `value`) if the promise was already completed.
    pub fn complete(&self, value: T) -> bool {
        let wakers = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Ready(_) => return false,
                State::Pending(wakers) => {
                    let wakers = std::mem::take(wakers);
                    *state = State::Ready(value);
                    wakers
                }
            }
        };
        self.shared.completed.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Ready(_))
    }

    /// True iff both handles refer to the same underlying promise.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }
}

impl<T: Clone> Promise<T> {
    pub fn try_get(&self) -> Option<T> {
        match &*self.shared.state.lock() {
            State::Ready(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }

    /// Blocks the current thread until the promise is completed.
    pub fn join(&self) -> T {
        let mut state = self.shared.state.lock();
        loop {
            if let State::Ready(value) = &*state {
                return value.clone();
            }
            self.shared.completed.wait(&mut state);
        }
    }

    /// Like [`Promise::join`], but gives up after `timeout`.
    pub fn join_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let State::Ready(value) = &*state {
                return Some(value.clone());
            }
            if self
                .shared
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &*state {
                    State::Ready(value) => Some(value.clone()),
                    State::Pending(_) => None,
                };
            }
        }
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Ready(value) => Poll::Ready(value.clone()),
            State::Pending(wakers) => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
