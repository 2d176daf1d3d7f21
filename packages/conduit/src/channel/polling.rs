// blocking layer: drive one of the crate's futures to completion on the current thread.
//
// design based on pollster crate. the parked thread sleeps on a condvar, it never spins.

use super::token::lock;
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
};


// poll the future until it resolves, blocking the thread in between.
pub(crate) fn block_on<F>(fut: &mut F) -> F::Output
where
    F: Future + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(&mut cx) {
            return output;
        }

        // otherwise, block until notification
        let mut state = lock(&signal.state);

        // if a notification is already present, poll again right away
        if let State::Notified = *state {
            *state = State::Empty;
            continue;
        }

        debug_assert!(matches!(*state, State::Empty));
        *state = State::Waiting;
        while let State::Waiting = *state {
            state = signal.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        *state = State::Empty;
    }
}

// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        match *state {
            State::Notified => (),
            State::Empty => *state = State::Notified,
            State::Waiting => {
                *state = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    // resolves on the second poll, after waking itself from another thread.
    struct WakeFromThread(bool);

    impl Future for WakeFromThread {
        type Output = u32;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<u32> {
            if self.0 {
                return Poll::Ready(7);
            }
            self.0 = true;
            let waker = cx.waker().clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                waker.wake();
            });
            Poll::Pending
        }
    }

    #[test]
    fn blocks_until_woken() {
        assert_eq!(block_on(&mut WakeFromThread(false)), 7);
    }

    #[test]
    fn ready_immediately() {
        assert_eq!(block_on(&mut std::future::ready(3)), 3);
    }
}
