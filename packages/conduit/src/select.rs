//! Waiting on several conduit operations at once.

use crate::channel::{
    api::{CanRecv, CanSend, HasChannel, SEND_ON_CLOSED},
    core::{Channel, TryRecv, TrySend},
    polling::block_on,
    token::{Outcome, Slot, Token, Waiter},
};
use rand::Rng;
use smallvec::SmallVec;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};


/// Set of send and receive operations across conduits, of which exactly one is carried out
///
/// Each case comes with a handler, and all handlers produce the same output type `R`. Running
/// the select ([`block`](Self::block), or awaiting it as a future):
///
/// 1. If any cases are ready, picks one of them uniformly at random, carries out its transfer, and
///    runs its handler.
/// 2. Otherwise, if there is a [`default`](Self::default) handler, runs that.
/// 3. Otherwise, waits until some case can be carried out, carries it out, and runs its handler.
///
/// A receive case is ready if its conduit has a message, a waiting sender, or is closed, and its
/// handler gets `None` in the latter case. A send case is ready if the conduit has buffer room, or
/// if it is closed, in which case carrying it out panics just like
/// [`Conduit::send`](crate::Conduit::send). A send case on a capacity 0 conduit is never ready
/// right away: it completes once a receiver takes the message. Messages of send cases which are
/// not carried out are dropped.
///
/// A select with no cases and no default never resolves.
///
/// ```
/// use conduit::{Conduit, Select};
///
/// let numbers = Conduit::<u32>::new(1);
/// let words = Conduit::<&str>::new(1);
/// words.try_send("hi").unwrap();
///
/// let got = Select::new()
///     .recv(&numbers, |n| format!("number {:?}", n))
///     .recv(&words, |w| format!("word {:?}", w))
///     .block();
/// assert_eq!(got, "word Some(\"hi\")");
/// ```
pub struct Select<'a, R> {
    cases: Vec<Box<dyn Case<R> + Send + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + Send + 'a>>,
    // token shared by every case's waiter, while parked.
    parked: Option<Arc<Token>>,
    done: bool,
}

impl<'a, R> Select<'a, R> {
    /// Construct with no cases
    pub fn new() -> Self {
        Select {
            cases: Vec::new(),
            default: None,
            parked: None,
            done: false,
        }
    }

    /// Add a case receiving from a conduit
    ///
    /// The handler receives `None` if the conduit is closed and drained.
    pub fn recv<C, T, F>(mut self, conduit: &C, handler: F) -> Self
    where
        C: CanRecv<T>,
        T: Send + 'a,
        F: FnOnce(Option<T>) -> R + Send + 'a,
    {
        self.cases.push(Box::new(RecvCase {
            channel: conduit.channel().clone(),
            msg: None,
            handler,
        }));
        self
    }

    /// Add a case sending a message into a conduit
    pub fn send<C, T, F>(mut self, conduit: &C, msg: T, handler: F) -> Self
    where
        C: CanSend<T>,
        T: Send + 'a,
        F: FnOnce() -> R + Send + 'a,
    {
        self.cases.push(Box::new(SendCase {
            channel: conduit.channel().clone(),
            slot: Slot::holding(msg),
            handler,
        }));
        self
    }

    /// Set a handler to run instead of waiting, if no case is ready
    pub fn default<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() -> R + Send + 'a,
    {
        self.default = Some(Box::new(handler));
        self
    }

    /// Number of cases, not counting the default
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Whether there are no cases, not counting the default
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Block the current thread until a case or the default has run, and return its output
    pub fn block(mut self) -> R {
        block_on(&mut self)
    }

    fn poll_select(&mut self, cx: &mut Context) -> Poll<R> {
        assert!(!self.done, "select polled after completion");
        loop {
            if let Some(token) = &self.parked {
                let Some(fired) = token.poll_fired(cx.waker()) else { return Poll::Pending };
                if let Some(token) = self.parked.take() {
                    self.unpark(&token, self.cases.len());
                }
                if fired.outcome == Outcome::Notified {
                    // a receive case may have become ready, so start over
                    continue;
                }
                return Poll::Ready(self.complete(fired.case, fired.outcome));
            }

            // pick uniformly among the cases ready right now. checking them in order and taking
            // the first would bias towards earlier cases.
            let ready: SmallVec<[usize; 8]> = (0..self.cases.len())
                .filter(|&index| self.cases[index].is_ready())
                .collect();
            if !ready.is_empty() {
                let index = ready[rand::thread_rng().gen_range(0..ready.len())];
                match self.cases[index].attempt() {
                    Some(outcome) => return Poll::Ready(self.complete(index, outcome)),
                    // lost a race against another task
                    None => continue,
                }
            }

            if let Some(default) = self.default.take() {
                self.done = true;
                self.cases.clear();
                return Poll::Ready(default());
            }

            if self.cases.is_empty() {
                return Poll::Pending;
            }

            // park on every case's conduit. a case checks readiness under the same lock it parks
            // under, so no wake-up can slip in between.
            let token = Token::new(cx.waker());
            let mut parked = 0;
            for (index, case) in self.cases.iter_mut().enumerate() {
                if !case.park(&token, index) {
                    break;
                }
                parked += 1;
            }
            if parked < self.cases.len() && token.claim(0, Outcome::Withdrawn).is_some() {
                // some case became ready while parking the others, so start over
                self.unpark(&token, parked);
                continue;
            }
            // either fully parked, or already fired by a counterpart
            self.parked = Some(token);
        }
    }

    // remove waiters of the first n cases.
    fn unpark(&mut self, token: &Token, n: usize) {
        for case in &mut self.cases[..n] {
            case.unpark(token);
        }
    }

    // run the handler of a case which has been carried out.
    fn complete(&mut self, index: usize, outcome: Outcome) -> R {
        self.done = true;
        self.default = None;
        let mut cases = std::mem::take(&mut self.cases);
        let case = cases.swap_remove(index);
        // drops the messages of send cases not carried out
        drop(cases);
        case.complete(outcome)
    }
}

impl<'a, R> Future for Select<'a, R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<R> {
        self.get_mut().poll_select(cx)
    }
}

#[cfg(feature = "futures")]
impl<'a, R> futures::future::FusedFuture for Select<'a, R> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<'a, R> Drop for Select<'a, R> {
    fn drop(&mut self) {
        let Some(token) = self.parked.take() else { return };
        let withdrawn = token.claim(0, Outcome::Withdrawn).is_some();
        self.unpark(&token, self.cases.len());
        if withdrawn {
            return;
        }
        // a receive case was notified, but will never retry
        if let Some(fired) = token.fired() {
            if fired.outcome == Outcome::Notified && fired.case < self.cases.len() {
                self.cases[fired.case].pass_on();
            }
        }
    }
}


// ==== cases ====


// one case of a select, type-erased over the message type.
trait Case<R> {
    // whether the transfer could complete right now.
    fn is_ready(&self) -> bool;

    // try to carry out the transfer right now.
    fn attempt(&mut self) -> Option<Outcome>;

    // park on the conduit, unless the case is ready, in which case return false.
    fn park(&mut self, token: &Arc<Token>, index: usize) -> bool;

    // remove this select's waiters from the conduit.
    fn unpark(&mut self, token: &Token);

    // run the handler. called without any locks held.
    fn complete(self: Box<Self>, outcome: Outcome) -> R;

    // the case was notified, but the select is going away without retrying.
    fn pass_on(&mut self);
}

struct RecvCase<T, F> {
    channel: Channel<T>,
    // message taken by a successful attempt.
    msg: Option<T>,
    handler: F,
}

impl<T, F, R> Case<R> for RecvCase<T, F>
where
    F: FnOnce(Option<T>) -> R,
{
    fn is_ready(&self) -> bool {
        self.channel.lock().can_recv(None)
    }

    fn attempt(&mut self) -> Option<Outcome> {
        match self.channel.lock().try_recv() {
            TryRecv::Received(msg) => {
                self.msg = Some(msg);
                Some(Outcome::Transferred)
            }
            TryRecv::Closed => Some(Outcome::Closed),
            TryRecv::Empty => None,
        }
    }

    fn park(&mut self, token: &Arc<Token>, index: usize) -> bool {
        let mut lock = self.channel.lock();
        if lock.can_recv(Some(token)) {
            return false;
        }
        lock.park_receiver(Waiter {
            token: Arc::clone(token),
            case: index,
            slot: (),
        });
        true
    }

    fn unpark(&mut self, token: &Token) {
        self.channel.lock().unpark(token);
    }

    fn complete(mut self: Box<Self>, outcome: Outcome) -> R {
        let msg = match outcome {
            Outcome::Transferred => self.msg.take(),
            // woken by the close. only reached while parked, so nothing was buffered
            _ => None,
        };
        (self.handler)(msg)
    }

    fn pass_on(&mut self) {
        self.channel.lock().pass_on();
    }
}

struct SendCase<T, F> {
    channel: Channel<T>,
    // holds the message until it is sent.
    slot: Arc<Slot<T>>,
    handler: F,
}

impl<T, F, R> Case<R> for SendCase<T, F>
where
    F: FnOnce() -> R,
{
    fn is_ready(&self) -> bool {
        self.channel.lock().can_send()
    }

    fn attempt(&mut self) -> Option<Outcome> {
        let msg = self.slot.take()?;
        match self.channel.lock().try_send(msg) {
            TrySend::Sent => Some(Outcome::Transferred),
            TrySend::Full(msg) => {
                self.slot.put(msg);
                None
            }
            TrySend::Closed(msg) => {
                self.slot.put(msg);
                Some(Outcome::Closed)
            }
        }
    }

    fn park(&mut self, token: &Arc<Token>, index: usize) -> bool {
        let mut lock = self.channel.lock();
        if lock.can_send() {
            return false;
        }
        lock.park_sender(Waiter {
            token: Arc::clone(token),
            case: index,
            slot: Arc::clone(&self.slot),
        });
        true
    }

    fn unpark(&mut self, token: &Token) {
        self.channel.lock().unpark(token);
    }

    fn complete(self: Box<Self>, outcome: Outcome) -> R {
        if outcome != Outcome::Transferred {
            drop(self);
            panic!("{}", SEND_ON_CLOSED);
        }
        (self.handler)()
    }

    fn pass_on(&mut self) {}
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conduit, after};
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        thread,
        time::Duration,
    };

    #[test]
    fn picks_fairly_between_ready_cases() {
        const TRIALS: usize = 10_000;
        let a = conduit::<()>(TRIALS);
        let b = conduit::<()>(TRIALS);
        let mut fired_a = 0;
        for _ in 0..TRIALS {
            let was_a = Select::new()
                .send(&a, (), || true)
                .send(&b, (), || false)
                .block();
            if was_a {
                fired_a += 1;
            }
        }
        assert_eq!(a.len() + b.len(), TRIALS);
        assert!(fired_a >= TRIALS * 40 / 100, "case a fired {} times", fired_a);
        assert!(fired_a <= TRIALS * 60 / 100, "case a fired {} times", fired_a);
    }

    #[test]
    fn default_when_nothing_ready() {
        let a = conduit::<u8>(0);
        let full = conduit::<u8>(1);
        full.try_send(1).unwrap();
        let got = Select::new()
            .recv(&a, |_| "recv")
            .send(&full, 2, || "send")
            .default(|| "default")
            .block();
        assert_eq!(got, "default");
        // the unsent message was dropped, not buffered
        assert_eq!(full.len(), 1);
    }

    #[test]
    fn ready_case_beats_default() {
        let a = conduit::<u8>(1);
        a.try_send(9).unwrap();
        let got = Select::new()
            .recv(&a, |msg| msg)
            .default(|| None)
            .block();
        assert_eq!(got, Some(9));
    }

    #[test]
    fn blocks_until_sender_arrives() {
        let a = conduit::<u32>(0);
        let b = conduit::<u32>(0);
        let send = b.send_only();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            send.send(42).block();
        });
        let got = Select::new()
            .recv(&a, |msg| ('a', msg))
            .recv(&b.recv_only(), |msg| ('b', msg))
            .block();
        assert_eq!(got, ('b', Some(42)));
        join.join().unwrap();
        assert_eq!(a.try_recv(), Err(crate::TryRecvError::Empty));
    }

    #[test]
    fn two_parked_selects_meet() {
        let c = conduit::<u32>(0);
        let sender = c.send_only();
        let join = thread::spawn(move || {
            Select::new().send(&sender, 7, || ()).block();
        });
        thread::sleep(Duration::from_millis(20));
        let got = Select::new().recv(&c.recv_only(), |msg| msg).block();
        assert_eq!(got, Some(7));
        join.join().unwrap();
    }

    #[test]
    fn parked_select_receives_once() {
        let a = conduit::<u32>(0);
        let b = conduit::<u32>(0);
        let (send_a, send_b) = (a.send_only(), b.send_only());
        let join_a = thread::spawn(move || send_a.send(1).block());
        let join_b = thread::spawn(move || send_b.send(2).block());
        let first = Select::new()
            .recv(&a, |msg| msg)
            .recv(&b, |msg| msg)
            .block();
        let second = Select::new()
            .recv(&a, |msg| msg)
            .recv(&b, |msg| msg)
            .block();
        let mut got = vec![first.unwrap(), second.unwrap()];
        got.sort();
        assert_eq!(got, vec![1, 2]);
        join_a.join().unwrap();
        join_b.join().unwrap();
    }

    #[test]
    fn own_send_and_recv_do_not_match() {
        let c = conduit::<u32>(0);
        let got = Select::new()
            .send(&c, 1, || "sent")
            .recv(&c, |_| "received")
            .default(|| "default")
            .block();
        assert_eq!(got, "default");
    }

    #[test]
    fn recv_case_on_closed_gets_none() {
        let c = conduit::<u32>(0);
        let closer = c.send_only();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        let got = Select::new().recv(&c, |msg| msg).block();
        assert_eq!(got, None);
        join.join().unwrap();
    }

    #[test]
    fn send_case_on_closed_panics() {
        let c = conduit::<u32>(4);
        c.close();
        let result = catch_unwind(AssertUnwindSafe(|| {
            Select::new().send(&c, 1, || ()).block()
        }));
        assert!(result.is_err());
        assert!(c.is_empty());
    }

    #[test]
    fn timeout_by_racing_timer() {
        let c = conduit::<u32>(0);
        let timed_out = Select::new()
            .recv(&c, |_| false)
            .recv(&after(Duration::from_millis(10)), |_| true)
            .block();
        assert!(timed_out);
    }

    struct Flag(std::sync::atomic::AtomicBool);

    impl std::task::Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn dropped_woken_select_passes_wake_on() {
        let c = conduit::<u32>(1);
        let noop = futures::task::noop_waker();
        let flag = Arc::new(Flag(Default::default()));
        let flag_waker = std::task::Waker::from(Arc::clone(&flag));

        let mut select = Select::new().recv(&c, |msg| msg);
        assert!(Pin::new(&mut select).poll(&mut Context::from_waker(&noop)).is_pending());
        let mut fut = c.recv();
        assert!(Pin::new(&mut fut).poll(&mut Context::from_waker(&flag_waker)).is_pending());

        // wakes the select, which parked first
        c.try_send(5).unwrap();
        assert!(!flag.0.load(std::sync::atomic::Ordering::SeqCst));
        drop(select);
        assert!(flag.0.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(Pin::new(&mut fut).poll(&mut Context::from_waker(&flag_waker)), Poll::Ready(Some(5)));
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn dropped_select_loses_nothing() {
        let c = conduit::<u32>(1);
        let select = Select::new().recv(&c, |msg| msg);
        assert!(tokio::time::timeout(Duration::from_millis(20), select).await.is_err());
        c.try_send(5).unwrap();
        assert_eq!(c.recv().await, Some(5));
    }

    #[tokio::test]
    async fn awaited_select() {
        let c = conduit::<u32>(0);
        let send = c.send_only();
        let task = tokio::spawn(async move { send.send(3).await });
        let got = Select::new().recv(&c, |msg| msg.map(|n| n * 2)).await;
        assert_eq!(got, Some(6));
        task.await.unwrap();
    }
}
