//! Generate-then-consume pipeline with race-free shutdown.
//!
//! A producer task sends every item into a bounded conduit and then closes it. Consumer tasks,
//! either one per item or a fixed pool, process the items. The pipeline only reports completion
//! once the conduit is closed and drained _and_ every consumer task has finished. Reporting
//! completion as soon as the conduit closes would be wrong: consumers can still be mid-flight at
//! that point, and their work would be silently cut off.

use crate::{
    channel::api::{Conduit, Receiver, Sender},
    select::Select,
    spawn::Spawn,
    timer::after,
    tracker::{DoneGuard, Tracker},
};
use std::{
    future::Future,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    time::{Duration, Instant},
};


/// Stage of a [`Pipeline`] run
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Phase {
    /// The producer is being started. Every pipeline begins here.
    Generating,
    /// Items are being received and handed to consumers.
    Draining,
    /// The conduit is closed and drained, and consumers are being waited on.
    AwaitingConsumers,
    /// Every item has been produced and consumed.
    Done,
}

impl Phase {
    // the only phase which may follow this one.
    fn next(self) -> Option<Phase> {
        match self {
            Phase::Generating => Some(Phase::Draining),
            Phase::Draining => Some(Phase::AwaitingConsumers),
            Phase::AwaitingConsumers => Some(Phase::Done),
            Phase::Done => None,
        }
    }
}

/// How items are distributed to consumer tasks
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum FanOut {
    /// Spawn one consumer task per item
    #[default]
    PerItem,
    /// Spawn a fixed number of worker tasks which share the conduit
    ///
    /// Must be at least 1.
    Pool(usize),
}

/// Configuration for a [`Pipeline`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct PipelineConfig {
    /// Capacity of the conduit between producer and consumers. 0 makes every item a direct
    /// hand-off.
    pub capacity: usize,
    /// How items are distributed to consumer tasks
    pub fan_out: FanOut,
    /// If set, while draining in [`FanOut::PerItem`] mode, log progress each time this much time
    /// passes without the run finishing
    pub progress_interval: Option<Duration>,
}

impl PipelineConfig {
    /// Ownership-chaining setter for [`capacity`](Self::capacity)
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Ownership-chaining setter for [`fan_out`](Self::fan_out)
    pub fn with_fan_out(mut self, fan_out: FanOut) -> Self {
        self.fan_out = fan_out;
        self
    }

    /// Ownership-chaining setter for [`progress_interval`](Self::progress_interval)
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }
}

/// Summary of a finished [`Pipeline`] run
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Report {
    /// Number of items which went through the conduit
    pub items: usize,
    /// Number of consumer tasks spawned
    pub consumers: usize,
}

/// One run of the generate-then-consume pattern
///
/// ```
/// use conduit::{Pipeline, PipelineConfig, ThreadSpawner};
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let seen_2 = Arc::clone(&seen);
/// let report = Pipeline::new(PipelineConfig::default()).run(
///     ThreadSpawner,
///     (0..10).map(|i| format!("item {}", i)),
///     move |item| seen_2.lock().unwrap().push(item),
/// );
/// assert_eq!(report.items, 10);
/// assert_eq!(seen.lock().unwrap().len(), 10);
/// ```
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    phase: Phase,
}

impl Pipeline {
    /// Construct in the [`Generating`](Phase::Generating) phase
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline { config, phase: Phase::Generating }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Configuration this pipeline was constructed with
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline to completion, blocking the current thread
    ///
    /// Spawns a producer task which sends every item then closes the conduit, and consumer tasks
    /// which call `consume` on the items, all through `spawner`. Returns once every item has been
    /// consumed, or its consumer has panicked.
    ///
    /// # Panics
    ///
    /// If the pipeline has already been run, or is configured with a pool of 0 workers.
    pub fn run<S, I, C>(&mut self, spawner: S, items: I, consume: C) -> Report
    where
        S: Spawn,
        I: IntoIterator + Send + 'static,
        I::Item: Send + 'static,
        C: Fn(I::Item) + Send + Sync + 'static,
    {
        self.check_runnable();
        let conduit = Conduit::new(self.config.capacity);
        let tracker = Tracker::new();
        let consume = Arc::new(consume);

        let producer = CloseOnDrop(conduit.send_only());
        spawner.spawn(move || {
            for item in items {
                producer.0.send(item).block();
            }
        });
        self.advance(Phase::Draining);

        // counted by whoever receives, so it is final once the tracker is released
        let received = Arc::new(AtomicUsize::new(0));
        let consumers = match self.config.fan_out {
            FanOut::PerItem => {
                let mut drain = PerItem::new(self.config.progress_interval, &received, &tracker);
                loop {
                    let event = drain.next(&conduit).block();
                    match drain.accept(event) {
                        ControlFlow::Continue(Some((item, guard))) => {
                            let consume = Arc::clone(&consume);
                            spawner.spawn(move || {
                                let _guard = guard;
                                consume(item);
                            });
                        }
                        ControlFlow::Continue(None) => (),
                        ControlFlow::Break(consumers) => break consumers,
                    }
                }
            }
            FanOut::Pool(workers) => {
                for _ in 0..workers {
                    let guard = tracker.enter();
                    let recv = conduit.recv_only();
                    let consume = Arc::clone(&consume);
                    let received = Arc::clone(&received);
                    spawner.spawn(move || {
                        let _guard = guard;
                        for item in recv.iter() {
                            received.fetch_add(1, Relaxed);
                            consume(item);
                        }
                    });
                }
                workers
            }
        };

        self.advance(Phase::AwaitingConsumers);
        tracker.wait().block();
        self.finish(&received, consumers)
    }

    /// Run the pipeline to completion on the current tokio runtime
    ///
    /// Like [`run`](Self::run), but the producer and consumers are tokio tasks and `consume`
    /// returns a future.
    ///
    /// # Panics
    ///
    /// If the pipeline has already been run, is configured with a pool of 0 workers, or is not
    /// polled from within a tokio runtime.
    pub async fn run_async<I, C, F>(&mut self, items: I, consume: C) -> Report
    where
        I: IntoIterator + Send + 'static,
        I::IntoIter: Send,
        I::Item: Send + 'static,
        C: Fn(I::Item) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        self.check_runnable();
        let conduit = Conduit::new(self.config.capacity);
        let tracker = Tracker::new();
        let consume = Arc::new(consume);

        let producer = CloseOnDrop(conduit.send_only());
        tokio::spawn(async move {
            for item in items {
                producer.0.send(item).await;
            }
        });
        self.advance(Phase::Draining);

        let received = Arc::new(AtomicUsize::new(0));
        let consumers = match self.config.fan_out {
            FanOut::PerItem => {
                let mut drain = PerItem::new(self.config.progress_interval, &received, &tracker);
                loop {
                    let event = drain.next(&conduit).await;
                    match drain.accept(event) {
                        ControlFlow::Continue(Some((item, guard))) => {
                            let work = consume(item);
                            tokio::spawn(async move {
                                let _guard = guard;
                                work.await;
                            });
                        }
                        ControlFlow::Continue(None) => (),
                        ControlFlow::Break(consumers) => break consumers,
                    }
                }
            }
            FanOut::Pool(workers) => {
                for _ in 0..workers {
                    let guard = tracker.enter();
                    let recv = conduit.recv_only();
                    let consume = Arc::clone(&consume);
                    let received = Arc::clone(&received);
                    tokio::spawn(async move {
                        let _guard = guard;
                        while let Some(item) = recv.recv().await {
                            received.fetch_add(1, Relaxed);
                            consume(item).await;
                        }
                    });
                }
                workers
            }
        };

        self.advance(Phase::AwaitingConsumers);
        tracker.wait().await;
        self.finish(&received, consumers)
    }

    fn finish(&mut self, received: &AtomicUsize, consumers: usize) -> Report {
        self.advance(Phase::Done);
        let report = Report { items: received.load(Relaxed), consumers };
        debug!(items = report.items, consumers = report.consumers, "pipeline done");
        report
    }

    fn check_runnable(&self) {
        assert_eq!(self.phase, Phase::Generating, "pipeline already run");
        if let FanOut::Pool(workers) = self.config.fan_out {
            assert!(workers > 0, "pipeline worker pool must not be empty");
        }
    }

    fn advance(&mut self, to: Phase) {
        assert_eq!(self.phase.next(), Some(to), "invalid pipeline phase transition");
        debug!(from = ?self.phase, ?to, "pipeline phase");
        self.phase = to;
    }
}

// per-item draining, shared by the blocking and async orchestrators. they drive `next` to
// completion their own way and feed the result to `accept`.
struct PerItem<'p> {
    interval: Option<Duration>,
    // fires when progress is next due.
    ticker: Option<Receiver<Instant>>,
    received: &'p AtomicUsize,
    tracker: &'p Tracker,
    consumers: usize,
}

impl<'p> PerItem<'p> {
    fn new(interval: Option<Duration>, received: &'p AtomicUsize, tracker: &'p Tracker) -> Self {
        PerItem {
            interval,
            ticker: interval.map(after),
            received,
            tracker,
            consumers: 0,
        }
    }

    // receive the next item, racing the progress timer if there is one.
    fn next<T: Send + 'static>(&self, conduit: &Conduit<T>) -> Select<'static, Drain<T>> {
        let select = Select::new().recv(conduit, Drain::from);
        match &self.ticker {
            Some(timer) => select.recv(timer, |_| Drain::Tick),
            None => select,
        }
    }

    // continues with an item and the guard its consumer must hold, or with none after logging
    // progress. breaks with the number of consumers once the conduit is closed and drained.
    fn accept<T>(&mut self, event: Drain<T>) -> ControlFlow<usize, Option<(T, DoneGuard)>> {
        match event {
            Drain::Item(item) => {
                self.received.fetch_add(1, Relaxed);
                self.consumers += 1;
                // register before the consumer is spawned, or the wait could miss it
                ControlFlow::Continue(Some((item, self.tracker.enter())))
            }
            Drain::Tick => {
                debug!(
                    received = self.received.load(Relaxed),
                    in_flight = self.tracker.count(),
                    "pipeline still draining",
                );
                self.ticker = self.interval.map(after);
                ControlFlow::Continue(None)
            }
            Drain::Closed => ControlFlow::Break(self.consumers),
        }
    }
}

// what the orchestrator woke up for while draining.
enum Drain<T> {
    Item(T),
    Tick,
    Closed,
}

impl<T> From<Option<T>> for Drain<T> {
    fn from(item: Option<T>) -> Self {
        match item {
            Some(item) => Drain::Item(item),
            None => Drain::Closed,
        }
    }
}

// closes the conduit when the producer finishes, however it finishes. otherwise a panicking
// producer would leave the orchestrator draining forever.
struct CloseOnDrop<T>(Sender<T>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        if !self.0.is_closed() {
            self.0.close();
        }
    }
}
