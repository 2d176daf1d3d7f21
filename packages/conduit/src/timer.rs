//! Timer conduits, for layering timeouts on top of [`Select`](crate::Select).

use crate::channel::api::{Conduit, Receiver, Sender};
use std::{
    thread,
    time::{Duration, Instant},
};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    time::sleep,
};


/// Create a conduit which receives the current instant once `duration` has elapsed, and is closed
/// right after
///
/// Racing a receive against this in a [`Select`](crate::Select) gives it a timeout. Sending never
/// blocks since the conduit has room for the one message.
///
/// When called from within a multi-threaded tokio runtime, the timer is a task on that runtime.
/// Otherwise it runs on its own thread.
pub fn after(duration: Duration) -> Receiver<Instant> {
    let conduit = Conduit::new(1);
    let send = conduit.send_only();
    match Handle::try_current() {
        // a current-thread runtime is stalled while its thread blocks on the timer, so it could
        // never fire
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            handle.spawn(async move {
                sleep(duration).await;
                fire(&send);
            });
        }
        _ => {
            let spawned = thread::Builder::new()
                .name("conduit-timer".into())
                .spawn(move || {
                    thread::sleep(duration);
                    fire(&send);
                });
            if let Err(e) = spawned {
                // without a thread the timer can't fire, so fire it right away rather than never
                error!(%e, "failed to spawn timer thread");
                fire(&conduit.send_only());
            }
        }
    }
    conduit.recv_only()
}

fn fire(send: &Sender<Instant>) {
    if send.try_send(Instant::now()).is_err() {
        warn!("timer conduit unexpectedly full");
    }
    send.close();
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_then_closes() {
        let start = Instant::now();
        let timer = after(Duration::from_millis(20));
        let fired = timer.recv().block().unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(20));
        assert_eq!(timer.recv().block(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fires_on_runtime() {
        let start = Instant::now();
        let timer = after(Duration::from_millis(20));
        let fired = tokio::time::timeout(Duration::from_secs(5), timer.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(20));
        assert_eq!(timer.recv().await, None);
    }

    #[tokio::test]
    async fn fires_on_current_thread_runtime() {
        // blocking here stalls the runtime, so this only fires if the timer isn't a task on it
        let timer = after(Duration::from_millis(10));
        assert!(timer.recv().block().is_some());
    }
}
