//! Cooperative task scheduler
//!
//! The process-wide event loop: one [`DelayQueue`] of timed callbacks plus a
//! set of socket-readiness registrations, multiplexed through a single
//! `async fn run` intended for a current-thread runtime. Timer and socket
//! callbacks are the only wake sources; everything else in the engine is
//! expressed as a callback registered here.
//!
//! Scheduling is never synchronous: a zero-delay task fires on the next
//! loop iteration, so a completion callback can never nest inside the stack
//! of the call that scheduled it. Re-entrant scheduling from inside a
//! firing callback is legal and common (a pacing timer reschedules itself).

pub mod delay_queue;

pub use delay_queue::{DelayQueue, TaskToken};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::transport::DatagramTransport;
use crate::{Error, Result};

/// A scheduled or read callback; receives the scheduler so it can schedule,
/// cancel, and register further work
pub type TaskFn = Box<dyn FnMut(&mut TaskScheduler)>;

/// Opaque handle for a background read registration
pub type SocketToken = u64;

/// Upper bound on one readiness wait; keeps the wait call well inside any
/// platform timer range and bounds stop-flag latency
const MAX_WAIT_GRANULARITY: Duration = Duration::from_secs(1);

struct ReadRegistration {
    transport: Arc<dyn DatagramTransport>,
    // Taken out of the slot while its callback runs so the callback can
    // borrow the scheduler mutably
    handler: Option<TaskFn>,
}

/// The cooperative event loop
///
/// One instance per engine; created at startup, dropped at shutdown.
/// Entries come and go continuously. Within one iteration expired timers
/// fire before newly-readable sockets; across iterations the only
/// guarantee is that the nearest deadline is never missed by more than the
/// wait granularity.
pub struct TaskScheduler {
    timers: DelayQueue<TaskFn>,
    readers: HashMap<SocketToken, ReadRegistration>,
    next_socket_token: SocketToken,
    /// Advances every readiness wait to rotate the polling order
    poll_rotation: usize,
}

impl TaskScheduler {
    /// Create a new scheduler with no pending work
    pub fn new() -> Self {
        Self {
            timers: DelayQueue::new(),
            readers: HashMap::new(),
            next_socket_token: 1,
            poll_rotation: 0,
        }
    }

    /// Schedule `task` to fire once, `delay` from now
    ///
    /// A zero delay fires on the next loop iteration, never synchronously.
    pub fn schedule_delayed_task(
        &mut self,
        delay: Duration,
        task: impl FnMut(&mut TaskScheduler) + 'static,
    ) -> TaskToken {
        let token = self.timers.schedule(delay, Box::new(task));
        trace!("Scheduled task {} in {:?}", token, delay);
        token
    }

    /// Cancel a pending task; a no-op when it already fired or was never
    /// scheduled. After this returns the task cannot fire.
    pub fn unschedule_delayed_task(&mut self, token: TaskToken) {
        if self.timers.cancel(token).is_some() {
            trace!("Unscheduled task {}", token);
        }
    }

    /// Number of pending delayed tasks
    pub fn pending_tasks(&self) -> usize {
        self.timers.len()
    }

    /// Register `handler` to be invoked whenever `transport` is readable
    pub fn turn_on_background_read_handling(
        &mut self,
        transport: Arc<dyn DatagramTransport>,
        handler: impl FnMut(&mut TaskScheduler) + 'static,
    ) -> SocketToken {
        let token = self.next_socket_token;
        self.next_socket_token += 1;
        self.readers.insert(
            token,
            ReadRegistration {
                transport,
                handler: Some(Box::new(handler)),
            },
        );
        debug!("Background read handling on, token {}", token);
        token
    }

    /// Deregister a background read handler; takes effect before the next
    /// readiness wait
    pub fn turn_off_background_read_handling(&mut self, token: SocketToken) {
        if self.readers.remove(&token).is_some() {
            debug!("Background read handling off, token {}", token);
        }
    }

    /// Run the event loop until `stop` is set
    ///
    /// Each iteration fires every due timer, then blocks on socket
    /// readiness for at most the time to the next deadline (clamped to the
    /// wait granularity). Benign wait errors (interrupted, would-block)
    /// continue the loop; any other readiness-wait failure is fatal and
    /// returns [`Error::EventLoop`] — the loop cannot make progress, and
    /// the caller is expected to tear the engine down.
    pub async fn run(&mut self, stop: Arc<AtomicBool>) -> Result<()> {
        loop {
            if stop.load(Ordering::Relaxed) {
                debug!("Event loop stop flag set, exiting");
                return Ok(());
            }

            // Fire expired timers first. Entries are popped before their
            // callbacks run so a callback may freely reschedule.
            let due = self.timers.pop_due(Instant::now());
            for (token, mut task) in due {
                trace!("Firing task {}", token);
                task(self);
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
            }

            let wait = self
                .timers
                .time_until_next(Instant::now())
                .unwrap_or(MAX_WAIT_GRANULARITY)
                .min(MAX_WAIT_GRANULARITY);

            match self.wait_for_readable(wait).await {
                None => {} // timeout; loop around and fire timers
                Some((token, Ok(()))) => self.dispatch_read(token),
                Some((_, Err(e)))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    trace!("Benign readiness-wait error: {}", e);
                }
                Some((token, Err(e))) => {
                    warn!("Fatal readiness-wait error on socket {}: {}", token, e);
                    return Err(Error::EventLoop(format!(
                        "readiness wait failed: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Block until one registered transport reports readable or the
    /// timeout elapses
    async fn wait_for_readable(
        &mut self,
        timeout: Duration,
    ) -> Option<(SocketToken, std::io::Result<()>)> {
        let mut waiters: Vec<(SocketToken, Arc<dyn DatagramTransport>)> = self
            .readers
            .iter()
            .map(|(token, reg)| (*token, reg.transport.clone()))
            .collect();

        // Readiness ties are broken by polling order; rotate it so one
        // persistently-readable socket cannot starve the others
        if !waiters.is_empty() {
            waiters.sort_by_key(|(token, _)| *token);
            let start = self.poll_rotation % waiters.len();
            waiters.rotate_left(start);
            self.poll_rotation = self.poll_rotation.wrapping_add(1);
        }

        let readiness = async {
            if waiters.is_empty() {
                futures::future::pending::<(SocketToken, std::io::Result<()>)>().await
            } else {
                let waits: Vec<_> = waiters
                    .into_iter()
                    .map(|(token, transport)| {
                        Box::pin(async move { (token, transport.wait_readable().await) })
                    })
                    .collect();
                let (result, _, _) = futures::future::select_all(waits).await;
                result
            }
        };

        tokio::select! {
            biased;
            _ = tokio::time::sleep(timeout) => None,
            result = readiness => Some(result),
        }
    }

    fn dispatch_read(&mut self, token: SocketToken) {
        let Some(reg) = self.readers.get_mut(&token) else {
            return;
        };
        let Some(mut handler) = reg.handler.take() else {
            return;
        };

        handler(self);

        // Put the handler back unless the callback deregistered itself
        if let Some(reg) = self.readers.get_mut(&token) {
            if reg.handler.is_none() {
                reg.handler = Some(handler);
            }
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn stop_after(scheduler: &mut TaskScheduler, delay: Duration, stop: Arc<AtomicBool>) {
        scheduler.schedule_delayed_task(delay, move |_| {
            stop.store(true, Ordering::Relaxed);
        });
    }

    #[tokio::test]
    async fn test_tasks_fire_in_deadline_order() {
        let mut scheduler = TaskScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let o = order.clone();
        scheduler.schedule_delayed_task(Duration::from_millis(10), move |_| {
            o.lock().push("a");
        });
        let o = order.clone();
        scheduler.schedule_delayed_task(Duration::from_millis(5), move |_| {
            o.lock().push("b");
        });
        stop_after(&mut scheduler, Duration::from_millis(30), stop.clone());

        scheduler.run(stop).await.unwrap();
        assert_eq!(*order.lock(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_cancelled_task_never_fires() {
        let mut scheduler = TaskScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let o = order.clone();
        scheduler.schedule_delayed_task(Duration::from_millis(10), move |_| {
            o.lock().push("a");
        });
        let o = order.clone();
        let b = scheduler.schedule_delayed_task(Duration::from_millis(5), move |_| {
            o.lock().push("b");
        });
        scheduler.unschedule_delayed_task(b);
        // Unscheduling twice is a no-op
        scheduler.unschedule_delayed_task(b);
        stop_after(&mut scheduler, Duration::from_millis(30), stop.clone());

        scheduler.run(stop).await.unwrap();
        assert_eq!(*order.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_callback_reschedules_itself() {
        let mut scheduler = TaskScheduler::new();
        let count = Arc::new(Mutex::new(0u32));
        let stop = Arc::new(AtomicBool::new(false));

        fn tick(count: Arc<Mutex<u32>>, scheduler: &mut TaskScheduler) {
            let mut n = count.lock();
            *n += 1;
            if *n < 3 {
                let count = count.clone();
                drop(n);
                scheduler
                    .schedule_delayed_task(Duration::from_millis(1), move |s| {
                        tick(count.clone(), s)
                    });
            }
        }

        let c = count.clone();
        scheduler.schedule_delayed_task(Duration::ZERO, move |s| tick(c.clone(), s));
        stop_after(&mut scheduler, Duration::from_millis(50), stop.clone());

        scheduler.run(stop).await.unwrap();
        assert_eq!(*count.lock(), 3);
    }

    #[tokio::test]
    async fn test_zero_delay_fires_but_not_synchronously() {
        let mut scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let f = fired.clone();
        scheduler.schedule_delayed_task(Duration::ZERO, move |_| {
            f.store(true, Ordering::Relaxed);
        });
        // Nothing fires until the loop runs
        assert!(!fired.load(Ordering::Relaxed));

        stop_after(&mut scheduler, Duration::from_millis(5), stop.clone());
        scheduler.run(stop).await.unwrap();
        assert!(fired.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_read_handler_invoked_on_readable_transport() {
        use crate::transport::{DatagramRead, DatagramTransport};
        use async_trait::async_trait;
        use std::net::SocketAddr;

        // A transport that is readable exactly once
        struct OneShot {
            consumed: std::sync::atomic::AtomicBool,
        }

        #[async_trait]
        impl DatagramTransport for OneShot {
            async fn wait_readable(&self) -> std::io::Result<()> {
                if self.consumed.load(Ordering::Relaxed) {
                    futures::future::pending::<()>().await;
                }
                Ok(())
            }

            fn read_datagram(&self, buf: &mut [u8]) -> crate::Result<DatagramRead> {
                if self.consumed.swap(true, Ordering::Relaxed) {
                    return Ok(DatagramRead::WouldBlock);
                }
                buf[..4].copy_from_slice(b"data");
                Ok(DatagramRead::Datagram {
                    len: 4,
                    from: "127.0.0.1:9".parse::<SocketAddr>().unwrap(),
                })
            }

            fn write_datagram(&self, _dest: SocketAddr, _payload: &[u8]) -> crate::Result<()> {
                Ok(())
            }
        }

        let mut scheduler = TaskScheduler::new();
        let stop = Arc::new(AtomicBool::new(false));
        let got = Arc::new(Mutex::new(Vec::new()));

        let transport = Arc::new(OneShot {
            consumed: std::sync::atomic::AtomicBool::new(false),
        });
        let t = transport.clone();
        let g = got.clone();
        scheduler.turn_on_background_read_handling(transport.clone(), move |_| {
            let mut buf = [0u8; 16];
            while let Ok(DatagramRead::Datagram { len, .. }) = t.read_datagram(&mut buf) {
                g.lock().extend_from_slice(&buf[..len]);
            }
        });
        stop_after(&mut scheduler, Duration::from_millis(20), stop.clone());

        scheduler.run(stop).await.unwrap();
        assert_eq!(&*got.lock(), b"data");
    }

    #[tokio::test]
    async fn test_busy_socket_does_not_starve_another() {
        use crate::transport::{DatagramRead, DatagramTransport};
        use async_trait::async_trait;
        use std::net::SocketAddr;

        // Always readable, never yields a datagram; the handler just counts
        struct AlwaysReady;

        #[async_trait]
        impl DatagramTransport for AlwaysReady {
            async fn wait_readable(&self) -> std::io::Result<()> {
                Ok(())
            }
            fn read_datagram(&self, _buf: &mut [u8]) -> crate::Result<DatagramRead> {
                Ok(DatagramRead::WouldBlock)
            }
            fn write_datagram(&self, _dest: SocketAddr, _payload: &[u8]) -> crate::Result<()> {
                Ok(())
            }
        }

        let mut scheduler = TaskScheduler::new();
        let stop = Arc::new(AtomicBool::new(false));
        let counts = Arc::new(Mutex::new([0u32; 2]));

        for slot in 0..2 {
            let c = counts.clone();
            scheduler.turn_on_background_read_handling(Arc::new(AlwaysReady), move |_| {
                c.lock()[slot] += 1;
            });
        }
        stop_after(&mut scheduler, Duration::from_millis(20), stop.clone());

        scheduler.run(stop).await.unwrap();
        let counts = counts.lock();
        assert!(counts[0] > 0, "first socket never dispatched: {:?}", *counts);
        assert!(counts[1] > 0, "second socket never dispatched: {:?}", *counts);
    }
}
