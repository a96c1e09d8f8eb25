//! Runs named periodic jobs once the bots are ready and stops them cleanly.

use poise::BoxFuture;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, info_span, Instrument};

pub type TaskHandler<C> = fn(C) -> BoxFuture<'static, anyhow::Result<()>>;

pub struct PeriodicTask<C> {
    pub name: &'static str,
    pub interval: Duration,
    pub handler: TaskHandler<C>,
}

pub struct TaskSupervisor<C> {
    tasks: Mutex<Vec<PeriodicTask<C>>>,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Clone + Send + 'static> TaskSupervisor<C> {
    pub fn new(tasks: Vec<PeriodicTask<C>>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(tasks),
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns one loop per task. Loops idle until `ready` resolves, then run immediately and
    /// at every interval until [`stop`](Self::stop).
    pub fn start<R>(&self, ready: R, ctx: C)
    where
        R: Future<Output = ()> + Send + 'static,
    {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let (ready_tx, ready_rx) = watch::channel(false);

        let mut stop_rx = self.stop_tx.subscribe();
        let gate = tokio::spawn(async move {
            tokio::select! {
                _ = ready => {
                    ready_tx.send_replace(true);
                }
                _ = stopped(&mut stop_rx) => {}
            }
        });

        let mut handles = self.handles.lock().unwrap();
        handles.push(gate);
        for task in tasks {
            let stop_rx = self.stop_tx.subscribe();
            let ready_rx = ready_rx.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(
                run_loop(task, ctx, ready_rx, stop_rx).instrument(info_span!("periodic")),
            ));
        }
    }

    /// Signals every loop to stop and waits for in-flight runs, up to `timeout`.
    pub async fn stop(&self, timeout: Duration) {
        self.stop_tx.send_replace(true);
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            error!("Periodic tasks did not stop within {:?}", timeout);
        }
    }
}

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

async fn run_loop<C: Clone + Send + 'static>(
    task: PeriodicTask<C>,
    ctx: C,
    mut ready_rx: watch::Receiver<bool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        ready = async { ready_rx.wait_for(|ready| *ready).await.is_ok() } => {
            if !ready {
                return;
            }
        }
        _ = stopped(&mut stop_rx) => return,
    }

    info!("Starting periodic task {} every {:?}", task.name, task.interval);
    let mut ticker = interval(task.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            _ = ticker.tick() => {}
        }

        // Each run is its own tokio task so a panic stays contained.
        let run = tokio::spawn((task.handler)(ctx.clone()).instrument(info_span!("task", task = task.name)));
        match run.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Periodic task {} failed: {:#}", task.name, e),
            Err(e) if e.is_panic() => {
                error!("Periodic task {} panicked, it will not run again: {}", task.name, e);
                break;
            }
            Err(e) => error!("Periodic task {} was cancelled: {}", task.name, e),
        }
    }
    info!("Stopped periodic task {}", task.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Counters {
        ok: Arc<AtomicUsize>,
        failing: Arc<AtomicUsize>,
        panicking: Arc<AtomicUsize>,
        slow_finished: Arc<AtomicUsize>,
    }

    fn ok(c: Counters) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            c.ok.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn failing(c: Counters) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            c.failing.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("remote service unavailable")
        })
    }

    fn panicking(c: Counters) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            if c.panicking.fetch_add(1, Ordering::SeqCst) < usize::MAX {
                panic!("bad row");
            }
            Ok(())
        })
    }

    fn slow(c: Counters) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            c.slow_finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn task(name: &'static str, handler: TaskHandler<Counters>) -> PeriodicTask<Counters> {
        PeriodicTask {
            name,
            interval: Duration::from_millis(20),
            handler,
        }
    }

    #[tokio::test]
    async fn test_waits_for_ready_then_runs_and_isolates_panics() {
        let counters = Counters::default();
        let supervisor = TaskSupervisor::new(vec![
            task("ok", ok),
            task("failing", failing),
            task("panicking", panicking),
        ]);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        supervisor.start(
            async move {
                let _ = ready_rx.await;
            },
            counters.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counters.ok.load(Ordering::SeqCst), 0, "must not run before ready");

        ready_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        supervisor.stop(Duration::from_secs(2)).await;

        assert!(counters.ok.load(Ordering::SeqCst) >= 2);
        // Errors are retried on the next tick.
        assert!(counters.failing.load(Ordering::SeqCst) >= 2);
        // A panic ends only that loop.
        assert_eq!(counters.panicking.load(Ordering::SeqCst), 1);

        let after_stop = counters.ok.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counters.ok.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_run() {
        let counters = Counters::default();
        let supervisor = TaskSupervisor::new(vec![task("slow", slow)]);
        supervisor.start(async {}, counters.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        supervisor.stop(Duration::from_secs(2)).await;
        assert_eq!(counters.slow_finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_before_ready() {
        let counters = Counters::default();
        let supervisor = TaskSupervisor::new(vec![task("ok", ok)]);
        supervisor.start(std::future::pending(), counters.clone());
        supervisor.stop(Duration::from_secs(1)).await;
        assert_eq!(counters.ok.load(Ordering::SeqCst), 0);
    }
}
