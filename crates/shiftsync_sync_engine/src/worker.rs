//! Background task that drives the retry queue.

use crate::error::{SyncError, SyncResult};
use crate::retry::{BatchKey, QuarantinedBatch, QueueStatus, RetryDecision, RetryQueue};
use crate::state::{SyncApplier, SyncEngine};
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use shiftsync_protocol::EntityType;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// External events that make sync worth attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// The network came back.
    ConnectivityRegained,
    /// The application returned to the foreground.
    Foregrounded,
    /// A local operation was recorded. Only schedules a push.
    LocalWrite,
    /// The periodic timer fired.
    PeriodicTick,
}

#[derive(Debug)]
enum Command {
    Signal(SyncSignal),
    Pause,
    Resume,
    Release(BatchKey),
    Shutdown,
}

/// Runs sync batches in the background with backoff.
///
/// Dropping the worker aborts its task; [`shutdown`](Self::shutdown) also
/// waits for it.
pub struct RetryWorker {
    commands: mpsc::UnboundedSender<Command>,
    queue: Arc<Mutex<RetryQueue>>,
    task: Option<JoinHandle<()>>,
}

impl RetryWorker {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn<T, A>(engine: Arc<SyncEngine<T, A>>) -> Self
    where
        T: SyncTransport + 'static,
        A: SyncApplier + 'static,
    {
        let queue = Arc::new(Mutex::new(RetryQueue::new(engine.config().retry.clone())));
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(engine, Arc::clone(&queue), rx));
        Self {
            commands,
            queue,
            task: Some(task),
        }
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::Cancelled)
    }

    /// Delivers a signal.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] if the worker has stopped.
    pub fn signal(&self, signal: SyncSignal) -> SyncResult<()> {
        self.send(Command::Signal(signal))
    }

    /// Stops starting new attempts. Attempts in flight run to completion.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] if the worker has stopped.
    pub fn pause(&self) -> SyncResult<()> {
        self.send(Command::Pause)
    }

    /// Resumes after [`pause`](Self::pause).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] if the worker has stopped.
    pub fn resume(&self) -> SyncResult<()> {
        self.send(Command::Resume)
    }

    /// Gives a quarantined batch a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] if the worker has stopped.
    pub fn release(&self, key: BatchKey) -> SyncResult<()> {
        self.send(Command::Release(key))
    }

    /// Counts per state.
    pub fn status(&self) -> QueueStatus {
        self.queue.lock().status()
    }

    /// Batches that are no longer retried automatically.
    pub fn quarantined(&self) -> Vec<QuarantinedBatch> {
        self.queue.lock().quarantined().cloned().collect()
    }

    /// Stops the worker, aborting attempts in flight, and waits for it.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "retry worker ended abnormally");
            }
        }
    }
}

impl Drop for RetryWorker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn enqueue_signal(queue: &Mutex<RetryQueue>, entity_types: &[EntityType], signal: SyncSignal) {
    let now = Instant::now();
    let mut queue = queue.lock();
    queue.enqueue(BatchKey::Push, now);
    if signal != SyncSignal::LocalWrite {
        for &entity_type in entity_types {
            queue.enqueue(BatchKey::Pull(entity_type), now);
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn attempt<T, A>(engine: Arc<SyncEngine<T, A>>, key: BatchKey) -> (BatchKey, SyncResult<u64>)
where
    T: SyncTransport,
    A: SyncApplier,
{
    let result = match engine.ensure_handshake().await {
        Ok(()) => match key {
            BatchKey::Push => engine.push_pending().await,
            BatchKey::Pull(entity_type) => engine.pull_entity(entity_type).await,
        },
        Err(e) => Err(e),
    };
    if result.is_err() {
        engine.forget_handshake().await;
    }
    (key, result)
}

async fn run<T, A>(
    engine: Arc<SyncEngine<T, A>>,
    queue: Arc<Mutex<RetryQueue>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    T: SyncTransport + 'static,
    A: SyncApplier + 'static,
{
    let entity_types = engine.config().entity_types.clone();
    let mut in_flight = JoinSet::new();
    let mut paused = false;
    let mut ticker = engine.config().sync_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    info!(types = entity_types.len(), "retry worker started");

    loop {
        let wakeup = if paused {
            None
        } else {
            let now = Instant::now();
            let mut queue = queue.lock();
            for key in queue.due(now) {
                if queue.begin(key, now) {
                    debug!(%key, "batch attempt started");
                    in_flight.spawn(attempt(Arc::clone(&engine), key));
                }
            }
            queue.purge_expired(now);
            queue.next_wakeup()
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Signal(signal)) => {
                    debug!(?signal, "sync signal");
                    enqueue_signal(&queue, &entity_types, signal);
                }
                Some(Command::Pause) => paused = true,
                Some(Command::Resume) => paused = false,
                Some(Command::Release(key)) => {
                    if queue.lock().release(key, Instant::now()) {
                        info!(%key, "quarantined batch released");
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                Ok((key, Ok(count))) => {
                    debug!(%key, count, "batch acknowledged");
                    queue.lock().acknowledge(key, Instant::now());
                }
                Ok((key, Err(e))) => {
                    let decision = queue.lock().fail(key, Instant::now(), &e);
                    if let Some(RetryDecision::RetryAt(at)) = decision {
                        debug!(%key, error = %e, wait_ms = (at - Instant::now()).as_millis() as u64, "batch will be retried");
                    }
                }
                Err(e) => error!(error = %e, "batch attempt panicked"),
            },
            () = sleep_until(wakeup) => {}
            () = tick(&mut ticker) => enqueue_signal(&queue, &entity_types, SyncSignal::PeriodicTick),
        }
    }

    in_flight.shutdown().await;
    info!("retry worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncConfig};
    use crate::transport::MockTransport;
    use shiftsync_core::{MergeRuleRegistry, Replica, ReplicaConfig};
    use shiftsync_protocol::{
        ActorId, DeviceId, EntityId, FieldPath, HandshakeResponse, OpKind, OpValue, PROTOCOL_VERSION,
    };
    use std::time::Duration;

    fn worker(max_attempts: u32) -> (Arc<Replica>, Arc<SyncEngine<MockTransport, Replica>>, RetryWorker) {
        let config = ReplicaConfig::new(DeviceId::new("tablet-1").unwrap(), ActorId::new("crew").unwrap());
        let replica =
            Arc::new(Replica::in_memory(config, Arc::new(MergeRuleRegistry::standard().unwrap())).unwrap());
        replica
            .record(
                EntityType::Shift,
                EntityId::new("shift-1").unwrap(),
                OpKind::Update,
                Some(FieldPath::parse("notes").unwrap()),
                Some(OpValue::text("belt slipping")),
            )
            .unwrap();
        let sync = SyncConfig::new(replica.device_id().clone())
            .with_entity_types([EntityType::Shift])
            .with_retry(RetryConfig::new(max_attempts));
        let engine = Arc::new(SyncEngine::new(sync, MockTransport::new(), Arc::clone(&replica)));
        let worker = RetryWorker::spawn(Arc::clone(&engine));
        (replica, engine, worker)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let (replica, engine, worker) = worker(5);
        engine.transport().fail_next(2, true);

        worker.signal(SyncSignal::LocalWrite).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        // Handshakes failed at 0 s and 1 s, next attempt at 3 s.
        assert_eq!(engine.transport().call_count(), 2);
        assert_eq!(worker.status().failed, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.transport().call_count(), 4);
        assert_eq!(engine.transport().pushed_requests().len(), 1);
        assert_eq!(worker.status().acknowledged, 1);
        assert_eq!(replica.sync_status().unwrap().pending_ops, 0);
        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_batch_is_quarantined_until_released() {
        let (_replica, engine, worker) = worker(3);
        engine.transport().fail_next(10, true);

        worker.signal(SyncSignal::LocalWrite).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.transport().call_count(), 3);
        let quarantined = worker.quarantined();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].key, BatchKey::Push);
        assert_eq!(quarantined[0].attempts, 3);

        // Further signals leave a quarantined batch alone.
        worker.signal(SyncSignal::LocalWrite).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.transport().call_count(), 3);

        worker.release(BatchKey::Push).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.transport().call_count(), 4);
        assert!(worker.quarantined().is_empty());
        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_quarantines_immediately() {
        let (_replica, engine, worker) = worker(5);
        engine.transport().fail_next(1, false);

        worker.signal(SyncSignal::LocalWrite).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(engine.transport().call_count(), 1);
        assert_eq!(worker.status().quarantined, 1);
        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_handshake_quarantines_before_any_push() {
        let (replica, engine, worker) = worker(5);
        engine.transport().set_handshake_response(HandshakeResponse {
            protocol_version: PROTOCOL_VERSION + 1,
            server_time: 0,
            accepted: true,
            message: None,
        });

        worker.signal(SyncSignal::LocalWrite).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(engine.transport().call_count(), 1);
        assert!(engine.transport().pushed_requests().is_empty());
        assert_eq!(worker.status().quarantined, 1);
        assert_eq!(replica.sync_status().unwrap().pending_ops, 1);
        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn paused_worker_starts_nothing() {
        let (_replica, engine, worker) = worker(5);

        worker.pause().unwrap();
        worker.signal(SyncSignal::Foregrounded).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.transport().call_count(), 0);
        assert_eq!(worker.status().pending, 2);

        worker.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // One handshake, then one push and one pull of the only configured type.
        assert_eq!(engine.transport().call_count(), 3);
        assert_eq!(engine.transport().pull_count(), 1);
        assert_eq!(worker.status().acknowledged, 2);
        worker.shutdown().await;
    }
}
