//! Streaming session manager: one timer-driven task per live connection.
//!
//! Each session owns a single task that ticks at its own cadence: sample, push a
//! frame, persist a row. Sessions never share state beyond the store. The session
//! table is owned by the manager; removing an entry is what cancels its task, so
//! teardown happens exactly once no matter how many paths ask for it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::IntervalBounds;
use crate::sampler::Sampler;
use crate::store::Store;
use crate::types::{now_ms, Frame, PersistedRow, FRAME_VERSION};

pub type SessionId = u64;

pub const SAMPLE_ERROR_MESSAGE: &str = "Failed to retrieve system metrics";

/// Per-connection options.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub interval: Duration,
    pub persist: bool,
}

struct SessionEntry {
    // dropping the sender cancels the timer loop
    _cancel: oneshot::Sender<()>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    sampler: Sampler,
    store: Store,
    bounds: IntervalBounds,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
    accepting: AtomicBool,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(sampler: Sampler, store: Store, bounds: IntervalBounds) -> Self {
        Self {
            inner: Arc::new(Inner {
                sampler,
                store,
                bounds,
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn bounds(&self) -> IntervalBounds {
        self.inner.bounds
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    pub async fn live_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Start a session that pushes frames into `tx`. The first tick fires right away.
    /// Returns `None` once shutdown has begun.
    pub async fn open(&self, opts: SessionOptions, tx: mpsc::Sender<Frame>) -> Option<SessionId> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.inner.sessions.lock().await;
            // checked under the lock so shutdown can't miss a late entry
            if !self.is_accepting() {
                return None;
            }
            sessions.insert(
                id,
                SessionEntry {
                    _cancel: cancel_tx,
                    task: None,
                },
            );
        }
        info!(
            session = id,
            interval_ms = opts.interval.as_millis() as u64,
            persist = opts.persist,
            "session opened"
        );

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            // a task that dies must still leave the table; unwinding only
            // happens in builds without `panic = "abort"`
            let run = AssertUnwindSafe(manager.run(id, opts, tx, cancel_rx));
            if run.catch_unwind().await.is_err() {
                warn!(session = id, "session task panicked");
            }
            manager.release(id).await;
        });

        if let Some(entry) = self.inner.sessions.lock().await.get_mut(&id) {
            entry.task = Some(handle);
        }
        Some(id)
    }

    /// Cancel a session's timer. Safe to call any number of times; returns whether
    /// this call was the one that tore it down.
    pub async fn close(&self, id: SessionId) -> bool {
        self.release(id).await
    }

    async fn release(&self, id: SessionId) -> bool {
        let removed = self.inner.sessions.lock().await.remove(&id);
        if removed.is_some() {
            info!(session = id, "session closed");
        }
        removed.is_some()
    }

    async fn run(
        &self,
        id: SessionId,
        opts: SessionOptions,
        tx: mpsc::Sender<Frame>,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(opts.interval);
        // a slow tick pushes the next one back instead of bunching them up
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => break,
                _ = ticker.tick() => {}
            }
            if tx.is_closed() {
                debug!(session = id, "connection gone, stopping timer");
                break;
            }
            if self.tick(id, &mut seq, opts.persist, &tx).await.is_err() {
                debug!(session = id, "send failed, stopping timer");
                break;
            }
        }
    }

    /// One sample → push → persist cycle. `Err` means the connection is gone.
    async fn tick(
        &self,
        id: SessionId,
        seq: &mut u64,
        persist: bool,
        tx: &mpsc::Sender<Frame>,
    ) -> Result<(), mpsc::error::SendError<Frame>> {
        let reading = match self.inner.sampler.sample().await {
            Ok(r) => r,
            Err(e) => {
                warn!(session = id, "tick error: {e}");
                return tx
                    .send(Frame::Error {
                        message: SAMPLE_ERROR_MESSAGE.to_string(),
                    })
                    .await;
            }
        };

        let timestamp = now_ms();
        let row = if persist {
            match PersistedRow::from_reading(&reading, timestamp) {
                Ok(row) => Some(row),
                Err(e) => {
                    warn!(session = id, "failed to encode row: {e}");
                    None
                }
            }
        } else {
            None
        };

        tx.send(Frame::Metrics {
            version: FRAME_VERSION,
            seq: *seq,
            timestamp,
            data: reading,
        })
        .await?;
        *seq += 1;

        if let Some(row) = row {
            if let Err(e) = self.inner.store.append(&row).await {
                warn!(session = id, "failed to persist sample: {e}");
            }
        }
        Ok(())
    }

    /// Stop accepting sessions, cancel every live one, and wait up to `grace` for
    /// their tasks to finish before aborting what's left.
    pub async fn shutdown(&self, grace: Duration) {
        let entries: Vec<SessionEntry> = {
            let mut sessions = self.inner.sessions.lock().await;
            self.inner.accepting.store(false, Ordering::Release);
            sessions.drain().map(|(_, e)| e).collect()
        };
        info!(sessions = entries.len(), "cancelling live sessions");

        let handles: Vec<JoinHandle<()>> = entries.into_iter().filter_map(|e| e.task).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("sessions did not stop within {:?}, aborting", grace);
            for a in aborts {
                a.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AcquisitionError;
    use crate::sampler::{MetricsSource, RawReading};
    use std::sync::atomic::AtomicUsize;

    struct Scripted {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl MetricsSource for Scripted {
        fn acquire(&self) -> Result<RawReading, AcquisitionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fail_on {
                return Err(AcquisitionError("sensor read failed".into()));
            }
            Ok(RawReading {
                cpu_total_load: Some(n as f64),
                ..Default::default()
            })
        }
    }

    async fn manager(fail_on: Option<usize>) -> (tempfile::TempDir, Store, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("m.db")).await.unwrap();
        let sampler = Sampler::new(Scripted {
            calls: AtomicUsize::new(0),
            fail_on,
        });
        let mgr = SessionManager::new(sampler, store.clone(), IntervalBounds::new(5, 1_000, 10));
        (dir, store, mgr)
    }

    fn opts(ms: u64) -> SessionOptions {
        SessionOptions {
            interval: Duration::from_millis(ms),
            persist: true,
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(Some(f)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            out.push(f);
        }
        out
    }

    #[tokio::test]
    async fn first_tick_is_eager() {
        let (_dir, _store, mgr) = manager(None).await;
        let (tx, mut rx) = mpsc::channel(1);
        // an hour-long interval: only the eager tick can arrive in time
        mgr.open(opts(3_600_000), tx).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("eager tick")
            .unwrap();
        assert!(matches!(first, Frame::Metrics { seq: 0, version: 1, .. }));
    }

    #[tokio::test]
    async fn one_row_per_tick_and_failures_do_not_end_session() {
        let (_dir, store, mgr) = manager(Some(1)).await;
        let (tx, mut rx) = mpsc::channel(1);
        let id = mgr.open(opts(10), tx).await.unwrap();

        let mut frames = Vec::new();
        while frames.len() < 5 {
            frames.push(rx.recv().await.unwrap());
        }
        assert!(mgr.close(id).await);
        frames.extend(drain(&mut rx).await);

        assert!(matches!(frames[0], Frame::Metrics { .. }));
        assert_eq!(
            frames[1],
            Frame::Error {
                message: SAMPLE_ERROR_MESSAGE.into()
            }
        );
        let seqs: Vec<u64> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Metrics { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
        assert_eq!(store.count().await.unwrap(), seqs.len() as u64);

        let window = crate::store::TimeWindow::clamped(Some(0), None, now_ms());
        let pts = store
            .query_range(window, 2000, crate::types::MetricColumn::CpuLoad)
            .await
            .unwrap();
        assert!(pts.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        // call index 1 failed, so the second stored row came from call 2
        assert_eq!(pts[1].value, 2.0);
    }

    #[tokio::test]
    async fn persist_can_be_disabled() {
        let (_dir, store, mgr) = manager(None).await;
        let (tx, mut rx) = mpsc::channel(1);
        let id = mgr
            .open(
                SessionOptions {
                    interval: Duration::from_millis(10),
                    persist: false,
                },
                tx,
            )
            .await
            .unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        mgr.close(id).await;
        drain(&mut rx).await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn double_close_is_harmless() {
        let (_dir, _store, mgr) = manager(None).await;
        let (tx, mut rx) = mpsc::channel(1);
        let id = mgr.open(opts(10), tx).await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(mgr.live_count().await, 1);

        assert!(mgr.close(id).await);
        assert!(!mgr.close(id).await);
        assert_eq!(mgr.live_count().await, 0);
        // the task exits and drops its sender
        drain(&mut rx).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn store_failures_do_not_stop_the_stream() {
        let (_dir, store, mgr) = manager(None).await;
        let (tx, mut rx) = mpsc::channel(1);
        let id = mgr.open(opts(10), tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Frame::Metrics { seq: 0, .. })));

        // every append from here on fails with Closed
        store.close().await;
        let mut seqs = Vec::new();
        while seqs.len() < 3 {
            match rx.recv().await {
                Some(Frame::Metrics { seq, .. }) => seqs.push(seq),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(mgr.live_count().await, 1);
        assert!(mgr.close(id).await);
    }

    #[tokio::test]
    async fn panicking_session_is_still_released() {
        let (_dir, _store, mgr) = manager(None).await;
        let (tx, mut rx) = mpsc::channel(1);
        // a zero period makes the timer panic inside the task
        mgr.open(
            SessionOptions {
                interval: Duration::ZERO,
                persist: false,
            },
            tx,
        )
        .await
        .unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sender dropped");
        assert!(end.is_none());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while mgr.live_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "session leaked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn dropped_receiver_tears_session_down() {
        let (_dir, _store, mgr) = manager(None).await;
        let (tx, mut rx) = mpsc::channel(1);
        mgr.open(opts(10), tx).await.unwrap();
        rx.recv().await.unwrap();
        drop(rx);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while mgr.live_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "session leaked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn sessions_run_independently() {
        let (_dir, _store, mgr) = manager(None).await;
        let (tx_a, mut rx_a) = mpsc::channel(1);
        let (tx_b, mut rx_b) = mpsc::channel(1);
        let a = mgr.open(opts(10), tx_a).await.unwrap();
        let b = mgr.open(opts(20), tx_b).await.unwrap();
        assert_ne!(a, b);
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();
        mgr.close(a).await;
        // b keeps ticking after a is gone
        drain(&mut rx_a).await;
        assert!(matches!(rx_b.recv().await, Some(Frame::Metrics { .. })));
        assert_eq!(mgr.live_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything_and_refuses_new_sessions() {
        let (_dir, _store, mgr) = manager(None).await;
        let mut rxs = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(1);
            mgr.open(opts(10), tx).await.unwrap();
            rxs.push(rx);
        }
        // keep the receivers draining so in-flight sends can finish
        let drains: Vec<_> = rxs
            .into_iter()
            .map(|mut rx| tokio::spawn(async move { while rx.recv().await.is_some() {} }))
            .collect();

        mgr.shutdown(Duration::from_secs(2)).await;
        assert_eq!(mgr.live_count().await, 0);
        assert!(!mgr.is_accepting());
        for d in drains {
            tokio::time::timeout(Duration::from_secs(2), d)
                .await
                .expect("session task finished")
                .unwrap();
        }

        let (tx, _rx) = mpsc::channel(1);
        assert!(mgr.open(opts(10), tx).await.is_none());
    }
}
