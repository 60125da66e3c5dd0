//! Per-connection operation lane.
//!
//! A lane is a single worker task that owns a resource (the session slot)
//! and runs queued jobs against it one at a time, in submission order.
//! Jobs for different lanes progress independently.

use crate::ftp::error::{FtpError, FtpResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

fn boxed_job<S, F>(f: F) -> Job<S>
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// FIFO single-consumer queue bound to one resource.
pub struct OperationLane<S> {
    name: String,
    tx: StdMutex<Option<mpsc::Sender<Job<S>>>>,
    worker: StdMutex<Option<JoinHandle<S>>>,
    pending: Arc<AtomicUsize>,
    depth: usize,
    command_timeout: Duration,
}

impl<S: Send + 'static> OperationLane<S> {
    /// Start the worker for `resource`. Must be called inside a tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        resource: S,
        depth: usize,
        command_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let depth = depth.max(1);
        let (tx, mut rx) = mpsc::channel::<Job<S>>(depth);

        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            let mut resource = resource;
            while let Some(job) = rx.recv().await {
                job(&mut resource).await;
            }
            log::debug!("Lane {} drained", worker_name);
            resource
        });

        Self {
            name,
            tx: StdMutex::new(Some(tx)),
            worker: StdMutex::new(Some(worker)),
            pending: Arc::new(AtomicUsize::new(0)),
            depth,
            command_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entries submitted but not yet finished (the running one included).
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_closed(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.as_ref().map_or(true, |tx| tx.is_closed()),
            Err(_) => true,
        }
    }

    /// Append `op` to the lane.
    ///
    /// The entry is submitted before this returns, so the order of `enqueue`
    /// calls is the execution order. Dropping the returned future before the
    /// entry starts makes the worker skip it; dropping it while the entry
    /// runs aborts the entry.
    pub fn enqueue<T, F>(&self, op: F) -> impl Future<Output = FtpResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FtpResult<T>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<FtpResult<T>>();
        let submitted = self.submit(op, reply_tx);
        let name = self.name.clone();

        async move {
            submitted?;
            match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(FtpError::disconnected(format!(
                    "Lane {} stopped before the operation completed",
                    name
                ))),
            }
        }
    }

    fn submit<T, F>(&self, op: F, mut reply: oneshot::Sender<FtpResult<T>>) -> FtpResult<()>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, FtpResult<T>> + Send + 'static,
    {
        let pending = self.pending.clone();
        let timeout = self.command_timeout;
        let name = self.name.clone();

        let entry = boxed_job(move |resource: &mut S| {
            async move {
                if reply.is_closed() {
                    log::debug!("Lane {}: skipping abandoned entry", name);
                    pending.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
                let outcome = tokio::select! {
                    out = tokio::time::timeout(timeout, op(resource)) => Some(out),
                    _ = reply.closed() => None,
                };
                match outcome {
                    Some(Ok(result)) => {
                        let _ = reply.send(result);
                    }
                    Some(Err(_)) => {
                        log::warn!(
                            "Lane {}: operation exceeded {}ms",
                            name,
                            timeout.as_millis()
                        );
                        let _ = reply.send(Err(FtpError::timeout(format!(
                            "Operation on {} timed out after {}ms",
                            name,
                            timeout.as_millis()
                        ))
                        .with_connection(&name)));
                    }
                    None => log::debug!("Lane {}: running entry aborted by caller", name),
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            .boxed()
        });

        let guard = self
            .tx
            .lock()
            .map_err(|_| FtpError::disconnected(format!("Lane {} is poisoned", self.name)))?;
        let tx = guard
            .as_ref()
            .ok_or_else(|| FtpError::disconnected(format!("Lane {} is shut down", self.name)))?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Err(FtpError::queue_full(&self.name, self.depth).with_connection(&self.name))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Err(FtpError::disconnected(format!("Lane {} is closed", self.name))
                    .with_connection(&self.name))
            }
        }
    }

    /// Stop accepting entries, let the queued ones finish, and hand the
    /// resource back. `None` if the lane was already shut down.
    pub async fn shutdown(&self) -> Option<S> {
        let tx = self.tx.lock().ok().and_then(|mut guard| guard.take());
        drop(tx);
        let worker = self.worker.lock().ok().and_then(|mut guard| guard.take())?;
        match worker.await {
            Ok(resource) => Some(resource),
            Err(e) => {
                log::error!("Lane {} worker failed: {}", self.name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;
    use std::sync::atomic::AtomicBool;

    fn lane<S: Send + 'static>(resource: S) -> OperationLane<S> {
        OperationLane::spawn("test", resource, 16, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn entries_run_in_call_order_without_interleaving() {
        let lane = lane(Vec::<String>::new());

        let a = lane.enqueue(|log| {
            async move {
                log.push("start A".into());
                tokio::time::sleep(Duration::from_millis(30)).await;
                log.push("end A".into());
                Ok(())
            }
            .boxed()
        });
        let b = lane.enqueue(|log| {
            async move {
                log.push("start B".into());
                log.push("end B".into());
                Ok(())
            }
            .boxed()
        });
        let c = lane.enqueue(|log| {
            async move {
                log.push("start C".into());
                tokio::time::sleep(Duration::from_millis(5)).await;
                log.push("end C".into());
                Ok(())
            }
            .boxed()
        });

        // Await out of order: execution order is fixed at submission.
        c.await.unwrap();
        b.await.unwrap();
        a.await.unwrap();

        let log = lane.shutdown().await.unwrap();
        assert_eq!(
            log,
            vec!["start A", "end A", "start B", "end B", "start C", "end C"]
        );
    }

    #[tokio::test]
    async fn lanes_do_not_block_each_other() {
        let slow = lane(());
        let fast = lane(0u32);
        let (_hold, gate) = oneshot::channel::<()>();

        let blocked = slow.enqueue(move |_| {
            async move {
                let _ = gate.await;
                Ok(())
            }
            .boxed()
        });
        let blocked = tokio::spawn(blocked);

        let n = tokio::time::timeout(
            Duration::from_secs(1),
            fast.enqueue(|n| {
                async move {
                    *n += 1;
                    Ok(*n)
                }
                .boxed()
            }),
        )
        .await
        .expect("fast lane was blocked")
        .unwrap();

        assert_eq!(n, 1);
        assert!(!blocked.is_finished());
        blocked.abort();
    }

    #[tokio::test]
    async fn failed_entry_does_not_poison_lane() {
        let lane = lane(0u32);

        let failed = lane.enqueue(|_| {
            async move { Err::<(), _>(FtpError::from_reply(550, "550 No such file")) }.boxed()
        });
        let next = lane.enqueue(|n| {
            async move {
                *n += 1;
                Ok(*n)
            }
            .boxed()
        });

        assert_eq!(failed.await.unwrap_err().kind, FtpErrorKind::NotFound);
        assert_eq!(next.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_entry_is_skipped() {
        let lane = lane(Vec::<&'static str>::new());
        let (release, gate) = oneshot::channel::<()>();

        let first = lane.enqueue(move |log| {
            async move {
                let _ = gate.await;
                log.push("first");
                Ok(())
            }
            .boxed()
        });
        let first = tokio::spawn(first);

        let abandoned = lane.enqueue(|log| {
            async move {
                log.push("abandoned");
                Ok(())
            }
            .boxed()
        });
        drop(abandoned);

        let last = lane.enqueue(|log| {
            async move {
                log.push("last");
                Ok(())
            }
            .boxed()
        });

        release.send(()).unwrap();
        first.await.unwrap().unwrap();
        last.await.unwrap();

        assert_eq!(lane.pending(), 0);
        assert_eq!(lane.shutdown().await.unwrap(), vec!["first", "last"]);
    }

    #[tokio::test]
    async fn dropping_running_entry_aborts_it() {
        let lane = lane(());
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let long = lane.enqueue(move |_| {
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), long)
            .await
            .is_err());

        let next = tokio::time::timeout(
            Duration::from_secs(1),
            lane.enqueue(|_| async move { Ok(7u8) }.boxed()),
        )
        .await
        .expect("lane stuck behind aborted entry");
        assert_eq!(next.unwrap(), 7);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_entry_times_out() {
        let lane = OperationLane::spawn("slow", (), 4, Duration::from_millis(100));

        let err = lane
            .enqueue(|_| {
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, FtpErrorKind::Timeout);
        assert!(err.is_retryable());
        assert_eq!(lane.enqueue(|_| async move { Ok(1) }.boxed()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_lane_rejects_new_entries() {
        let lane = OperationLane::spawn("tiny", (), 1, Duration::from_secs(30));
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release, gate) = oneshot::channel::<()>();

        let running = tokio::spawn(lane.enqueue(move |_| {
            async move {
                let _ = started_tx.send(());
                let _ = gate.await;
                Ok(())
            }
            .boxed()
        }));
        started_rx.await.unwrap();

        let queued = lane.enqueue(|_| async move { Ok(()) }.boxed());
        let rejected = lane.enqueue(|_| async move { Ok(()) }.boxed()).await;
        assert_eq!(rejected.unwrap_err().kind, FtpErrorKind::QueueFull);

        release.send(()).unwrap();
        running.await.unwrap().unwrap();
        queued.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_then_rejects() {
        let lane = lane(0u32);
        let mut waiting = Vec::new();
        for _ in 0..3 {
            waiting.push(lane.enqueue(|n| {
                async move {
                    *n += 1;
                    Ok(())
                }
                .boxed()
            }));
        }

        assert_eq!(lane.shutdown().await, Some(3));
        for entry in waiting {
            entry.await.unwrap();
        }
        assert!(lane.is_closed());
        let err = lane.enqueue(|_| async move { Ok(()) }.boxed()).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Disconnected);
        assert_eq!(lane.shutdown().await, None);
    }
}
