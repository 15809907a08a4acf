//! Serialized outbound-operation queue.
//!
//! A single worker task drains jobs in FIFO order and fully settles each one
//! (success, failure or timeout) before starting the next, so two
//! session-mutating operations never overlap.
//!
//! Each job's action runs as its own task and is raced against the job's
//! budget. When the budget wins the caller gets [`CourierError::Timeout`] and
//! the action is detached, not cancelled: whatever provider call it was
//! making may still finish later, with nobody observing the result. The
//! action is handed a [`JobTicket`] so it can check, before starting any
//! new provider call, whether its caller has already been answered.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CourierError, Result};
use crate::sync::lock;

/// Delivers a terminal error to the caller unless the action already did.
type Abandon = Box<dyn FnOnce(CourierError) + Send>;

/// Lets a running action see whether the queue gave up on it.
#[derive(Clone, Debug)]
pub struct JobTicket {
    id: u64,
    abandoned: Arc<AtomicBool>,
}

impl JobTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once the caller has been handed a terminal error for this job.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Fail with `Timeout` if the job was abandoned.
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_abandoned() {
            return Err(CourierError::Timeout(format!(
                "job {} was abandoned before it started",
                self.id
            )));
        }
        Ok(())
    }
}

struct Job {
    id: u64,
    timeout: Duration,
    action: BoxFuture<'static, ()>,
    abandon: Abandon,
}

/// Handle to the queue. Clones share the same worker.
#[derive(Clone)]
pub struct OperationQueue {
    tx: mpsc::UnboundedSender<Job>,
    next_id: Arc<AtomicU64>,
    depth: Arc<AtomicUsize>,
}

impl OperationQueue {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// The worker exits once every handle has been dropped and the backlog
    /// is drained.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_worker(rx, Arc::clone(&depth)));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            depth,
        }
    }

    /// Append a job and wait for its outcome.
    ///
    /// The outcome is delivered exactly once: the action's own result, or a
    /// `Timeout` if `timeout` elapsed first. The queue never retries.
    pub async fn enqueue<T, F, Fut>(&self, action: F, timeout: Duration) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(JobTicket) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = JobTicket {
            id,
            abandoned: Arc::new(AtomicBool::new(false)),
        };

        let deliver = Arc::clone(&slot);
        let abandoned = Arc::clone(&ticket.abandoned);
        let action = async move {
            let outcome = action(ticket).await;
            if let Some(tx) = lock(&deliver).take() {
                let _ = tx.send(outcome);
            }
        }
        .boxed();

        let abandon: Abandon = Box::new(move |err| {
            abandoned.store(true, Ordering::SeqCst);
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(Err(err));
            }
        });

        self.depth.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            id,
            timeout,
            action,
            abandon,
        };
        if self.tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(CourierError::Internal("operation queue is closed".to_string()));
        }
        log::debug!("job {} enqueued (budget {:?})", id, timeout);

        rx.await.map_err(|_| {
            CourierError::Internal(format!("job {id} was dropped without an outcome"))
        })?
    }

    /// Jobs waiting or running.
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>, depth: Arc<AtomicUsize>) {
    while let Some(job) = rx.recv().await {
        let Job {
            id,
            timeout,
            action,
            abandon,
        } = job;

        let mut handle = tokio::spawn(action);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => log::debug!("job {} settled", id),
            Ok(Err(e)) => {
                log::error!("job {} panicked: {}", id, e);
                abandon(CourierError::Internal(format!("job {id} panicked")));
            }
            Err(_) => {
                // Dropping the JoinHandle detaches the action; it keeps running.
                log::warn!("job {} abandoned after {:?}", id, timeout);
                abandon(CourierError::Timeout(format!(
                    "job {id} exceeded its {timeout:?} budget"
                )));
            }
        }
        depth.fetch_sub(1, Ordering::SeqCst);
    }
    log::debug!("operation queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::time::{sleep, Instant};

    const BUDGET: Duration = Duration::from_secs(5);

    mod ordering {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn jobs_complete_in_submission_order_without_overlap() {
            let queue = OperationQueue::start();
            let log = Arc::new(Mutex::new(Vec::new()));
            let running = Arc::new(AtomicBool::new(false));

            let mut waiters = Vec::new();
            for i in 0..8u64 {
                let log = Arc::clone(&log);
                let running = Arc::clone(&running);
                let queue = queue.clone();
                waiters.push(tokio::spawn(async move {
                    queue
                        .enqueue(
                            move |_| async move {
                                assert!(!running.swap(true, Ordering::SeqCst), "overlap");
                                // Later jobs are shorter, so overlap would reorder them.
                                sleep(Duration::from_millis(80 - i * 10)).await;
                                lock(&log).push(i);
                                running.store(false, Ordering::SeqCst);
                                Ok(i)
                            },
                            BUDGET,
                        )
                        .await
                }));
                // Make submission order deterministic.
                tokio::task::yield_now().await;
            }

            for (i, waiter) in waiters.into_iter().enumerate() {
                assert_eq!(waiter.await.unwrap().unwrap(), i as u64);
            }
            assert_eq!(*lock(&log), (0..8).collect::<Vec<_>>());
        }

        #[tokio::test]
        async fn failing_job_does_not_stop_the_loop() {
            let queue = OperationQueue::start();

            let failed: Result<()> = queue
                .enqueue(
                    |_| async { Err(CourierError::SessionFault("boom".into())) },
                    BUDGET,
                )
                .await;
            let next = queue.enqueue(|_| async { Ok("after") }, BUDGET).await;

            assert_eq!(failed.unwrap_err().kind(), "session_fault");
            assert_eq!(next.unwrap(), "after");
        }

        #[tokio::test]
        async fn panicking_job_reports_internal_error() {
            let queue = OperationQueue::start();

            let result: Result<()> = queue
                .enqueue(|_| async { panic!("job exploded") }, BUDGET)
                .await;
            let next = queue.enqueue(|_| async { Ok(1) }, BUDGET).await;

            assert_eq!(result.unwrap_err().kind(), "internal");
            assert_eq!(next.unwrap(), 1);
        }
    }

    mod timeout {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn hung_job_times_out_after_its_budget_and_next_job_starts() {
            let queue = OperationQueue::start();
            let started = Instant::now();

            let hung = {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let result: Result<()> = queue
                        .enqueue(
                            |_| async {
                                futures::future::pending::<()>().await;
                                Ok(())
                            },
                            Duration::from_secs(30),
                        )
                        .await;
                    (result, started.elapsed())
                })
            };
            tokio::task::yield_now().await;

            let next_started = queue
                .enqueue(move |_| async move { Ok(started.elapsed()) }, BUDGET)
                .await
                .unwrap();

            let (result, elapsed) = hung.await.unwrap();
            assert_eq!(result.unwrap_err().kind(), "timeout");
            assert_eq!(elapsed, Duration::from_secs(30));
            assert_eq!(next_started, Duration::from_secs(30));
        }

        #[tokio::test(start_paused = true)]
        async fn abandoned_action_keeps_running_detached() {
            let queue = OperationQueue::start();
            let finished = Arc::new(AtomicBool::new(false));

            let flag = Arc::clone(&finished);
            let result: Result<()> = queue
                .enqueue(
                    move |_| async move {
                        sleep(Duration::from_secs(10)).await;
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    },
                    Duration::from_secs(1),
                )
                .await;

            assert!(result.unwrap_err().is_timeout());
            assert!(!finished.load(Ordering::SeqCst));

            sleep(Duration::from_secs(10)).await;
            assert!(finished.load(Ordering::SeqCst));
        }

        #[tokio::test(start_paused = true)]
        async fn abandoned_action_sees_its_ticket_flagged() {
            let queue = OperationQueue::start();
            let (seen_tx, seen_rx) = oneshot::channel();

            let result: Result<()> = queue
                .enqueue(
                    move |ticket| async move {
                        assert!(!ticket.is_abandoned());
                        assert!(ticket.ensure_live().is_ok());
                        sleep(Duration::from_secs(10)).await;
                        let _ = seen_tx.send(ticket.ensure_live());
                        Ok(())
                    },
                    Duration::from_secs(1),
                )
                .await;
            assert!(result.unwrap_err().is_timeout());

            let late = seen_rx.await.unwrap();
            assert!(late.unwrap_err().is_timeout());
        }

        #[tokio::test]
        async fn settled_job_ticket_is_never_flagged() {
            let queue = OperationQueue::start();
            let ticket = queue
                .enqueue(|ticket| async move { Ok(ticket) }, BUDGET)
                .await
                .unwrap();
            assert!(!ticket.is_abandoned());
        }
    }

    #[tokio::test]
    async fn pending_counts_waiting_and_running_jobs() {
        let queue = OperationQueue::start();
        assert_eq!(queue.pending(), 0);

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        |_| async move {
                            let _ = release_rx.await;
                            Ok(())
                        },
                        BUDGET,
                    )
                    .await
            })
        };
        while queue.pending() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.pending(), 1);

        release_tx.send(()).unwrap();
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.pending(), 0);
    }
}
