//! Aggregator running on a dedicated thread, reached over channels.
//!
//! ```text
//! Worker 0 ─┐                                   ┌─ Pull: reply with snapshot
//! Worker 1 ─┼─> ChannelAggregator ──requests──> AggregatorService thread
//! Worker N ─┘    (send/recv deadlines)          └─ Push: merge, reply version
//! ```
//!
//! Each request carries its own bounded(1) reply channel. A client that
//! gives up after its timeout simply drops the reply receiver; the service
//! ignores the failed reply send.
//!
//! Errors map onto [`SyncError`]:
//! - service stopped or its thread gone: `Unreachable`
//! - merge refused (architecture mismatch): `Rejected`
//! - no reply before the deadline: `Timeout`

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use burn::module::Module;
use burn::tensor::backend::Backend;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::config::AggregatorConfig;
use crate::error::{ServiceError, SyncError, SyncOp};
use crate::sync::aggregator::Aggregator;
use crate::sync::shared::{load_into, rejected, AggregateState};

/// Request sent from a [`ChannelAggregator`] to the service thread.
enum AggregatorRequest<M> {
    Pull {
        reply: Sender<M>,
    },
    Push {
        model: M,
        reply: Sender<Result<u64, SyncError>>,
    },
}

/// Spawns the aggregator service thread.
pub struct AggregatorService;

impl AggregatorService {
    /// Start a service aggregating from `initial`.
    ///
    /// Returns the control handle and a cloneable client.
    pub fn spawn<B, M>(
        initial: M,
        config: AggregatorConfig,
    ) -> Result<(AggregatorHandle, ChannelAggregator<B, M>), ServiceError>
    where
        B: Backend,
        M: Module<B> + 'static,
    {
        config.validate()?;
        let (tx, rx) = bounded::<AggregatorRequest<M>>(config.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let version = Arc::new(AtomicU64::new(0));

        let state = AggregateState::<B, M>::new(initial, config.merge_rule);
        let thread = {
            let shutdown = shutdown.clone();
            let version = version.clone();
            let poll_interval = config.poll_interval;
            let name = config.thread_name.clone();
            std::thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || run_service(state, rx, shutdown, version, poll_interval, name))?
        };
        log::info!(
            "Aggregator service '{}' started (rule={:?}, queue={})",
            config.thread_name,
            config.merge_rule,
            config.queue_capacity
        );

        let handle = AggregatorHandle {
            thread,
            shutdown,
            version,
        };
        let client = ChannelAggregator {
            sender: tx,
            _backend: PhantomData,
        };
        Ok((handle, client))
    }
}

fn run_service<B: Backend, M: Module<B>>(
    mut state: AggregateState<B, M>,
    rx: Receiver<AggregatorRequest<M>>,
    shutdown: Arc<AtomicBool>,
    version: Arc<AtomicU64>,
    poll_interval: Duration,
    name: String,
) {
    while !shutdown.load(Ordering::Acquire) {
        match rx.recv_timeout(poll_interval) {
            Ok(AggregatorRequest::Pull { reply }) => {
                let _ = reply.send(state.snapshot());
            }
            Ok(AggregatorRequest::Push { model, reply }) => {
                let result = state.absorb(&model).map_err(|e| {
                    log::warn!("Aggregator '{}' rejected push: {}", name, e);
                    rejected(SyncOp::Push, e)
                });
                if let Ok(v) = result {
                    version.store(v, Ordering::Release);
                }
                let _ = reply.send(result);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!(
        "Aggregator service '{}' stopped after {} pushes",
        name,
        version.load(Ordering::Acquire)
    );
}

/// Control handle for a running [`AggregatorService`].
pub struct AggregatorHandle {
    thread: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    version: Arc<AtomicU64>,
}

impl AggregatorHandle {
    /// Signal the service to stop. It exits within one poll interval.
    ///
    /// Requests already queued but not yet served are dropped, which their
    /// senders observe as `Unreachable`.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop the service and wait for its thread to exit.
    pub fn stop_and_wait(self) -> std::thread::Result<()> {
        self.stop();
        self.thread.join()
    }

    /// Wait for the service thread to exit.
    ///
    /// Without a prior `stop()` this returns once every client is dropped.
    pub fn join(self) -> std::thread::Result<()> {
        self.thread.join()
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Number of accepted pushes so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// Client side of an [`AggregatorService`]. Cheap to clone, one per worker.
pub struct ChannelAggregator<B: Backend, M> {
    sender: Sender<AggregatorRequest<M>>,
    _backend: PhantomData<B>,
}

impl<B: Backend, M> Clone for ChannelAggregator<B, M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _backend: PhantomData,
        }
    }
}

impl<B: Backend, M> ChannelAggregator<B, M> {
    fn send(&self, op: SyncOp, request: AggregatorRequest<M>, deadline: Option<Instant>, timeout: Duration) -> Result<(), SyncError> {
        let stopped = || SyncError::Unreachable {
            op,
            reason: "aggregator service has stopped".to_string(),
        };
        let Some(deadline) = deadline else {
            return self.sender.send(request).map_err(|_| stopped());
        };
        self.sender.send_deadline(request, deadline).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => SyncError::Timeout { op, timeout },
            SendTimeoutError::Disconnected(_) => stopped(),
        })
    }
}

/// Deadline for a call, or `None` when `timeout` reaches past what `Instant` can represent.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn await_reply<T>(op: SyncOp, reply: &Receiver<T>, deadline: Option<Instant>, timeout: Duration) -> Result<T, SyncError> {
    let dropped = || SyncError::Unreachable {
        op,
        reason: "aggregator service dropped the request".to_string(),
    };
    let Some(deadline) = deadline else {
        return reply.recv().map_err(|_| dropped());
    };
    reply.recv_deadline(deadline).map_err(|e| match e {
        RecvTimeoutError::Timeout => SyncError::Timeout { op, timeout },
        RecvTimeoutError::Disconnected => dropped(),
    })
}

impl<B, M> Aggregator<M> for ChannelAggregator<B, M>
where
    B: Backend,
    M: Module<B>,
{
    fn pull(&self, model: &mut M, timeout: Duration) -> Result<(), SyncError> {
        let deadline = deadline_after(timeout);
        let (reply, response) = bounded(1);
        self.send(SyncOp::Pull, AggregatorRequest::Pull { reply }, deadline, timeout)?;
        let aggregate = await_reply(SyncOp::Pull, &response, deadline, timeout)?;
        load_into(model, &aggregate)
    }

    fn push(&self, model: &M, timeout: Duration) -> Result<(), SyncError> {
        let deadline = deadline_after(timeout);
        let (reply, response) = bounded(1);
        let request = AggregatorRequest::Push {
            model: model.clone(),
            reply,
        };
        self.send(SyncOp::Push, request, deadline, timeout)?;
        await_reply(SyncOp::Push, &response, deadline, timeout)?.map(|_| ())
    }
}
