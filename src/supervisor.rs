//! # The arbitration supervisor: admission loop and transaction driver.
//!
//! One [`Supervisor`] owns the message queue and, inside [`Supervisor::process`],
//! the `processing` and `waiting` tables. Workers never touch those tables;
//! everything crosses the boundary as a message. The loop admits, waitlists,
//! ceases, finalizes, and promotes, one message per iteration.
//!
//! # High-level architecture
//!
//! ```text
//!  callers ──► with_worker ──► Worker ──begin/end──► queue
//!                                ▲                     │
//!                                │ response        dispatch
//!                                │                     ▼
//!                          ReplyHandle ◄──────── Supervisor loop
//!                                            (processing / waiting maps)
//! ```
//!
//! - A begin message is answered with proceed, answered with cease, or
//!   parked on the per-key waitlist until the active entry ends.
//! - An end message settles the transaction (running `finalize` on success)
//!   and promotes the waiting successor, if any.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, TransactionError};
use crate::logging::{Field, Log, NopLog};
use crate::message::{Envelope, MessageKind, MessageStatus, Signal, State};
use crate::message_map::MessageMap;
use crate::request::Request;
use crate::telemetry::{Instrument, MessageLabels, NopInstrument, OutcomeLabels};
use crate::worker::Worker;

/// Default depth of the supervisor queue and worker response channels.
pub(crate) const CHANNEL_DEPTH: usize = 10;

/// # Hook invoked before and after each supervisor loop iteration.
///
/// The default hook does nothing. Tests install one to step the loop
/// deterministically: the loop will not enter its select until the hook's
/// future resolves.
#[async_trait]
pub trait PollHook: Send + Sync {
    async fn poll_done(&self);
}

struct NopHook;

#[async_trait]
impl PollHook for NopHook {
    async fn poll_done(&self) {}
}

/// # Builder for a [`Supervisor`].
///
/// ```
/// use keyvisor::Supervisor;
///
/// let supervisor = Supervisor::builder().channel_depth(64).build();
/// drop(supervisor);
/// ```
pub struct SupervisorBuilder {
    channel_depth: usize,
    instrument: Arc<dyn Instrument>,
    logger: Arc<dyn Log>,
    hook: Arc<dyn PollHook>,
}

impl SupervisorBuilder {
    fn new() -> Self {
        Self {
            channel_depth: CHANNEL_DEPTH,
            instrument: Arc::new(NopInstrument),
            logger: Arc::new(NopLog),
            hook: Arc::new(NopHook),
        }
    }

    /// Bounds the supervisor queue (default 10).
    pub fn channel_depth(mut self, depth: usize) -> Self {
        self.channel_depth = depth;
        self
    }

    /// Installs a metrics sink (default: no-op).
    pub fn instrument(mut self, instrument: Arc<dyn Instrument>) -> Self {
        self.instrument = instrument;
        self
    }

    /// Installs a structured logger (default: no-op).
    pub fn logger(mut self, logger: Arc<dyn Log>) -> Self {
        self.logger = logger;
        self
    }

    /// Installs the loop-iteration hook (default: no-op; used by tests).
    pub fn poll_hook(mut self, hook: Arc<dyn PollHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn build(self) -> Supervisor {
        let (queue_tx, queue_rx) = mpsc::channel(self.channel_depth.max(1));
        self.instrument.queue_chan_depth(0);
        self.instrument.processing_map_depth(0);
        self.instrument.waiting_map_depth(0);
        Supervisor {
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            terminate: CancellationToken::new(),
            metrics: self.instrument,
            logger: self.logger,
            hook: self.hook,
        }
    }
}

/// # Per-key request arbiter.
///
/// Run [`process`](Supervisor::process) on a dedicated task, then drive
/// transactions through [`with_worker`](Supervisor::with_worker) from any
/// number of concurrent tasks. [`terminate`](Supervisor::terminate) requests
/// shutdown; in-flight callers should be cancelled first.
pub struct Supervisor {
    queue_tx: mpsc::Sender<Envelope>,
    queue_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    terminate: CancellationToken,
    metrics: Arc<dyn Instrument>,
    logger: Arc<dyn Log>,
    hook: Arc<dyn PollHook>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// A supervisor with default options.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    /// Requests shutdown of the processing loop. Idempotent.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// Runs the arbitration loop until [`terminate`](Supervisor::terminate).
    ///
    /// Dispatches one queue message per iteration. Invoke on a dedicated
    /// task; a second invocation is a no-op (the loop cannot be restarted).
    pub async fn process(&self) {
        let queue_rx = match self.queue_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut queue_rx) = queue_rx else {
            self.logger
                .dpanic("supervisor processing loop already claimed", &[]);
            return;
        };

        let mut processing = MessageMap::new();
        let mut waiting = MessageMap::new();

        loop {
            self.hook.poll_done().await;
            tokio::select! {
                msg = queue_rx.recv() => {
                    // The supervisor holds a sender, so the queue cannot close.
                    let Some(mut msg) = msg else { return };
                    self.metrics.dec_queue_chan_depth();
                    msg.stamp_latency();

                    let key = msg.key();
                    let latency = msg.latency();
                    let state = msg.state();
                    let status = match msg.kind() {
                        MessageKind::Begin => {
                            self.process_begin(&mut processing, &mut waiting, msg)
                        }
                        MessageKind::End(_) => {
                            self.process_end(&mut processing, &mut waiting, msg)
                        }
                    };

                    self.logger.debug(
                        "supervisor completed message processing",
                        &[
                            Field::new("key", key),
                            Field::new("duration", latency),
                            Field::new("state", state.as_label()),
                            Field::new("results", status.results()),
                            Field::new("waitlist", status.waitlisted()),
                            Field::new("finalizefailure", status.finalize_failed()),
                        ],
                    );
                }
                _ = self.terminate.cancelled() => return,
            }
            self.hook.poll_done().await;
        }
    }

    /// # Drives one arbitrated transaction.
    ///
    /// Sends the begin message, and if the supervisor answers proceed, runs
    /// `work` on the caller's task with the caller's `ctx`. On success the
    /// supervisor invokes the request's `finalize` before replying. Exactly
    /// one end message balances the begin on every path, so cancellation
    /// and work failure never leak a processing-table entry.
    ///
    /// Errors surface per [`TransactionError`]; the work closure's error is
    /// passed through unchanged inside [`TransactionError::Work`].
    pub async fn with_worker<F, Fut>(
        &self,
        ctx: CancellationToken,
        request: Arc<dyn Request>,
        work: F,
    ) -> Result<(), TransactionError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), BoxError>>,
    {
        let mut worker = Worker::new(
            self.queue_tx.clone(),
            Arc::clone(&self.metrics),
            ctx,
            request,
        );

        self.logger.debug(
            "transaction entered",
            &[
                Field::new("key", worker.request().key()),
                Field::new("status", worker.status().as_label()),
            ],
        );

        if let Err(err) = worker.send_begin().await {
            worker.finish().await;
            return Err(err);
        }
        let begin = worker.recv_response(State::Begin, Signal::Cease).await;

        self.logger.debug(
            "transaction received begin response",
            &[
                Field::new("key", worker.request().key()),
                Field::new("status", worker.status().as_label()),
                Field::new("response", begin.sig.as_label()),
            ],
        );

        if begin.sig != Signal::Proceed {
            let duration = worker.duration();
            self.metrics.transactions(
                duration,
                OutcomeLabels {
                    signal: Signal::Failure.as_label(),
                },
            );
            self.logger.debug(
                "transaction completed with error",
                &[
                    Field::new("key", worker.request().key()),
                    Field::new("duration", duration),
                    Field::new("response", begin.sig.as_label()),
                ],
            );
            worker.finish().await;
            return match begin.err {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        worker.start_work();
        if let Err(err) = work(worker.ctx()).await {
            let worktime = worker.work_duration();
            let duration = worker.duration();
            // The work closure ran; only the transaction is a failure.
            self.metrics.worktime(
                worktime,
                OutcomeLabels {
                    signal: Signal::Success.as_label(),
                },
            );
            self.metrics.transactions(
                duration,
                OutcomeLabels {
                    signal: Signal::Failure.as_label(),
                },
            );
            self.logger.debug(
                "transaction completed with work error",
                &[
                    Field::new("key", worker.request().key()),
                    Field::new("duration", duration),
                    Field::new("worktime", worktime),
                ],
            );
            worker.finish().await;
            return Err(TransactionError::Work(err));
        }

        worker.set_status(Signal::Success);
        let worktime = worker.work_duration();
        self.metrics.worktime(
            worktime,
            OutcomeLabels {
                signal: Signal::Success.as_label(),
            },
        );

        self.logger.debug(
            "transaction completed work closure",
            &[
                Field::new("key", worker.request().key()),
                Field::new("status", worker.status().as_label()),
            ],
        );

        if let Err(err) = worker.send_end().await {
            self.metrics.transactions(
                worker.duration(),
                OutcomeLabels {
                    signal: Signal::Failure.as_label(),
                },
            );
            worker.finish().await;
            return Err(err);
        }
        let end = worker.recv_response(State::End, Signal::Failure).await;

        self.logger.debug(
            "transaction received end response",
            &[
                Field::new("key", worker.request().key()),
                Field::new("status", worker.status().as_label()),
                Field::new("response", end.sig.as_label()),
            ],
        );

        if end.sig != Signal::Success {
            let duration = worker.duration();
            self.metrics.transactions(
                duration,
                OutcomeLabels {
                    signal: Signal::Failure.as_label(),
                },
            );
            self.logger.debug(
                "transaction completed with error",
                &[
                    Field::new("key", worker.request().key()),
                    Field::new("duration", duration),
                    Field::new("worktime", worktime),
                    Field::new("response", end.sig.as_label()),
                ],
            );
            worker.finish().await;
            return match end.err {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        let duration = worker.duration();
        self.metrics.transactions(
            duration,
            OutcomeLabels {
                signal: Signal::Success.as_label(),
            },
        );
        self.logger.debug(
            "transaction completed",
            &[
                Field::new("key", worker.request().key()),
                Field::new("duration", duration),
                Field::new("worktime", worktime),
            ],
        );
        worker.finish().await;
        Ok(())
    }

    /// Admission decision for one begin message: cease on invalidity,
    /// otherwise activate, waitlist, or cease against the incumbent.
    fn process_begin(
        &self,
        processing: &mut MessageMap,
        waiting: &mut MessageMap,
        mut msg: Envelope,
    ) -> MessageStatus {
        if msg.kind() != MessageKind::Begin {
            // Unreachable by construction; kept to catch future dispatch changes.
            self.logger.dpanic(
                "non-begin message dispatched to process_begin",
                &[Field::new("key", msg.key())],
            );
        }

        if let Err(err) = msg.request().valid() {
            msg.mark(MessageStatus::CEASE);
            self.push_message_metrics(&msg);
            msg.respond(
                State::Begin,
                Signal::Cease,
                Some(TransactionError::Invalid(err)),
            );
            return msg.status();
        }

        self.enqueue_message(processing, waiting, msg)
    }

    /// Ranks a valid begin message against the active entry and the waiter
    /// on its key. The newcomer is activated, parked, ceased, or it
    /// displaces an inferior waiter (which is ceased in its place).
    fn enqueue_message(
        &self,
        processing: &mut MessageMap,
        waiting: &mut MessageMap,
        mut msg: Envelope,
    ) -> MessageStatus {
        let key = msg.key();

        let Some(in_process) = processing.get(key) else {
            return self.activate_message(processing, msg);
        };
        if let Err(err) = msg.request().supersedes(in_process.request().as_ref()) {
            msg.mark(MessageStatus::CEASE);
            self.push_message_metrics(&msg);
            msg.respond(
                State::Begin,
                Signal::Cease,
                Some(TransactionError::Superseded(err)),
            );
            return msg.status();
        }

        let Some(waiter) = waiting.get(key) else {
            msg.mark(MessageStatus::WAITLIST);
            self.metrics.inc_waiting_map_depth();
            let status = msg.status();
            waiting.add(msg);
            return status;
        };
        if let Err(err) = msg.request().supersedes(waiter.request().as_ref()) {
            msg.mark(MessageStatus::CEASE);
            self.push_message_metrics(&msg);
            msg.respond(
                State::Begin,
                Signal::Cease,
                Some(TransactionError::Superseded(err)),
            );
            return msg.status();
        }

        // The newcomer takes the waitlist slot. The reverse ranking call
        // exists only to build the displaced waiter's diagnostic.
        let diagnostic = waiter.request().supersedes(msg.request().as_ref()).err();
        if let Some(mut displaced) = waiting.remove(key) {
            self.metrics.dec_waiting_map_depth();
            displaced.mark(MessageStatus::CEASE);
            self.push_message_metrics(&displaced);
            displaced.respond(
                State::Begin,
                Signal::Cease,
                diagnostic.map(TransactionError::Superseded),
            );
        }

        msg.mark(MessageStatus::WAITLIST);
        self.metrics.inc_waiting_map_depth();
        let status = msg.status();
        waiting.add(msg);
        status
    }

    /// Inserts the message into the processing table and answers proceed.
    fn activate_message(&self, processing: &mut MessageMap, mut msg: Envelope) -> MessageStatus {
        self.metrics.inc_processing_map_depth();
        msg.mark(MessageStatus::PROCEED);
        self.push_message_metrics(&msg);
        msg.respond(State::Begin, Signal::Proceed, None);
        let status = msg.status();
        processing.add(msg);
        status
    }

    /// Settles one end message: report failure, or finalize and report the
    /// outcome. Always purges the sender's table entry afterwards.
    fn process_end(
        &self,
        processing: &mut MessageMap,
        waiting: &mut MessageMap,
        mut msg: Envelope,
    ) -> MessageStatus {
        let outcome = match msg.kind() {
            MessageKind::End(signal) => signal,
            MessageKind::Begin => {
                // Unreachable by construction; kept to catch future dispatch changes.
                self.logger.dpanic(
                    "non-end message dispatched to process_end",
                    &[Field::new("key", msg.key())],
                );
                return msg.status();
            }
        };

        match outcome {
            Signal::Failure => {
                msg.mark(MessageStatus::FAILURE);
                self.push_message_metrics(&msg);
                msg.respond(State::End, Signal::Failure, None);
            }
            Signal::Success => {
                msg.mark(MessageStatus::SUCCESS);
                match msg.request().finalize() {
                    Err(err) => {
                        msg.mark(MessageStatus::FINALIZE_FAILURE);
                        self.push_message_metrics(&msg);
                        msg.respond(
                            State::End,
                            Signal::Failure,
                            Some(TransactionError::Finalize(err)),
                        );
                    }
                    Ok(()) => {
                        self.push_message_metrics(&msg);
                        msg.respond(State::End, Signal::Success, None);
                    }
                }
            }
            other => {
                // Workers cannot send these; kept to catch future changes.
                self.logger.dpanic(
                    "unexpected signal in end message",
                    &[
                        Field::new("key", msg.key()),
                        Field::new("signal", other.as_label()),
                    ],
                );
            }
        }

        self.purge_message(processing, waiting, &msg);
        msg.status()
    }

    /// Removes the exact message from whichever table holds it; freeing a
    /// processing slot promotes the waiting successor on that key.
    fn purge_message(
        &self,
        processing: &mut MessageMap,
        waiting: &mut MessageMap,
        msg: &Envelope,
    ) {
        // A waiting entry means the worker gave up before activation.
        if waiting.contains_message(msg) {
            self.metrics.dec_waiting_map_depth();
            waiting.remove(msg.key());
            return;
        }

        if processing.contains_message(msg) {
            self.metrics.dec_processing_map_depth();
            processing.remove(msg.key());
            self.promote_from_waiting(processing, waiting, msg.key());
        }
    }

    /// Activates the waiting message for `key`, if any. Validity is not
    /// re-checked on promotion.
    fn promote_from_waiting(
        &self,
        processing: &mut MessageMap,
        waiting: &mut MessageMap,
        key: i64,
    ) {
        if let Some(waiter) = waiting.remove(key) {
            self.metrics.dec_waiting_map_depth();
            self.activate_message(processing, waiter);
        }
    }

    fn push_message_metrics(&self, msg: &Envelope) {
        let status = msg.status();
        self.metrics.messages(
            msg.latency(),
            MessageLabels {
                state: msg.state().as_label(),
                signal: status.results(),
                waitlisted: status.waitlisted(),
                finalize_failed: status.finalize_failed(),
            },
        );
    }
}
