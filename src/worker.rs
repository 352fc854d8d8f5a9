//! # The per-request half of the arbitration protocol.
//!
//! One [`Worker`] exists per `with_worker` call. It sends the begin
//! envelope, waits for the supervisor's answer (bounded by the caller's
//! cancellation token), and guarantees through [`Worker::finish`] that
//! exactly one end envelope balances the begin on every exit path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransactionError;
use crate::message::{Envelope, ReplyHandle, Response, Signal, State};
use crate::request::Request;
use crate::supervisor::CHANNEL_DEPTH;
use crate::telemetry::Instrument;

static NEXT_SIGNATURE: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Worker {
    queue: mpsc::Sender<Envelope>,
    metrics: Arc<dyn Instrument>,
    response_rx: mpsc::Receiver<Response>,
    reply: ReplyHandle,
    done: CancellationToken,
    ctx: CancellationToken,
    request: Arc<dyn Request>,
    status: Signal,
    signature: u64,
    begin_sent: Option<Instant>,
    end_sent: Option<Instant>,
    work_start: Option<Instant>,
}

impl Worker {
    pub(crate) fn new(
        queue: mpsc::Sender<Envelope>,
        metrics: Arc<dyn Instrument>,
        ctx: CancellationToken,
        request: Arc<dyn Request>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let done = CancellationToken::new();
        Self {
            queue,
            metrics,
            response_rx: rx,
            reply: ReplyHandle::new(tx, done.clone()),
            done,
            ctx,
            request,
            status: Signal::Failure,
            signature: NEXT_SIGNATURE.fetch_add(1, Ordering::Relaxed),
            begin_sent: None,
            end_sent: None,
            work_start: None,
        }
    }

    pub(crate) fn request(&self) -> &Arc<dyn Request> {
        &self.request
    }

    pub(crate) fn status(&self) -> Signal {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: Signal) {
        self.status = status;
    }

    /// Token handed to the work closure; cancelling the caller's context
    /// cancels it.
    pub(crate) fn ctx(&self) -> CancellationToken {
        self.ctx.clone()
    }

    pub(crate) fn start_work(&mut self) {
        self.work_start = Some(Instant::now());
    }

    /// Seconds since the begin envelope was sent.
    pub(crate) fn duration(&self) -> f64 {
        self.begin_sent
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Seconds since the work closure was entered.
    pub(crate) fn work_duration(&self) -> f64 {
        self.work_start
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Sends the begin envelope onto the supervisor queue.
    pub(crate) async fn send_begin(&mut self) -> Result<(), TransactionError> {
        let msg = Envelope::begin(
            Arc::clone(&self.request),
            self.reply.clone(),
            self.signature,
        );
        self.begin_sent = Some(Instant::now());
        self.metrics.inc_queue_chan_depth();
        if self.queue.send(msg).await.is_err() {
            self.metrics.dec_queue_chan_depth();
            return Err(TransactionError::Terminated);
        }
        Ok(())
    }

    /// Sends the end envelope carrying the worker's current status.
    pub(crate) async fn send_end(&mut self) -> Result<(), TransactionError> {
        let msg = Envelope::end(
            Arc::clone(&self.request),
            self.reply.clone(),
            self.signature,
            self.status,
        );
        self.metrics.inc_queue_chan_depth();
        if self.queue.send(msg).await.is_err() {
            self.metrics.dec_queue_chan_depth();
            return Err(TransactionError::Terminated);
        }
        self.end_sent = Some(Instant::now());
        Ok(())
    }

    /// Waits for the supervisor's response, bounded by the caller's context.
    ///
    /// An already-delivered response wins over a concurrent cancellation;
    /// otherwise cancellation yields a synthetic response with the given
    /// defaults and [`TransactionError::Canceled`].
    pub(crate) async fn recv_response(&mut self, state: State, default_sig: Signal) -> Response {
        tokio::select! {
            biased;
            resp = self.response_rx.recv() => match resp {
                Some(resp) => resp,
                None => Response {
                    state,
                    sig: default_sig,
                    err: Some(TransactionError::Terminated),
                },
            },
            _ = self.ctx.cancelled() => Response {
                state,
                sig: default_sig,
                err: Some(TransactionError::Canceled),
            },
        }
    }

    /// Tears the worker down: cancels `done` so pending replies are
    /// discarded, then sends the balancing end envelope if none was sent.
    ///
    /// Must run on every exit path of the transaction driver.
    pub(crate) async fn finish(mut self) {
        self.done.cancel();
        if self.end_sent.is_none() {
            let _ = self.send_end().await;
        }
    }
}

impl Drop for Worker {
    // Backstop for a transaction future dropped mid-flight: the protocol
    // still needs a balancing end, delivered best-effort without blocking.
    fn drop(&mut self) {
        self.done.cancel();
        if self.begin_sent.is_some() && self.end_sent.is_none() {
            let msg = Envelope::end(
                Arc::clone(&self.request),
                self.reply.clone(),
                self.signature,
                self.status,
            );
            self.metrics.inc_queue_chan_depth();
            if self.queue.try_send(msg).is_err() {
                self.metrics.dec_queue_chan_depth();
            } else {
                self.end_sent = Some(Instant::now());
            }
        }
    }
}
