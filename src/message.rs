//! # The begin/end message protocol between workers and the supervisor.
//!
//! A worker drives one transaction by sending a begin [`Envelope`] onto the
//! supervisor queue, receiving a [`Response`], and closing with an end
//! envelope. Replies travel through a [`ReplyHandle`]: a non-blocking send
//! guarded by the worker's `done` token, so the supervisor can never stall
//! on a worker that has given up.
//!
//! Envelope identity is `(worker signature, request allocation)`; two
//! workers submitting structurally equal requests remain distinct messages.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransactionError;
use crate::request::Request;

/// Protocol phase of a message or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Begin,
    End,
}

impl State {
    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            State::Begin => "begin",
            State::End => "end",
        }
    }
}

/// Answer carried in a [`Response`], or outcome carried in an end envelope.
///
/// `Proceed`/`Cease` answer begin messages; `Success`/`Failure` report work
/// outcomes and answer end messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Proceed,
    Cease,
    Success,
    Failure,
}

impl Signal {
    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            Signal::Proceed => "proceed",
            Signal::Cease => "cease",
            Signal::Success => "success",
            Signal::Failure => "failure",
        }
    }
}

/// Additive status bitset recorded on a message for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MessageStatus(u8);

impl MessageStatus {
    pub(crate) const PROCEED: MessageStatus = MessageStatus(1);
    pub(crate) const SUCCESS: MessageStatus = MessageStatus(1 << 1);
    pub(crate) const CEASE: MessageStatus = MessageStatus(1 << 2);
    pub(crate) const FAILURE: MessageStatus = MessageStatus(1 << 3);
    pub(crate) const WAITLIST: MessageStatus = MessageStatus(1 << 4);
    pub(crate) const FINALIZE_FAILURE: MessageStatus = MessageStatus(1 << 5);

    /// Idempotently adds the given status bits.
    pub(crate) fn add(&mut self, status: MessageStatus) {
        self.0 |= status.0;
    }

    /// Idempotently removes the given status bits.
    #[allow(dead_code)]
    pub(crate) fn remove(&mut self, status: MessageStatus) {
        self.0 &= !status.0;
    }

    pub(crate) fn contains(&self, status: MessageStatus) -> bool {
        self.0 & status.0 != 0
    }

    /// Collapses the bitset to one result label, most significant first.
    pub(crate) fn results(&self) -> &'static str {
        if self.contains(Self::PROCEED) {
            return "proceed";
        }
        if self.contains(Self::SUCCESS) {
            return "success";
        }
        if self.contains(Self::CEASE) {
            return "cease";
        }
        if self.contains(Self::FAILURE) {
            return "failure";
        }
        ""
    }

    pub(crate) fn waitlisted(&self) -> bool {
        self.contains(Self::WAITLIST)
    }

    pub(crate) fn finalize_failed(&self) -> bool {
        self.contains(Self::FINALIZE_FAILURE)
    }
}

/// Supervisor's answer to one begin or end message.
#[derive(Debug)]
pub(crate) struct Response {
    pub state: State,
    pub sig: Signal,
    pub err: Option<TransactionError>,
}

/// Reply channel back to one worker.
///
/// `respond` drops the response once the worker's `done` token is cancelled;
/// the send itself is non-blocking (the response channel is buffered and
/// sees at most one reply per protocol phase).
#[derive(Clone)]
pub(crate) struct ReplyHandle {
    tx: mpsc::Sender<Response>,
    done: CancellationToken,
}

impl ReplyHandle {
    pub(crate) fn new(tx: mpsc::Sender<Response>, done: CancellationToken) -> Self {
        Self { tx, done }
    }

    pub(crate) fn respond(&self, state: State, sig: Signal, err: Option<TransactionError>) {
        if self.done.is_cancelled() {
            // Worker has ceased; do not attempt to return messages.
            return;
        }
        let _ = self.tx.try_send(Response { state, sig, err });
    }
}

/// Tag distinguishing the two protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Begin,
    /// Carries the worker's outcome signal.
    End(Signal),
}

/// One protocol message travelling from a worker to the supervisor.
pub(crate) struct Envelope {
    kind: MessageKind,
    req: Arc<dyn Request>,
    reply: ReplyHandle,
    worker_sig: u64,
    sent_at: Instant,
    latency: f64,
    status: MessageStatus,
}

impl Envelope {
    pub(crate) fn begin(req: Arc<dyn Request>, reply: ReplyHandle, worker_sig: u64) -> Self {
        Self {
            kind: MessageKind::Begin,
            req,
            reply,
            worker_sig,
            sent_at: Instant::now(),
            latency: 0.0,
            status: MessageStatus::default(),
        }
    }

    pub(crate) fn end(
        req: Arc<dyn Request>,
        reply: ReplyHandle,
        worker_sig: u64,
        outcome: Signal,
    ) -> Self {
        Self {
            kind: MessageKind::End(outcome),
            req,
            reply,
            worker_sig,
            sent_at: Instant::now(),
            latency: 0.0,
            status: MessageStatus::default(),
        }
    }

    pub(crate) fn kind(&self) -> MessageKind {
        self.kind
    }

    pub(crate) fn state(&self) -> State {
        match self.kind {
            MessageKind::Begin => State::Begin,
            MessageKind::End(_) => State::End,
        }
    }

    pub(crate) fn request(&self) -> &Arc<dyn Request> {
        &self.req
    }

    pub(crate) fn key(&self) -> i64 {
        self.req.key()
    }

    pub(crate) fn respond(&self, state: State, sig: Signal, err: Option<TransactionError>) {
        self.reply.respond(state, sig, err);
    }

    /// Identity: same worker signature and same request allocation.
    pub(crate) fn same(&self, other: &Envelope) -> bool {
        self.worker_sig == other.worker_sig && Arc::ptr_eq(&self.req, &other.req)
    }

    /// Stamps dispatch latency, in seconds since the worker sent the message.
    pub(crate) fn stamp_latency(&mut self) {
        self.latency = self.sent_at.elapsed().as_secs_f64();
    }

    pub(crate) fn latency(&self) -> f64 {
        self.latency
    }

    pub(crate) fn status(&self) -> MessageStatus {
        self.status
    }

    pub(crate) fn mark(&mut self, status: MessageStatus) {
        self.status.add(status);
    }
}
