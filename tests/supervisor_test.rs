//! Event-sequenced scenarios for the supervisor.
//!
//! Each test installs a poll hook that parks the supervisor loop until the
//! test acknowledges it, so every dispatch iteration happens exactly when
//! the scenario script says it does. One `step` equals one processed
//! message.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::{MtxMap, TestReq};
use keyvisor::telemetry::{LocalInstrument, MetricGauge, MetricHistogram};
use keyvisor::{PollHook, Request, Supervisor, TransactionError};

/// Parks the supervisor loop at every poll point until the test
/// acknowledges the emitted token.
struct StepHook {
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

#[async_trait]
impl PollHook for StepHook {
    async fn poll_done(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ack_tx).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

struct Harness {
    supervisor: Arc<Supervisor>,
    steps: mpsc::Receiver<oneshot::Sender<()>>,
    metrics: Arc<LocalInstrument>,
    store: Arc<MtxMap>,
    loop_task: JoinHandle<()>,
}

impl Harness {
    fn new() -> Self {
        let (tx, steps) = mpsc::channel(1);
        let metrics = Arc::new(LocalInstrument::new());
        let supervisor = Arc::new(
            Supervisor::builder()
                .instrument(metrics.clone())
                .poll_hook(Arc::new(StepHook { tx }))
                .build(),
        );
        let loop_task = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.process().await }
        });
        Self {
            supervisor,
            steps,
            metrics,
            store: Arc::new(MtxMap::default()),
            loop_task,
        }
    }

    fn req(&self, key: i64, value: i64) -> TestReq {
        TestReq::new(&self.store, key, value)
    }

    /// Lets the loop run exactly one dispatch iteration (pre and post poll).
    async fn step(&mut self) {
        for _ in 0..2 {
            let ack = self
                .steps
                .recv()
                .await
                .expect("supervisor loop exited early");
            let _ = ack.send(());
        }
    }

    /// Asserts the message/transaction totals observed so far.
    fn assert_totals(&self, messages: i64, transactions: i64) {
        let totals = self.metrics.snap().histogram_totals();
        assert_eq!(
            totals.get(&MetricHistogram::Messages).copied().unwrap_or(0),
            messages,
            "processed message count"
        );
        assert_eq!(
            totals
                .get(&MetricHistogram::Transactions)
                .copied()
                .unwrap_or(0),
            transactions,
            "completed transaction count"
        );
    }

    /// Terminates the loop and asserts a clean drain.
    async fn shutdown(mut self) {
        self.supervisor.terminate();
        let ack = self
            .steps
            .recv()
            .await
            .expect("supervisor loop exited early");
        let _ = ack.send(());
        self.loop_task.await.expect("supervisor loop panicked");

        let snap = self.metrics.snap();
        assert_eq!(snap.gauge(MetricGauge::QueueChanDepth), 0);
        assert_eq!(snap.gauge(MetricGauge::ProcessingMapDepth), 0);
        assert_eq!(snap.gauge(MetricGauge::WaitingMapDepth), 0);
    }
}

/// Test-side halves of one work-closure gate.
struct Gate {
    entered: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

type WorkerGate = Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>;

fn make_gate(enabled: bool) -> (WorkerGate, Option<Gate>) {
    if !enabled {
        return (None, None);
    }
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    (
        Some((entered_tx, release_rx)),
        Some(Gate {
            entered: entered_rx,
            release: release_tx,
        }),
    )
}

struct Submitted {
    handle: JoinHandle<Result<(), TransactionError>>,
    ctx: CancellationToken,
    executed: Arc<AtomicBool>,
    start: Option<Gate>,
    finish: Option<Gate>,
}

impl Submitted {
    fn cancel(&self) {
        self.ctx.cancel();
    }

    fn executed(&self) -> bool {
        self.executed.load(Ordering::SeqCst)
    }

    /// Waits for the work closure to reach its start gate, then releases it.
    async fn wait_start(&mut self) {
        let gate = self.start.take().expect("request has no start gate");
        gate.entered
            .await
            .expect("work closure dropped before start gate");
        let _ = gate.release.send(());
    }

    /// Waits for the work closure to reach its finish gate, then releases it.
    async fn wait_finish(&mut self) {
        let gate = self.finish.take().expect("request has no finish gate");
        gate.entered
            .await
            .expect("work closure dropped before finish gate");
        let _ = gate.release.send(());
    }

    async fn result(&mut self) -> Result<(), TransactionError> {
        (&mut self.handle)
            .await
            .expect("transaction task panicked")
    }
}

/// Spawns one transaction. The work closure pauses at its gates (when
/// enabled), refuses to run once its context is cancelled, and records
/// whether it executed.
fn submit(harness: &Harness, req: TestReq, start_gate: bool, finish_gate: bool) -> Submitted {
    let request: Arc<dyn Request> = Arc::new(req);
    let ctx = CancellationToken::new();
    let executed = Arc::new(AtomicBool::new(false));

    let (start_worker, start) = make_gate(start_gate);
    let (finish_worker, finish) = make_gate(finish_gate);

    let handle = tokio::spawn({
        let supervisor = Arc::clone(&harness.supervisor);
        let ctx = ctx.clone();
        let executed = Arc::clone(&executed);
        async move {
            supervisor
                .with_worker(ctx, request, move |work_ctx| async move {
                    if let Some((entered, release)) = start_worker {
                        let _ = entered.send(());
                        let _ = release.await;
                    }
                    if work_ctx.is_cancelled() {
                        return Err("work observed canceled context".into());
                    }
                    executed.store(true, Ordering::SeqCst);
                    if let Some((entered, release)) = finish_worker {
                        let _ = entered.send(());
                        let _ = release.await;
                    }
                    Ok(())
                })
                .await
        }
    });

    Submitted {
        handle,
        ctx,
        executed,
        start,
        finish,
    }
}

#[tokio::test]
async fn single_request_success() {
    let mut h = Harness::new();

    let mut r = submit(&h, h.req(2, 10), false, true);
    h.step().await; // begin
    r.wait_finish().await;
    h.step().await; // end

    assert!(r.result().await.is_ok());
    assert!(r.executed());
    assert_eq!(h.store.get(2), 10);
    h.assert_totals(2, 1);
    h.shutdown().await;
}

#[tokio::test]
async fn single_request_canceled_before_begin() {
    let mut h = Harness::new();

    let mut r = submit(&h, h.req(2, 10), false, false);
    r.cancel();
    h.step().await; // begin; reply discarded by the ceased worker
    h.step().await; // end

    assert!(matches!(
        r.result().await,
        Err(TransactionError::Canceled)
    ));
    assert!(!r.executed());
    assert_eq!(h.store.get(2), 0);
    h.assert_totals(2, 1);
    h.shutdown().await;
}

#[tokio::test]
async fn single_request_canceled_after_begin_before_work() {
    let mut h = Harness::new();

    let mut r = submit(&h, h.req(2, 10), true, false);
    h.step().await; // begin answered proceed; work parks at its start gate
    r.cancel();
    r.wait_start().await; // released work refuses the canceled context
    h.step().await; // end

    assert!(matches!(r.result().await, Err(TransactionError::Work(_))));
    assert!(!r.executed());
    assert_eq!(h.store.get(2), 0);
    h.assert_totals(2, 1);
    h.shutdown().await;
}

#[tokio::test]
async fn second_request_inferior_to_active_is_ceased() {
    let mut h = Harness::new();

    let mut first = submit(&h, h.req(1, 20), true, false);
    h.step().await; // v20 begin answered proceed; work parked

    let mut second = submit(&h, h.req(1, 9), false, false);
    h.step().await; // v9 begin ceased: does not supersede the active v20

    assert!(matches!(
        second.result().await,
        Err(TransactionError::Superseded(_))
    ));
    assert!(!second.executed());

    first.wait_start().await;
    h.step().await; // one of the two ends
    h.step().await; // the other end

    assert!(first.result().await.is_ok());
    assert!(first.executed());
    assert_eq!(h.store.get(1), 20);
    h.assert_totals(4, 2);
    h.shutdown().await;
}

#[tokio::test]
async fn second_request_invalid_after_first_commits() {
    let mut h = Harness::new();

    let mut first = submit(&h, h.req(1, 20), false, true);
    h.step().await; // v20 begin
    first.wait_finish().await;
    h.step().await; // v20 end: store now holds 20
    assert!(first.result().await.is_ok());

    let mut second = submit(&h, h.req(1, 9), false, false);
    h.step().await; // v9 begin ceased: invalid against the stored 20
    h.step().await; // v9 end

    assert!(matches!(
        second.result().await,
        Err(TransactionError::Invalid(_))
    ));
    assert!(!second.executed());
    assert_eq!(h.store.get(1), 20);
    h.assert_totals(4, 2);
    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_of_active_request_is_ceased() {
    let mut h = Harness::new();

    let mut original = submit(&h, h.req(1, 9), true, false);
    h.step().await; // v9 begin answered proceed; work parked

    // Equal value from another worker: neither supersedes, incumbent wins.
    let mut duplicate = submit(&h, h.req(1, 9), false, false);
    h.step().await; // duplicate begin ceased

    assert!(matches!(
        duplicate.result().await,
        Err(TransactionError::Superseded(_))
    ));
    assert!(!duplicate.executed());

    original.wait_start().await;
    h.step().await;
    h.step().await;

    assert!(original.result().await.is_ok());
    assert!(original.executed());
    assert_eq!(h.store.get(1), 9);
    h.assert_totals(4, 2);
    h.shutdown().await;
}

#[tokio::test]
async fn two_requests_on_one_key_serialize() {
    let mut h = Harness::new();

    let mut first = submit(&h, h.req(1, 9), false, false);
    h.step().await; // v9 begin
    let mut second = submit(&h, h.req(1, 20), false, false);
    h.step().await;
    h.step().await;
    h.step().await; // v9 end, v20 begin (direct or via waitlist), v20 end

    assert!(first.result().await.is_ok());
    assert!(second.result().await.is_ok());
    assert!(first.executed());
    assert!(second.executed());
    assert_eq!(h.store.get(1), 20);
    h.assert_totals(4, 2);
    h.shutdown().await;
}

#[tokio::test]
async fn canceled_first_request_does_not_block_successor() {
    let mut h = Harness::new();

    let mut first = submit(&h, h.req(1, 9), false, false);
    first.cancel();
    h.step().await; // v9 begin activates; the proceed reply is discarded
    h.step().await; // v9 end purges the abandoned slot

    let mut second = submit(&h, h.req(1, 20), false, false);
    h.step().await; // v20 begin
    h.step().await; // v20 end

    assert!(matches!(
        first.result().await,
        Err(TransactionError::Canceled)
    ));
    assert!(!first.executed());
    assert!(second.result().await.is_ok());
    assert!(second.executed());
    assert_eq!(h.store.get(1), 20);
    h.assert_totals(4, 2);
    h.shutdown().await;
}

#[tokio::test]
async fn three_requests_on_distinct_keys_all_run() {
    let mut h = Harness::new();

    let mut r2 = submit(&h, h.req(2, 10), false, false);
    h.step().await;
    let mut r1 = submit(&h, h.req(1, 20), false, false);
    let mut r3 = submit(&h, h.req(3, 30), false, false);
    for _ in 0..5 {
        h.step().await;
    }

    assert!(r1.result().await.is_ok());
    assert!(r2.result().await.is_ok());
    assert!(r3.result().await.is_ok());
    assert_eq!(h.store.get(1), 20);
    assert_eq!(h.store.get(2), 10);
    assert_eq!(h.store.get(3), 30);
    h.assert_totals(6, 3);
    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_of_waiter_is_ceased_and_waiter_survives() {
    let mut h = Harness::new();

    let mut v8 = submit(&h, h.req(1, 8), true, false);
    h.step().await; // v8 active, parked at its start gate

    let mut v9 = submit(&h, h.req(1, 9), true, false);
    h.step().await; // v9 waitlisted, no reply yet

    let mut v9dup = submit(&h, h.req(1, 9), false, false);
    h.step().await; // duplicate does not supersede the waiter: ceased
    h.step().await; // duplicate end; identity check leaves the real v9 parked

    assert!(matches!(
        v9dup.result().await,
        Err(TransactionError::Superseded(_))
    ));
    assert!(!v9dup.executed());

    v8.wait_start().await;
    h.step().await; // v8 end commits 8 and promotes v9
    v9.wait_start().await;
    h.step().await; // v9 end commits 9

    assert!(v8.result().await.is_ok());
    assert!(v9.result().await.is_ok());
    assert!(v9.executed());
    assert_eq!(h.store.get(1), 9);
    h.assert_totals(6, 3);
    h.shutdown().await;
}

#[tokio::test]
async fn newer_request_displaces_the_waiter() {
    let mut h = Harness::new();

    let mut v9 = submit(&h, h.req(1, 9), false, true);
    h.step().await; // v9 active, parked at its finish gate

    let mut v10 = submit(&h, h.req(1, 10), false, false);
    h.step().await; // v10 waitlisted

    let mut v11 = submit(&h, h.req(1, 11), false, false);
    h.step().await; // v11 displaces v10; v10 ceased with a diagnostic

    assert!(matches!(
        v10.result().await,
        Err(TransactionError::Superseded(_))
    ));
    assert!(!v10.executed());
    h.step().await; // v10 end; must not disturb the waiting v11

    v9.wait_finish().await;
    h.step().await; // v9 end commits 9 and promotes v11
    h.step().await; // v11 end commits 11

    assert!(v9.result().await.is_ok());
    assert!(v11.result().await.is_ok());
    assert!(v11.executed());
    assert_eq!(h.store.get(1), 11);
    h.assert_totals(6, 3);
    h.shutdown().await;
}

#[tokio::test]
async fn third_request_inferior_to_waiter_is_ceased() {
    let mut h = Harness::new();

    let mut v9 = submit(&h, h.req(1, 9), false, true);
    h.step().await; // v9 active, parked at its finish gate

    let mut v20 = submit(&h, h.req(1, 20), false, false);
    h.step().await; // v20 waitlisted

    let mut v11 = submit(&h, h.req(1, 11), false, false);
    h.step().await; // v11 does not supersede the waiting v20: ceased
    h.step().await; // v11 end

    assert!(matches!(
        v11.result().await,
        Err(TransactionError::Superseded(_))
    ));
    assert!(!v11.executed());

    v9.wait_finish().await;
    h.step().await; // v9 end commits 9 and promotes v20
    h.step().await; // v20 end commits 20

    assert!(v9.result().await.is_ok());
    assert!(v20.result().await.is_ok());
    assert_eq!(h.store.get(1), 20);
    h.assert_totals(6, 3);
    h.shutdown().await;
}

#[tokio::test]
async fn canceled_waiter_is_purged_without_promotion() {
    let mut h = Harness::new();

    let mut active = submit(&h, h.req(1, 9), false, true);
    h.step().await; // v9 active, parked at its finish gate

    let mut waiter = submit(&h, h.req(1, 10), false, false);
    h.step().await; // v10 waitlisted, no reply yet

    waiter.cancel();
    assert!(matches!(
        waiter.result().await,
        Err(TransactionError::Canceled)
    ));
    h.step().await; // v10 end removes the exact waitlist entry

    active.wait_finish().await;
    h.step().await; // v9 end commits 9; nothing left to promote

    assert!(active.result().await.is_ok());
    assert!(!waiter.executed());
    assert_eq!(h.store.get(1), 9);
    // The waitlisted begin was never answered, so only three messages
    // reached a terminal disposition.
    h.assert_totals(3, 2);
    h.shutdown().await;
}

#[tokio::test]
async fn finalize_failure_surfaces_and_frees_the_key() {
    let mut h = Harness::new();

    let mut failing = TestReq::new(&h.store, 1, 20);
    failing.fail_finalize = true;
    let mut r = submit(&h, failing, false, false);
    h.step().await; // begin
    h.step().await; // end: finalize refuses, transaction fails

    assert!(matches!(
        r.result().await,
        Err(TransactionError::Finalize(_))
    ));
    assert!(r.executed(), "work ran before finalize failed");
    assert_eq!(h.store.get(1), 0, "failed finalize must not commit");

    // The key is free again: a fresh request proceeds normally.
    let mut retry = submit(&h, h.req(1, 20), false, false);
    h.step().await;
    h.step().await;

    assert!(retry.result().await.is_ok());
    assert_eq!(h.store.get(1), 20);
    h.assert_totals(4, 2);
    h.shutdown().await;
}
