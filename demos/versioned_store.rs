//! # Example: versioned_store
//!
//! Arbitrates concurrent versioned writes into an in-memory store.
//!
//! Shows how to:
//! - Implement [`Request`] for a versioned write (`valid`, `supersedes`, `finalize`)
//! - Run the supervisor loop on its own task
//! - Drive many concurrent transactions through [`Supervisor::with_worker`]
//! - Collect metrics with [`LocalInstrument`] and logs with [`TracingLog`]
//!
//! ## Flow
//! ```text
//! main()
//!   ├─► spawn supervisor.process()
//!   ├─► for every (key, version) in shuffled order:
//!   │     spawn with_worker(ctx, VersionedPut, work)
//!   │       ├─► proceed: simulate work, then finalize commits the version
//!   │       └─► cease: stale/superseded writes return diagnostics
//!   └─► join all, print store contents and metric snapshot
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example versioned_store
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use keyvisor::logging::TracingLog;
use keyvisor::telemetry::LocalInstrument;
use keyvisor::{BoxError, Request, Supervisor};

/// In-memory versioned store standing in for real persistence.
#[derive(Default)]
struct Store {
    records: Mutex<HashMap<i64, i64>>,
}

impl Store {
    fn version(&self, key: i64) -> i64 {
        self.records.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    fn commit(&self, key: i64, version: i64) {
        self.records.lock().unwrap().insert(key, version);
    }

    fn dump(&self) -> Vec<(i64, i64)> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        records.sort();
        records
    }
}

/// One versioned write competing for its key.
struct VersionedPut {
    key: i64,
    version: i64,
    store: Arc<Store>,
}

impl Request for VersionedPut {
    fn key(&self) -> i64 {
        self.key
    }

    fn valid(&self) -> Result<(), BoxError> {
        let current = self.store.version(self.key);
        if self.version > current {
            Ok(())
        } else {
            Err(format!(
                "write {}:{} is stale (stored version {})",
                self.key, self.version, current
            )
            .into())
        }
    }

    fn supersedes(&self, other: &dyn Request) -> Result<(), BoxError> {
        let other = other
            .as_any()
            .downcast_ref::<VersionedPut>()
            .ok_or("other request is not a VersionedPut")?;
        if self.version > other.version {
            Ok(())
        } else {
            Err(format!(
                "write {}:{} superseded by {}:{}",
                self.key, self.version, other.key, other.version
            )
            .into())
        }
    }

    fn finalize(&self) -> Result<(), BoxError> {
        self.store.commit(self.key, self.version);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let store = Arc::new(Store::default());
    let metrics = Arc::new(LocalInstrument::new());

    let supervisor = Arc::new(
        Supervisor::builder()
            .channel_depth(32)
            .instrument(metrics.clone())
            .logger(Arc::new(TracingLog))
            .build(),
    );

    let loop_task = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.process().await }
    });

    // Five versions per key, submitted in shuffled order: only the highest
    // version per key should land in the store.
    let mut writes: Vec<(i64, i64)> = (1..=4)
        .flat_map(|key| (1..=5).map(move |version| (key, version)))
        .collect();
    writes.shuffle(&mut rand::thread_rng());

    let mut handles = Vec::new();
    for (key, version) in writes {
        let supervisor = Arc::clone(&supervisor);
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let put = Arc::new(VersionedPut {
                key,
                version,
                store,
            });
            let outcome = supervisor
                .with_worker(CancellationToken::new(), put, |_ctx| async move {
                    // Simulated work with jitter to create contention.
                    let millis = rand::thread_rng().gen_range(1..5);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(())
                })
                .await;
            (key, version, outcome)
        }));
    }

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for handle in handles {
        let (key, version, outcome) = handle.await?;
        match outcome {
            Ok(()) => {
                accepted += 1;
                println!("[accepted] key={key} version={version}");
            }
            Err(err) => {
                rejected += 1;
                println!("[rejected] key={key} version={version}: {err}");
            }
        }
    }

    supervisor.terminate();
    loop_task.await?;

    println!("\nstore contents (key, version): {:?}", store.dump());
    println!("accepted={accepted} rejected={rejected}");
    println!("metric snapshot: {:?}", metrics.snap());
    Ok(())
}
