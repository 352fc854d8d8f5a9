//! Shared fixtures for the integration tests: an in-memory versioned store
//! and a versioned test request built on it.

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use keyvisor::{BoxError, Request};

/// Mutex-guarded map standing in for persistent storage during tests.
#[derive(Default)]
pub struct MtxMap {
    records: Mutex<HashMap<i64, i64>>,
}

impl MtxMap {
    pub fn get(&self, key: i64) -> i64 {
        self.records.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    pub fn set(&self, key: i64, value: i64) {
        self.records.lock().unwrap().insert(key, value);
    }
}

/// Versioned write request: valid while its value beats the stored one,
/// supersedes lower values, finalize commits to the store.
pub struct TestReq {
    pub key: i64,
    pub value: i64,
    pub store: Arc<MtxMap>,
    pub fail_finalize: bool,
}

impl TestReq {
    pub fn new(store: &Arc<MtxMap>, key: i64, value: i64) -> Self {
        Self {
            key,
            value,
            store: Arc::clone(store),
            fail_finalize: false,
        }
    }
}

impl Request for TestReq {
    fn key(&self) -> i64 {
        self.key
    }

    fn valid(&self) -> Result<(), BoxError> {
        let current = self.store.get(self.key);
        if self.value > current {
            Ok(())
        } else {
            Err(format!("test item {}:{} not valid", self.key, self.value).into())
        }
    }

    fn supersedes(&self, other: &dyn Request) -> Result<(), BoxError> {
        let other = other
            .as_any()
            .downcast_ref::<TestReq>()
            .ok_or("failed to cast request as TestReq")?;
        if self.value > other.value {
            Ok(())
        } else {
            Err(format!(
                "{}:{} superseded by {}:{}",
                self.key, self.value, other.key, other.value
            )
            .into())
        }
    }

    fn finalize(&self) -> Result<(), BoxError> {
        if self.fail_finalize {
            return Err("finalize refused".into());
        }
        self.store.set(self.key, self.value);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
