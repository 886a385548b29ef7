// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::Result;
use crate::lock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

struct Entry<T> {
    created: Instant,
    cell: Arc<OnceCell<T>>,
}

/// Short-lived memo of async lookups. Concurrent callers of the same key share
/// one in-flight fetch; failed fetches are not remembered.
pub struct TtlCache<T> {
    ttl: Duration,
    entries: Mutex<HashMap<&'static str, Entry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_try_fetch<F, Fut>(&self, key: &'static str, bypass: bool, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cell = {
            let mut entries = lock(&self.entries);
            let fresh = entries
                .get(key)
                .filter(|entry| !bypass && entry.created.elapsed() < self.ttl)
                .map(|entry| entry.cell.clone());
            match fresh {
                Some(cell) => cell,
                None => {
                    let cell = Arc::new(OnceCell::new());
                    entries.insert(
                        key,
                        Entry {
                            created: Instant::now(),
                            cell: cell.clone(),
                        },
                    );
                    cell
                }
            }
        };
        cell.get_or_try_init(fetch).await.cloned()
    }

    pub fn invalidate(&self, key: &str) {
        lock(&self.entries).remove(key);
    }
}
