// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Concurrency guard: caps simultaneous subscriptions per
// (user, conversation) pair.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Wire code carried by capacity rejections.
pub const CONCURRENCY_LIMIT_CODE: &str = "SSE_CONCURRENCY_LIMIT_EXCEEDED";

type LeaseKey = (String, Uuid);

/// Admission refused; the caller should retry after `retry_after_secs`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("SSE_CONCURRENCY_LIMIT_EXCEEDED: {active} active stream(s), limit {limit}")]
pub struct CapacityRejection {
    pub active: usize,
    pub limit: usize,
    pub retry_after_secs: u64,
}

impl CapacityRejection {
    pub fn code(&self) -> &'static str {
        CONCURRENCY_LIMIT_CODE
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyGuard {
    active: Arc<DashMap<LeaseKey, usize>>,
    limit: usize,
    retry_after_secs: u64,
}

impl ConcurrencyGuard {
    pub fn new(limit: usize, retry_after_secs: u64) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            limit,
            retry_after_secs,
        }
    }

    /// Take a slot for the pair, or reject if the pair is at its limit.
    ///
    /// The check and the increment happen under the same shard lock, so two
    /// racing calls can never both take the last slot.
    pub fn admit(&self, user_id: &str, conversation_id: Uuid) -> Result<Lease, CapacityRejection> {
        let key = (user_id.to_string(), conversation_id);
        {
            let mut count = self.active.entry(key.clone()).or_insert(0);
            if *count >= self.limit {
                let active = *count;
                drop(count);
                tracing::info!(
                    user_id,
                    conversation_id = %conversation_id,
                    active,
                    limit = self.limit,
                    "stream rejected at concurrency limit"
                );
                return Err(CapacityRejection {
                    active,
                    limit: self.limit,
                    retry_after_secs: self.retry_after_secs,
                });
            }
            *count += 1;
        }
        Ok(Lease {
            active: Arc::clone(&self.active),
            key,
        })
    }

    /// Leases currently held for the pair.
    pub fn active(&self, user_id: &str, conversation_id: Uuid) -> usize {
        self.active
            .get(&(user_id.to_string(), conversation_id))
            .map_or(0, |count| *count)
    }
}

/// A held slot. Released exactly once, when dropped.
#[derive(Debug)]
pub struct Lease {
    active: Arc<DashMap<LeaseKey, usize>>,
    key: LeaseKey,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Entry::Occupied(mut slot) = self.active.entry(self.key.clone()) {
            if *slot.get() <= 1 {
                slot.remove();
            } else {
                *slot.get_mut() -= 1;
            }
        }
    }
}
