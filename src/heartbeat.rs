// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Heartbeat ticker: keeps idle subscriber connections alive.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::broker::{Beat, Broker};

/// Spawn a ticker for one channel.
///
/// Beats every `interval` while the channel is open and has subscribers,
/// and exits as soon as the channel turns terminal or disappears.
pub fn spawn_ticker(broker: Broker, message_id: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(finished) = broker.finished(&message_id) else {
            return;
        };
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = finished.cancelled() => break,
                _ = ticker.tick() => match broker.heartbeat(&message_id) {
                    Ok(Beat::Sent) => tracing::trace!(message_id = %message_id, "heartbeat"),
                    Ok(Beat::Idle) => {}
                    Ok(Beat::Terminal) | Err(_) => break,
                },
            }
        }
        tracing::debug!(message_id = %message_id, "heartbeat ticker stopped");
    })
}
