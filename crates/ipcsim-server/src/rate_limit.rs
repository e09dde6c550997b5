// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-window message rate limiting for a single connection.

use std::time::Duration;

use tokio::time::Instant;

/// Counts messages in fixed windows of `window` length.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    max: u32,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    /// Allow `max` messages per `window`.
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Record one message. Returns `false` if it exceeds the window's budget.
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.max {
            return false;
        }
        self.count += 1;
        true
    }

    /// Messages counted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}
