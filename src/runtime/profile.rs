// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Profile counters exported by exchange operators.
//!
//! Responsibilities:
//! - Provides named counters that external resource-limit enforcement can read concurrently.
//! - Tracks high-water marks for byte counters without taking locks.
//!
//! Key exported interfaces:
//! - Types: `HighWaterMarkCounter`, `CounterRef`, `TUnit`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TUnit {
    Unit,
    Bytes,
}

pub type CounterRef = Arc<HighWaterMarkCounter>;

/// Counter that remembers the largest value it has ever held.
pub struct HighWaterMarkCounter {
    name: String,
    unit: TUnit,
    value: AtomicI64,
    peak: AtomicI64,
}

impl fmt::Debug for HighWaterMarkCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HighWaterMarkCounter")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("value", &self.value())
            .field("peak", &self.peak())
            .finish()
    }
}

impl HighWaterMarkCounter {
    pub fn new(name: impl Into<String>, unit: TUnit) -> Self {
        Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> TUnit {
        self.unit
    }

    /// Applies `delta` and returns the new value.
    pub fn add(&self, delta: i64) -> i64 {
        let prev = self.value.fetch_add(delta, Ordering::AcqRel);
        let cur = prev.saturating_add(delta);
        if delta > 0 {
            self.update_peak(cur);
        }
        cur
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}
