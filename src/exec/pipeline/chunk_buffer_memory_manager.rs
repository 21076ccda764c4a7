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
//! Chunk-buffer memory accounting.
//!
//! Responsibilities:
//! - Tracks buffered chunk bytes per exchange channel and in aggregate.
//! - Exposes high-water-mark counters for external resource-limit enforcement.
//!
//! Key exported interfaces:
//! - Types: `ChunkBufferMemoryManager`.
//!
//! Invariant: once every in-flight `consume`/`release` call has returned, the
//! aggregate equals the sum of the channel counters.

use std::sync::Arc;

use crate::runtime::profile::{CounterRef, HighWaterMarkCounter, TUnit};

/// Memory accounting for chunks buffered in exchange queues.
pub struct ChunkBufferMemoryManager {
    channel_usage: Vec<CounterRef>,
    memory_usage: CounterRef,
}

impl ChunkBufferMemoryManager {
    pub fn new(num_channels: usize) -> Self {
        let channel_usage = (0..num_channels)
            .map(|idx| {
                Arc::new(HighWaterMarkCounter::new(
                    format!("MemoryUsage{idx}"),
                    TUnit::Bytes,
                ))
            })
            .collect();
        Self {
            channel_usage,
            memory_usage: Arc::new(HighWaterMarkCounter::new("MemoryUsage", TUnit::Bytes)),
        }
    }

    pub fn consume(&self, channel: usize, bytes: i64) {
        if bytes == 0 {
            return;
        }
        self.channel_usage[channel].add(bytes);
        self.memory_usage.add(bytes);
    }

    pub fn release(&self, channel: usize, bytes: i64) {
        if bytes == 0 {
            return;
        }
        self.channel_usage[channel].add(-bytes);
        self.memory_usage.add(-bytes);
    }

    pub fn get_memory_usage(&self) -> i64 {
        self.memory_usage.value()
    }

    pub fn get_peak_memory_usage(&self) -> i64 {
        self.memory_usage.peak()
    }

    pub fn channel_memory_usage(&self, channel: usize) -> i64 {
        self.channel_usage[channel].value()
    }

    pub fn channel_peak_memory_usage(&self, channel: usize) -> i64 {
        self.channel_usage[channel].peak()
    }

    pub fn channel_counter(&self, channel: usize) -> CounterRef {
        Arc::clone(&self.channel_usage[channel])
    }

    pub fn aggregate_counter(&self) -> CounterRef {
        Arc::clone(&self.memory_usage)
    }

    pub fn num_channels(&self) -> usize {
        self.channel_usage.len()
    }
}
