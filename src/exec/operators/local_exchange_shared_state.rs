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
//! Shared state of one local exchange point.
//!
//! Responsibilities:
//! - Owns the exchanger, readiness gates, and running sink/source counters.
//! - Sequences end-of-stream propagation when the last producer finishes.
//! - Releases buffered data when the last consumer retires.
//!
//! Key exported interfaces:
//! - Types: `LocalExchangeSharedState`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::exec::chunk::Chunk;
use crate::exec::operators::local_exchanger::{
    LocalExchangeConfig, LocalExchangeStats, LocalExchanger, SinkInfo, SinkStatus,
};
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::novarocks_logging::{debug, info};
use crate::runtime::profile::CounterRef;
use crate::runtime::runtime_state::RuntimeState;

/// One instance per exchange point, shared by every sink and source task through `Arc`.
pub struct LocalExchangeSharedState {
    exchanger: LocalExchanger,
    num_sink_tasks: usize,
    num_source_tasks: usize,
    running_sink_operators: AtomicUsize,
    running_source_operators: AtomicUsize,
    sink_finished: Vec<AtomicBool>,
    source_closed: Vec<AtomicBool>,
}

impl LocalExchangeSharedState {
    pub fn new(config: LocalExchangeConfig) -> Arc<Self> {
        let num_channels = config.num_source_tasks;
        let (source_deps, sink_deps) = Self::create_dependencies(num_channels);
        let exchanger = LocalExchanger::new(&config, source_deps, sink_deps);
        Arc::new(Self {
            exchanger,
            num_sink_tasks: config.num_sink_tasks,
            num_source_tasks: num_channels,
            running_sink_operators: AtomicUsize::new(config.num_sink_tasks),
            running_source_operators: AtomicUsize::new(num_channels),
            sink_finished: (0..config.num_sink_tasks)
                .map(|_| AtomicBool::new(false))
                .collect(),
            source_closed: (0..num_channels).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    /// Allocates one source gate and one sink gate per channel.
    ///
    /// Source gates start blocked (nothing queued yet); sink gates start ready.
    pub fn create_dependencies(n: usize) -> (Vec<DependencyHandle>, Vec<DependencyHandle>) {
        let source_deps = (0..n)
            .map(|i| Dependency::new(format!("LOCAL_EXCHANGE_SOURCE_DEPENDENCY_{i}"), false))
            .collect();
        let sink_deps = (0..n)
            .map(|i| Dependency::new(format!("LOCAL_EXCHANGE_SINK_DEPENDENCY_{i}"), true))
            .collect();
        (source_deps, sink_deps)
    }

    pub fn exchanger(&self) -> &LocalExchanger {
        &self.exchanger
    }

    pub fn exchange_id(&self) -> usize {
        self.exchanger.exchange_id()
    }

    pub fn num_sink_tasks(&self) -> usize {
        self.num_sink_tasks
    }

    pub fn num_source_tasks(&self) -> usize {
        self.num_source_tasks
    }

    /// Routes `chunk`; when `eos` is set and the chunk was accepted, the calling
    /// sink task is retired.
    ///
    /// A blocked chunk does not consume `eos`: the caller retries with the same flag.
    pub fn sink(
        &self,
        state: &RuntimeState,
        chunk: Chunk,
        eos: bool,
        sink: SinkInfo<'_>,
    ) -> Result<SinkStatus, String> {
        let status = self.exchanger.sink(state, chunk, sink)?;
        if eos && status.is_accepted() {
            self.finish_sink(sink.channel_id);
        }
        Ok(status)
    }

    /// Retires sink task `sink_channel`. Repeated calls for the same task are ignored.
    pub fn finish_sink(&self, sink_channel: usize) -> bool {
        let Some(flag) = self.sink_finished.get(sink_channel) else {
            panic!(
                "sink channel {} out of range ({} sink tasks)",
                sink_channel, self.num_sink_tasks
            );
        };
        if flag.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.sub_running_sink_operators()
    }

    pub fn get_block(&self, state: &RuntimeState, channel: usize) -> Result<(Chunk, bool), String> {
        self.exchanger.get_block(state, channel)
    }

    /// Closes source channel `channel` and retires its task once.
    pub fn close_source(&self, channel: usize) -> bool {
        self.exchanger.close(channel);
        if self.source_closed[channel].swap(true, Ordering::AcqRel) {
            return false;
        }
        self.sub_running_source_operators()
    }

    /// Returns true for the call that took the counter to zero.
    pub fn sub_running_sink_operators(&self) -> bool {
        let Some(prev) = saturating_decrement(&self.running_sink_operators) else {
            return false;
        };
        debug!(
            "LocalExchange producer finished: exchange_id={} remaining_producers={}",
            self.exchange_id(),
            prev - 1
        );
        if prev != 1 {
            return false;
        }
        self.exchanger.set_all_eos();
        info!(
            "LocalExchange all producers finished: exchange_id={}",
            self.exchange_id()
        );
        let stats = self.exchanger.stats_snapshot();
        for channel in &stats.channels {
            debug!(
                "LocalExchange stats: exchange_id={} channel={} pushed_rows={} popped_rows={} pushed_chunks={} popped_chunks={} dropped_rows={} buffered_chunks={} memory_usage={} peak_memory_usage={}",
                stats.exchange_id,
                channel.channel,
                channel.pushed_rows,
                channel.popped_rows,
                channel.pushed_chunks,
                channel.popped_chunks,
                channel.dropped_rows,
                channel.buffered_chunks,
                channel.memory_usage,
                channel.peak_memory_usage
            );
        }
        true
    }

    /// Returns true for the call that took the counter to zero; that call
    /// closes and clears every channel.
    pub fn sub_running_source_operators(&self) -> bool {
        let Some(prev) = saturating_decrement(&self.running_source_operators) else {
            return false;
        };
        if prev != 1 {
            return false;
        }
        for channel in 0..self.exchanger.num_channels() {
            self.exchanger.close(channel);
        }
        debug!(
            "LocalExchange all consumers finished: exchange_id={} memory_usage={}",
            self.exchange_id(),
            self.mem_usage()
        );
        true
    }

    pub fn running_sink_operators(&self) -> usize {
        self.running_sink_operators.load(Ordering::Acquire)
    }

    pub fn running_source_operators(&self) -> usize {
        self.running_source_operators.load(Ordering::Acquire)
    }

    pub fn source_dependency(&self, channel: usize) -> DependencyHandle {
        Arc::clone(self.exchanger.source_dependency(channel))
    }

    pub fn sink_dependency(&self, channel: usize) -> DependencyHandle {
        Arc::clone(self.exchanger.sink_dependency(channel))
    }

    pub fn mem_usage(&self) -> i64 {
        self.exchanger.memory_manager().get_memory_usage()
    }

    pub fn peak_mem_usage(&self) -> i64 {
        self.exchanger.memory_manager().get_peak_memory_usage()
    }

    pub fn channel_mem_usage(&self, channel: usize) -> i64 {
        self.exchanger.memory_manager().channel_memory_usage(channel)
    }

    pub fn channel_mem_counter(&self, channel: usize) -> CounterRef {
        self.exchanger.memory_manager().channel_counter(channel)
    }

    pub fn mem_counter(&self) -> CounterRef {
        self.exchanger.memory_manager().aggregate_counter()
    }

    pub fn stats_snapshot(&self) -> LocalExchangeStats {
        self.exchanger.stats_snapshot()
    }
}

/// Decrements `counter` unless it is already zero; returns the previous value.
fn saturating_decrement(counter: &AtomicUsize) -> Option<usize> {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        if current == 0 {
            return None;
        }
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) => return Some(prev),
            Err(actual) => current = actual,
        }
    }
}
