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
//! Local exchange queues and routing.
//!
//! Responsibilities:
//! - Routes chunks from sink tasks into per-channel queues by hash shuffle, passthrough, or broadcast.
//! - Maintains per-channel end-of-stream flags, memory counters, and readiness gates.
//! - Drains queued chunks for source tasks in bounded row batches.
//!
//! Key exported interfaces:
//! - Types: `LocalExchangeType`, `LocalExchanger`, `SinkInfo`, `SinkStatus`, `LocalExchangeStats`.
//!
//! Current limitations:
//! - Channel ids outside `[0, num_channels)` are contract violations and panic.
//! - Producer/consumer reference counting lives in `LocalExchangeSharedState`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::operators::local_exchange_partitioner::{ChannelMap, PartitionHasher};
use crate::exec::pipeline::chunk_buffer_memory_manager::ChunkBufferMemoryManager;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::novarocks_logging::{debug, trace};
use crate::runtime::runtime_state::RuntimeState;

static NEXT_EXCHANGE_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Routing strategy of one local exchange.
pub enum LocalExchangeType {
    /// Rows go to `shuffle_idx_to_instance_idx[hash % num_partitions]`.
    HashShuffle,
    /// Whole chunks rotate across channels, per sink.
    Passthrough,
    /// Every chunk goes to every open channel.
    Broadcast,
}

impl fmt::Display for LocalExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LocalExchangeType::HashShuffle => "HASH_SHUFFLE",
            LocalExchangeType::Passthrough => "PASSTHROUGH",
            LocalExchangeType::Broadcast => "BROADCAST",
        };
        f.write_str(name)
    }
}

/// Plan-level configuration of one exchange point.
#[derive(Clone, Debug)]
pub struct LocalExchangeConfig {
    pub exchange_type: LocalExchangeType,
    pub num_sink_tasks: usize,
    pub num_source_tasks: usize,
    pub num_partitions: usize,
    pub shuffle_idx_to_instance_idx: HashMap<usize, usize>,
    /// Per-channel queued chunk capacity; `0` is unbounded.
    ///
    /// Soft limit: the capacity check and the enqueue lock the queue separately,
    /// so racing producers may each add one chunk past it.
    pub free_block_limit: usize,
}

impl LocalExchangeConfig {
    /// Hash shuffle with an identity partition to channel mapping.
    pub fn hash_shuffle(
        num_sink_tasks: usize,
        num_source_tasks: usize,
        num_partitions: usize,
        free_block_limit: usize,
    ) -> Self {
        Self {
            exchange_type: LocalExchangeType::HashShuffle,
            num_sink_tasks,
            num_source_tasks,
            num_partitions,
            shuffle_idx_to_instance_idx: HashMap::new(),
            free_block_limit,
        }
    }

    pub fn passthrough(num_sink_tasks: usize, num_source_tasks: usize) -> Self {
        Self {
            exchange_type: LocalExchangeType::Passthrough,
            num_sink_tasks,
            num_source_tasks,
            num_partitions: num_source_tasks,
            shuffle_idx_to_instance_idx: HashMap::new(),
            free_block_limit: 0,
        }
    }

    pub fn broadcast(num_sink_tasks: usize, num_source_tasks: usize) -> Self {
        Self {
            exchange_type: LocalExchangeType::Broadcast,
            num_sink_tasks,
            num_source_tasks,
            num_partitions: num_source_tasks,
            shuffle_idx_to_instance_idx: HashMap::new(),
            free_block_limit: 0,
        }
    }

    pub fn with_shuffle_idx_to_instance_idx(mut self, table: HashMap<usize, usize>) -> Self {
        self.shuffle_idx_to_instance_idx = table;
        self
    }

    pub fn with_free_block_limit(mut self, free_block_limit: usize) -> Self {
        self.free_block_limit = free_block_limit;
        self
    }

    /// Uses `runtime.local_exchange_free_block_limit` from the app config.
    pub fn with_default_free_block_limit(self) -> Self {
        self.with_free_block_limit(crate::common::config::local_exchange_free_block_limit())
    }
}

/// Per-call binding of the sink task that pushes a chunk.
#[derive(Clone, Copy)]
pub struct SinkInfo<'a> {
    pub channel_id: usize,
    pub hasher: Option<&'a dyn PartitionHasher>,
}

impl<'a> SinkInfo<'a> {
    pub fn new(channel_id: usize, hasher: Option<&'a dyn PartitionHasher>) -> Self {
        Self { channel_id, hasher }
    }
}

/// Outcome of a sink call that did not fail.
#[derive(Debug)]
pub enum SinkStatus {
    /// The chunk was routed; pieces for closed channels were dropped.
    Accepted,
    /// A destination queue is at capacity. Nothing was enqueued; the chunk is
    /// handed back and the caller should park on that channel's sink dependency.
    Blocked { channel: usize, chunk: Chunk },
}

impl SinkStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SinkStatus::Accepted)
    }
}

struct DataQueueState {
    chunks: VecDeque<Chunk>,
    eos: bool,
}

/// One channel's FIFO; EOS is sticky.
struct DataQueue {
    state: Mutex<DataQueueState>,
}

impl DataQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(DataQueueState {
                chunks: VecDeque::new(),
                eos: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DataQueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Route {
    Whole(usize),
    Rows(usize, Vec<u32>),
}

impl Route {
    fn channel(&self) -> usize {
        match self {
            Route::Whole(channel) | Route::Rows(channel, _) => *channel,
        }
    }
}

#[derive(Default)]
struct ChannelStats {
    pushed_rows: AtomicU64,
    popped_rows: AtomicU64,
    pushed_chunks: AtomicU64,
    popped_chunks: AtomicU64,
    dropped_rows: AtomicU64,
}

/// In-process exchange buffer shared by all sink and source tasks of one exchange point.
pub struct LocalExchanger {
    exchange_id: usize,
    exchange_type: LocalExchangeType,
    channel_map: ChannelMap,
    free_block_limit: usize,
    data_queues: Vec<DataQueue>,
    memory_manager: ChunkBufferMemoryManager,
    source_deps: Vec<DependencyHandle>,
    sink_deps: Vec<DependencyHandle>,
    passthrough_cursors: Vec<AtomicUsize>,
    stats: Vec<ChannelStats>,
    // Schema of the first non-empty chunk; every later chunk must match it.
    schema: OnceLock<SchemaRef>,
}

impl LocalExchanger {
    /// `source_deps` and `sink_deps` hold one gate per channel, index-aligned with the queues.
    pub(crate) fn new(
        config: &LocalExchangeConfig,
        source_deps: Vec<DependencyHandle>,
        sink_deps: Vec<DependencyHandle>,
    ) -> Self {
        let num_channels = config.num_source_tasks;
        assert!(num_channels > 0, "local exchange requires at least one source");
        assert_eq!(source_deps.len(), num_channels);
        assert_eq!(sink_deps.len(), num_channels);
        let channel_map = match config.exchange_type {
            LocalExchangeType::HashShuffle => ChannelMap::new(
                config.num_partitions,
                num_channels,
                &config.shuffle_idx_to_instance_idx,
            ),
            LocalExchangeType::Passthrough | LocalExchangeType::Broadcast => {
                ChannelMap::identity(num_channels)
            }
        };
        let exchange_id = NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed);
        let passthrough_cursors = (0..config.num_sink_tasks.max(1))
            .map(|sink| AtomicUsize::new(sink % num_channels))
            .collect();
        debug!(
            "LocalExchanger created: exchange_id={} type={} sinks={} channels={} partitions={} free_block_limit={}",
            exchange_id,
            config.exchange_type,
            config.num_sink_tasks,
            num_channels,
            channel_map.num_partitions(),
            config.free_block_limit
        );
        Self {
            exchange_id,
            exchange_type: config.exchange_type,
            channel_map,
            free_block_limit: config.free_block_limit,
            data_queues: (0..num_channels).map(|_| DataQueue::new()).collect(),
            memory_manager: ChunkBufferMemoryManager::new(num_channels),
            source_deps,
            sink_deps,
            passthrough_cursors,
            stats: (0..num_channels).map(|_| ChannelStats::default()).collect(),
            schema: OnceLock::new(),
        }
    }

    pub fn exchange_id(&self) -> usize {
        self.exchange_id
    }

    pub fn exchange_type(&self) -> LocalExchangeType {
        self.exchange_type
    }

    pub fn num_channels(&self) -> usize {
        self.data_queues.len()
    }

    pub fn free_block_limit(&self) -> usize {
        self.free_block_limit
    }

    pub fn memory_manager(&self) -> &ChunkBufferMemoryManager {
        &self.memory_manager
    }

    pub fn source_dependency(&self, channel: usize) -> &DependencyHandle {
        &self.source_deps[channel]
    }

    pub fn sink_dependency(&self, channel: usize) -> &DependencyHandle {
        &self.sink_deps[channel]
    }

    /// Routes `chunk` into the channel queues.
    ///
    /// Schema mismatches and hashing failures are returned before any queue is touched.
    pub fn sink(
        &self,
        _state: &RuntimeState,
        chunk: Chunk,
        sink: SinkInfo<'_>,
    ) -> Result<SinkStatus, String> {
        if chunk.is_empty() {
            return Ok(SinkStatus::Accepted);
        }
        self.check_schema(&chunk)?;
        let routes = self.route(&chunk, sink)?;

        if self.free_block_limit > 0 {
            for route in &routes {
                let channel = route.channel();
                if self.at_capacity(channel) {
                    trace!(
                        "LocalExchange sink blocked: exchange_id={} sink={} channel={}",
                        self.exchange_id, sink.channel_id, channel
                    );
                    return Ok(SinkStatus::Blocked { channel, chunk });
                }
            }
        }

        for route in routes {
            match route {
                Route::Whole(channel) => {
                    self.enqueue(channel, chunk.clone());
                }
                Route::Rows(channel, rows) => {
                    let part = chunk.take_rows(&rows)?;
                    self.enqueue(channel, part);
                }
            }
        }
        Ok(SinkStatus::Accepted)
    }

    /// Drains up to `state.chunk_size()` rows from `channel`.
    ///
    /// Returns `(chunk, eos)`; `eos` is true only when the queue is both empty and
    /// marked EOS. An empty, open queue yields zero rows with `eos == false`.
    pub fn get_block(&self, state: &RuntimeState, channel: usize) -> Result<(Chunk, bool), String> {
        let target_rows = state.chunk_size();
        let mut drained = Vec::new();
        let mut rows = 0usize;
        let (eos, has_room) = {
            let mut guard = self.data_queues[channel].lock();
            let mut bytes = 0i64;
            while rows < target_rows {
                let Some(chunk) = guard.chunks.pop_front() else {
                    break;
                };
                rows += chunk.len();
                bytes += chunk_bytes(&chunk);
                drained.push(chunk);
            }
            self.memory_manager.release(channel, bytes);
            let empty = guard.chunks.is_empty();
            if empty && !guard.eos {
                self.source_deps[channel].set_blocked();
            }
            (empty && guard.eos, self.has_room(guard.chunks.len()))
        };
        if has_room {
            self.sink_deps[channel].set_ready();
        }

        if drained.is_empty() {
            return Ok((Chunk::default(), eos));
        }
        let stats = &self.stats[channel];
        stats.popped_rows.fetch_add(rows as u64, Ordering::Relaxed);
        stats
            .popped_chunks
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        let schema = drained[0].schema();
        let chunk = Chunk::concat(&schema, &drained)?;
        Ok((chunk, eos))
    }

    /// Marks `channel` EOS and frees whatever it still buffers. Idempotent.
    pub fn close(&self, channel: usize) {
        let released_chunks = {
            let mut guard = self.data_queues[channel].lock();
            guard.eos = true;
            let released = guard.chunks.drain(..).collect::<Vec<_>>();
            let bytes = released.iter().map(chunk_bytes).sum::<i64>();
            self.memory_manager.release(channel, bytes);
            released.len()
        };
        if released_chunks > 0 {
            debug!(
                "LocalExchange channel closed with buffered data: exchange_id={} channel={} released_chunks={}",
                self.exchange_id, channel, released_chunks
            );
        }
        self.source_deps[channel].set_ready();
        self.sink_deps[channel].set_ready();
    }

    /// Marks every queue EOS without discarding buffered data.
    pub(crate) fn set_all_eos(&self) {
        for (channel, queue) in self.data_queues.iter().enumerate() {
            queue.lock().eos = true;
            self.source_deps[channel].set_ready();
            self.sink_deps[channel].set_ready();
        }
    }

    pub fn is_eos(&self, channel: usize) -> bool {
        self.data_queues[channel].lock().eos
    }

    pub fn queued_chunks(&self, channel: usize) -> usize {
        self.data_queues[channel].lock().chunks.len()
    }

    pub fn queued_rows(&self, channel: usize) -> usize {
        self.data_queues[channel]
            .lock()
            .chunks
            .iter()
            .map(Chunk::len)
            .sum()
    }

    pub fn stats_snapshot(&self) -> LocalExchangeStats {
        let channels = (0..self.num_channels())
            .map(|channel| {
                let stats = &self.stats[channel];
                LocalExchangeChannelStats {
                    channel,
                    pushed_rows: stats.pushed_rows.load(Ordering::Relaxed),
                    popped_rows: stats.popped_rows.load(Ordering::Relaxed),
                    pushed_chunks: stats.pushed_chunks.load(Ordering::Relaxed),
                    popped_chunks: stats.popped_chunks.load(Ordering::Relaxed),
                    dropped_rows: stats.dropped_rows.load(Ordering::Relaxed),
                    buffered_chunks: self.queued_chunks(channel),
                    memory_usage: self.memory_manager.channel_memory_usage(channel),
                    peak_memory_usage: self.memory_manager.channel_peak_memory_usage(channel),
                }
            })
            .collect();
        LocalExchangeStats {
            exchange_id: self.exchange_id,
            memory_usage: self.memory_manager.get_memory_usage(),
            peak_memory_usage: self.memory_manager.get_peak_memory_usage(),
            channels,
        }
    }

    fn route(&self, chunk: &Chunk, sink: SinkInfo<'_>) -> Result<Vec<Route>, String> {
        match self.exchange_type {
            LocalExchangeType::HashShuffle => {
                let hasher = sink
                    .hasher
                    .ok_or_else(|| "hash shuffle local exchange requires a partition hasher".to_string())?;
                let hashes = hasher.hash_rows(chunk)?;
                if hashes.len() != chunk.len() {
                    return Err(format!(
                        "partition hasher returned {} hashes for {} rows",
                        hashes.len(),
                        chunk.len()
                    ));
                }
                let groups = self.channel_map.group_rows(&hashes);
                if let [(channel, _)] = groups.as_slice() {
                    return Ok(vec![Route::Whole(*channel)]);
                }
                Ok(groups
                    .into_iter()
                    .map(|(channel, rows)| Route::Rows(channel, rows))
                    .collect())
            }
            LocalExchangeType::Passthrough => {
                let cursor = &self.passthrough_cursors[sink.channel_id % self.passthrough_cursors.len()];
                let channel = cursor.fetch_add(1, Ordering::Relaxed) % self.num_channels();
                Ok(vec![Route::Whole(channel)])
            }
            LocalExchangeType::Broadcast => Ok((0..self.num_channels()).map(Route::Whole).collect()),
        }
    }

    fn check_schema(&self, chunk: &Chunk) -> Result<(), String> {
        let incoming = chunk.schema();
        let pinned = self.schema.get_or_init(|| Arc::clone(&incoming));
        if Arc::ptr_eq(pinned, &incoming) || **pinned == *incoming {
            return Ok(());
        }
        Err(format!(
            "local exchange {} chunk schema mismatch: expected {:?}, got {:?}",
            self.exchange_id, pinned, incoming
        ))
    }

    fn at_capacity(&self, channel: usize) -> bool {
        let guard = self.data_queues[channel].lock();
        if guard.eos || self.has_room(guard.chunks.len()) {
            return false;
        }
        self.sink_deps[channel].set_blocked();
        true
    }

    fn has_room(&self, queued: usize) -> bool {
        self.free_block_limit == 0 || queued < self.free_block_limit
    }

    /// Returns false when the channel is already EOS and the chunk was dropped.
    fn enqueue(&self, channel: usize, chunk: Chunk) -> bool {
        let rows = chunk.len() as u64;
        let bytes = chunk_bytes(&chunk);
        let stats = &self.stats[channel];
        {
            let mut guard = self.data_queues[channel].lock();
            if guard.eos {
                stats.dropped_rows.fetch_add(rows, Ordering::Relaxed);
                return false;
            }
            guard.chunks.push_back(chunk);
            self.memory_manager.consume(channel, bytes);
            if !self.has_room(guard.chunks.len()) {
                self.sink_deps[channel].set_blocked();
            }
        }
        stats.pushed_rows.fetch_add(rows, Ordering::Relaxed);
        stats.pushed_chunks.fetch_add(1, Ordering::Relaxed);
        self.source_deps[channel].set_ready();
        true
    }
}

fn chunk_bytes(chunk: &Chunk) -> i64 {
    i64::try_from(chunk.estimated_bytes()).unwrap_or(i64::MAX)
}

/// Per-channel queue statistics reported by local exchange.
#[derive(Clone, Debug)]
pub struct LocalExchangeChannelStats {
    pub channel: usize,
    pub pushed_rows: u64,
    pub popped_rows: u64,
    pub pushed_chunks: u64,
    pub popped_chunks: u64,
    pub dropped_rows: u64,
    pub buffered_chunks: usize,
    pub memory_usage: i64,
    pub peak_memory_usage: i64,
}

/// Aggregated local-exchange queue and memory statistics.
#[derive(Clone, Debug)]
pub struct LocalExchangeStats {
    pub exchange_id: usize,
    pub memory_usage: i64,
    pub peak_memory_usage: i64,
    pub channels: Vec<LocalExchangeChannelStats>,
}
