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
//! Integration tests for the local shuffle exchange.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::common::{KeyAsHash, int_chunk, int_values, keyed_chunk, run_with_timeout, string_values, wait_ready};
use novarocks_exchange::exec::pipeline::operator_factory::OperatorFactory;
use novarocks_exchange::exec::operators::{LocalExchangeSinkFactory, LocalExchangeSourceFactory};
use novarocks_exchange::{
    Chunk, Crc32HashPartitioner, LocalExchangeConfig, LocalExchangeSharedState, PartitionHasher,
    RuntimeState, SinkInfo, SinkStatus,
};

mod common;

const WAIT: Duration = Duration::from_secs(10);

fn key_hasher() -> &'static dyn PartitionHasher {
    &KeyAsHash
}

fn assert_memory_consistent(shared: &LocalExchangeSharedState) {
    let channels = shared.num_source_tasks();
    let sum: i64 = (0..channels).map(|c| shared.channel_mem_usage(c)).sum();
    assert_eq!(shared.mem_usage(), sum);
}

#[test]
fn test_four_sinks_four_sources_lifecycle() {
    let rt = RuntimeState::with_chunk_size(4096);
    let shared = LocalExchangeSharedState::new(LocalExchangeConfig::hash_shuffle(4, 4, 4, 0));

    for sink in 0..4 {
        let info = SinkInfo::new(sink, Some(key_hasher()));
        for _ in 0..2 {
            let status = shared
                .sink(&rt, int_chunk(&[sink as i32; 10]), false, info)
                .expect("sink");
            assert!(status.is_accepted());
        }
    }
    for channel in 0..4 {
        assert_eq!(shared.exchanger().queued_rows(channel), 20);
        assert!(shared.channel_mem_usage(channel) > 0);
    }
    assert_memory_consistent(&shared);

    for channel in 0..4 {
        let (chunk, eos) = shared.get_block(&rt, channel).expect("drain");
        assert_eq!(chunk.len(), 20);
        assert!(!eos);
        assert!(int_values(&chunk).iter().all(|v| *v == channel as i32));
        assert_eq!(shared.channel_mem_usage(channel), 0);
    }
    assert_eq!(shared.mem_usage(), 0);

    for sink in 0..4 {
        let info = SinkInfo::new(sink, Some(key_hasher()));
        shared
            .sink(&rt, Chunk::default(), true, info)
            .expect("finish sink");
    }
    assert_eq!(shared.running_sink_operators(), 0);
    for channel in 0..4 {
        let (chunk, eos) = shared.get_block(&rt, channel).expect("eos read");
        assert_eq!(chunk.len(), 0);
        assert!(eos);
    }

    for channel in 0..4 {
        shared.close_source(channel);
    }
    assert_eq!(shared.running_source_operators(), 0);
    for channel in 0..4 {
        assert!(shared.exchanger().is_eos(channel));
        assert_eq!(shared.exchanger().queued_chunks(channel), 0);
    }

    let status = shared
        .sink(&rt, int_chunk(&[0, 1, 2, 3]), false, SinkInfo::new(0, Some(key_hasher())))
        .expect("sink after close");
    assert!(status.is_accepted());
    for channel in 0..4 {
        assert_eq!(shared.exchanger().queued_chunks(channel), 0);
        assert!(shared.exchanger().is_eos(channel));
    }
    assert_eq!(shared.mem_usage(), 0);
}

#[test]
fn test_many_partitions_to_fewer_channels() {
    let rt = RuntimeState::with_chunk_size(4096);
    let table: HashMap<usize, usize> = (0..8).map(|p| (p, p % 3)).collect();
    let shared = LocalExchangeSharedState::new(
        LocalExchangeConfig::hash_shuffle(2, 3, 8, 0).with_shuffle_idx_to_instance_idx(table),
    );
    let first: Vec<i32> = (0..40).collect();
    let second: Vec<i32> = (40..64).collect();
    shared
        .sink(&rt, int_chunk(&first), false, SinkInfo::new(0, Some(key_hasher())))
        .expect("sink 0");
    shared
        .sink(&rt, int_chunk(&second), false, SinkInfo::new(1, Some(key_hasher())))
        .expect("sink 1");
    assert_memory_consistent(&shared);

    let mut seen = BTreeSet::new();
    for channel in 0..3 {
        let (chunk, eos) = shared.get_block(&rt, channel).expect("drain");
        assert!(!eos);
        let values = int_values(&chunk);
        for v in &values {
            assert_eq!((*v as usize % 8) % 3, channel, "value {v} on channel {channel}");
            assert!(seen.insert(*v), "value {v} delivered twice");
        }
        // Rows of one producer keep their relative order.
        let from_first: Vec<i32> = values.iter().copied().filter(|v| *v < 40).collect();
        assert!(from_first.windows(2).all(|w| w[0] < w[1]));
    }
    assert_eq!(seen.len(), 64);
    assert_eq!(shared.mem_usage(), 0);
}

#[test]
fn test_channel_without_rows_still_sees_eos() {
    let rt = RuntimeState::with_chunk_size(4096);
    let shared = LocalExchangeSharedState::new(LocalExchangeConfig::hash_shuffle(2, 3, 3, 0));
    let (chunk, eos) = shared.get_block(&rt, 2).expect("empty read");
    assert!(chunk.is_empty());
    assert!(!eos);

    shared
        .sink(&rt, int_chunk(&[0, 3, 6]), true, SinkInfo::new(0, Some(key_hasher())))
        .expect("sink 0");
    let (chunk, eos) = shared.get_block(&rt, 2).expect("still empty");
    assert!(chunk.is_empty());
    assert!(!eos);

    assert!(shared.finish_sink(1));
    let (chunk, eos) = shared.get_block(&rt, 2).expect("eos read");
    assert!(chunk.is_empty());
    assert!(eos);
    let (chunk, eos) = shared.get_block(&rt, 0).expect("drain with eos");
    assert_eq!(int_values(&chunk), vec![0, 3, 6]);
    assert!(eos);
}

#[test]
fn test_crc32_partitioner_keeps_keys_together() {
    let rt = RuntimeState::with_chunk_size(4096);
    let shared = LocalExchangeSharedState::new(LocalExchangeConfig::hash_shuffle(1, 4, 16, 0));
    let hasher = Crc32HashPartitioner::new(vec![1]);
    let names = ["apple", "pear", "plum", "fig", "kiwi", "lime"];
    for round in 0..3 {
        let keys: Vec<i32> = (0..names.len() as i32).map(|k| k + round * 10).collect();
        shared
            .sink(&rt, keyed_chunk(&keys, &names), false, SinkInfo::new(0, Some(&hasher as &dyn PartitionHasher)))
            .expect("sink");
    }

    let mut owner: HashMap<String, usize> = HashMap::new();
    let mut total = 0;
    for channel in 0..4 {
        let (chunk, _) = shared.get_block(&rt, channel).expect("drain");
        if chunk.is_empty() {
            continue;
        }
        assert_eq!(chunk.columns().len(), 2);
        for name in string_values(&chunk, 1) {
            total += 1;
            let prev = owner.insert(name.clone(), channel);
            assert!(prev.is_none() || prev == Some(channel), "{name} split across channels");
        }
    }
    assert_eq!(total, 18);
    assert_eq!(owner.len(), names.len());
}

#[test]
fn test_hash_failure_does_not_corrupt_counters() {
    let rt = RuntimeState::with_chunk_size(4096);
    let shared = LocalExchangeSharedState::new(LocalExchangeConfig::hash_shuffle(2, 2, 2, 0));
    let broken = Crc32HashPartitioner::new(vec![3]);
    let err = shared
        .sink(&rt, int_chunk(&[1, 2]), true, SinkInfo::new(0, Some(&broken as &dyn PartitionHasher)))
        .expect_err("missing key column");
    assert!(err.contains("out of range"), "err={err}");
    assert_eq!(shared.running_sink_operators(), 2);
    assert_eq!(shared.mem_usage(), 0);

    // The failed producer still retires, and the exchange converges.
    assert!(!shared.finish_sink(0));
    shared
        .sink(&rt, int_chunk(&[1]), true, SinkInfo::new(1, Some(key_hasher())))
        .expect("healthy producer");
    assert_eq!(shared.running_sink_operators(), 0);
    let (chunk, eos) = shared.get_block(&rt, 1).expect("drain");
    assert_eq!(int_values(&chunk), vec![1]);
    assert!(eos);
}

#[test]
fn test_bounded_queue_backpressure() {
    let rt = RuntimeState::with_chunk_size(4096);
    let shared = LocalExchangeSharedState::new(LocalExchangeConfig::hash_shuffle(1, 2, 2, 2));
    let info = SinkInfo::new(0, Some(key_hasher()));
    for _ in 0..2 {
        assert!(shared.sink(&rt, int_chunk(&[1]), false, info).expect("sink").is_accepted());
    }
    let sink_dep = shared.sink_dependency(1);
    assert!(!sink_dep.is_ready());

    let chunk = match shared.sink(&rt, int_chunk(&[3, 5]), false, info).expect("sink") {
        SinkStatus::Blocked { channel, chunk } => {
            assert_eq!(channel, 1);
            chunk
        }
        SinkStatus::Accepted => panic!("channel 1 is at capacity"),
    };
    assert_eq!(shared.exchanger().queued_chunks(1), 2);
    assert_memory_consistent(&shared);

    // Closing the full channel releases the producer; the retry is dropped silently.
    shared.close_source(1);
    assert!(sink_dep.is_ready());
    assert!(shared.sink(&rt, chunk, false, info).expect("retry").is_accepted());
    assert_eq!(shared.exchanger().queued_chunks(1), 0);
    assert_eq!(shared.channel_mem_usage(1), 0);
    assert_eq!(shared.stats_snapshot().channels[1].dropped_rows, 2);
}

fn run_concurrent(free_block_limit: usize) {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 3;
    const PARTITIONS: usize = 6;
    const CHUNKS: usize = 40;
    const ROWS: usize = 64;

    let table: HashMap<usize, usize> = (0..PARTITIONS).map(|p| (p, p % CONSUMERS)).collect();
    let shared = LocalExchangeSharedState::new(
        LocalExchangeConfig::hash_shuffle(PRODUCERS, CONSUMERS, PARTITIONS, free_block_limit)
            .with_shuffle_idx_to_instance_idx(table),
    );
    let rt = RuntimeState::with_chunk_size(256);

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let shared = Arc::clone(&shared);
            let rt = rt.clone();
            thread::spawn(move || {
                let info = SinkInfo::new(p, Some(key_hasher()));
                for c in 0..CHUNKS {
                    let base = (p * CHUNKS + c) * ROWS;
                    let values: Vec<i32> = (base..base + ROWS).map(|v| v as i32).collect();
                    let mut chunk = int_chunk(&values);
                    let eos = c + 1 == CHUNKS;
                    loop {
                        match shared.sink(&rt, chunk, eos, info).expect("sink") {
                            SinkStatus::Accepted => break,
                            SinkStatus::Blocked { channel, chunk: back } => {
                                wait_ready(&shared.sink_dependency(channel), WAIT);
                                chunk = back;
                            }
                        }
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|channel| {
            let shared = Arc::clone(&shared);
            let rt = rt.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    let (chunk, eos) = shared.get_block(&rt, channel).expect("get block");
                    assert!(chunk.len() < 256 + ROWS);
                    got.extend(int_values(&chunk));
                    if eos {
                        break;
                    }
                    if chunk.is_empty() {
                        wait_ready(&shared.source_dependency(channel), WAIT);
                    }
                }
                shared.close_source(channel);
                got
            })
        })
        .collect();

    for producer in producers {
        producer.join().expect("producer thread");
    }
    let mut all = Vec::new();
    for (channel, consumer) in consumers.into_iter().enumerate() {
        let got = consumer.join().expect("consumer thread");
        for v in &got {
            assert_eq!((*v as usize % PARTITIONS) % CONSUMERS, channel);
        }
        for p in 0..PRODUCERS {
            let lo = (p * CHUNKS * ROWS) as i32;
            let hi = lo + (CHUNKS * ROWS) as i32;
            let from_p: Vec<i32> = got.iter().copied().filter(|v| *v >= lo && *v < hi).collect();
            assert!(
                from_p.windows(2).all(|w| w[0] < w[1]),
                "producer {p} reordered on channel {channel}"
            );
        }
        all.extend(got);
    }
    all.sort_unstable();
    let expected: Vec<i32> = (0..(PRODUCERS * CHUNKS * ROWS) as i32).collect();
    assert_eq!(all, expected);
    assert_eq!(shared.mem_usage(), 0);
    assert_eq!(shared.running_sink_operators(), 0);
    assert_eq!(shared.running_source_operators(), 0);
}

#[test]
fn test_concurrent_unbounded_exchange() {
    run_with_timeout(Duration::from_secs(60), || run_concurrent(0));
}

#[test]
fn test_concurrent_bounded_exchange() {
    run_with_timeout(Duration::from_secs(60), || run_concurrent(2));
}

#[test]
fn test_operators_drive_hash_shuffle() {
    let rt = RuntimeState::with_chunk_size(4096);
    let shared = LocalExchangeSharedState::new(LocalExchangeConfig::hash_shuffle(2, 2, 2, 0));
    let hasher: Arc<dyn PartitionHasher> = Arc::new(Crc32HashPartitioner::new(vec![0]));
    let sink_factory = LocalExchangeSinkFactory::new(5, Arc::clone(&shared), Some(hasher));
    let source_factory = LocalExchangeSourceFactory::new(6, Arc::clone(&shared));
    assert!(sink_factory.is_sink());
    assert!(source_factory.is_source());
    assert_eq!(sink_factory.name(), "LOCAL_EXCHANGE_SINK (id=5)");

    let mut sinks: Vec<_> = (0..2).map(|d| sink_factory.create(2, d)).collect();
    let mut sources: Vec<_> = (0..2).map(|d| source_factory.create(2, d)).collect();

    for (driver, sink) in sinks.iter_mut().enumerate() {
        let op = sink.as_processor_mut().expect("sink op");
        for batch in 0..3 {
            assert!(op.need_input());
            let start = (driver * 30 + batch * 10) as i32;
            let keys: Vec<i32> = (start..start + 10).map(|k| k % 7).collect();
            op.push_chunk(&rt, int_chunk(&keys)).expect("push");
        }
        op.set_finishing(&rt).expect("finish");
        assert!(sink.is_finished());
    }

    let mut per_source: Vec<BTreeSet<i32>> = vec![BTreeSet::new(); 2];
    let mut rows = 0;
    for (driver, source) in sources.iter_mut().enumerate() {
        while !source.is_finished() {
            let op = source.as_processor_mut().expect("source op");
            assert!(op.has_output());
            if let Some(chunk) = op.pull_chunk(&rt).expect("pull") {
                rows += chunk.len();
                per_source[driver].extend(int_values(&chunk));
            }
        }
        source.close().expect("close");
    }
    assert_eq!(rows, 60);
    assert!(per_source[0].is_disjoint(&per_source[1]));
    assert_eq!(per_source[0].len() + per_source[1].len(), 7);
    assert_eq!(shared.running_source_operators(), 0);
    assert_eq!(shared.mem_usage(), 0);
}
