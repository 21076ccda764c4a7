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
//! Row routing for local shuffle.
//!
//! Responsibilities:
//! - Defines the per-row hashing capability consumed by hash shuffle.
//! - Maps row hashes to partitions and partitions to physical channels.
//!
//! Key exported interfaces:
//! - Types: `PartitionHasher`, `Crc32HashPartitioner`, `ChannelMap`.

use std::collections::HashMap;

use arrow::array::ArrayRef;
use arrow::row::{RowConverter, SortField};

use crate::exec::chunk::Chunk;

/// Computes one 32-bit hash per row of a chunk.
pub trait PartitionHasher: Send + Sync {
    fn hash_rows(&self, chunk: &Chunk) -> Result<Vec<u32>, String>;
}

impl<F> PartitionHasher for F
where
    F: Fn(&Chunk) -> Result<Vec<u32>, String> + Send + Sync,
{
    fn hash_rows(&self, chunk: &Chunk) -> Result<Vec<u32>, String> {
        self(chunk)
    }
}

/// CRC32C over the row-encoded key columns.
#[derive(Clone, Debug)]
pub struct Crc32HashPartitioner {
    key_columns: Vec<usize>,
}

impl Crc32HashPartitioner {
    pub fn new(key_columns: Vec<usize>) -> Self {
        Self { key_columns }
    }

    pub fn key_columns(&self) -> &[usize] {
        &self.key_columns
    }
}

impl PartitionHasher for Crc32HashPartitioner {
    fn hash_rows(&self, chunk: &Chunk) -> Result<Vec<u32>, String> {
        if self.key_columns.is_empty() {
            return Err("hash partitioner has no key columns".to_string());
        }
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.key_columns.len());
        for &idx in &self.key_columns {
            let column = chunk.columns().get(idx).ok_or_else(|| {
                format!(
                    "partition key column {} out of range (num_columns={})",
                    idx,
                    chunk.columns().len()
                )
            })?;
            arrays.push(column.clone());
        }
        let fields = arrays
            .iter()
            .map(|a| SortField::new(a.data_type().clone()))
            .collect::<Vec<_>>();
        let converter = RowConverter::new(fields).map_err(|e| e.to_string())?;
        let rows = converter
            .convert_columns(&arrays)
            .map_err(|e| format!("encode partition keys: {}", e))?;
        Ok(rows
            .iter()
            .map(|row| crc32c::crc32c(row.as_ref()))
            .collect())
    }
}

/// Shuffle-index to instance-index table, built once per exchange.
#[derive(Clone, Debug)]
pub struct ChannelMap {
    partition_to_channel: Vec<usize>,
    num_channels: usize,
}

impl ChannelMap {
    /// Partitions missing from `shuffle_idx_to_instance_idx` map to themselves.
    ///
    /// Panics on zero partitions or when any partition resolves to a channel
    /// outside `[0, num_channels)`.
    pub fn new(
        num_partitions: usize,
        num_channels: usize,
        shuffle_idx_to_instance_idx: &HashMap<usize, usize>,
    ) -> Self {
        assert!(num_partitions > 0, "local exchange requires at least one partition");
        let partition_to_channel = (0..num_partitions)
            .map(|partition| {
                let channel = shuffle_idx_to_instance_idx
                    .get(&partition)
                    .copied()
                    .unwrap_or(partition);
                assert!(
                    channel < num_channels,
                    "partition {partition} maps to channel {channel} but only {num_channels} channels exist"
                );
                channel
            })
            .collect();
        Self {
            partition_to_channel,
            num_channels,
        }
    }

    pub fn identity(num_partitions: usize) -> Self {
        Self::new(num_partitions, num_partitions, &HashMap::new())
    }

    pub fn num_partitions(&self) -> usize {
        self.partition_to_channel.len()
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn partition_of(&self, hash: u32) -> usize {
        (hash as usize) % self.partition_to_channel.len()
    }

    pub fn channel_of(&self, partition: usize) -> usize {
        self.partition_to_channel[partition]
    }

    /// Groups row indices by destination channel, keeping row order inside each group.
    ///
    /// Returns `(channel, rows)` pairs in ascending channel order, skipping empty groups.
    pub fn group_rows(&self, hashes: &[u32]) -> Vec<(usize, Vec<u32>)> {
        let mut channel_rows: Vec<Vec<u32>> = vec![Vec::new(); self.num_channels];
        for (row, &hash) in hashes.iter().enumerate() {
            let channel = self.channel_of(self.partition_of(hash));
            channel_rows[channel].push(row as u32);
        }
        channel_rows
            .into_iter()
            .enumerate()
            .filter(|(_, rows)| !rows.is_empty())
            .collect()
    }
}
