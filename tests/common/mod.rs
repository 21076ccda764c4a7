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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tempfile::TempDir;

use arrow::array::{ArrayRef, Int32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};

use novarocks_exchange::exec::pipeline::dependency::DependencyHandle;
use novarocks_exchange::novarocks_config;
use novarocks_exchange::novarocks_logging;
use novarocks_exchange::{Chunk, PartitionHasher};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with the given runtime section.
    pub fn with_runtime(chunk_size: usize, free_block_limit: usize) -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novarocks.toml");

        let config_content = format!(
            r#"
log_level = "info"
log_filter = "novarocks_exchange=debug"

[runtime]
chunk_size = {chunk_size}
local_exchange_free_block_limit = {free_block_limit}
"#
        );

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    pub fn new() -> anyhow::Result<Self> {
        Self::with_runtime(4096, 0)
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novarocks_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static novarocks_config::NovaRocksConfig> {
        novarocks_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Single non-null Int32 column named `k`.
pub fn int_chunk(values: &[i32]) -> Chunk {
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, false)]));
    let array = Arc::new(Int32Array::from(values.to_vec())) as ArrayRef;
    Chunk::new(RecordBatch::try_new(schema, vec![array]).expect("record batch"))
}

/// Int32 key column plus a Utf8 payload column.
pub fn keyed_chunk(keys: &[i32], names: &[&str]) -> Chunk {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int32, false),
        Field::new("name", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(keys.to_vec())) as ArrayRef,
            Arc::new(StringArray::from(names.to_vec())) as ArrayRef,
        ],
    )
    .expect("record batch");
    Chunk::new(batch)
}

pub fn int_values(chunk: &Chunk) -> Vec<i32> {
    if chunk.is_empty() {
        return Vec::new();
    }
    chunk.columns()[0]
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 key column")
        .values()
        .to_vec()
}

pub fn string_values(chunk: &Chunk, column: usize) -> Vec<String> {
    chunk.columns()[column]
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("utf8 column")
        .iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect()
}

/// Uses the first column's value as the row hash, so `k % num_partitions` picks the partition.
pub struct KeyAsHash;

impl PartitionHasher for KeyAsHash {
    fn hash_rows(&self, chunk: &Chunk) -> Result<Vec<u32>, String> {
        Ok(int_values(chunk).into_iter().map(|v| v as u32).collect())
    }
}

/// Parks the calling thread until `dep` turns ready, failing the test after `timeout`.
pub fn wait_ready(dep: &DependencyHandle, timeout: Duration) {
    let (tx, rx) = mpsc::channel::<()>();
    dep.add_waiter(Arc::new(move || {
        let _ = tx.send(());
    }));
    if rx.recv_timeout(timeout).is_err() {
        panic!("dependency {} not ready after {:?}", dep.name(), timeout);
    }
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}
