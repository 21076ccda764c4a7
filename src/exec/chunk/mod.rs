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
use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::datatypes::{Schema, SchemaRef};

/// A chunk of data, consisting of multiple rows.
/// Wrapper around Arrow RecordBatch; the payload is immutable once built.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    /// Byte footprint used for exchange memory accounting.
    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }

    /// Builds a sub-chunk holding `indices` in the given order.
    pub fn take_rows(&self, indices: &[u32]) -> Result<Self, String> {
        let indices = UInt32Array::from(indices.to_vec());
        let batch = take_record_batch(&self.batch, &indices)
            .map_err(|e| format!("Arrow take failed: {}", e))?;
        Ok(Self { batch })
    }

    /// Concatenates chunks that share `schema` into one chunk.
    pub fn concat(schema: &SchemaRef, chunks: &[Chunk]) -> Result<Self, String> {
        if chunks.len() == 1 {
            return Ok(chunks[0].clone());
        }
        let batch = concat_batches(schema, chunks.iter().map(|c| &c.batch))
            .map_err(|e| format!("concat_batches: {}", e))?;
        Ok(Self { batch })
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            batch: RecordBatch::new_empty(Arc::new(Schema::empty())),
        }
    }
}

impl From<RecordBatch> for Chunk {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}
