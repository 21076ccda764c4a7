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
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::config;

/// Query options forwarded from the plan that the exchange cares about.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub batch_size: Option<i32>,
}

/// RuntimeState is a per-fragment-instance execution context.
///
/// It carries query options (chunk size), the first error reported by any
/// operator of the fragment, and the cancellation flag observed by adapters.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    query_options: Option<QueryOptions>,
    error_state: Arc<RuntimeErrorState>,
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: std::sync::Mutex<Option<String>>,
    cancelled: AtomicBool,
}

impl RuntimeErrorState {
    /// Keeps the first error; later ones are dropped.
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RuntimeState {
    pub fn new(query_options: Option<QueryOptions>) -> Self {
        Self {
            query_options,
            error_state: Arc::new(RuntimeErrorState::default()),
        }
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self::new(Some(QueryOptions {
            batch_size: Some(i32::try_from(chunk_size).unwrap_or(i32::MAX)),
        }))
    }

    pub fn error_state(&self) -> Arc<RuntimeErrorState> {
        Arc::clone(&self.error_state)
    }

    pub fn error(&self) -> Option<String> {
        self.error_state.error()
    }

    pub fn set_error(&self, err: String) {
        self.error_state.set_error(err);
    }

    pub fn cancel(&self) {
        self.error_state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_state.is_cancelled()
    }

    /// Return the maximum row count per in-memory chunk/RecordBatch.
    ///
    /// Falls back to `runtime.chunk_size` from the app config when the query does
    /// not carry a positive `batch_size`.
    pub fn chunk_size(&self) -> usize {
        self.query_options
            .as_ref()
            .and_then(|opts| opts.batch_size)
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or_else(config::chunk_size)
            .max(1)
    }
}
