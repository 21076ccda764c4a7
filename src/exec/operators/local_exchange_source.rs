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
//! Source side of local in-process exchange.
//!
//! Responsibilities:
//! - Pulls buffered chunks from one local exchange channel for downstream operators.
//! - Distinguishes an empty open channel from end-of-stream.
//! - Closes its channel exactly once on end-of-stream, cancel, or close.
//!
//! Key exported interfaces:
//! - Types: `LocalExchangeSourceFactory`.

use std::sync::Arc;

use crate::exec::chunk::Chunk;
use crate::exec::operators::local_exchange_shared_state::LocalExchangeSharedState;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::novarocks_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

/// Factory for local-exchange source operators; driver `i` reads channel `i`.
pub struct LocalExchangeSourceFactory {
    name: String,
    owner_node_id: i32,
    shared: Arc<LocalExchangeSharedState>,
}

impl LocalExchangeSourceFactory {
    pub fn new(owner_node_id: i32, shared: Arc<LocalExchangeSharedState>) -> Self {
        let name = if owner_node_id >= 0 {
            format!("LOCAL_EXCHANGE_SOURCE (id={owner_node_id})")
        } else {
            "LOCAL_EXCHANGE_SOURCE".to_string()
        };
        debug!(
            "LocalExchangeSourceFactory created: exchange_id={} owner_node_id={} channels={}",
            shared.exchange_id(),
            owner_node_id,
            shared.num_source_tasks()
        );
        Self {
            name,
            owner_node_id,
            shared,
        }
    }
}

impl OperatorFactory for LocalExchangeSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, driver_id: i32) -> Box<dyn Operator> {
        let channel = (driver_id.max(0) as usize) % self.shared.num_source_tasks();
        Box::new(LocalExchangeSourceOperator {
            name: self.name.clone(),
            owner_node_id: self.owner_node_id,
            driver_id,
            channel,
            shared: Arc::clone(&self.shared),
            finished: false,
            blocked_empty: false,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct LocalExchangeSourceOperator {
    name: String,
    owner_node_id: i32,
    driver_id: i32,
    channel: usize,
    shared: Arc<LocalExchangeSharedState>,
    finished: bool,
    blocked_empty: bool,
}

impl LocalExchangeSourceOperator {
    fn retire(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shared.close_source(self.channel);
    }
}

impl Operator for LocalExchangeSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<(), String> {
        self.retire();
        Ok(())
    }

    fn cancel(&mut self) {
        self.retire();
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for LocalExchangeSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.finished && self.shared.source_dependency(self.channel).is_ready()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<(), String> {
        Err("local exchange source operator does not accept input".to_string())
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>, String> {
        if self.finished {
            return Ok(None);
        }
        if state.is_cancelled() {
            debug!(
                "LocalExchangeSource cancelled: exchange_id={} owner_node_id={} driver_id={} channel={}",
                self.shared.exchange_id(),
                self.owner_node_id,
                self.driver_id,
                self.channel
            );
            self.retire();
            return Ok(None);
        }
        let (chunk, eos) = self.shared.get_block(state, self.channel).inspect_err(|err| {
            state.set_error(err.clone());
        })?;
        if eos {
            self.retire();
            let stats = self.shared.stats_snapshot();
            if let Some(channel) = stats.channels.get(self.channel) {
                debug!(
                    "LocalExchangeSource finished: exchange_id={} owner_node_id={} driver_id={} channel={} pushed_rows={} popped_rows={} dropped_rows={} remaining_consumers={}",
                    stats.exchange_id,
                    self.owner_node_id,
                    self.driver_id,
                    channel.channel,
                    channel.pushed_rows,
                    channel.popped_rows,
                    channel.dropped_rows,
                    self.shared.running_source_operators()
                );
            }
        }
        if chunk.is_empty() {
            if !eos && !self.blocked_empty {
                debug!(
                    "LocalExchangeSource blocked (empty): exchange_id={} owner_node_id={} driver_id={} channel={} remaining_producers={}",
                    self.shared.exchange_id(),
                    self.owner_node_id,
                    self.driver_id,
                    self.channel,
                    self.shared.running_sink_operators()
                );
                self.blocked_empty = true;
            }
            return Ok(None);
        }
        self.blocked_empty = false;
        Ok(Some(chunk))
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<(), String> {
        Ok(())
    }

    fn source_dependency(&self) -> Option<DependencyHandle> {
        if self.finished {
            return None;
        }
        Some(self.shared.source_dependency(self.channel))
    }
}
