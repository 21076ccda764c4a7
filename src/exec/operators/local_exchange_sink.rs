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
//! Sink side of local in-process exchange.
//!
//! Responsibilities:
//! - Pushes chunks into the shared exchange on behalf of one producer task.
//! - Holds chunks handed back by backpressure until the blocking channel drains.
//! - Retires the producer exactly once on finish, cancel, or close.
//!
//! Key exported interfaces:
//! - Types: `LocalExchangeSinkFactory`.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::exec::chunk::Chunk;
use crate::exec::operators::local_exchange_partitioner::PartitionHasher;
use crate::exec::operators::local_exchange_shared_state::LocalExchangeSharedState;
use crate::exec::operators::local_exchanger::{SinkInfo, SinkStatus};
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::novarocks_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

/// Factory for local-exchange sink operators that partition and enqueue chunks locally.
pub struct LocalExchangeSinkFactory {
    name: String,
    owner_node_id: i32,
    shared: Arc<LocalExchangeSharedState>,
    hasher: Option<Arc<dyn PartitionHasher>>,
}

impl LocalExchangeSinkFactory {
    pub fn new(
        owner_node_id: i32,
        shared: Arc<LocalExchangeSharedState>,
        hasher: Option<Arc<dyn PartitionHasher>>,
    ) -> Self {
        let name = if owner_node_id >= 0 {
            format!("LOCAL_EXCHANGE_SINK (id={owner_node_id})")
        } else {
            "LOCAL_EXCHANGE_SINK".to_string()
        };
        debug!(
            "LocalExchangeSinkFactory created: exchange_id={} owner_node_id={} type={}",
            shared.exchange_id(),
            owner_node_id,
            shared.exchanger().exchange_type()
        );
        Self {
            name,
            owner_node_id,
            shared,
            hasher,
        }
    }
}

impl OperatorFactory for LocalExchangeSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, driver_id: i32) -> Box<dyn Operator> {
        let sink_channel = (driver_id.max(0) as usize) % self.shared.num_sink_tasks().max(1);
        Box::new(LocalExchangeSinkOperator {
            name: self.name.clone(),
            owner_node_id: self.owner_node_id,
            driver_id,
            sink_channel,
            shared: Arc::clone(&self.shared),
            hasher: self.hasher.clone(),
            pending: VecDeque::new(),
            blocked_channel: None,
            finishing: false,
            finished: false,
            logged_first_input: false,
        })
    }

    fn is_sink(&self) -> bool {
        true
    }
}

struct LocalExchangeSinkOperator {
    name: String,
    owner_node_id: i32,
    driver_id: i32,
    sink_channel: usize,
    shared: Arc<LocalExchangeSharedState>,
    hasher: Option<Arc<dyn PartitionHasher>>,
    // Chunks handed back by backpressure, oldest first.
    pending: VecDeque<Chunk>,
    blocked_channel: Option<usize>,
    finishing: bool,
    finished: bool,
    logged_first_input: bool,
}

impl LocalExchangeSinkOperator {
    /// Returns true once nothing is pending.
    fn flush(&mut self, state: &RuntimeState) -> Result<bool, String> {
        let info = SinkInfo::new(self.sink_channel, self.hasher.as_deref());
        while let Some(chunk) = self.pending.pop_front() {
            let status = match self.shared.sink(state, chunk, false, info) {
                Ok(status) => status,
                Err(err) => {
                    state.set_error(err.clone());
                    return Err(err);
                }
            };
            if let SinkStatus::Blocked { channel, chunk } = status {
                self.pending.push_front(chunk);
                if self.blocked_channel != Some(channel) {
                    debug!(
                        "LocalExchangeSink blocked: exchange_id={} owner_node_id={} driver_id={} channel={} pending_chunks={}",
                        self.shared.exchange_id(),
                        self.owner_node_id,
                        self.driver_id,
                        channel,
                        self.pending.len()
                    );
                }
                self.blocked_channel = Some(channel);
                return Ok(false);
            }
        }
        self.blocked_channel = None;
        Ok(true)
    }

    fn retire(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.pending.clear();
        self.blocked_channel = None;
        let finished_all = self.shared.finish_sink(self.sink_channel);
        debug!(
            "LocalExchangeSink producer finished: exchange_id={} owner_node_id={} driver_id={} remaining_producers={} finished_all={}",
            self.shared.exchange_id(),
            self.owner_node_id,
            self.driver_id,
            self.shared.running_sink_operators(),
            finished_all
        );
    }
}

impl Operator for LocalExchangeSinkOperator {
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

impl ProcessorOperator for LocalExchangeSinkOperator {
    fn need_input(&self) -> bool {
        if self.finished || self.finishing {
            return false;
        }
        match self.blocked_channel {
            Some(channel) => self.shared.sink_dependency(channel).is_ready(),
            None => true,
        }
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<(), String> {
        if self.finished || chunk.is_empty() {
            return Ok(());
        }
        if state.is_cancelled() {
            self.retire();
            return Ok(());
        }
        if !self.logged_first_input {
            self.logged_first_input = true;
            debug!(
                "LocalExchangeSink first chunk: exchange_id={} owner_node_id={} driver_id={} rows={}",
                self.shared.exchange_id(),
                self.owner_node_id,
                self.driver_id,
                chunk.len()
            );
        }
        self.pending.push_back(chunk);
        self.flush(state)?;
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>, String> {
        Ok(None)
    }

    /// May be called again after the sink dependency turns ready; the producer
    /// retires once every pending chunk is accepted.
    fn set_finishing(&mut self, state: &RuntimeState) -> Result<(), String> {
        if self.finished {
            return Ok(());
        }
        self.finishing = true;
        if state.is_cancelled() || self.flush(state)? {
            self.retire();
        }
        Ok(())
    }

    fn sink_dependency(&self) -> Option<DependencyHandle> {
        if self.finished {
            return None;
        }
        self.blocked_channel
            .map(|channel| self.shared.sink_dependency(channel))
    }
}
