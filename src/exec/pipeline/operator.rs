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
//! Core operator traits and blocking semantics.
//!
//! Responsibilities:
//! - Defines the push/pull contract the exchange adapters expose to a pipeline driver.
//! - Exposes the readiness gates a driver parks on when an operator cannot progress.
//!
//! Key exported interfaces:
//! - Types: `BlockedReason`, `Operator`, `ProcessorOperator`.

use crate::exec::chunk::Chunk;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::runtime::runtime_state::RuntimeState;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Why a driver yielded instead of moving data.
///
/// The execution engine uses cooperative scheduling: when an operator cannot make
/// progress, the driver records a [`BlockedReason`] and parks on the named gate.
pub enum BlockedReason {
    /// Blocked on a dependency object.
    Dependency(DependencyHandle),
}

/// Base operator contract.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn close(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn cancel(&mut self) {}

    fn is_finished(&self) -> bool {
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        None
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        None
    }
}

/// Extended operator contract for stages with push/pull semantics.
pub trait ProcessorOperator: Operator {
    fn need_input(&self) -> bool;

    fn has_output(&self) -> bool;

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<(), String>;

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>, String>;

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<(), String>;

    /// Gate that turns ready when `has_output` may have become true.
    fn source_dependency(&self) -> Option<DependencyHandle> {
        None
    }

    /// Gate that turns ready when `need_input` may have become true.
    fn sink_dependency(&self) -> Option<DependencyHandle> {
        None
    }

    /// Reason a driver should park this operator, if any.
    fn blocked_reason(&self) -> Option<BlockedReason> {
        if let Some(dep) = self.source_dependency().filter(|d| !d.is_ready()) {
            return Some(BlockedReason::Dependency(dep));
        }
        if let Some(dep) = self.sink_dependency().filter(|d| !d.is_ready()) {
            return Some(BlockedReason::Dependency(dep));
        }
        None
    }
}
