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
//! Execution operator module exports.
//!
//! Responsibilities:
//! - Hosts the local exchange: row partitioner, exchanger, shared state, and sink/source operators.
//! - Provides a stable import surface for exchange construction.

pub(crate) mod local_exchange_partitioner;
mod local_exchange_shared_state;
mod local_exchange_sink;
mod local_exchange_source;
pub(crate) mod local_exchanger;

pub use local_exchange_partitioner::{ChannelMap, Crc32HashPartitioner, PartitionHasher};
pub use local_exchange_shared_state::LocalExchangeSharedState;
pub use local_exchange_sink::LocalExchangeSinkFactory;
pub use local_exchange_source::LocalExchangeSourceFactory;
pub use local_exchanger::{
    LocalExchangeChannelStats, LocalExchangeConfig, LocalExchangeStats, LocalExchangeType,
    LocalExchanger, SinkInfo, SinkStatus,
};
