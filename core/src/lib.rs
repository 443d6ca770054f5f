// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event-driven HTTP/1.1 load generation engine: one reactor per worker
//! thread, each driving a pool of pipelined, keep-alive connections against
//! a single target, with coordinated-omission-corrected latency reporting
//! and optional multi-process synchronization.

pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod reactor;
pub mod runtime;
pub mod script;
pub mod socket;
pub mod stats;
pub mod sync;
pub mod thread_engine;

pub use aggregator::{FairnessBucket, Report, ThreadReport};
pub use config::{Config, Header, Role, Transport};
pub use connection::{CompletedResponse, ConnState, Connection};
pub use error::{ConfigError, SpawnError, SyncError, TlsError};
pub use runtime::Runtime;
pub use script::{build_request, ErrorCounts, ScriptEngine, StaticScript, ThreadContext};
pub use socket::{client_tls_config, Socket};
pub use stats::Statistics;
pub use sync::InterProcessSync;
