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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! An incremental HTTP/1.1 response parser.
//!
//! The parser is driven by feeding it whatever bytes the transport handed
//! back from a single read; it never requires a complete message to be
//! buffered up front. Callers implement [`ResponseCallbacks`] to receive
//! status line, header, and body events as they are recognized.

mod response;
mod tokens;
mod version;

pub use response::{ParseError, ParseResult, ResponseCallbacks, ResponseParser};
pub use version::Version;
