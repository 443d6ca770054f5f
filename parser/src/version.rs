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

//! HTTP version as reported on a response's status line.

use std::fmt::Display;

/// HTTP version of a parsed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0 — no keep-alive unless `Connection: keep-alive` is present.
    Http10,
    /// HTTP/1.1 — keep-alive unless `Connection: close` is present.
    Http11,
}

impl Version {
    /// Whether this version keeps the connection open by default, absent an
    /// explicit `Connection` header overriding it.
    #[inline]
    pub fn keeps_alive_by_default(self) -> bool {
        matches!(self, Version::Http11)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        })
    }
}
