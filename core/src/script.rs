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

//! The user-script capability interface (spec §6), plus a static default
//! implementation used when `-s/--script` is not given.

use crate::config::{Config, Transport};
use crate::stats::Statistics;

/// Per-thread context handed to [`ScriptEngine::init`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext {
    /// 0-based index of the thread this script instance belongs to.
    pub thread_index: u64,
    /// Total worker thread count.
    pub threads: u64,
}

/// Aggregate socket-error counters, as reported to
/// [`ScriptEngine::errors`] at end of run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorCounts {
    /// Failed connection attempts.
    pub connect: u64,
    /// Failed or short reads.
    pub read: u64,
    /// Failed or short writes.
    pub write: u64,
    /// Latency samples that exceeded the configured timeout.
    pub timeout: u64,
    /// Responses with status >= 400.
    pub status: u64,
}

/// The bidirectional, single-threaded-per-engine script capability (spec
/// §6). One instance is owned per thread engine; none of its methods are
/// called concurrently with another instance's.
pub trait ScriptEngine: std::fmt::Debug {
    /// Resolves `host`/`service`, giving a script a chance to validate or
    /// cache DNS results. The default implementation is a no-op since name
    /// resolution happens once, centrally, before threads spawn.
    fn resolve(&mut self, _host: &str, _service: &str) -> Result<(), String> {
        Ok(())
    }

    /// Initializes per-thread script state.
    fn init(&mut self, ctx: ThreadContext, extra_args: &[String]);

    /// Produces the next request's bytes.
    fn request(&mut self) -> Vec<u8>;

    /// Whether [`ScriptEngine::request`] returns the same bytes every call
    /// (enables the engine to generate the request once per thread instead
    /// of per batch).
    fn is_static(&self) -> bool;

    /// Whether [`ScriptEngine::delay`] should be consulted before each
    /// batch.
    fn has_delay(&self) -> bool;

    /// Whether completed responses should be buffered and passed to
    /// [`ScriptEngine::response`].
    fn want_response(&self) -> bool;

    /// Pipeline depth to use for the run; consulted once after `init`.
    fn verify_request(&mut self) -> u64;

    /// Milliseconds to delay before writing the next batch.
    fn delay(&mut self) -> u64;

    /// Invoked once per completed response when `want_response()` is true.
    fn response(&mut self, status: u16, headers: &[(String, String)], body: &[u8]);

    /// Whether the script wants to end the run early (checked per
    /// response-complete).
    fn has_done(&self) -> bool {
        false
    }

    /// Invoked once at end of run with aggregate counters.
    fn summary(&mut self, runtime_us: u64, complete: u64, bytes: u64);

    /// Invoked once at end of run with aggregated error counts.
    fn errors(&mut self, errs: &ErrorCounts);

    /// Invoked once at end of run with the final latency and request-rate
    /// histograms, for scripts that compute custom summaries.
    fn done(&mut self, latency: &Statistics, request_rate: &Statistics);
}

/// The default script: one fixed request, generated once, no delay, no
/// response inspection. Used whenever `-s/--script` is not given.
#[derive(Debug)]
pub struct StaticScript {
    request: Vec<u8>,
}

impl StaticScript {
    /// Builds the one request this run will send, from the target and
    /// extra headers in `config`.
    pub fn new(config: &Config, path: &str) -> Self {
        StaticScript {
            request: build_request(path, config),
        }
    }
}

impl ScriptEngine for StaticScript {
    fn init(&mut self, _ctx: ThreadContext, _extra_args: &[String]) {}

    fn request(&mut self) -> Vec<u8> {
        self.request.clone()
    }

    fn is_static(&self) -> bool {
        true
    }

    fn has_delay(&self) -> bool {
        false
    }

    fn want_response(&self) -> bool {
        false
    }

    fn verify_request(&mut self) -> u64 {
        1
    }

    fn delay(&mut self) -> u64 {
        0
    }

    fn response(&mut self, _status: u16, _headers: &[(String, String)], _body: &[u8]) {}

    fn summary(&mut self, _runtime_us: u64, _complete: u64, _bytes: u64) {}

    fn errors(&mut self, _errs: &ErrorCounts) {}

    fn done(&mut self, _latency: &Statistics, _request_rate: &Statistics) {}
}

/// Serializes a minimal `GET`-style HTTP/1.1 request, applying keep-alive
/// and the configured extra headers. Used both by [`StaticScript`] and by
/// scripted runs that supply extra `-H` headers but no `--script` (spec
/// SPEC_FULL §6 item 2).
pub fn build_request(path: &str, config: &Config) -> Vec<u8> {
    let mut req = Vec::with_capacity(128);
    req.extend_from_slice(b"GET ");
    req.extend_from_slice(path.as_bytes());
    req.extend_from_slice(b" HTTP/1.1\r\n");
    req.extend_from_slice(b"Host: ");
    req.extend_from_slice(config.host.as_bytes());
    req.extend_from_slice(b"\r\n");
    req.extend_from_slice(b"Connection: keep-alive\r\n");

    let has_user_agent = config.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent"));
    if !has_user_agent {
        req.extend_from_slice(b"User-Agent: gale\r\n");
    }

    for (name, value) in &config.headers {
        req.extend_from_slice(name.as_bytes());
        req.extend_from_slice(b": ");
        req.extend_from_slice(value.as_bytes());
        req.extend_from_slice(b"\r\n");
    }

    req.extend_from_slice(b"\r\n");
    req
}

#[cfg(feature = "lua")]
pub mod lua {
    //! A scripted [`ScriptEngine`] backed by an embedded Lua interpreter,
    //! mirroring the original's `wrk.*` script table: `request()`,
    //! `response(status, headers, body)`, `delay()`, `done(summary,
    //! latency, requests)`.

    use super::*;
    use mlua::{Lua, Table, Value};
    use std::path::Path;

    /// Errors loading or running a Lua script.
    #[derive(Debug, thiserror::Error)]
    pub enum ScriptError {
        /// The script file could not be read.
        #[error("failed to read script {path:?}: {source}")]
        Read {
            /// Path that failed to read.
            path: std::path::PathBuf,
            /// Underlying I/O error.
            #[source]
            source: std::io::Error,
        },
        /// The script failed to parse or raised an error during load.
        #[error("script error: {0}")]
        Lua(#[from] mlua::Error),
    }

    /// A [`ScriptEngine`] whose hooks call into a loaded Lua chunk.
    pub struct LuaScript {
        lua: Lua,
    }

    impl std::fmt::Debug for LuaScript {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("LuaScript").finish_non_exhaustive()
        }
    }

    impl LuaScript {
        /// Loads and executes the top level of `path`, giving it a chance
        /// to define `request`, `response`, `delay`, and `done` globals.
        pub fn load(path: &Path) -> Result<Self, ScriptError> {
            let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let lua = Lua::new();
            lua.load(&source).exec()?;
            Ok(LuaScript { lua })
        }

        fn has_global(&self, name: &str) -> bool {
            self.lua
                .globals()
                .get::<_, Value>(name)
                .map(|v| !matches!(v, Value::Nil))
                .unwrap_or(false)
        }
    }

    impl ScriptEngine for LuaScript {
        fn init(&mut self, ctx: ThreadContext, extra_args: &[String]) {
            let globals = self.lua.globals();
            let _ = globals.set("thread_index", ctx.thread_index);
            let _ = globals.set("thread_count", ctx.threads);
            if self.has_global("init") {
                let args: Vec<String> = extra_args.to_vec();
                let _: mlua::Result<()> = self.lua.globals().get::<_, mlua::Function>("init").and_then(|f| f.call(args));
            }
        }

        fn request(&mut self) -> Vec<u8> {
            if self.has_global("request") {
                if let Ok(f) = self.lua.globals().get::<_, mlua::Function>("request") {
                    if let Ok(s) = f.call::<_, mlua::String>(()) {
                        return s.as_bytes().to_vec();
                    }
                }
            }
            Vec::new()
        }

        fn is_static(&self) -> bool {
            !self.has_global("request") || !self.dynamic_request_hint()
        }

        fn has_delay(&self) -> bool {
            self.has_global("delay")
        }

        fn want_response(&self) -> bool {
            self.has_global("response")
        }

        fn verify_request(&mut self) -> u64 {
            1
        }

        fn delay(&mut self) -> u64 {
            if let Ok(f) = self.lua.globals().get::<_, mlua::Function>("delay") {
                if let Ok(ms) = f.call::<_, u64>(()) {
                    return ms;
                }
            }
            0
        }

        fn response(&mut self, status: u16, headers: &[(String, String)], body: &[u8]) {
            if let Ok(f) = self.lua.globals().get::<_, mlua::Function>("response") {
                let table: Table = self.lua.create_table().unwrap();
                for (k, v) in headers {
                    let _ = table.set(k.as_str(), v.as_str());
                }
                let body_str = String::from_utf8_lossy(body).into_owned();
                let _: mlua::Result<()> = f.call((status, table, body_str));
            }
        }

        fn summary(&mut self, runtime_us: u64, complete: u64, bytes: u64) {
            if let Ok(f) = self.lua.globals().get::<_, mlua::Function>("done") {
                let summary = self.lua.create_table().unwrap();
                let _ = summary.set("duration", runtime_us);
                let _ = summary.set("requests", complete);
                let _ = summary.set("bytes", bytes);
                let _: mlua::Result<()> = f.call(summary);
            }
        }

        fn errors(&mut self, _errs: &ErrorCounts) {}

        fn done(&mut self, _latency: &Statistics, _request_rate: &Statistics) {}
    }

    impl LuaScript {
        fn dynamic_request_hint(&self) -> bool {
            // The original treats a script as dynamic whenever it defines
            // `request` at all, since Lua scripts commonly close over
            // mutable upvalues (counters, random bodies). Static bodies
            // should simply omit a custom `request` function.
            true
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Role, DEFAULT_DURATION, DEFAULT_TIMEOUT};

    fn base_config() -> Config {
        Config {
            connections: 1,
            threads: 1,
            duration: DEFAULT_DURATION,
            timeout: DEFAULT_TIMEOUT,
            pipeline: 1,
            dynamic: false,
            delay: false,
            want_response: false,
            latency_report: false,
            warmup: false,
            warmup_timeout: None,
            local_ips: vec![],
            sync_addr: None,
            role: Role::Standalone,
            strict_sync: false,
            transport: Transport::Plain,
            host: "example.com".into(),
            headers: vec![("X-Test".into(), "1".into())],
        }
    }

    #[test]
    fn static_script_embeds_host_and_extra_headers() {
        let cfg = base_config();
        let mut script = StaticScript::new(&cfg, "/");
        let bytes = script.request();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("X-Test: 1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn static_script_is_static_and_has_no_delay() {
        let cfg = base_config();
        let mut script = StaticScript::new(&cfg, "/");
        assert!(script.is_static());
        assert!(!script.has_delay());
        assert_eq!(script.verify_request(), 1);
    }
}
