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

//! Process entry point: argument parsing, target resolution, inter-process
//! rendezvous setup, thread spawning, and final report rendering (spec §6,
//! §7).

mod args;
mod units;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;

use gale_core::{
    client_tls_config, Config, ConfigError, InterProcessSync, Report, Role, ScriptEngine, SpawnError,
    StaticScript, SyncError, ThreadContext, Transport,
};

use args::Args;

/// Errors surfaced to `main`, each carrying the exit code spec §7 assigns
/// its class.
#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Usage(#[from] ConfigError),
    #[error("could not resolve {host}:{port}: {source}")]
    Dns {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("startup connectivity check against {addr} failed: {source}")]
    StartupConnect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("worker thread panicked")]
    ThreadPanic,
}

impl AppError {
    fn exit_code(&self) -> u8 {
        match self {
            AppError::Usage(_) | AppError::Dns { .. } | AppError::StartupConnect { .. } | AppError::ThreadPanic => 1,
            AppError::Spawn(_) => 2,
            AppError::Sync(_) => 3,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.version {
        print_version();
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    gale_core::runtime::ignore_sigpipe();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn print_version() {
    println!(
        "gale {} [mio (epoll/kqueue/IOCP, platform-selected)]",
        env!("CARGO_PKG_VERSION")
    );
}

/// Parses the target URL into `(transport, host, port, path)`.
fn parse_target(raw: &str) -> Result<(Transport, String, u16, String), AppError> {
    let url = url::Url::parse(raw).map_err(|e| AppError::Usage(ConfigError::InvalidUrl(e.to_string())))?;

    let transport = match url.scheme() {
        "http" => Transport::Plain,
        "https" => Transport::Tls,
        other => return Err(AppError::Usage(ConfigError::InvalidUrl(format!("unsupported scheme {other:?}")))),
    };

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Usage(ConfigError::InvalidUrl(raw.to_string())))?
        .to_string();

    let port = url.port().unwrap_or(match transport {
        Transport::Plain => 80,
        Transport::Tls => 443,
    });

    let path = {
        let mut p = url.path().to_string();
        if let Some(query) = url.query() {
            p.push('?');
            p.push_str(query);
        }
        if p.is_empty() {
            p.push('/');
        }
        p
    };

    Ok((transport, host, port, path))
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, AppError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| AppError::Dns { host: host.to_string(), port, source })?
        .next()
        .ok_or_else(|| AppError::Dns {
            host: host.to_string(),
            port,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        })
}

/// Builds the single, un-threaded script instance used for deriving pipeline
/// depth/dynamic/delay/want_response up front, and for the end-of-run
/// `summary`/`errors`/`done` hooks.
fn build_one_script(script_path: &Option<PathBuf>, config: &Config, request_path: &str) -> anyhow::Result<Box<dyn ScriptEngine>> {
    match script_path {
        None => Ok(Box::new(StaticScript::new(config, request_path))),
        Some(path) => load_lua_script(path),
    }
}

/// Builds the per-thread factory closure: every worker thread constructs
/// its own script instance, since e.g. an embedded Lua interpreter is not
/// `Send`.
fn build_script_factory(
    script_path: Option<PathBuf>,
    config: Arc<Config>,
    request_path: String,
) -> anyhow::Result<Arc<dyn Fn() -> Box<dyn ScriptEngine> + Send + Sync>> {
    match script_path {
        None => Ok(Arc::new(move || Box::new(StaticScript::new(&config, &request_path)) as Box<dyn ScriptEngine>)),
        Some(path) => {
            #[cfg(feature = "lua")]
            {
                Ok(Arc::new(move || {
                    Box::new(
                        gale_core::script::lua::LuaScript::load(&path)
                            .unwrap_or_else(|e| panic!("failed to load script {path:?}: {e}")),
                    ) as Box<dyn ScriptEngine>
                }))
            }
            #[cfg(not(feature = "lua"))]
            {
                let _ = path;
                anyhow::bail!("this build was not compiled with scripting support (rebuild with --features lua)")
            }
        }
    }
}

#[cfg(feature = "lua")]
fn load_lua_script(path: &PathBuf) -> anyhow::Result<Box<dyn ScriptEngine>> {
    Ok(Box::new(gale_core::script::lua::LuaScript::load(path)?))
}

#[cfg(not(feature = "lua"))]
fn load_lua_script(_path: &PathBuf) -> anyhow::Result<Box<dyn ScriptEngine>> {
    anyhow::bail!("this build was not compiled with scripting support (rebuild with --features lua)")
}

fn run(args: Args) -> anyhow::Result<()> {
    let (transport, host, port, path) = parse_target(&args.url)?;
    let headers = args.parsed_headers().map_err(AppError::Usage)?;
    let local_ips = args.local_ips();

    let role = match (args.primary, &args.sync) {
        (Some(secondaries), Some(_)) => Role::Primary { secondaries },
        (Some(_), None) => return Err(AppError::Usage(ConfigError::InvalidSyncAddress("--primary requires --sync".to_string())).into()),
        (None, Some(_)) => Role::Secondary,
        (None, None) => Role::Standalone,
    };

    let sync_addr = args
        .sync
        .as_ref()
        .map(|raw| raw.parse::<SocketAddr>().map_err(|_| AppError::Usage(ConfigError::InvalidSyncAddress(raw.clone()))))
        .transpose()?;

    let mut config = Config {
        connections: args.connections,
        threads: args.threads,
        duration: args.duration,
        timeout: args.timeout,
        pipeline: 1,
        dynamic: false,
        delay: false,
        want_response: false,
        latency_report: args.latency,
        warmup: args.warmup,
        warmup_timeout: args.warmup_timeout,
        local_ips,
        sync_addr,
        role: role.clone(),
        strict_sync: args.strict_sync,
        transport,
        host: host.clone(),
        headers,
    };
    config.validate().map_err(AppError::Usage)?;

    let mut main_script = build_one_script(&args.script, &config, &path)?;
    main_script.init(ThreadContext { thread_index: 0, threads: config.threads }, &[]);
    let _ = main_script.resolve(&host, &port.to_string());

    config.pipeline = main_script.verify_request().max(1);
    config.dynamic = !main_script.is_static();
    config.delay = main_script.has_delay();
    config.want_response = main_script.want_response();

    let remote_addr = resolve(&host, port)?;
    let startup_timeout = Duration::from_secs(5);
    gale_core::runtime::startup_connect_check(remote_addr, startup_timeout)
        .map_err(|source| AppError::StartupConnect { addr: remote_addr, source })?;

    let tls_config = matches!(config.transport, Transport::Tls).then(client_tls_config);

    let secondaries = match role {
        Role::Primary { secondaries } => secondaries,
        _ => 0,
    };
    let sync = InterProcessSync::setup(config.sync_addr, secondaries).map_err(AppError::Sync)?;
    let sync = Arc::new(Mutex::new(sync));

    let config = Arc::new(config);
    let runtime = Arc::new(gale_core::Runtime::new());
    let script_factory = build_script_factory(args.script.clone(), config.clone(), path.clone())?;

    {
        let runtime = runtime.clone();
        ctrlc::set_handler(move || runtime.request_stop())
            .expect("failed to install SIGINT handler");
    }

    let mut handles = Vec::with_capacity(config.threads as usize);
    for thread_index in 0..config.threads {
        let handle = gale_core::thread_engine::spawn(
            thread_index,
            config.clone(),
            runtime.clone(),
            remote_addr,
            tls_config.clone(),
            sync.clone(),
            script_factory.clone(),
        )
        .map_err(SpawnError::Os)
        .map_err(AppError::Spawn)?;
        handles.push(handle);
    }

    // Polls `stop` in small increments rather than one blind sleep so a
    // SIGINT-triggered stop (same path as duration expiry, spec §5/§7) is
    // observed promptly instead of only after the full duration elapses.
    let deadline = std::time::Instant::now() + config.duration;
    while std::time::Instant::now() < deadline && !runtime.should_stop() {
        std::thread::sleep(Duration::from_millis(100));
    }
    runtime.request_stop();

    let mut thread_reports = Vec::with_capacity(handles.len());
    for handle in handles {
        let report = handle.join().map_err(|_| AppError::ThreadPanic)?.map_err(AppError::Spawn)?;
        thread_reports.push(report);
    }

    let report = Report::join(thread_reports, config.connections, config.timeout.as_millis() as u64);

    let runtime_us = report.runtime.as_micros() as u64;
    main_script.summary(runtime_us, report.complete, report.bytes);
    main_script.errors(&report.errors);
    main_script.done(&report.latency, &report.request_rate);

    print!("{}", report.render(config.latency_report));

    Ok(())
}
