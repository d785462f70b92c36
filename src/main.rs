//! connmux: multi-process TCP connection manager
//!
//! This is the main entry point for both roles: the dispatch process
//! (default) and a worker process spawned with an inherited channel fd.
//!
//! # Usage
//!
//! ```bash
//! # Run the dispatch process with default configuration
//! connmux
//!
//! # Run with custom configuration
//! connmux -c /path/to/config.json
//!
//! # Run with environment overrides
//! CONNMUX_LOG_LEVEL=debug connmux
//! ```

use std::net::TcpListener;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use connmux::admin::{AdminHandler, AdminServer};
use connmux::config::{load_config_with_env, Config, WorkerMode};
use connmux::conn::{ConnState, Registry, ReleaseOutcome};
use connmux::dispatch::Dispatcher;
use connmux::handoff::{Direction, HandoffChannel};
use connmux::mask::IdMasker;
use connmux::proto::{BindingTable, ProtoId, RawBinding};
use connmux::reactor::{self, EventSink, FdKind, Reactor, ReadyEvent, SinkFlow, TickClock};
use connmux::worker::{Worker, WorkerSettings};
use connmux::DispatchError;

/// Fd number the worker channel lands on in a child process
const WORKER_CHANNEL_FD: RawFd = 3;

/// Which role this invocation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Dispatch,
    Worker,
}

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Process role
    role: Role,
    /// Inherited channel fd (worker role)
    channel_fd: RawFd,
    /// Worker index (worker role)
    worker_id: u16,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/connmux/config.json");
        let mut role = Role::Dispatch;
        let mut channel_fd = WORKER_CHANNEL_FD;
        let mut worker_id = 0u16;
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--role" => {
                    role = match args.next().as_deref() {
                        Some("worker") => Role::Worker,
                        Some("dispatch") | None => Role::Dispatch,
                        Some(other) => {
                            eprintln!("Unknown role: {other}");
                            std::process::exit(1);
                        }
                    };
                }
                "--channel-fd" => {
                    if let Some(fd) = args.next().and_then(|v| v.parse().ok()) {
                        channel_fd = fd;
                    }
                }
                "--worker-id" => {
                    if let Some(id) = args.next().and_then(|v| v.parse().ok()) {
                        worker_id = id;
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("connmux v{}", connmux::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            role,
            channel_fd,
            worker_id,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"connmux v{}

Multi-process TCP connection manager with fd handoff.

USAGE:
    connmux [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/connmux/config.json]
    --role <ROLE>           dispatch (default) or worker
    --channel-fd <FD>       Inherited handoff channel fd (worker role)
    --worker-id <N>         Worker index (worker role)
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    CONNMUX_LISTEN_ADDR       Override listen address
    CONNMUX_LOG_LEVEL         Override log level (trace, debug, info, warn, error)
    CONNMUX_MAX_CONNECTIONS   Override maximum connections
    CONNMUX_WORKERS           Override worker count
    CONNMUX_ADMIN_SOCKET      Override admin socket path
"#,
        connmux::VERSION
    );
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        connmux::config::create_default_config(&args.config_path)
            .with_context(|| format!("writing {}", args.config_path.display()))?;
        println!("Wrote default configuration to {}", args.config_path.display());
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).context("loading configuration")?;

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    init_tracing(&config.log.level);

    match args.role {
        Role::Dispatch => run_dispatch(&args, &config),
        Role::Worker => run_worker(&args, &config),
    }
}

/// Worker role: serve the inherited channel until it dies
fn run_worker(args: &Args, config: &Config) -> Result<()> {
    info!(worker = args.worker_id, fd = args.channel_fd, "worker process starting");

    // SAFETY: the dispatch process placed our channel end on this fd and
    // nothing else in this process uses it.
    let channel = unsafe { HandoffChannel::from_raw_fd(args.channel_fd) }
        .context("wrapping inherited channel fd")?;

    let bindings = default_bindings();
    let settings = WorkerSettings::from_config(&config.worker);
    let mut worker = Worker::new(args.worker_id, channel, bindings, settings)
        .context("creating worker")?;

    match worker.run() {
        Ok(()) => {
            info!(worker = args.worker_id, "worker exiting cleanly");
            Ok(())
        }
        Err(e) => {
            // Channel death is the expected end of life; the dispatch
            // process restarts us
            error!(worker = args.worker_id, "worker exiting: {}", e);
            std::process::exit(1);
        }
    }
}

/// Dispatch role: accept, hand off, process returns
fn run_dispatch(args: &Args, config: &Config) -> Result<()> {
    info!("connmux v{} dispatch starting", connmux::VERSION);

    let registry = Arc::new(Registry::new(config.connection.max_connections));
    let mut dispatcher = Dispatcher::new(Arc::clone(&registry));
    let shutdown = Arc::new(AtomicBool::new(false));
    let bindings = default_bindings();

    // Spawn the worker pool
    let mut children = Vec::new();
    let mut threads = Vec::new();
    for worker_id in 0..config.worker.count {
        let worker_id = u16::try_from(worker_id).context("worker count exceeds u16")?;
        let (dispatch_end, worker_end) = HandoffChannel::pair().context("creating channel pair")?;
        match config.worker.mode {
            WorkerMode::Thread => {
                let settings = WorkerSettings::from_config(&config.worker);
                let bindings = Arc::clone(&bindings);
                let handle = std::thread::Builder::new()
                    .name(format!("connmux-worker-{worker_id}"))
                    .spawn(move || {
                        let mut worker =
                            match Worker::new(worker_id, worker_end, bindings, settings) {
                                Ok(worker) => worker,
                                Err(e) => {
                                    error!(worker = worker_id, "worker setup failed: {}", e);
                                    return;
                                }
                            };
                        if let Err(e) = worker.run() {
                            error!(worker = worker_id, "worker exited: {}", e);
                        }
                    })
                    .context("spawning worker thread")?;
                threads.push(handle);
            }
            WorkerMode::Process => {
                let child = spawn_worker_process(&args.config_path, worker_id, worker_end)
                    .context("spawning worker process")?;
                children.push(child);
            }
        }
        dispatcher.add_worker(dispatch_end);
    }
    info!(
        workers = config.worker.count,
        mode = ?config.worker.mode,
        "worker pool ready"
    );

    // Admin socket
    let masker = match &config.admin.mask_seed {
        Some(seed) => Some(
            IdMasker::new(config.admin.mask_prefix.clone(), seed.as_bytes())
                .context("configuring identifier masking")?,
        ),
        None => None,
    };
    let handler = Arc::new(AdminHandler::new(
        Arc::clone(&registry),
        masker,
        Arc::clone(&shutdown),
    ));
    let _admin_thread = AdminServer::new(config.admin.clone(), handler)
        .spawn()
        .context("starting admin server")?;

    // Listener: the thin accept wrapper feeding the registry
    let listener = TcpListener::bind(config.listen.address)
        .with_context(|| format!("binding {}", config.listen.address))?;
    listener.set_nonblocking(true)?;
    info!("listening on {}", config.listen.address);

    // Dispatch reactor: listener plus every worker channel
    let mut reactor = Reactor::new(config.worker.max_fds).context("creating dispatch reactor")?;
    reactor.add_reader(listener.as_raw_fd(), FdKind::Listener)?;
    dispatcher.register_channels(&mut reactor)?;

    let mut clock = TickClock::new(config.worker.tick_interval());
    let mut sink = DispatchLoop {
        dispatcher,
        listener,
        proto: ProtoId(0),
        shutdown,
    };
    reactor::run(&mut reactor, &mut clock, &mut sink).context("dispatch loop failed")?;

    info!("dispatch loop stopped; waiting for workers");
    for handle in threads {
        let _ = handle.join();
    }
    for mut child in children {
        let _ = child.wait();
    }
    info!("connmux stopped");
    Ok(())
}

/// Dispatch-side event sink: accepts feed the registry, channel readiness
/// feeds the dispatcher, ticks flush async writes and poll for shutdown
struct DispatchLoop {
    dispatcher: Dispatcher,
    listener: TcpListener,
    proto: ProtoId,
    shutdown: Arc<AtomicBool>,
}

impl EventSink for DispatchLoop {
    fn on_ready(&mut self, reactor: &mut Reactor, event: ReadyEvent) -> SinkFlow {
        match event.kind {
            FdKind::Listener => {
                self.accept_ready();
                SinkFlow::Continue
            }
            FdKind::Channel(worker) => {
                self.dispatcher.on_channel_ready(reactor, worker);
                SinkFlow::Continue
            }
            FdKind::Conn(_) => SinkFlow::Continue,
        }
    }

    fn on_tick(&mut self, _reactor: &mut Reactor) -> SinkFlow {
        self.dispatcher.on_tick();
        if self.shutdown.load(Ordering::Acquire) {
            info!("shutting down: closing worker channels");
            self.dispatcher.shutdown();
            return SinkFlow::Stop;
        }
        SinkFlow::Continue
    }
}

impl DispatchLoop {
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let local = stream
                        .local_addr()
                        .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("valid literal"));
                    let fd: OwnedFd = stream.into();
                    let conn = match self.dispatcher.registry().create(
                        fd,
                        local,
                        peer,
                        self.proto,
                        ConnState::Established,
                    ) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(%peer, "connection rejected: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.dispatcher.assign(&conn, Direction::READ) {
                        warn!(%peer, "assignment failed: {}", e);
                        // Channel failures already released the connection
                        if !matches!(e, DispatchError::Channel(_)) {
                            self.dispatcher.release(&conn, ReleaseOutcome::Error);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Spawn a worker child with its channel end on a fixed fd
fn spawn_worker_process(
    config_path: &Path,
    worker_id: u16,
    worker_end: HandoffChannel,
) -> Result<Child> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("locating own executable")?;
    let raw = worker_end.raw_fd();

    let mut cmd = Command::new(exe);
    cmd.arg("--role")
        .arg("worker")
        .arg("--channel-fd")
        .arg(WORKER_CHANNEL_FD.to_string())
        .arg("--worker-id")
        .arg(worker_id.to_string())
        .arg("-c")
        .arg(config_path);

    // SAFETY: the hook only calls async-signal-safe dup/dup2
    unsafe {
        cmd.pre_exec(move || {
            // dup2 clears FD_CLOEXEC on the child's copy
            let src = if raw == WORKER_CHANNEL_FD {
                nix::unistd::dup(raw).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?
            } else {
                raw
            };
            nix::unistd::dup2(src, WORKER_CHANNEL_FD)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let child = cmd.spawn().context("exec worker")?;
    // Parent's copy of the worker end closes here
    drop(worker_end);
    Ok(child)
}

fn default_bindings() -> Arc<BindingTable> {
    let bindings = BindingTable::new();
    bindings.register(ProtoId(0), Arc::new(RawBinding::default()));
    Arc::new(bindings)
}
