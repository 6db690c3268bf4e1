use chrono::Utc;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    error::Error,
    fs::{self, OpenOptions},
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    process::{self, ExitCode},
    thread,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use respawn::{
    Daemon, DaemonConfig, RestartPolicy, Sink,
    cli::{Cli, Commands, parse_args},
    config::load_config,
    logs::show_logs,
    pidfile::{PidFile, read_pid, read_worker_pid},
};

/// Options of `respawn start` that shape the daemon rather than the payload.
struct StartOptions {
    config: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    max_restart: Option<u32>,
    restart_policy: Option<RestartPolicy>,
    restart_delay: Option<Duration>,
    title: Option<String>,
    record_worker_pid: bool,
}

/// What the worker does once it is running.
struct Payload {
    tick: Duration,
    crash_after: Option<Duration>,
    exit_code: u8,
}

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<ExitCode, Box<dyn Error>> {
    match args.command {
        Commands::Start {
            config,
            pid_file,
            log_file,
            max_restart,
            restart_policy,
            restart_delay,
            title,
            record_worker_pid,
            tick,
            crash_after,
            exit_code,
        } => {
            let options = StartOptions {
                config,
                pid_file,
                log_file,
                max_restart,
                restart_policy,
                restart_delay,
                title,
                record_worker_pid,
            };
            let payload = Payload {
                tick,
                crash_after,
                exit_code,
            };
            start(options, payload)
        }
        Commands::Stop { pid_file, timeout } => stop(&pid_file, timeout),
        Commands::Status { pid_file } => status(&pid_file),
        Commands::Logs { log_file, lines } => {
            show_logs(&log_file, lines, &mut io::stdout().lock())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.filter().to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .try_init();
}

fn start(options: StartOptions, payload: Payload) -> Result<ExitCode, Box<dyn Error>> {
    let daemon = build_daemon(&options)?;
    let launch = daemon.start()?;

    if !launch.should_continue() {
        return Ok(launch.exit_code());
    }

    Ok(run_worker(&payload))
}

fn build_daemon(options: &StartOptions) -> Result<Daemon, Box<dyn Error>> {
    let mut config = match &options.config {
        Some(path) => load_config(path)?,
        None => DaemonConfig::default(),
    };

    if let Some(pid_file) = &options.pid_file {
        config.pid_file = Some(pid_file.clone());
    }
    if let Some(max_restart) = options.max_restart {
        config.max_restart = max_restart;
    }
    if let Some(policy) = options.restart_policy {
        config.restart_policy = policy;
    }
    if let Some(title) = &options.title {
        config.process_title = Some(title.clone());
    }
    config.record_worker_pid |= options.record_worker_pid;

    let mut daemon = Daemon::from_config(&config)?;
    if let Some(delay) = options.restart_delay {
        daemon = daemon.restart_delay(delay);
    }

    let (stdout, stderr) = match &options.log_file {
        Some(path) => open_log_sinks(path)?,
        None => (Sink::stdout(), Sink::stderr()),
    };

    Ok(daemon.stdout(stdout).stderr(stderr))
}

fn open_log_sinks(path: &Path) -> io::Result<(Sink, Sink)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let err_file = file.try_clone()?;
    Ok((Sink::file(file), Sink::file(err_file)))
}

/// Heartbeat payload: prints a Unix timestamp every tick, optionally crashing.
fn run_worker(payload: &Payload) -> ExitCode {
    let pid = process::id();
    let started = Instant::now();
    info!("Worker {pid} running");

    loop {
        if writeln!(io::stdout(), "{} worker({pid}) tick", Utc::now().timestamp()).is_err() {
            warn!("Worker {pid} lost its output; exiting");
            return ExitCode::FAILURE;
        }

        let mut pause = payload.tick;
        if let Some(limit) = payload.crash_after {
            let elapsed = started.elapsed();
            if elapsed >= limit {
                warn!("Worker {pid} exiting with code {}", payload.exit_code);
                return ExitCode::from(payload.exit_code);
            }
            pause = pause.min(limit - elapsed);
        }
        thread::sleep(pause);
    }
}

fn stop(pid_file: &Path, timeout: Duration) -> Result<ExitCode, Box<dyn Error>> {
    match PidFile::probe(pid_file) {
        Ok(()) => {
            println!("respawn is not running");
            return Ok(ExitCode::SUCCESS);
        }
        Err(err) if err.is_already_running() => {}
        Err(err) => return Err(err.into()),
    }

    let pid = read_pid(pid_file)
        .ok_or_else(|| format!("pid file {} holds no pid", pid_file.display()))?;
    info!("Sending SIGTERM to daemon {pid}");
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            println!("respawn is not running");
            return Ok(ExitCode::SUCCESS);
        }
        Err(err) => return Err(format!("failed to signal daemon {pid}: {err}").into()),
    }

    let deadline = Instant::now() + timeout;
    while pid_file.exists() {
        if Instant::now() >= deadline {
            return Err(format!(
                "daemon {pid} did not exit within {}ms",
                timeout.as_millis()
            )
            .into());
        }
        thread::sleep(Duration::from_millis(50));
    }

    println!("Stopped respawn daemon (pid {pid})");
    Ok(ExitCode::SUCCESS)
}

fn status(pid_file: &Path) -> Result<ExitCode, Box<dyn Error>> {
    match PidFile::probe(pid_file) {
        Ok(()) => {
            println!("respawn is not running");
            return Ok(ExitCode::FAILURE);
        }
        Err(err) if err.is_already_running() => {}
        Err(err) => return Err(err.into()),
    }

    let Some(pid) = read_pid(pid_file) else {
        println!("respawn is running (pid not yet recorded)");
        return Ok(ExitCode::SUCCESS);
    };

    if signal::kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH) {
        println!("respawn is not running (stale pid {pid})");
        return Ok(ExitCode::FAILURE);
    }

    match read_worker_pid(pid_file) {
        Some(worker) => println!("respawn is running (pid {pid}, worker {worker})"),
        None => println!("respawn is running (pid {pid})"),
    }
    Ok(ExitCode::SUCCESS)
}
