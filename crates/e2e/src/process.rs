//! Process runner - spawning build tools and servers in their own process group

use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::error::{E2eError, E2eResult};
use crate::server::{probe, RunningInstance, Stop};

const TAIL_LINES: usize = 50;
const REAP_INTERVAL: Duration = Duration::from_millis(25);

/// Options for one child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Working directory
    pub cwd: PathBuf,

    /// Variables merged over the ambient environment
    pub env: BTreeMap<String, String>,

    /// Port the process is expected to serve on
    pub port: Option<u16>,
}

impl SpawnOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: BTreeMap::new(),
            port: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Outcome of a one-shot command
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub command: String,
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl BuildResult {
    fn from_status(command: String, status: ExitStatus, stdout: String, stderr: String) -> Self {
        Self {
            command,
            code: status.code(),
            success: status.success(),
            stdout,
            stderr,
        }
    }

    pub fn status_label(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// Turn a non-zero exit into a build failure carrying the captured output
    pub fn into_result(self, implementation: &str) -> E2eResult<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(E2eError::Build {
                implementation: implementation.to_string(),
                status: self.status_label(),
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Spawns children and waits for them under the configured bounds
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: ProcessConfig,
}

impl ProcessRunner {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Start a long-running server and wait until it accepts connections
    ///
    /// On readiness timeout or early exit the whole process group is killed
    /// before the error is returned.
    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: &SpawnOptions,
    ) -> E2eResult<RunningInstance> {
        let port = options.port.ok_or_else(|| {
            E2eError::Config(format!("spawn of `{}` needs an expected port", describe(command, args)))
        })?;

        let mut process = ChildProcess::spawn(command, args, options, self.config.shutdown_grace())?;
        info!("Spawned `{}` (pid: {}), expecting port {}", process.label, process.pid(), port);

        if let Err(e) = self.wait_for_ready(&mut process, port).await {
            if let Err(stop_err) = process.stop() {
                warn!("Cleanup after failed start of `{}` failed: {}", process.label, stop_err);
            }
            return Err(e);
        }

        info!("`{}` is ready on port {}", process.label, port);
        Ok(RunningInstance::new(port, process))
    }

    async fn wait_for_ready(&self, process: &mut ChildProcess, port: u16) -> E2eResult<()> {
        let timeout = self.config.readiness_timeout();
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            process.ensure_running(port)?;

            if probe(port, self.config.connect_timeout()).await {
                // The port may belong to someone else while our child is still failing its bind
                sleep(self.config.settle()).await;
                process.ensure_running(port)?;
                if probe(port, self.config.connect_timeout()).await {
                    debug!("Port {} ready after {} attempt(s)", port, attempts);
                    return Ok(());
                }
            }

            if start.elapsed() >= timeout {
                return Err(E2eError::ReadinessTimeout {
                    command: process.label.clone(),
                    port,
                    timeout,
                });
            }

            if attempts == 1 {
                info!("Waiting for port {} to accept connections...", port);
            }

            sleep(self.config.poll_interval()).await;
        }
    }

    /// Run a command to completion, capturing its exit status and both streams
    ///
    /// Blocks the calling thread. Anything left in the child's process group
    /// after it exits is killed.
    pub fn run_to_completion(
        &self,
        command: &str,
        args: &[String],
        options: &SpawnOptions,
    ) -> E2eResult<BuildResult> {
        let label = describe(command, args);
        let timeout = self.config.build_timeout();
        debug!("Running `{}` in {}", label, options.cwd.display());

        let mut child = command_for(command, args, options).spawn().map_err(|e| {
            E2eError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to spawn `{}`: {}", label, e),
            ))
        })?;

        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if start.elapsed() >= timeout {
                break None;
            }
            thread::sleep(REAP_INTERVAL);
        };

        kill_group(&child);
        let status = match status {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                join(stdout);
                join(stderr);
                return Err(E2eError::Timeout(format!("`{}` to finish within {:?}", label, timeout)));
            }
        };

        let result = BuildResult::from_status(label, status, join(stdout), join(stderr));
        debug!("`{}` finished with {}", result.command, result.status_label());
        Ok(result)
    }
}

/// A spawned child that leads its own process group
struct ChildProcess {
    child: Child,
    label: String,
    grace: Duration,
    tail: OutputTail,
    stopped: bool,
}

impl ChildProcess {
    fn spawn(command: &str, args: &[String], options: &SpawnOptions, grace: Duration) -> E2eResult<Self> {
        let label = describe(command, args);
        let mut child = command_for(command, args, options)
            .spawn()
            .map_err(|e| E2eError::ServerStartup(format!("Failed to spawn `{}`: {}", label, e)))?;

        let tail = OutputTail::default();
        if let Some(out) = child.stdout.take() {
            tail.follow(out, label.clone());
        }
        if let Some(err) = child.stderr.take() {
            tail.follow(err, label.clone());
        }

        Ok(Self {
            child,
            label,
            grace,
            tail,
            stopped: false,
        })
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// A failed status query counts as running so the group still gets killed
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None) | Err(_))
    }

    /// Fail with the output tail if the child has already exited
    fn ensure_running(&mut self, port: u16) -> E2eResult<()> {
        match self.child.try_wait()? {
            None => Ok(()),
            Some(status) => Err(E2eError::ServerStartup(format!(
                "`{}` exited ({}) before accepting connections on port {}\n{}",
                self.label,
                status,
                port,
                self.tail.render()
            ))),
        }
    }
}

impl Stop for ChildProcess {
    fn stop(&mut self) -> E2eResult<()> {
        if self.stopped {
            return Ok(());
        }
        info!("Stopping `{}` (pid: {})", self.label, self.pid());

        // Try graceful shutdown first
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(self.child.id() as i32);
            if self.is_running() && killpg(pgid, Signal::SIGTERM).is_ok() {
                let deadline = Instant::now() + self.grace;
                while Instant::now() < deadline && self.is_running() {
                    thread::sleep(REAP_INTERVAL);
                }
            }
        }

        // Whatever is left in the group, including forked workers
        kill_group(&self.child);
        self.stopped = true;
        let _ = self.child.kill();
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Last lines a child wrote, kept for startup diagnostics
#[derive(Debug, Clone, Default)]
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn follow<R: Read + Send + 'static>(&self, pipe: R, label: String) {
        let lines = Arc::clone(&self.lines);
        thread::spawn(move || {
            for line in BufReader::new(pipe).lines() {
                let Ok(line) = line else { break };
                debug!(target: "rsc_e2e::child", "[{}] {}", label, line);
                let mut lines = lines.lock();
                if lines.len() == TAIL_LINES {
                    lines.pop_front();
                }
                lines.push_back(line);
            }
        });
    }

    fn render(&self) -> String {
        self.lines.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn command_for(command: &str, args: &[String], options: &SpawnOptions) -> Command {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(&options.cwd)
        .envs(&options.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

fn kill_group(child: &Child) {
    kill_process_group(child.id());
}

/// SIGKILL every process in the group led by `pid`
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // ESRCH just means the group is already gone
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: u32) {}

fn collect<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn describe(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}
