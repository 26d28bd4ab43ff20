//! Backend process management
//!
//! Launch scripts are run by `sh` in their own process group so the whole
//! tree (model servers like to fork workers) can be signalled at once. A
//! waiter task owns the child and publishes its exit status, which lets
//! callers signal and poll the process without exclusive access to it.

use async_trait::async_trait;
use llmhost_core::{Error, HardwareConfig, ModelDefinition, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a backend process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A running backend
#[async_trait]
pub trait BackendProcess: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Exit status if the process has already ended
    fn try_exit(&self) -> Option<ExitInfo>;

    /// Ask the process group to stop (SIGTERM)
    fn terminate(&self);

    /// Kill the process group (SIGKILL)
    fn kill(&self);

    /// Wait for the process to end
    async fn wait(&self) -> ExitInfo;
}

/// Everything needed to start one backend
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub alias: String,
    pub port: u16,
    pub hardware: HardwareConfig,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(definition: &ModelDefinition, hardware: &HardwareConfig) -> Self {
        Self {
            alias: definition.primary_alias().to_string(),
            port: definition.port,
            hardware: hardware.clone(),
            working_dir: definition.working_dir.clone(),
            env: definition.env.clone(),
        }
    }

    /// Environment passed to the launch script
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("LLMHOST_ALIAS".to_string(), self.alias.clone());
        env.insert("LLMHOST_PORT".to_string(), self.port.to_string());
        env.insert("LLMHOST_DEVICES".to_string(), self.hardware.device_list());
        env.insert(
            "LLMHOST_HARDWARE_CONFIG".to_string(),
            self.hardware.name.clone(),
        );
        env
    }

    /// Directory the script runs in. Loaded configurations always set one;
    /// `None` inherits the daemon's own directory.
    pub fn current_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }
}

/// Starts backend processes
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<std::sync::Arc<dyn BackendProcess>>;
}

/// Runs the hardware configuration's script with `sh`. The path is passed as
/// an argument, never as shell source.
#[derive(Debug, Clone, Default)]
pub struct ScriptLauncher;

#[async_trait]
impl Launcher for ScriptLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<std::sync::Arc<dyn BackendProcess>> {
        let mut command = Command::new("sh");
        command
            .arg(&spec.hardware.script)
            .envs(spec.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        if let Some(dir) = spec.current_dir() {
            command.current_dir(dir);
        }

        info!(
            alias = %spec.alias,
            port = spec.port,
            hardware_config = %spec.hardware.name,
            script = %spec.hardware.script.display(),
            "Launching backend"
        );

        let process = ChildProcess::spawn(command, &spec.alias).map_err(|e| {
            Error::startup_failed(
                &spec.alias,
                format!(
                    "failed to run {}: {}",
                    spec.hardware.script.display(),
                    e
                ),
            )
        })?;

        Ok(std::sync::Arc::new(process))
    }
}

/// A spawned child process
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ChildProcess {
    /// Spawn `command` and start forwarding its output to the log
    pub fn spawn(mut command: Command, alias: &str) -> std::io::Result<Self> {
        let mut child = command.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, alias.to_string(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, alias.to_string(), "stderr"));
        }

        let (tx, rx) = watch::channel(None);
        let name = alias.to_string();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!(alias = %name, "Failed to wait for backend process: {}", e);
                    ExitInfo::unknown()
                }
            };
            debug!(alias = %name, "Backend process ended with {}", exit);
            let _ = tx.send(Some(exit));
        });

        Ok(Self { pid, exit: rx })
    }

    fn signal(&self, signal: nix::sys::signal::Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        let group = nix::unistd::Pid::from_raw(pid as i32);
        match nix::sys::signal::killpg(group, signal) {
            Ok(()) => debug!(pid, ?signal, "Signalled backend process group"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(pid, ?signal, "Failed to signal backend process group: {}", e),
        }
    }
}

#[async_trait]
impl BackendProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    fn terminate(&self) {
        self.signal(nix::sys::signal::Signal::SIGTERM);
    }

    fn kill(&self) {
        self.signal(nix::sys::signal::Signal::SIGKILL);
    }

    async fn wait(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(Option::is_some).await;
        match result {
            Ok(value) => value.clone().unwrap_or_else(ExitInfo::unknown),
            Err(_) => ExitInfo::unknown(),
        }
    }
}

async fn forward_output<R>(stream: R, alias: String, stream_name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!(target: "backend", alias = %alias, stream = stream_name, "{}", line);
        }
    }
}

/// Stop a process: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// A process that ignores SIGKILL as well is given up on after a further
/// `grace` and reported as unknown.
pub async fn shutdown_process(process: &dyn BackendProcess, grace: Duration) -> ExitInfo {
    if let Some(exit) = process.try_exit() {
        // the leader is gone; make sure workers it forked follow
        process.kill();
        return exit;
    }

    process.terminate();
    if let Ok(exit) = tokio::time::timeout(grace, process.wait()).await {
        process.kill();
        return exit;
    }

    warn!(
        pid = ?process.pid(),
        "Backend did not exit within {:?}, killing",
        grace
    );
    process.kill();

    match tokio::time::timeout(grace.max(Duration::from_secs(1)), process.wait()).await {
        Ok(exit) => exit,
        Err(_) => {
            warn!(pid = ?process.pid(), "Backend survived SIGKILL");
            ExitInfo::unknown()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmhost_core::ModelMode;

    fn spec(script: impl Into<PathBuf>) -> LaunchSpec {
        LaunchSpec {
            alias: "test-model".to_string(),
            port: 9123,
            hardware: HardwareConfig {
                name: "cpu".to_string(),
                required_devices: ["CPU".to_string(), "gpu0".to_string()].into(),
                memory_mb: Default::default(),
                script: script.into(),
            },
            working_dir: None,
            env: [("EXTRA".to_string(), "1".to_string())].into(),
        }
    }

    /// Write `body` to `dir/start.sh` and build a spec running it from `dir`
    fn script_in(dir: &Path, body: &str) -> LaunchSpec {
        std::fs::create_dir_all(dir).unwrap();
        let script = dir.join("start.sh");
        std::fs::write(&script, format!("{}\n", body)).unwrap();
        let mut spec = spec(script);
        spec.working_dir = Some(dir.to_path_buf());
        spec
    }

    #[test]
    fn test_launch_environment() {
        let env = spec("start.sh").environment();
        assert_eq!(env["LLMHOST_ALIAS"], "test-model");
        assert_eq!(env["LLMHOST_PORT"], "9123");
        assert_eq!(env["LLMHOST_DEVICES"], "CPU,gpu0");
        assert_eq!(env["LLMHOST_HARDWARE_CONFIG"], "cpu");
        assert_eq!(env["EXTRA"], "1");
    }

    #[test]
    fn test_spec_from_definition() {
        let hw = spec("start.sh").hardware;
        let def = ModelDefinition {
            aliases: vec!["Primary".to_string(), "other".to_string()],
            mode: ModelMode::Embedding,
            port: 9200,
            auto_start: false,
            working_dir: Some(PathBuf::from("/srv/models")),
            env: Default::default(),
            hardware: vec![hw.clone()],
        };
        let spec = LaunchSpec::new(&def, &hw);
        assert_eq!(spec.alias, "Primary");
        assert_eq!(spec.port, 9200);
        assert_eq!(spec.current_dir(), Some(Path::new("/srv/models")));
    }

    #[test]
    fn test_current_dir_ignores_script_location() {
        let mut spec = spec("/opt/models/scripts/start.sh");
        assert_eq!(spec.current_dir(), None);

        spec.working_dir = Some(PathBuf::from("/etc/llmhost"));
        assert_eq!(spec.current_dir(), Some(Path::new("/etc/llmhost")));
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let process = ScriptLauncher
            .launch(&script_in(dir.path(), "exit 3"))
            .await
            .unwrap();
        let exit = process.wait().await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(process.try_exit(), Some(exit));
    }

    #[tokio::test]
    async fn test_script_path_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("model dir").join("my scripts");
        let mut spec = script_in(&run_dir, r#"test "$(pwd -P)" = "$EXPECTED_DIR""#);
        spec.env.insert(
            "EXPECTED_DIR".to_string(),
            run_dir.canonicalize().unwrap().display().to_string(),
        );

        let process = ScriptLauncher.launch(&spec).await.unwrap();
        let exit = process.wait().await;
        assert!(exit.success(), "script failed with {}", exit);
    }

    #[tokio::test]
    async fn test_script_sees_environment() {
        let dir = tempfile::tempdir().unwrap();
        let process = ScriptLauncher
            .launch(&script_in(
                dir.path(),
                r#"test "$LLMHOST_PORT" = 9123 && test "$EXTRA" = 1"#,
            ))
            .await
            .unwrap();
        assert!(process.wait().await.success());
    }

    #[tokio::test]
    async fn test_missing_script_fails() {
        let dir = tempfile::tempdir().unwrap();
        let process = ScriptLauncher
            .launch(&spec(dir.path().join("absent.sh")))
            .await
            .unwrap();
        assert!(!process.wait().await.success());
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let process = ScriptLauncher
            .launch(&script_in(dir.path(), "sleep 30"))
            .await
            .unwrap();
        assert!(process.try_exit().is_none());

        let exit = shutdown_process(process.as_ref(), Duration::from_secs(5)).await;
        assert!(!exit.success());
        assert!(process.try_exit().is_some());
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let process = ScriptLauncher
            .launch(&script_in(dir.path(), "trap '' TERM; sleep 30"))
            .await
            .unwrap();

        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exit = shutdown_process(process.as_ref(), Duration::from_millis(300)).await;
        assert_eq!(exit.signal, Some(9));
    }

    #[test]
    fn test_exit_info_display() {
        let exit = ExitInfo {
            code: Some(2),
            signal: None,
        };
        assert_eq!(exit.to_string(), "exit code 2");
        let exit = ExitInfo {
            code: None,
            signal: Some(15),
        };
        assert_eq!(exit.to_string(), "signal 15");
    }
}
