// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process backend.
//!
//! Runs each execution as a child process of the engine:
//!
//! | Kind | Command | Pause / resume |
//! |------|---------|----------------|
//! | `interpreted` | `{python} -u main.py` in the app directory | `SIGSTOP` / `SIGCONT` |
//! | `compiled_binary` | the binary, from `path` or base64 `binary` | `SIGSTOP` / `SIGCONT` |
//! | `container_image` | `{cli} run --rm -i --name edgekit-{exec} {image}` | `{cli} pause` / `unpause` |
//!
//! Payloads are materialised under `{DATA_DIR}/apps/{app_id}/` (the id
//! percent-encoded), which is removed again by [`ExecutionBackend::discard`].
//! A container launch only succeeds once `{cli} inspect` reports it running.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use edgekit_protocol::message::{AppKind, StreamTag};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::traits::*;

const READ_CHUNK: usize = 8 * 1024;
const CONTAINER_POLL: Duration = Duration::from_millis(250);

/// Configuration for the process backend.
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    /// Root under which application payloads are written.
    pub data_dir: PathBuf,
    /// Interpreter for interpreted applications.
    pub python: String,
    /// Container CLI (docker, podman, nerdctl).
    pub container_cli: String,
    /// How long `terminate` waits after SIGTERM before SIGKILL.
    pub stop_grace: Duration,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".data"),
            python: "python3".to_string(),
            container_cli: "docker".to_string(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

struct LiveProcess {
    pid: Option<u32>,
    container: Option<String>,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    exited: watch::Receiver<bool>,
}

/// Backend that runs executions as local processes.
pub struct ProcessBackend {
    config: ProcessBackendConfig,
    live: Arc<Mutex<HashMap<String, LiveProcess>>>,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self {
            config,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn app_dir(&self, app_id: &str) -> PathBuf {
        self.config.data_dir.join("apps").join(encode_dir_name(app_id))
    }

    /// Write the payload to disk and build the command that runs it.
    async fn prepare_command(&self, spec: &LaunchSpec) -> Result<(Command, Option<String>)> {
        let app_dir = self.app_dir(&spec.app_id);
        tokio::fs::create_dir_all(&app_dir).await?;

        match spec.app_kind {
            AppKind::Interpreted => {
                let entry = materialise_interpreted(&app_dir, &spec.payload).await?;
                let mut cmd = Command::new(&self.config.python);
                cmd.arg("-u").arg(entry).current_dir(&app_dir);
                cmd.args(payload_args(&spec.payload));
                Ok((cmd, None))
            }
            AppKind::CompiledBinary => {
                let binary = materialise_binary(&app_dir, &spec.payload).await?;
                let mut cmd = Command::new(binary);
                cmd.current_dir(&app_dir);
                cmd.args(payload_args(&spec.payload));
                Ok((cmd, None))
            }
            AppKind::ContainerImage => {
                let image = spec
                    .payload
                    .get("image")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        BackendError::InvalidPayload("container payload needs `image`".to_string())
                    })?;
                let name = format!("edgekit-{}", spec.execution_id);
                let mut cmd = Command::new(&self.config.container_cli);
                cmd.args(["run", "--rm", "-i", "--name", &name, image]);
                cmd.args(payload_args(&spec.payload));
                Ok((cmd, Some(name)))
            }
        }
    }

    async fn container_cmd(&self, verb: &str, name: &str) -> Result<()> {
        let output = Command::new(&self.config.container_cli)
            .args([verb, name])
            .output()
            .await?;
        if !output.status.success() {
            return Err(BackendError::Signal(format!(
                "{} {} failed: {}",
                verb,
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Poll until the container is running. Fails if the CLI exits first,
    /// e.g. because the image could not be pulled.
    async fn wait_container_running(
        &self,
        name: &str,
        exited: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let output = Command::new(&self.config.container_cli)
                .args(["inspect", "-f", "{{.State.Running}}", name])
                .output()
                .await?;
            if output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true" {
                return Ok(());
            }
            if *exited.borrow() {
                return Err(BackendError::LaunchFailed(format!(
                    "container {} exited before it was running",
                    name
                )));
            }
            tokio::select! {
                _ = exited.changed() => {}
                _ = tokio::time::sleep(CONTAINER_POLL) => {}
            }
        }
    }

    async fn lookup(&self, execution_id: &str) -> Result<(Option<u32>, Option<String>)> {
        let live = self.live.lock().await;
        let process = live
            .get(execution_id)
            .ok_or_else(|| BackendError::NotRunning(execution_id.to_string()))?;
        Ok((process.pid, process.container.clone()))
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn backend_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec, events: EventSender) -> Result<ExecutionHandle> {
        let (mut cmd, container) = self.prepare_command(spec).await?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("EDGEKIT_APP_ID", &spec.app_id)
            .env("EDGEKIT_EXECUTION_ID", &spec.execution_id);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::LaunchFailed(format!("spawn failed: {}", e)))?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take().map(|s| Arc::new(Mutex::new(s)));

        let (exited_tx, exited_rx) = watch::channel(false);
        let mut started = exited_rx.clone();
        self.live.lock().await.insert(
            spec.execution_id.clone(),
            LiveProcess {
                pid,
                container: container.clone(),
                stdin,
                exited: exited_rx,
            },
        );

        let stdout_task = stdout.map(|s| {
            tokio::spawn(pump_stream(
                s,
                StreamTag::Stdout,
                spec.execution_id.clone(),
                events.clone(),
            ))
        });
        let stderr_task = stderr.map(|s| {
            tokio::spawn(pump_stream(
                s,
                StreamTag::Stderr,
                spec.execution_id.clone(),
                events.clone(),
            ))
        });

        let live = self.live.clone();
        let execution_id = spec.execution_id.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => Some(exit_code_of(status)),
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Failed to wait for process");
                    None
                }
            };
            live.lock().await.remove(&execution_id);
            let _ = exited_tx.send(true);

            // Flush remaining output before reporting termination. Orphaned
            // grandchildren may keep the pipes open, so do not wait forever.
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                    debug!(execution_id = %execution_id, "Output pump still open after exit");
                }
            }

            info!(execution_id = %execution_id, exit_code = ?exit_code, "Process exited");
            let _ = events
                .send(BackendEvent::Terminated {
                    execution_id,
                    exit_code,
                })
                .await;
        });

        if let Some(name) = &container {
            // Stop the CLI if the container never comes up, or if the caller
            // gives up waiting.
            let mut abort = TerminateOnDrop {
                pid,
                exited: started.clone(),
            };
            self.wait_container_running(name, &mut started).await?;
            abort.disarm();
        }

        info!(
            app_id = %spec.app_id,
            execution_id = %spec.execution_id,
            pid = ?pid,
            container = ?container,
            "Process launched"
        );

        Ok(ExecutionHandle {
            execution_id: spec.execution_id.clone(),
            handle_id: container.unwrap_or_else(|| pid.map(|p| p.to_string()).unwrap_or_default()),
            started_at: Utc::now(),
            pid,
        })
    }

    async fn pause(&self, handle: &ExecutionHandle) -> Result<()> {
        match self.lookup(&handle.execution_id).await? {
            (_, Some(container)) => self.container_cmd("pause", &container).await,
            (Some(pid), None) => send_signal(pid, Signal::SIGSTOP),
            (None, None) => Err(BackendError::NotRunning(handle.execution_id.clone())),
        }
    }

    async fn resume(&self, handle: &ExecutionHandle) -> Result<()> {
        match self.lookup(&handle.execution_id).await? {
            (_, Some(container)) => self.container_cmd("unpause", &container).await,
            (Some(pid), None) => send_signal(pid, Signal::SIGCONT),
            (None, None) => Err(BackendError::NotRunning(handle.execution_id.clone())),
        }
    }

    async fn terminate(&self, handle: &ExecutionHandle) -> Result<()> {
        let (pid, container, mut exited) = {
            let live = self.live.lock().await;
            match live.get(&handle.execution_id) {
                Some(p) => (p.pid, p.container.clone(), p.exited.clone()),
                // Already gone counts as terminated.
                None => return Ok(()),
            }
        };

        if let Some(container) = &container {
            let grace = self.config.stop_grace.as_secs().to_string();
            let output = Command::new(&self.config.container_cli)
                .args(["stop", "-t", &grace, container])
                .output()
                .await?;
            if !output.status.success() {
                warn!(
                    container = %container,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Container stop failed, waiting for the CLI process"
                );
            }
        } else if let Some(pid) = pid {
            // A stopped process cannot act on SIGTERM until continued.
            let _ = send_signal(pid, Signal::SIGCONT);
            if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM not delivered");
            }
        }

        if wait_exited(&mut exited, self.config.stop_grace).await {
            return Ok(());
        }

        if let Some(pid) = pid {
            warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
            let _ = send_signal(pid, Signal::SIGKILL);
        }

        if wait_exited(&mut exited, Duration::from_secs(5)).await {
            Ok(())
        } else {
            Err(BackendError::Signal(format!(
                "execution {} still running after SIGKILL",
                handle.execution_id
            )))
        }
    }

    async fn write_input(&self, handle: &ExecutionHandle, bytes: &[u8]) -> Result<()> {
        let stdin = {
            let live = self.live.lock().await;
            live.get(&handle.execution_id)
                .and_then(|p| p.stdin.clone())
                .ok_or_else(|| BackendError::NotRunning(handle.execution_id.clone()))?
        };
        let mut stdin = stdin.lock().await;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn discard(&self, app_id: &str) -> Result<()> {
        let dir = self.app_dir(app_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(path = %dir.display(), "Removed application directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sends SIGTERM to a process still running when dropped, unless disarmed.
struct TerminateOnDrop {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
}

impl TerminateOnDrop {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        if *self.exited.borrow() {
            return;
        }
        if let Some(pid) = self.pid.take()
            && let Err(e) = send_signal(pid, Signal::SIGTERM)
        {
            debug!(pid, error = %e, "SIGTERM not delivered");
        }
    }
}

/// Directory name for an application id. Percent-encodes everything but
/// ASCII alphanumerics, `-` and `_`, so distinct ids never share a directory
/// and no id can escape the data dir.
fn encode_dir_name(app_id: &str) -> String {
    let mut encoded = String::with_capacity(app_id.len());
    for byte in app_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

async fn pump_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: StreamTag,
    execution_id: String,
    events: EventSender,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = BackendEvent::Output {
                    execution_id: execution_id.clone(),
                    stream,
                    bytes: buf[..n].to_vec(),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(execution_id = %execution_id, error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await,
        Ok(Ok(_))
    ) || *exited.borrow()
}

fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let pid = i32::try_from(pid).map_err(|_| BackendError::Signal(format!("invalid pid {}", pid)))?;
    kill(Pid::from_raw(pid), signal)
        .map_err(|e| BackendError::Signal(format!("{} to {} failed: {}", signal, pid, e)))
}

/// Exit code, with death-by-signal mapped to `128 + signo`.
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

fn payload_args(payload: &Value) -> Vec<String> {
    payload
        .get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .map(|a| match a {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Write interpreted code and return the entry point relative to `app_dir`.
///
/// `code` is either plain source, or a JSON array describing a project
/// tree of `{name, type: "file" | "folder", content?, isBase64?, items?}`.
async fn materialise_interpreted(app_dir: &Path, payload: &Value) -> Result<PathBuf> {
    let entrypoint = payload
        .get("entrypoint")
        .and_then(Value::as_str)
        .unwrap_or("main.py");

    // `files`: flat map of relative path to text content.
    if let Some(files) = payload.get("files").and_then(Value::as_object) {
        let project_dir = app_dir.join("project");
        if project_dir.exists() {
            tokio::fs::remove_dir_all(&project_dir).await?;
        }
        for (name, content) in files {
            let path = project_dir.join(checked_relative(name)?);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = content.as_str().ok_or_else(|| {
                BackendError::InvalidPayload(format!("{}: content must be a string", name))
            })?;
            tokio::fs::write(&path, content).await?;
        }
        return Ok(PathBuf::from("project").join(checked_relative(entrypoint)?));
    }

    let code = payload.get("code").and_then(Value::as_str).ok_or_else(|| {
        BackendError::InvalidPayload("interpreted payload needs `code` or `files`".to_string())
    })?;

    match serde_json::from_str::<Value>(code) {
        Ok(Value::Array(items)) => {
            let project_dir = app_dir.join("project");
            if project_dir.exists() {
                tokio::fs::remove_dir_all(&project_dir).await?;
            }
            tokio::fs::create_dir_all(&project_dir).await?;

            let items = unwrap_single_root(items);
            write_tree(&project_dir, &items).await?;
            Ok(PathBuf::from("project").join(checked_relative(entrypoint)?))
        }
        _ => {
            tokio::fs::write(app_dir.join("main.py"), code).await?;
            Ok(PathBuf::from("main.py"))
        }
    }
}

fn unwrap_single_root(items: Vec<Value>) -> Vec<Value> {
    let items: Vec<Value> = items.into_iter().filter(|i| i["name"] != "__MACOSX").collect();
    if let [only] = items.as_slice()
        && only["type"] == "folder"
        && let Some(children) = only.get("items").and_then(Value::as_array)
    {
        return children.clone();
    }
    items
}

async fn write_tree(dir: &Path, items: &[Value]) -> Result<()> {
    // Iterative to avoid recursive async fns.
    let mut stack: Vec<(PathBuf, Vec<Value>)> = vec![(dir.to_path_buf(), items.to_vec())];
    while let Some((current, items)) = stack.pop() {
        for item in items {
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::InvalidPayload("project item without name".to_string()))?;
            if name == "__MACOSX" {
                continue;
            }
            let path = current.join(checked_relative(name)?);
            match item.get("type").and_then(Value::as_str) {
                Some("folder") => {
                    tokio::fs::create_dir_all(&path).await?;
                    let children = item
                        .get("items")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    stack.push((path, children));
                }
                Some("file") => {
                    let content = item.get("content").and_then(Value::as_str).unwrap_or("");
                    let is_base64 = item.get("isBase64").and_then(Value::as_bool).unwrap_or(false);
                    if is_base64 {
                        let bytes = BASE64.decode(content).map_err(|e| {
                            BackendError::InvalidPayload(format!("{}: invalid base64: {}", name, e))
                        })?;
                        tokio::fs::write(&path, bytes).await?;
                    } else {
                        tokio::fs::write(&path, content).await?;
                    }
                }
                other => {
                    return Err(BackendError::InvalidPayload(format!(
                        "{}: unknown item type {:?}",
                        name, other
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Reject absolute paths and `..` components.
fn checked_relative(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let escapes = path.components().any(|c| {
        !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
    });
    if escapes || name.is_empty() {
        return Err(BackendError::InvalidPayload(format!(
            "path {:?} must be relative and stay inside the project",
            name
        )));
    }
    Ok(path)
}

/// Resolve the binary to run: an existing `path`, or base64 `binary`
/// content written out with mode 0755.
async fn materialise_binary(app_dir: &Path, payload: &Value) -> Result<PathBuf> {
    if let Some(path) = payload.get("path").and_then(Value::as_str) {
        let path = PathBuf::from(path);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BackendError::InvalidPayload(format!(
                "binary not found: {}",
                path.display()
            )));
        }
        return Ok(path);
    }

    let encoded = payload
        .get("binary")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            BackendError::InvalidPayload("binary payload needs `path` or `binary`".to_string())
        })?;
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| BackendError::InvalidPayload(format!("binary is not valid base64: {}", e)))?;

    let target = app_dir.join("app.bin");
    tokio::fs::write(&target, bytes).await?;
    tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).await?;
    // Absolute so current_dir does not change its meaning.
    Ok(std::path::absolute(&target)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn backend(dir: &TempDir) -> ProcessBackend {
        ProcessBackend::new(ProcessBackendConfig {
            data_dir: dir.path().to_path_buf(),
            stop_grace: Duration::from_secs(2),
            ..Default::default()
        })
    }

    fn spec(app_kind: AppKind, payload: Value) -> LaunchSpec {
        LaunchSpec {
            execution_id: uuid::Uuid::new_v4().to_string(),
            app_id: "app-1".to_string(),
            app_kind,
            payload,
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_checked_relative() {
        assert!(checked_relative("main.py").is_ok());
        assert!(checked_relative("pkg/mod.py").is_ok());
        assert!(checked_relative("../escape.py").is_err());
        assert!(checked_relative("/etc/passwd").is_err());
        assert!(checked_relative("").is_err());
    }

    #[test]
    fn test_exit_code_of_signal() {
        assert_eq!(exit_code_of(ExitStatus::from_raw(0)), 0);
        // Raw wait status: exit code lives in the high byte
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
        // Killed by SIGKILL
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
    }

    #[test]
    fn test_payload_args() {
        assert_eq!(
            payload_args(&json!({"args": ["-v", 3]})),
            vec!["-v".to_string(), "3".to_string()]
        );
        assert!(payload_args(&json!({})).is_empty());
    }

    #[tokio::test]
    async fn test_materialise_plain_code() {
        let dir = TempDir::new().unwrap();
        let entry = materialise_interpreted(dir.path(), &json!({"code": "print('hi')"}))
            .await
            .unwrap();
        assert_eq!(entry, PathBuf::from("main.py"));
        let written = std::fs::read_to_string(dir.path().join("main.py")).unwrap();
        assert_eq!(written, "print('hi')");
    }

    #[tokio::test]
    async fn test_materialise_project_tree() {
        let dir = TempDir::new().unwrap();
        let project = json!([{
            "name": "root",
            "type": "folder",
            "items": [
                {"name": "main.py", "type": "file", "content": "import lib.util"},
                {"name": "lib", "type": "folder", "items": [
                    {"name": "util.py", "type": "file", "content": BASE64.encode("X = 1"), "isBase64": true}
                ]},
                {"name": "__MACOSX", "type": "folder", "items": []}
            ]
        }]);
        let payload = json!({"code": project.to_string()});

        let entry = materialise_interpreted(dir.path(), &payload).await.unwrap();
        assert_eq!(entry, PathBuf::from("project/main.py"));
        assert!(dir.path().join("project/main.py").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("project/lib/util.py")).unwrap(),
            "X = 1"
        );
        assert!(!dir.path().join("project/__MACOSX").exists());
    }

    #[tokio::test]
    async fn test_materialise_files_map() {
        let dir = TempDir::new().unwrap();
        let payload = json!({
            "files": {"run.py": "import helpers", "helpers/__init__.py": ""},
            "entrypoint": "run.py"
        });
        let entry = materialise_interpreted(dir.path(), &payload).await.unwrap();
        assert_eq!(entry, PathBuf::from("project/run.py"));
        assert!(dir.path().join("project/helpers/__init__.py").exists());
    }

    #[tokio::test]
    async fn test_materialise_rejects_escaping_project() {
        let dir = TempDir::new().unwrap();
        let project = json!([
            {"name": "../evil.py", "type": "file", "content": ""},
            {"name": "main.py", "type": "file", "content": ""}
        ]);
        let result = materialise_interpreted(dir.path(), &json!({"code": project.to_string()})).await;
        assert!(matches!(result, Err(BackendError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_materialise_binary_missing_path() {
        let dir = TempDir::new().unwrap();
        let result = materialise_binary(dir.path(), &json!({"path": "/nonexistent/app"})).await;
        assert!(matches!(result, Err(BackendError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_launch_binary_streams_output_and_exit() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let (tx, mut rx) = mpsc::channel(64);

        let spec = spec(
            AppKind::CompiledBinary,
            json!({"path": "/bin/sh", "args": ["-c", "echo out; echo err 1>&2; exit 3"]}),
        );
        let handle = backend.launch(&spec, tx).await.unwrap();
        assert!(handle.pid.is_some());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = loop {
            match rx.recv().await.unwrap() {
                BackendEvent::Output { stream: StreamTag::Stdout, bytes, .. } => stdout.extend(bytes),
                BackendEvent::Output { stream: StreamTag::Stderr, bytes, .. } => stderr.extend(bytes),
                BackendEvent::Terminated { exit_code, .. } => break exit_code,
            }
        };
        assert_eq!(stdout, b"out\n");
        assert_eq!(stderr, b"err\n");
        assert_eq!(exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_pause_resume_terminate_process() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let (tx, mut rx) = mpsc::channel(64);

        let spec = spec(
            AppKind::CompiledBinary,
            json!({"path": "/bin/sh", "args": ["-c", "exec sleep 30"]}),
        );
        let handle = backend.launch(&spec, tx).await.unwrap();

        backend.pause(&handle).await.unwrap();
        backend.resume(&handle).await.unwrap();
        backend.terminate(&handle).await.unwrap();

        match rx.recv().await.unwrap() {
            BackendEvent::Terminated { exit_code, .. } => assert_eq!(exit_code, Some(128 + 15)),
            other => panic!("unexpected event {:?}", other),
        }

        // Gone now: terminate is idempotent, pause is not
        backend.terminate(&handle).await.unwrap();
        assert!(matches!(
            backend.pause(&handle).await,
            Err(BackendError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_write_input_reaches_process() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let (tx, mut rx) = mpsc::channel(64);

        let spec = spec(
            AppKind::CompiledBinary,
            json!({"path": "/bin/sh", "args": ["-c", "read line; echo got:$line"]}),
        );
        let handle = backend.launch(&spec, tx).await.unwrap();
        backend.write_input(&handle, b"ping\n").await.unwrap();

        let mut stdout = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                BackendEvent::Output { bytes, .. } => stdout.extend(bytes),
                BackendEvent::Terminated { .. } => break,
            }
        }
        assert_eq!(stdout, b"got:ping\n");
    }

    #[tokio::test]
    async fn test_discard_removes_app_dir() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let app_dir = backend.app_dir("app-1");
        std::fs::create_dir_all(&app_dir).unwrap();

        backend.discard("app-1").await.unwrap();
        assert!(!app_dir.exists());
        // Nothing to remove is fine
        backend.discard("app-1").await.unwrap();
    }

    #[test]
    fn test_app_dir_is_sanitised() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let path = backend.app_dir("../../etc");
        assert_eq!(path, dir.path().join("apps").join("%2E%2E%2F%2E%2E%2Fetc"));
        assert!(path.starts_with(dir.path().join("apps")));
    }

    #[test]
    fn test_app_dir_is_unique_per_id() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let ids = ["a/b", "a:b", "a_b", "a%2Fb", "a.b"];
        let dirs: std::collections::HashSet<PathBuf> = ids.iter().map(|id| backend.app_dir(id)).collect();
        assert_eq!(dirs.len(), ids.len());
        assert_eq!(backend.app_dir("app-1_2"), dir.path().join("apps").join("app-1_2"));
    }

    /// Write a fake container CLI: a shell `case` over its first argument.
    fn fake_container_cli(dir: &TempDir, cases: &str) -> String {
        let path = dir.path().join("fake-cli");
        std::fs::write(&path, format!("#!/bin/sh\ncase \"$1\" in\n{}\nesac\n", cases)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn container_backend(dir: &TempDir, cases: &str) -> ProcessBackend {
        ProcessBackend::new(ProcessBackendConfig {
            data_dir: dir.path().to_path_buf(),
            container_cli: fake_container_cli(dir, cases),
            stop_grace: Duration::from_secs(1),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_container_launch_fails_when_never_running() {
        let dir = TempDir::new().unwrap();
        // `run` fails the way an image pull does
        let backend = container_backend(
            &dir,
            "  run) echo 'pull access denied' 1>&2; exit 125 ;;\n  inspect) exit 1 ;;",
        );
        let (tx, mut rx) = mpsc::channel(64);

        let spec = spec(AppKind::ContainerImage, json!({"image": "missing/image:1"}));
        let result = backend.launch(&spec, tx).await;
        assert!(matches!(result, Err(BackendError::LaunchFailed(_))));

        // The CLI's own exit is still reported
        let exit_code = loop {
            match rx.recv().await.unwrap() {
                BackendEvent::Terminated { exit_code, .. } => break exit_code,
                BackendEvent::Output { .. } => {}
            }
        };
        assert_eq!(exit_code, Some(125));
    }

    #[tokio::test]
    async fn test_container_stop_failure_escalates_to_cli_kill() {
        let dir = TempDir::new().unwrap();
        let backend = container_backend(
            &dir,
            "  run) exec sleep 30 ;;\n  inspect) echo true ;;\n  stop) exit 1 ;;",
        );
        let (tx, mut rx) = mpsc::channel(64);

        let spec = spec(AppKind::ContainerImage, json!({"image": "app:1"}));
        let handle = backend.launch(&spec, tx).await.unwrap();
        assert_eq!(handle.handle_id, format!("edgekit-{}", spec.execution_id));
        assert!(handle.pid.is_some());

        backend.terminate(&handle).await.unwrap();
        match rx.recv().await.unwrap() {
            BackendEvent::Terminated { exit_code, .. } => assert_eq!(exit_code, Some(128 + 9)),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
