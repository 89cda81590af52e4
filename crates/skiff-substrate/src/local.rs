//! Single-host substrate: one directory per unit, processes via
//! `tokio::process`.
//!
//! ```text
//! <root>/
//!   units/<handle>/          working directory of the unit
//!   checkpoints/<snapshot>/  copy of a unit directory
//! ```
//!
//! CPU and memory in metric samples are the declared request; the local
//! substrate does not meter processes.

use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use skiff_core::{ResourceRequest, SubstrateHandle, epoch_secs};

use crate::channel::{CloseGuard, ProcessChannel};
use crate::error::{SubstrateError, SubstrateResult};
use crate::types::*;
use crate::Substrate;

const CHANNEL_DEPTH: usize = 32;
const LOG_HISTORY: usize = 1000;
const CHECKPOINT_PREFIX: &str = "local:";

/// Fan-out of a unit's log lines with a bounded replay history.
#[derive(Clone)]
struct LogSink {
    tx: broadcast::Sender<String>,
    history: Arc<Mutex<VecDeque<String>>>,
}

impl LogSink {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_HISTORY);
        Self {
            tx,
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn push(&self, line: String) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == LOG_HISTORY {
            history.pop_front();
        }
        history.push_back(line.clone());
        let _ = self.tx.send(line);
    }

    fn push_chunk(&self, chunk: &[u8]) {
        for line in String::from_utf8_lossy(chunk).lines() {
            self.push(line.to_string());
        }
    }

    /// History followed by live lines until every writer is gone.
    fn follow(&self) -> mpsc::Receiver<String> {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        // Subscribe under the history lock so no line is missed or repeated.
        let (backlog, mut live) = {
            let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            (history.iter().cloned().collect::<Vec<_>>(), self.tx.subscribe())
        };
        tokio::spawn(async move {
            for line in backlog {
                if out_tx.send(line).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(line) => {
                        if out_tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        out_rx
    }
}

struct LocalUnit {
    dir: PathBuf,
    env: HashMap<String, String>,
    resources: ResourceRequest,
    started: Instant,
    log: LogSink,
    kill_switches: Mutex<Vec<Arc<Notify>>>,
}

impl LocalUnit {
    fn register_kill(&self) -> Arc<Notify> {
        let kill = Arc::new(Notify::new());
        let mut switches = self.kill_switches.lock().unwrap_or_else(PoisonError::into_inner);
        switches.retain(|k| Arc::strong_count(k) > 1);
        switches.push(kill.clone());
        kill
    }

    fn kill_all(&self) {
        let switches = self.kill_switches.lock().unwrap_or_else(PoisonError::into_inner);
        for kill in switches.iter() {
            kill.notify_one();
        }
    }
}

pub struct LocalSubstrate {
    root: PathBuf,
    units: Mutex<HashMap<String, Arc<LocalUnit>>>,
}

impl LocalSubstrate {
    pub fn new(root: impl Into<PathBuf>) -> SubstrateResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("units"))?;
        std::fs::create_dir_all(root.join("checkpoints"))?;
        info!(root = %root.display(), "local substrate ready");
        Ok(Self {
            root,
            units: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<LocalUnit>>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unit(&self, handle: &SubstrateHandle) -> SubstrateResult<Arc<LocalUnit>> {
        self.lock()
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| SubstrateError::NotFound(format!("unit {handle}")))
    }

    fn unit_dir(&self, handle: &SubstrateHandle) -> PathBuf {
        self.root.join("units").join(handle.as_str())
    }

    fn checkpoint_dir(&self, storage_ref: &str) -> SubstrateResult<PathBuf> {
        let id = storage_ref
            .strip_prefix(CHECKPOINT_PREFIX)
            .ok_or_else(|| SubstrateError::Rejected(format!("foreign checkpoint: {storage_ref}")))?;
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(SubstrateError::Rejected(format!("bad checkpoint id: {id}")));
        }
        Ok(self.root.join("checkpoints").join(id))
    }
}

/// Resolve a client path inside `dir`, refusing anything that could leave it.
fn resolve_within(dir: &Path, path: &str) -> SubstrateResult<PathBuf> {
    let rel = Path::new(path.trim_start_matches('/'));
    if rel.as_os_str().is_empty() {
        return Err(SubstrateError::Rejected("empty path".to_string()));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(SubstrateError::Rejected(format!(
                    "path escapes workload root: {path}"
                )));
            }
        }
    }
    Ok(dir.join(rel))
}

fn copy_tree(src: &Path, dst: &Path) -> SubstrateResult<u64> {
    let mut total = 0;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| SubstrateError::Fatal(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SubstrateError::Fatal(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            total += std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(total)
}

fn dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> SubstrateResult<T> + Send + 'static,
) -> SubstrateResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SubstrateError::Fatal(e.to_string()))?
}

fn spawn_process(
    dir: &Path,
    env: &HashMap<String, String>,
    command: &[String],
) -> SubstrateResult<Child> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| SubstrateError::Rejected("empty command".to_string()))?;
    Command::new(program)
        .args(args)
        .current_dir(dir)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SubstrateError::Fatal(format!("spawn {program}: {e}")))
}

/// Wait for `child` or kill it when `kill` fires; yields the exit code.
async fn supervise(mut child: Child, kill: Arc<Notify>) -> i32 {
    tokio::select! {
        status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
        _ = kill.notified() => {
            let _ = child.kill().await;
            -1
        }
    }
}

/// Forward a process stream to the session (if any) and the unit log.
fn pump_output(
    mut reader: impl AsyncRead + Unpin + Send + 'static,
    output: mpsc::Sender<Bytes>,
    log: LogSink,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    log.push_chunk(&chunk);
                    if output.send(chunk).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[async_trait]
impl Substrate for LocalSubstrate {
    async fn provision(
        &self,
        handle: &SubstrateHandle,
        spec: &ProvisionSpec,
    ) -> SubstrateResult<()> {
        if self.lock().contains_key(handle.as_str()) {
            return Ok(());
        }
        let dir = self.unit_dir(handle);
        // A directory left by a previous daemon is adopted as it stands.
        let adopted = tokio::fs::try_exists(&dir).await?;
        tokio::fs::create_dir_all(&dir).await?;

        if adopted {
            info!(%handle, "adopting existing unit directory");
        } else if let Some(seed) = &spec.seed {
            let src = self.checkpoint_dir(&seed.storage_ref)?;
            let dst = dir.clone();
            let copied = blocking(move || copy_tree(&src, &dst)).await?;
            debug!(%handle, bytes = copied, "unit seeded from checkpoint");
        }

        let unit = Arc::new(LocalUnit {
            dir,
            env: spec.env.clone(),
            resources: spec.resources,
            started: Instant::now(),
            log: LogSink::new(),
            kill_switches: Mutex::new(Vec::new()),
        });

        if !spec.command.is_empty() {
            let mut child = spawn_process(&unit.dir, &unit.env, &spec.command)?;
            drop(child.stdin.take());
            if let Some(stdout) = child.stdout.take() {
                pump_lines(stdout, unit.log.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                pump_lines(stderr, unit.log.clone());
            }
            let kill = unit.register_kill();
            let log = unit.log.clone();
            let handle_owned = handle.clone();
            tokio::spawn(async move {
                let code = supervise(child, kill).await;
                log.push(format!("[skiff] main process exited with code {code}"));
                debug!(handle = %handle_owned, code, "main process exited");
            });
        }

        self.lock().insert(handle.as_str().to_string(), unit);
        info!(%handle, image = %spec.image, "unit provisioned");
        Ok(())
    }

    async fn wait_ready(&self, handle: &SubstrateHandle) -> SubstrateResult<()> {
        self.unit(handle).map(|_| ())
    }

    async fn teardown(&self, handle: &SubstrateHandle) -> SubstrateResult<()> {
        let unit = self.lock().remove(handle.as_str());
        match &unit {
            Some(unit) => unit.kill_all(),
            None => debug!(%handle, "teardown of unit not held in memory"),
        }
        match tokio::fs::remove_dir_all(self.unit_dir(handle)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(%handle, error = %e, "failed to remove unit directory");
                return Err(e.into());
            }
        }
        info!(%handle, "unit torn down");
        Ok(())
    }

    async fn inspect(&self, handle: &SubstrateHandle) -> SubstrateResult<UnitStatus> {
        self.unit(handle)?;
        Ok(UnitStatus {
            phase: UnitPhase::Running,
            ready: true,
            machine_id: Some("local".to_string()),
        })
    }

    async fn exec(
        &self,
        handle: &SubstrateHandle,
        request: ExecRequest,
    ) -> SubstrateResult<ProcessChannel> {
        let unit = self.unit(handle)?;
        let mut env = unit.env.clone();
        env.extend(request.env);
        let mut child = spawn_process(&unit.dir, &env, &request.command)?;

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(chunk) = input_rx.recv().await {
                    if stdin.write_all(&chunk).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
                // Dropping stdin delivers EOF.
            });
        }
        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, output_tx.clone(), unit.log.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, output_tx, unit.log.clone());
        }

        let kill = unit.register_kill();
        let guard_kill = kill.clone();
        tokio::spawn(async move {
            let code = supervise(child, kill).await;
            let _ = exit_tx.send(code);
        });

        debug!(%handle, command = ?request.command, "process started");
        Ok(ProcessChannel {
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            guard: CloseGuard::new(move || guard_kill.notify_one()),
        })
    }

    async fn logs(&self, handle: &SubstrateHandle) -> SubstrateResult<mpsc::Receiver<String>> {
        Ok(self.unit(handle)?.log.follow())
    }

    async fn metrics(&self, handle: &SubstrateHandle) -> SubstrateResult<MetricSample> {
        let unit = self.unit(handle)?;
        let dir = unit.dir.clone();
        let disk_bytes = blocking(move || Ok(dir_size(&dir))).await?;
        Ok(MetricSample {
            cpu_millis: unit.resources.cpu_millis,
            memory_mb: unit.resources.memory_mb,
            disk_bytes,
            uptime_secs: unit.started.elapsed().as_secs(),
            sampled_at: epoch_secs(),
        })
    }

    async fn checkpoint(
        &self,
        handle: &SubstrateHandle,
        snapshot_id: &str,
    ) -> SubstrateResult<CheckpointRef> {
        let unit = self.unit(handle)?;
        let storage_ref = format!("{CHECKPOINT_PREFIX}{snapshot_id}");
        let dst = self.checkpoint_dir(&storage_ref)?;
        let src = unit.dir.clone();
        let size_bytes = blocking(move || {
            std::fs::create_dir_all(&dst)?;
            copy_tree(&src, &dst)
        })
        .await?;
        info!(%handle, %storage_ref, size_bytes, "checkpoint written");
        Ok(CheckpointRef {
            storage_ref,
            size_bytes,
        })
    }

    async fn delete_checkpoint(&self, storage_ref: &str) -> SubstrateResult<()> {
        let dir = self.checkpoint_dir(storage_ref)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(
        &self,
        handle: &SubstrateHandle,
        path: &str,
        data: Bytes,
    ) -> SubstrateResult<u64> {
        let unit = self.unit(handle)?;
        let target = resolve_within(&unit.dir, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;
        debug!(%handle, %path, bytes = data.len(), "file uploaded");
        Ok(data.len() as u64)
    }

    async fn download(&self, handle: &SubstrateHandle, path: &str) -> SubstrateResult<Bytes> {
        let unit = self.unit(handle)?;
        let target = resolve_within(&unit.dir, path)?;
        let data = tokio::fs::read(&target).await?;
        Ok(Bytes::from(data))
    }
}

/// Forward a process stream line by line into the unit log.
fn pump_lines(reader: impl AsyncRead + Unpin + Send + 'static, log: LogSink) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.push(line);
        }
    });
}
