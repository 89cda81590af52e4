//! In-memory substrate for tests.
//!
//! Units are maps of files; exec starts an echo process that writes every
//! input chunk back to its output and exits with 0 once input closes.
//! Failures can be queued per operation, and counters expose how often each
//! operation ran and how many process channels are currently open.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};

use skiff_core::{SubstrateHandle, epoch_secs};

use crate::channel::{CloseGuard, ProcessChannel};
use crate::error::{SubstrateError, SubstrateResult};
use crate::types::*;
use crate::Substrate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Provision,
    WaitReady,
    Teardown,
    Exec,
    Checkpoint,
}

struct FakeUnit {
    spec: ProvisionSpec,
    files: HashMap<String, Bytes>,
    log: broadcast::Sender<String>,
    kills: Vec<Arc<Notify>>,
}

#[derive(Default)]
struct FakeState {
    units: HashMap<String, FakeUnit>,
    checkpoints: HashMap<String, HashMap<String, Bytes>>,
    failures: HashMap<Op, VecDeque<SubstrateError>>,
    calls: HashMap<Op, usize>,
    torn_down: Vec<String>,
}

#[derive(Default)]
pub struct FakeSubstrate {
    state: Mutex<FakeState>,
    open_channels: Arc<AtomicUsize>,
    provision_delay: Mutex<Option<Duration>>,
    checkpoint_delay: Mutex<Option<Duration>>,
    checkpoints_in_flight: AtomicUsize,
    peak_checkpoints_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `op` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: Op, error: SubstrateError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Delay every provision by `delay` (after the unit is recorded).
    pub fn set_provision_delay(&self, delay: Duration) {
        *self
            .provision_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Hold every checkpoint open for `delay` before capturing files.
    pub fn set_checkpoint_delay(&self, delay: Duration) {
        *self
            .checkpoint_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Most checkpoints ever running at the same time.
    pub fn peak_checkpoints_in_flight(&self) -> usize {
        self.peak_checkpoints_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn open_channels(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }

    pub fn unit_exists(&self, handle: &SubstrateHandle) -> bool {
        self.lock().units.contains_key(handle.as_str())
    }

    pub fn unit_count(&self) -> usize {
        self.lock().units.len()
    }

    /// Handles torn down so far, in order, including unknown ones.
    pub fn torn_down(&self) -> Vec<String> {
        self.lock().torn_down.clone()
    }

    pub fn provisioned_spec(&self, handle: &SubstrateHandle) -> Option<ProvisionSpec> {
        self.lock()
            .units
            .get(handle.as_str())
            .map(|u| u.spec.clone())
    }

    /// Append a line to a unit's log.
    pub fn emit_log(&self, handle: &SubstrateHandle, line: &str) {
        if let Some(unit) = self.lock().units.get(handle.as_str()) {
            let _ = unit.log.send(line.to_string());
        }
    }

    fn record(&self, op: Op) -> SubstrateResult<()> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn missing(handle: &SubstrateHandle) -> SubstrateError {
        SubstrateError::NotFound(format!("unit {handle}"))
    }
}

#[async_trait]
impl Substrate for FakeSubstrate {
    async fn provision(
        &self,
        handle: &SubstrateHandle,
        spec: &ProvisionSpec,
    ) -> SubstrateResult<()> {
        self.record(Op::Provision)?;
        {
            let mut state = self.lock();
            if !state.units.contains_key(handle.as_str()) {
                let files = match &spec.seed {
                    Some(seed) => state
                        .checkpoints
                        .get(&seed.storage_ref)
                        .cloned()
                        .ok_or_else(|| SubstrateError::NotFound(seed.storage_ref.clone()))?,
                    None => HashMap::new(),
                };
                let (log, _) = broadcast::channel(1024);
                state.units.insert(
                    handle.as_str().to_string(),
                    FakeUnit {
                        spec: spec.clone(),
                        files,
                        log,
                        kills: Vec::new(),
                    },
                );
            }
        }
        let delay = *self
            .provision_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn wait_ready(&self, handle: &SubstrateHandle) -> SubstrateResult<()> {
        self.record(Op::WaitReady)?;
        if self.unit_exists(handle) {
            Ok(())
        } else {
            Err(Self::missing(handle))
        }
    }

    async fn teardown(&self, handle: &SubstrateHandle) -> SubstrateResult<()> {
        self.record(Op::Teardown)?;
        let mut state = self.lock();
        state.torn_down.push(handle.as_str().to_string());
        if let Some(unit) = state.units.remove(handle.as_str()) {
            for kill in unit.kills {
                kill.notify_one();
            }
        }
        Ok(())
    }

    async fn inspect(&self, handle: &SubstrateHandle) -> SubstrateResult<UnitStatus> {
        if !self.unit_exists(handle) {
            return Err(Self::missing(handle));
        }
        Ok(UnitStatus {
            phase: UnitPhase::Running,
            ready: true,
            machine_id: Some("fake-0".to_string()),
        })
    }

    async fn exec(
        &self,
        handle: &SubstrateHandle,
        request: ExecRequest,
    ) -> SubstrateResult<ProcessChannel> {
        self.record(Op::Exec)?;
        let kill = Arc::new(Notify::new());
        {
            let mut state = self.lock();
            let unit = state
                .units
                .get_mut(handle.as_str())
                .ok_or_else(|| Self::missing(handle))?;
            unit.kills.push(kill.clone());
        }

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(8);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(8);
        let (exit_tx, exit_rx) = oneshot::channel();

        // `["exit", code]` exits immediately; anything else echoes.
        let immediate_exit = match request.command.as_slice() {
            [cmd, code] if cmd == "exit" => code.parse::<i32>().ok(),
            _ => None,
        };

        let process_kill = kill.clone();
        tokio::spawn(async move {
            if let Some(code) = immediate_exit {
                let _ = exit_tx.send(code);
                return;
            }
            let code = loop {
                tokio::select! {
                    chunk = input_rx.recv() => match chunk {
                        Some(chunk) => {
                            if output_tx.send(chunk).await.is_err() {
                                break -1;
                            }
                        }
                        None => break 0,
                    },
                    _ = process_kill.notified() => break -1,
                }
            };
            drop(output_tx);
            let _ = exit_tx.send(code);
        });

        self.open_channels.fetch_add(1, Ordering::SeqCst);
        let open = self.open_channels.clone();
        Ok(ProcessChannel {
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            guard: CloseGuard::new(move || {
                kill.notify_one();
                open.fetch_sub(1, Ordering::SeqCst);
            }),
        })
    }

    async fn logs(&self, handle: &SubstrateHandle) -> SubstrateResult<mpsc::Receiver<String>> {
        let mut live = {
            let state = self.lock();
            let unit = state
                .units
                .get(handle.as_str())
                .ok_or_else(|| Self::missing(handle))?;
            unit.log.subscribe()
        };
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            loop {
                match live.recv().await {
                    Ok(line) => {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }

    async fn metrics(&self, handle: &SubstrateHandle) -> SubstrateResult<MetricSample> {
        let state = self.lock();
        let unit = state
            .units
            .get(handle.as_str())
            .ok_or_else(|| Self::missing(handle))?;
        Ok(MetricSample {
            cpu_millis: unit.spec.resources.cpu_millis,
            memory_mb: unit.spec.resources.memory_mb,
            disk_bytes: unit.files.values().map(|f| f.len() as u64).sum(),
            uptime_secs: 0,
            sampled_at: epoch_secs(),
        })
    }

    async fn checkpoint(
        &self,
        handle: &SubstrateHandle,
        snapshot_id: &str,
    ) -> SubstrateResult<CheckpointRef> {
        self.record(Op::Checkpoint)?;
        let running = self.checkpoints_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.checkpoints_in_flight);
        self.peak_checkpoints_in_flight
            .fetch_max(running, Ordering::SeqCst);
        let delay = *self
            .checkpoint_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        let files = state
            .units
            .get(handle.as_str())
            .ok_or_else(|| Self::missing(handle))?
            .files
            .clone();
        let storage_ref = format!("fake://{snapshot_id}");
        let size_bytes = files.values().map(|f| f.len() as u64).sum();
        state.checkpoints.insert(storage_ref.clone(), files);
        Ok(CheckpointRef {
            storage_ref,
            size_bytes,
        })
    }

    async fn delete_checkpoint(&self, storage_ref: &str) -> SubstrateResult<()> {
        self.lock().checkpoints.remove(storage_ref);
        Ok(())
    }

    async fn upload(
        &self,
        handle: &SubstrateHandle,
        path: &str,
        data: Bytes,
    ) -> SubstrateResult<u64> {
        if path.split('/').any(|c| c == "..") {
            return Err(SubstrateError::Rejected(format!("path escapes workload root: {path}")));
        }
        let mut state = self.lock();
        let unit = state
            .units
            .get_mut(handle.as_str())
            .ok_or_else(|| Self::missing(handle))?;
        let len = data.len() as u64;
        unit.files
            .insert(path.trim_start_matches('/').to_string(), data);
        Ok(len)
    }

    async fn download(&self, handle: &SubstrateHandle, path: &str) -> SubstrateResult<Bytes> {
        let state = self.lock();
        let unit = state
            .units
            .get(handle.as_str())
            .ok_or_else(|| Self::missing(handle))?;
        unit.files
            .get(path.trim_start_matches('/'))
            .cloned()
            .ok_or_else(|| SubstrateError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SubstrateHandle {
        SubstrateHandle::new("skiff-w-1")
    }

    #[tokio::test]
    async fn queued_failures_are_consumed_in_order() {
        let fake = FakeSubstrate::new();
        fake.fail_next(Op::Provision, SubstrateError::Transient("busy".to_string()));
        fake.fail_next(Op::Provision, SubstrateError::Fatal("bad image".to_string()));

        let spec = ProvisionSpec::default();
        assert!(fake.provision(&handle(), &spec).await.unwrap_err().is_transient());
        assert!(!fake.provision(&handle(), &spec).await.unwrap_err().is_transient());
        fake.provision(&handle(), &spec).await.unwrap();
        assert_eq!(fake.calls(Op::Provision), 3);
        assert!(fake.unit_exists(&handle()));
    }

    #[tokio::test]
    async fn echo_channel_counts_open_and_closed() {
        let fake = FakeSubstrate::new();
        fake.provision(&handle(), &ProvisionSpec::default()).await.unwrap();

        let mut channel = fake.exec(&handle(), ExecRequest::default()).await.unwrap();
        assert_eq!(fake.open_channels(), 1);
        channel.input.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(channel.output.recv().await.unwrap(), Bytes::from_static(b"hi"));

        let ProcessChannel { exit, guard, .. } = channel;
        drop(guard);
        assert_eq!(exit.await.unwrap(), -1);
        assert_eq!(fake.open_channels(), 0);
    }

    #[tokio::test]
    async fn teardown_kills_processes_and_is_idempotent() {
        let fake = FakeSubstrate::new();
        fake.provision(&handle(), &ProvisionSpec::default()).await.unwrap();
        let channel = fake.exec(&handle(), ExecRequest::default()).await.unwrap();

        fake.teardown(&handle()).await.unwrap();
        fake.teardown(&handle()).await.unwrap();
        assert_eq!(channel.exit.await.unwrap(), -1);
        assert_eq!(fake.torn_down().len(), 2);
        assert!(!fake.unit_exists(&handle()));
    }

    #[tokio::test]
    async fn checkpoint_then_seeded_provision() {
        let fake = FakeSubstrate::new();
        fake.provision(&handle(), &ProvisionSpec::default()).await.unwrap();
        fake.upload(&handle(), "/a.txt", Bytes::from_static(b"xyz")).await.unwrap();
        let checkpoint = fake.checkpoint(&handle(), "s-1").await.unwrap();
        assert_eq!(checkpoint.size_bytes, 3);

        let restored = SubstrateHandle::new("skiff-w-2");
        let spec = ProvisionSpec {
            seed: Some(checkpoint),
            ..Default::default()
        };
        fake.provision(&restored, &spec).await.unwrap();
        assert_eq!(
            fake.download(&restored, "a.txt").await.unwrap(),
            Bytes::from_static(b"xyz")
        );
    }

    #[tokio::test]
    async fn emitted_logs_reach_followers() {
        let fake = FakeSubstrate::new();
        fake.provision(&handle(), &ProvisionSpec::default()).await.unwrap();
        let mut logs = fake.logs(&handle()).await.unwrap();
        fake.emit_log(&handle(), "booted");
        assert_eq!(logs.recv().await.unwrap(), "booted");
    }
}
