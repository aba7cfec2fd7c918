//! Live ingestion for one execution: a push subscription plus a fixed-interval
//! poll, both feeding the same timeline through `upsert`.
//!
//! The poll runs for as long as the execution is active, not only after the
//! push channel fails. Push delivery is neither exactly-once nor ordered, and
//! since both producers go through the idempotent upsert a double delivery is
//! harmless.
//!
//! ```text
//! Idle --(status pending|queued|running)--> Connecting --(socket open)--> Live
//! Connecting|Live --(socket error/EOF)--> FallbackPolling
//! * --(terminal status | close() | drop)--> Closed
//! ```

use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::history::{fetch_history, fetch_progress};
use crate::backend::{Backend, BackendError, PushStream, PushTransport};
use crate::execution::{ExecutionMeta, ExecutionRef, ExecutionStatus};
use crate::normalizer::wire::RunCompleted;
use crate::normalizer::{EventNormalizer, Normalized};
use crate::timeline::{TimelineEvent, TimelineSnapshot, TimelineStore};

/// Default poll period while an execution is active.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Execution not active yet; no I/O.
    Idle,
    /// Polling, and the push connection is being opened.
    Connecting,
    /// Polling, and the push connection is open.
    Live,
    /// Push connection failed or ended; polling alone keeps the timeline current.
    FallbackPolling,
    /// Torn down. Nothing further is applied.
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub poll_interval: Duration,
    /// Fetch steps one last time after the push channel reports completion.
    pub final_sync: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            final_sync: true,
        }
    }
}

/// What the owner sees: published after every change.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub status: ExecutionStatus,
    pub meta: Option<ExecutionMeta>,
    pub timeline: TimelineSnapshot,
}

enum Command {
    Status(ExecutionStatus),
}

/// Handle to one execution's ingestion task. The task exclusively owns the
/// timeline store; the handle only reads published snapshots.
///
/// Dropping the handle tears the channel down.
pub struct RunChannel {
    execution: ExecutionRef,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ChannelSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RunChannel {
    pub fn spawn(
        execution: ExecutionRef,
        status: ExecutionStatus,
        backend: Arc<dyn Backend>,
        push: Arc<dyn PushTransport>,
        config: ChannelConfig,
    ) -> Self {
        let normalizer = EventNormalizer::new(execution.id.clone());
        Self::spawn_with_normalizer(execution, status, backend, push, config, normalizer)
    }

    /// Like [`RunChannel::spawn`], with a caller-supplied normalizer (e.g. a
    /// seeded one for reproducible ids).
    pub fn spawn_with_normalizer(
        execution: ExecutionRef,
        status: ExecutionStatus,
        backend: Arc<dyn Backend>,
        push: Arc<dyn PushTransport>,
        config: ChannelConfig,
        normalizer: EventNormalizer,
    ) -> Self {
        let store = TimelineStore::new(execution.id.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot {
            state: ChannelState::Idle,
            status,
            meta: None,
            timeline: store.snapshot(),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = Worker {
            execution: execution.clone(),
            backend,
            push,
            config,
            normalizer,
            store,
            state: ChannelState::Idle,
            status,
            meta: None,
            snapshots: snapshot_tx,
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            execution,
            commands: command_tx,
            snapshots: snapshot_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn execution(&self) -> &ExecutionRef {
        &self.execution
    }

    pub fn state(&self) -> ChannelState {
        self.snapshots.borrow().state
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshots.clone()
    }

    /// Tell the channel the owner observed a new status (e.g. from its own
    /// detail fetch). Entering an active status starts ingestion; a terminal
    /// status closes the channel.
    pub fn update_status(&self, status: ExecutionStatus) {
        if self.commands.send(Command::Status(status)).is_err() {
            debug!(execution = %self.execution, %status, "status update after channel closed");
        }
    }

    /// Tear down and wait for the task to finish. The last snapshot stays
    /// readable from any receiver obtained via [`RunChannel::subscribe`].
    pub async fn close(mut self) -> ChannelSnapshot {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(execution = %self.execution, error = %e, "channel task ended abnormally");
            }
        }
        self.snapshots.borrow().clone()
    }
}

impl Drop for RunChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<PushStream, BackendError>> + Send>>;

struct Worker {
    execution: ExecutionRef,
    backend: Arc<dyn Backend>,
    push: Arc<dyn PushTransport>,
    config: ChannelConfig,
    normalizer: EventNormalizer,
    store: TimelineStore,
    state: ChannelState,
    status: ExecutionStatus,
    meta: Option<ExecutionMeta>,
    snapshots: watch::Sender<ChannelSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        if self.wait_until_active().await {
            self.run_active().await;
        }
        self.set_state(ChannelState::Closed);
        info!(execution = %self.execution, status = %self.status, "channel closed");
    }

    /// Returns false if the channel should close without ever going active.
    async fn wait_until_active(&mut self) -> bool {
        loop {
            if self.status.is_active() {
                return true;
            }
            if self.status.is_terminal() {
                return false;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Status(status)) => self.set_status(status),
                    None => return false,
                },
            }
        }
    }

    async fn run_active(&mut self) {
        self.set_state(ChannelState::Connecting);
        info!(execution = %self.execution, status = %self.status, "channel active");

        let push = Arc::clone(&self.push);
        let exec = self.execution.clone();
        let mut connecting: Option<ConnectFuture> = Some(Box::pin(async move { push.subscribe(&exec).await }));
        let mut stream: Option<PushStream> = None;
        let mut hydrated = false;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Status(status)) => {
                        self.set_status(status);
                        if status.is_terminal() {
                            break;
                        }
                    }
                    None => break,
                },

                _ = ticker.tick() => {
                    if !self.poll(&mut hydrated).await || self.status.is_terminal() {
                        break;
                    }
                }

                res = wait_connected(&mut connecting) => {
                    connecting = None;
                    match res {
                        Ok(s) => {
                            stream = Some(s);
                            self.set_state(ChannelState::Live);
                        }
                        Err(e) => {
                            warn!(execution = %self.execution, error = %e, "push channel unavailable, polling only");
                            self.set_state(ChannelState::FallbackPolling);
                        }
                    }
                }

                frame = next_frame(&mut stream) => match frame {
                    Some(Ok(text)) => {
                        if let Some(done) = self.on_frame(&text) {
                            self.on_completed(done).await;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(execution = %self.execution, error = %e, "push channel error, polling only");
                        stream = None;
                        self.set_state(ChannelState::FallbackPolling);
                    }
                    None => {
                        debug!(execution = %self.execution, "push channel ended, polling only");
                        stream = None;
                        self.set_state(ChannelState::FallbackPolling);
                    }
                },
            }
        }
        // Dropping the stream closes the socket; the ticker goes with this frame.
        drop(stream);
    }

    /// One poll tick. The first tick loads full history. While the push
    /// channel is live, later ticks only fetch detail and steps, because
    /// network and console entries arrive over the socket. Without a socket
    /// every tick loads full history, and persisted ids keep it de-duplicated.
    /// Returns false if cancelled mid-fetch.
    async fn poll(&mut self, hydrated: &mut bool) -> bool {
        if !*hydrated || self.state == ChannelState::FallbackPolling {
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                res = fetch_history(self.backend.as_ref(), &self.execution) => res,
            };
            match fetched {
                Ok(history) => {
                    *hydrated = true;
                    self.set_meta(history.meta.clone());
                    let events = history.into_events(&self.execution);
                    self.ingest_all(events);
                }
                Err(e) => warn!(execution = %self.execution, error = %e, "history fetch failed"),
            }
            return true;
        }

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            res = fetch_progress(self.backend.as_ref(), &self.execution) => res,
        };
        match fetched {
            Ok(progress) => {
                let events = progress.step_events(&self.execution);
                self.set_meta(progress.meta);
                self.ingest_all(events);
            }
            Err(e) => warn!(execution = %self.execution, error = %e, "poll failed"),
        }
        true
    }

    /// Handle one push frame. Returns the completion payload if the frame
    /// ends the execution.
    fn on_frame(&mut self, text: &str) -> Option<RunCompleted> {
        match self.normalizer.normalize_text(text) {
            Ok(Normalized::Event(event)) => {
                self.ingest(event);
                None
            }
            Ok(Normalized::Completed(done)) if done.status.is_terminal() => Some(done),
            Ok(Normalized::Completed(done)) => {
                self.set_status(done.status);
                None
            }
            Ok(Normalized::Ignore) => None,
            Err(e) => {
                warn!(execution = %self.execution, error = %e, "dropping malformed push message");
                None
            }
        }
    }

    async fn on_completed(&mut self, done: RunCompleted) {
        if let Some(mut meta) = self.meta.clone() {
            meta.status = done.status;
            meta.completed_at = done.completed_at.or(meta.completed_at);
            meta.counters = done.counters;
            self.set_meta(meta);
        }
        if self.config.final_sync {
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => None,
                res = self.backend.fetch_steps(&self.execution) => Some(res),
            };
            match fetched {
                Some(Ok(steps)) => {
                    let events = steps
                        .into_iter()
                        .map(|s| TimelineEvent::step(self.execution.id.clone(), s))
                        .collect();
                    self.ingest_all(events);
                }
                Some(Err(e)) => warn!(execution = %self.execution, error = %e, "final sync failed"),
                None => {}
            }
        }
        self.set_status(done.status);
    }

    fn ingest(&mut self, event: TimelineEvent) {
        self.ingest_all(vec![event]);
    }

    fn ingest_all(&mut self, events: Vec<TimelineEvent>) {
        if self.state == ChannelState::Closed {
            debug!(execution = %self.execution, dropped = events.len(), "channel closed, dropping events");
            return;
        }
        let mut changed = false;
        for event in events {
            changed |= self.store.upsert(event).changed();
        }
        if changed {
            self.publish();
        }
    }

    fn set_meta(&mut self, meta: ExecutionMeta) {
        if self.meta.as_ref() == Some(&meta) {
            return;
        }
        let status = meta.status;
        self.meta = Some(meta);
        if self.status == status {
            self.publish();
        } else {
            self.set_status(status);
        }
    }

    fn set_status(&mut self, status: ExecutionStatus) {
        if self.status != status {
            debug!(execution = %self.execution, from = %self.status, to = %status, "status changed");
            self.status = status;
            self.publish();
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!(execution = %self.execution, from = ?self.state, to = ?state, "channel state");
            self.state = state;
            self.publish();
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(ChannelSnapshot {
            state: self.state,
            status: self.status,
            meta: self.meta.clone(),
            timeline: self.store.snapshot(),
        });
    }
}

async fn wait_connected(connecting: &mut Option<ConnectFuture>) -> Result<PushStream, BackendError> {
    match connecting {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_frame(stream: &mut Option<PushStream>) -> Option<Result<String, BackendError>> {
    match stream {
        Some(s) => s.next().await,
        None => pending().await,
    }
}
