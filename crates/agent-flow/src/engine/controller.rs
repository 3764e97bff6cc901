//! Level-triggered driver for the step state machine.
//!
//! Watches executions, steps and runs, maps every change to the objects
//! whose reconciliation may now produce a different result, and runs those
//! reconciliations. One object is never reconciled twice at the same time:
//! a change arriving while its reconciliation runs marks it dirty and it is
//! reconciled again afterwards. Failures are retried with backoff and a
//! periodic resync catches anything a feed missed.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Engine;
use crate::error::{AppError, AppResult};
use crate::model::{Kind, Resource, Run, Thread, WorkflowExecution, WorkflowStep};
use crate::store::{Selector, WatchEvent};

/// Settle time between passes of [`Controller::reconcile_until_idle`].
const IDLE_POLL: Duration = Duration::from_millis(5);

/// An object the controller reconciles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Execution(String),
    Step(String),
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Execution(name) => write!(f, "execution/{}", name),
            Key::Step(name) => write!(f, "step/{}", name),
        }
    }
}

enum Signal {
    Enqueue(Key),
    Finished(Key, AppResult<()>),
}

/// Drives [`Engine`] reconciliations for one namespace.
#[derive(Clone)]
pub struct Controller {
    engine: Engine,
    namespace: String,
}

impl Controller {
    pub fn new(engine: Engine, namespace: impl Into<String>) -> Self {
        Self {
            engine,
            namespace: namespace.into(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn reconcile(&self, key: &Key) -> AppResult<()> {
        match key {
            Key::Execution(name) => self.engine.reconcile_execution(&self.namespace, name).await,
            Key::Step(name) => self.engine.reconcile_step(&self.namespace, name).await,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> AppResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        let mut tasks: Vec<JoinHandle<()>> = [Kind::WorkflowExecution, Kind::WorkflowStep, Kind::Run]
            .into_iter()
            .map(|kind| self.start_feed(kind, tx.clone(), cancel.clone()))
            .collect();
        tasks.push(self.start_resync(tx.clone(), cancel.clone()));
        info!(namespace = %self.namespace, "Controller started");

        let mut in_flight: HashSet<Key> = HashSet::new();
        let mut dirty: HashSet<Key> = HashSet::new();
        let mut failures: HashMap<Key, u32> = HashMap::new();

        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            match signal {
                Signal::Enqueue(key) => {
                    if in_flight.contains(&key) {
                        dirty.insert(key);
                    } else {
                        in_flight.insert(key.clone());
                        self.start_reconcile(key, tx.clone());
                    }
                }
                Signal::Finished(key, result) => {
                    in_flight.remove(&key);
                    match result {
                        Ok(()) => {
                            failures.remove(&key);
                        }
                        Err(e) => {
                            let attempts = failures.entry(key.clone()).or_insert(0);
                            *attempts += 1;
                            let delay = self.backoff(*attempts);
                            if e.is_transient() {
                                warn!(key = %key, attempts = *attempts, error = %e, "Reconcile failed, retrying");
                            } else {
                                error!(key = %key, attempts = *attempts, error = %e, "Reconcile failed, retrying");
                            }
                            let tx = tx.clone();
                            let retry = key.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = tx.send(Signal::Enqueue(retry));
                            });
                        }
                    }
                    if dirty.remove(&key) {
                        in_flight.insert(key.clone());
                        self.start_reconcile(key, tx.clone());
                    }
                }
            }
        }

        for task in tasks {
            task.abort();
        }
        info!(namespace = %self.namespace, "Controller stopped");
        Ok(())
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let base = self.engine.config().watch_retry_delay();
        let cap = self.engine.config().resync_interval();
        base.saturating_mul(1u32 << attempts.saturating_sub(1).min(10))
            .min(cap)
    }

    fn start_reconcile(&self, key: Key, tx: mpsc::UnboundedSender<Signal>) {
        let controller = self.clone();
        tokio::spawn(async move {
            let result = controller.reconcile(&key).await;
            let _ = tx.send(Signal::Finished(key, result));
        });
    }

    /// Follow the change feed of `kind`, resuming after interruptions.
    fn start_feed(
        &self,
        kind: Kind,
        tx: mpsc::UnboundedSender<Signal>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        let retry_delay = self.engine.config().watch_retry_delay();
        tokio::spawn(async move {
            let store = controller.engine.store().clone();
            let mut resume: Option<u64> = None;
            loop {
                let mut events = match store
                    .watch(kind, &controller.namespace, Selector::everything(), resume)
                    .await
                {
                    Ok(events) => events,
                    Err(AppError::Expired(msg)) => {
                        // A fresh feed starts with every object again.
                        debug!(kind = %kind, "Watch expired, relisting: {}", msg);
                        resume = None;
                        continue;
                    }
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Watch failed");
                        if cancelled_during(&cancel, retry_delay).await {
                            return;
                        }
                        continue;
                    }
                };

                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = events.recv() => event,
                    };
                    let Some(event) = event else { break };
                    resume = Some(event.version());
                    match controller.related(event).await {
                        Ok(keys) => {
                            for key in keys {
                                let _ = tx.send(Signal::Enqueue(key));
                            }
                        }
                        Err(e) => warn!(kind = %kind, error = %e, "Failed to map change"),
                    }
                }

                if cancelled_during(&cancel, retry_delay).await {
                    return;
                }
            }
        })
    }

    fn start_resync(&self, tx: mpsc::UnboundedSender<Signal>, cancel: CancellationToken) -> JoinHandle<()> {
        let controller = self.clone();
        let interval = self.engine.config().resync_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match controller.pending_keys().await {
                    Ok(keys) => {
                        debug!(count = keys.len(), "Resync");
                        for key in keys {
                            let _ = tx.send(Signal::Enqueue(key));
                        }
                    }
                    Err(e) => warn!(error = %e, "Resync failed"),
                }
            }
        })
    }

    /// Objects whose reconciliation may change after `event`.
    async fn related(&self, event: WatchEvent) -> AppResult<Vec<Key>> {
        let mut keys = Vec::new();
        match event.object.kind {
            Kind::WorkflowExecution => {
                let execution: WorkflowExecution = event.object.into_resource()?;
                keys.push(Key::Execution(execution.metadata.name));
                if let Some(parent) = execution.spec.parent_step_name {
                    keys.push(Key::Step(parent));
                }
            }
            Kind::WorkflowStep => {
                let step: WorkflowStep = event.object.into_resource()?;
                keys.push(match &step.spec.parent_step_name {
                    Some(parent) => Key::Step(parent.clone()),
                    None => Key::Execution(step.spec.workflow_execution_name.clone()),
                });
                let dependents: Vec<WorkflowStep> = self
                    .engine
                    .store()
                    .list(
                        &self.namespace,
                        &Selector::field("spec.afterStepName", step.metadata.name.clone()),
                    )
                    .await?;
                keys.extend(dependents.into_iter().map(|s| Key::Step(s.metadata.name)));
                keys.push(Key::Step(step.metadata.name));
            }
            Kind::Run => {
                let run: Run = event.object.into_resource()?;
                if let Some(step) = run.spec.workflow_step_name {
                    keys.push(Key::Step(step));
                }
            }
            _ => {}
        }
        Ok(keys)
    }

    /// Every execution and step that is not finished yet.
    async fn pending_keys(&self) -> AppResult<Vec<Key>> {
        let store = self.engine.store();
        let executions: Vec<WorkflowExecution> =
            store.list(&self.namespace, &Selector::everything()).await?;
        let steps: Vec<WorkflowStep> = store.list(&self.namespace, &Selector::everything()).await?;
        Ok(executions
            .into_iter()
            .filter(|e| !e.status.state.is_terminal())
            .map(|e| Key::Execution(e.metadata.name))
            .chain(
                steps
                    .into_iter()
                    .filter(|s| !s.status.state.is_terminal())
                    .map(|s| Key::Step(s.metadata.name)),
            )
            .collect())
    }

    /// Reconcile everything until nothing changes any more and no run is
    /// in flight.
    ///
    /// Deterministic alternative to [`Controller::run`]; fails with
    /// `AppError::Internal` when the graph is still moving at `timeout`.
    pub async fn reconcile_until_idle(&self, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        let mut previous = None;
        loop {
            for key in self.pending_keys().await? {
                self.reconcile(&key).await?;
            }
            let fingerprint = self.fingerprint().await?;
            let busy = self.runs_in_flight().await?;
            if !busy && previous.as_ref() == Some(&fingerprint) {
                return Ok(());
            }
            previous = Some(fingerprint);
            if Instant::now() >= deadline {
                return Err(AppError::Internal(format!(
                    "namespace {} not idle after {:?}",
                    self.namespace, timeout
                )));
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    async fn fingerprint(&self) -> AppResult<Vec<(Kind, String, u64)>> {
        let store = self.engine.store();
        let everything = Selector::everything();
        let mut out = Vec::new();
        let executions: Vec<WorkflowExecution> = store.list(&self.namespace, &everything).await?;
        out.extend(executions.iter().map(version_of));
        let steps: Vec<WorkflowStep> = store.list(&self.namespace, &everything).await?;
        out.extend(steps.iter().map(version_of));
        let runs: Vec<Run> = store.list(&self.namespace, &everything).await?;
        out.extend(runs.iter().map(version_of));
        let threads: Vec<Thread> = store.list(&self.namespace, &everything).await?;
        out.extend(threads.iter().map(version_of));
        out.sort();
        Ok(out)
    }

    async fn runs_in_flight(&self) -> AppResult<bool> {
        let runs: Vec<Run> = self
            .engine
            .store()
            .list(&self.namespace, &Selector::everything())
            .await?;
        Ok(runs.iter().any(|r| !r.status.state.is_terminal()))
    }
}

/// Sleep for `delay`; true when `cancel` fired first.
async fn cancelled_during(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn version_of<T: Resource>(object: &T) -> (Kind, String, u64) {
    (T::KIND, object.name().to_string(), object.meta().resource_version)
}
