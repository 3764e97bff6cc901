//! Per-run live logs plus durable replay.
//!
//! A run in flight appends entries to an in-memory log. Each watcher merges
//! two sources into one channel: the live log, read from its own cursor and
//! woken by a length counter on every append, and a store watch on the
//! run's `RunState`. Both feed one [`CallTracker`] per watcher, so content
//! seen on one path is never repeated on the other. The durable record
//! decides when and how a run finished; the live log only lowers latency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::FlowConfig;
use crate::error::{AppError, AppResult};
use crate::invoker::CallTracker;
use crate::model::{Kind, Progress, Run, RunState, Thread};
use crate::runtime::{CallFrames, Program};
use crate::store::{Selector, StoreClient, WatchEventKind};

const CHANNEL_SIZE: usize = 256;

/// One entry of a run's live log.
#[derive(Debug, Clone)]
pub enum LiveEntry {
    /// Cumulative program and call frames at some point of the run.
    Snapshot {
        program: Arc<Program>,
        frames: Arc<CallFrames>,
    },
    /// A frame that is not derived from call output (prompts, errors).
    Progress(Progress),
    Done { error: Option<String> },
}

struct LiveLog {
    entries: Mutex<Vec<LiveEntry>>,
    len: watch::Sender<usize>,
}

impl LiveLog {
    fn new() -> Self {
        let (len, _) = watch::channel(0);
        Self {
            entries: Mutex::new(Vec::new()),
            len,
        }
    }

    fn append(&self, entry: LiveEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push(entry);
        self.len.send_replace(entries.len());
    }

    fn since(&self, cursor: usize) -> Vec<LiveEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(cursor..).map(<[_]>::to_vec).unwrap_or_default()
    }
}

/// What a watcher wants to follow.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Run to follow. Defaults to the thread's latest run.
    pub run_name: Option<String>,
    pub thread_name: Option<String>,
    /// Replay the earlier runs of the conversation first, oldest first.
    pub history: bool,
    /// Stops the watch. Never affects the run itself.
    pub cancel: CancellationToken,
}

enum Source {
    Live(LiveEntry),
    Durable(Box<RunState>),
}

enum Outcome {
    Finished,
    Failed,
    Stopped,
}

/// Owns the live logs of the runs produced by this process.
#[derive(Clone)]
pub struct Emitter {
    store: StoreClient,
    config: FlowConfig,
    logs: Arc<Mutex<HashMap<String, Arc<LiveLog>>>>,
}

impl Emitter {
    pub fn new(store: StoreClient, config: FlowConfig) -> Self {
        Self {
            store,
            config,
            logs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn logs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<LiveLog>>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_for(&self, run_name: &str) -> Arc<LiveLog> {
        self.logs()
            .entry(run_name.to_string())
            .or_insert_with(|| Arc::new(LiveLog::new()))
            .clone()
    }

    /// Open the live log of a run about to start.
    pub fn start_run(&self, run_name: &str) {
        self.log_for(run_name);
    }

    pub fn snapshot(&self, run_name: &str, program: Program, frames: CallFrames) {
        self.log_for(run_name).append(LiveEntry::Snapshot {
            program: Arc::new(program),
            frames: Arc::new(frames),
        });
    }

    pub fn progress(&self, run_name: &str, progress: Progress) {
        self.log_for(run_name).append(LiveEntry::Progress(progress));
    }

    /// Close the live log and drop it once the retention period passed.
    pub fn finish(&self, run_name: &str, error: Option<String>) {
        let log = self.log_for(run_name);
        log.append(LiveEntry::Done { error });

        let logs = self.logs.clone();
        let run_name = run_name.to_string();
        let retention = self.config.live_retention();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut logs = logs.lock().unwrap_or_else(PoisonError::into_inner);
            if logs.get(&run_name).is_some_and(|l| Arc::ptr_eq(l, &log)) {
                logs.remove(&run_name);
                debug!(run = %run_name, "Dropped live log");
            }
        });
    }

    /// Whether a live log is currently held for `run_name`.
    pub fn has_live(&self, run_name: &str) -> bool {
        self.logs().contains_key(run_name)
    }

    /// Stream the progress of a run.
    ///
    /// The channel closes when the run is done, when `opts.cancel` fires,
    /// or when the receiver is dropped.
    pub async fn watch(
        &self,
        namespace: &str,
        opts: WatchOptions,
    ) -> AppResult<mpsc::Receiver<Progress>> {
        let target = match (&opts.run_name, &opts.thread_name) {
            (Some(run), _) => run.clone(),
            (None, Some(thread)) => {
                let thread: Thread = self.store.get(namespace, thread).await?;
                thread.status.last_run_name.ok_or_else(|| {
                    AppError::NotFound(format!("thread {} has no runs", thread.metadata.name))
                })?
            }
            (None, None) => {
                return Err(AppError::Validation(
                    "watch needs a run or a thread".to_string(),
                ))
            }
        };

        let chain = if opts.history {
            self.history(namespace, &target).await?
        } else {
            vec![target]
        };

        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        let emitter = self.clone();
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            for run_name in chain {
                match emitter.follow(&namespace, &run_name, &tx, &opts.cancel).await {
                    Outcome::Stopped => return,
                    // Earlier turns that failed still belong to the conversation.
                    Outcome::Finished | Outcome::Failed => {}
                }
            }
        });
        Ok(rx)
    }

    /// `target` and its predecessors, oldest first.
    async fn history(&self, namespace: &str, target: &str) -> AppResult<Vec<String>> {
        let mut chain = vec![target.to_string()];
        let mut cursor = target.to_string();
        while let Some(run) = self.store.find::<Run>(namespace, &cursor).await? {
            match run.spec.previous_run_name {
                Some(previous) if !chain.contains(&previous) => {
                    chain.push(previous.clone());
                    cursor = previous;
                }
                _ => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }

    async fn follow(
        &self,
        namespace: &str,
        run_name: &str,
        tx: &mpsc::Sender<Progress>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let sources = cancel.child_token();
        let (merged_tx, mut merged) = mpsc::channel(CHANNEL_SIZE);

        let live = self.logs().get(run_name).cloned();
        if let Some(log) = live {
            tokio::spawn(live_path(log, merged_tx.clone(), sources.clone()));
        }
        tokio::spawn(durable_path(
            self.store.clone(),
            namespace.to_string(),
            run_name.to_string(),
            self.config.watch_retry_delay(),
            merged_tx,
            sources.clone(),
        ));

        let mut tracker = CallTracker::new();
        let outcome = loop {
            let source = tokio::select! {
                _ = cancel.cancelled() => break Outcome::Stopped,
                _ = tx.closed() => break Outcome::Stopped,
                source = merged.recv() => source,
            };

            let (frames, done) = match source {
                None => break Outcome::Stopped,
                Some(Source::Live(LiveEntry::Snapshot { program, frames })) => {
                    (tracker.frames(run_name, &program, &frames), None)
                }
                Some(Source::Live(LiveEntry::Progress(progress))) => (vec![progress], None),
                Some(Source::Live(LiveEntry::Done { error })) => (Vec::new(), Some(error)),
                Some(Source::Durable(state)) => match decode_state(&state) {
                    Ok((program, frames)) => {
                        let out = tracker.frames(run_name, &program, &frames);
                        let done = state.spec.done.then(|| state.spec.error.clone());
                        (out, done)
                    }
                    Err(e) => (
                        vec![Progress::error(
                            run_name,
                            format!("failed to decode run state: {}", e),
                        )],
                        Some(None),
                    ),
                },
            };

            if !send_all(tx, frames).await {
                break Outcome::Stopped;
            }
            if let Some(error) = done {
                let mut tail = tracker.flush(run_name);
                if let Some(message) = &error {
                    tail.push(Progress::error(run_name, message.clone()));
                }
                if !send_all(tx, tail).await {
                    break Outcome::Stopped;
                }
                break if error.is_some() {
                    Outcome::Failed
                } else {
                    Outcome::Finished
                };
            }
        };

        sources.cancel();
        outcome
    }
}

async fn send_all(tx: &mpsc::Sender<Progress>, frames: Vec<Progress>) -> bool {
    for frame in frames {
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

fn decode_state(state: &RunState) -> AppResult<(Program, CallFrames)> {
    let program = match &state.spec.program {
        Some(blob) => blob.decode()?,
        None => Program::default(),
    };
    let frames = match &state.spec.call_frame {
        Some(blob) => blob.decode()?,
        None => CallFrames::new(),
    };
    Ok((program, frames))
}

/// Forwards unseen live entries until `Done`.
async fn live_path(log: Arc<LiveLog>, out: mpsc::Sender<Source>, cancel: CancellationToken) {
    let mut changed = log.len.subscribe();
    let mut cursor = 0;
    loop {
        let entries = log.since(cursor);
        cursor += entries.len();
        for entry in entries {
            let done = matches!(entry, LiveEntry::Done { .. });
            if out.send(Source::Live(entry)).await.is_err() || done {
                return;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = changed.changed() => {
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

/// Forwards `RunState` changes, re-establishing the watch when it closes.
async fn durable_path(
    store: StoreClient,
    namespace: String,
    run_name: String,
    retry_delay: std::time::Duration,
    out: mpsc::Sender<Source>,
    cancel: CancellationToken,
) {
    let mut version: Option<u64> = None;
    loop {
        let watched = tokio::select! {
            _ = cancel.cancelled() => return,
            watched = store.watch(Kind::RunState, &namespace, Selector::name(run_name.clone()), version) => watched,
        };

        match watched {
            Ok(mut events) => loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    debug!(run = %run_name, "Run state watch closed, re-establishing");
                    break;
                };
                version = Some(event.version());
                if event.kind == WatchEventKind::Deleted {
                    continue;
                }
                let state = match event.object.into_resource::<RunState>() {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(run = %run_name, error = %e, "Malformed run state record");
                        continue;
                    }
                };
                let done = state.spec.done;
                if out.send(Source::Durable(Box::new(state))).await.is_err() || done {
                    return;
                }
            },
            Err(AppError::Expired(_)) => {
                debug!(run = %run_name, "Run state watch expired, restarting from current state");
                version = None;
                continue;
            }
            Err(e) => {
                warn!(run = %run_name, error = %e, "Run state watch failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressedBlob;
    use crate::model::{ObjectMeta, RunSpec, RunStateSpec, RunStatus};
    use crate::runtime::{CallFrame, CallOutput};
    use crate::store::MemoryStore;

    fn setup() -> (StoreClient, Emitter) {
        let store = StoreClient::new(Arc::new(MemoryStore::new()));
        let config = FlowConfig {
            watch_retry_delay_ms: 10,
            live_retention_secs: 1,
            ..FlowConfig::default()
        };
        (store.clone(), Emitter::new(store, config))
    }

    fn frames(content: &str) -> CallFrames {
        let mut frames = CallFrames::new();
        frames.insert(
            "c1".into(),
            CallFrame {
                id: "c1".into(),
                parent_id: None,
                tool_name: "chat".into(),
                input: String::new(),
                output: vec![CallOutput {
                    content: content.into(),
                    ..Default::default()
                }],
            },
        );
        frames
    }

    fn run_state(run: &str, content: &str, done: bool, error: Option<&str>) -> RunState {
        RunState {
            metadata: ObjectMeta::named("default", run),
            spec: RunStateSpec {
                thread_name: "t1".into(),
                program: Some(CompressedBlob::encode(&Program::default()).unwrap()),
                call_frame: Some(CompressedBlob::encode(&frames(content)).unwrap()),
                chat_state: None,
                done,
                error: error.map(str::to_string),
            },
        }
    }

    async fn save(store: &StoreClient, state: RunState) {
        match store.find::<RunState>("default", &state.metadata.name).await.unwrap() {
            None => {
                store.create(&state).await.unwrap();
            }
            Some(mut existing) => {
                existing.spec = state.spec;
                store.update(&existing).await.unwrap();
            }
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Progress>) -> Vec<Progress> {
        let mut out = Vec::new();
        while let Some(p) = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
        {
            out.push(p);
        }
        out
    }

    fn text(frames: &[Progress]) -> String {
        frames.iter().map(|p| p.content.as_str()).collect()
    }

    fn watch_run(run: &str) -> WatchOptions {
        WatchOptions {
            run_name: Some(run.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_duplicates_across_paths() {
        let (store, emitter) = setup();
        emitter.start_run("r1");
        emitter.snapshot("r1", Program::default(), frames("Hello"));
        save(&store, run_state("r1", "Hello", false, None)).await;

        let rx = emitter.watch("default", watch_run("r1")).await.unwrap();

        emitter.snapshot("r1", Program::default(), frames("Hello world"));
        save(&store, run_state("r1", "Hello world", false, None)).await;
        save(&store, run_state("r1", "Hello world!", true, None)).await;
        emitter.snapshot("r1", Program::default(), frames("Hello world!"));
        emitter.finish("r1", None);

        let out = collect(rx).await;
        assert_eq!(text(&out), "Hello world!");
        assert!(out.iter().all(|p| p.error.is_none()));
    }

    #[tokio::test]
    async fn test_replay_after_done_uses_durable_path() {
        let (store, emitter) = setup();
        save(&store, run_state("r1", "All done", true, None)).await;
        assert!(!emitter.has_live("r1"));

        let out = collect(emitter.watch("default", watch_run("r1")).await.unwrap()).await;
        assert_eq!(text(&out), "All done");
    }

    #[tokio::test]
    async fn test_done_with_error_ends_with_error_frame() {
        let (store, emitter) = setup();
        let rx = emitter.watch("default", watch_run("r1")).await.unwrap();
        save(&store, run_state("r1", "partial", false, None)).await;
        save(&store, run_state("r1", "partial", true, Some("boom"))).await;

        let out = collect(rx).await;
        assert_eq!(text(&out), "partial");
        assert_eq!(out.last().unwrap().error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_corrupt_state_ends_stream() {
        let (store, emitter) = setup();
        let mut state = run_state("r1", "x", false, None);
        // Valid blob, but not a call frame map.
        state.spec.call_frame = Some(CompressedBlob::from_text("not json").unwrap());
        save(&store, state).await;

        let out = collect(emitter.watch("default", watch_run("r1")).await.unwrap()).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].error.as_deref().unwrap().contains("decode"));
    }

    #[tokio::test]
    async fn test_history_replays_oldest_first() {
        let (store, emitter) = setup();
        for (name, previous, content) in [("r1", None, "first"), ("r2", Some("r1"), "second")] {
            store
                .create(&Run {
                    metadata: ObjectMeta::named("default", name),
                    spec: RunSpec {
                        thread_name: "t1".into(),
                        previous_run_name: previous.map(str::to_string),
                        ..Default::default()
                    },
                    status: RunStatus::default(),
                })
                .await
                .unwrap();
            save(&store, run_state(name, content, true, None)).await;
        }

        let opts = WatchOptions {
            history: true,
            ..watch_run("r2")
        };
        let out = collect(emitter.watch("default", opts).await.unwrap()).await;
        assert_eq!(text(&out), "firstsecond");
    }

    #[tokio::test]
    async fn test_cancel_closes_stream() {
        let (_store, emitter) = setup();
        emitter.start_run("r1");
        let opts = watch_run("r1");
        let cancel = opts.cancel.clone();
        let rx = emitter.watch("default", opts).await.unwrap();
        cancel.cancel();
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_watch_needs_target() {
        let (_store, emitter) = setup();
        let result = emitter.watch("default", WatchOptions::default()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
