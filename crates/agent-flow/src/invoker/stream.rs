//! Background task following one turn to its end.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::diff::CallTracker;
use super::{ActiveRun, Invoker};
use crate::codec::CompressedBlob;
use crate::error::{AppError, AppResult};
use crate::model::{
    ObjectMeta, Progress, Resource, Run, RunEngineState, RunState, RunStateSpec, RunStatus, Thread,
};
use crate::result_ext::ResultExt;
use crate::runtime::{CallFrames, Program, RuntimeEvent, RuntimeExecution};

const SAVE_ATTEMPTS: u32 = 3;

pub(super) async fn stream(
    invoker: Invoker,
    run: Run,
    execution: Arc<dyn RuntimeExecution>,
    mut events: mpsc::Receiver<RuntimeEvent>,
    progress: mpsc::UnboundedSender<Progress>,
    active: ActiveRun,
) {
    let run_name = run.metadata.name.clone();
    let mut tracker = CallTracker::new();

    // The periodic save bounds what a crash can lose; it runs whether or
    // not events arrive.
    let mut ticker = tokio::time::interval(invoker.config.snapshot_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                None => break,
                Some(RuntimeEvent::CallProgress(frame)) | Some(RuntimeEvent::CallFinish(frame)) => {
                    if frame.parent_id.is_some() {
                        continue;
                    }
                    let program = execution.program();
                    for frame in tracker.frame(&run_name, &program, &frame) {
                        let _ = progress.send(frame);
                    }
                    invoker.emitter.snapshot(&run_name, program, execution.call_frames());
                }
                Some(RuntimeEvent::Prompt(request)) => {
                    let invoker = invoker.clone();
                    let run = run.clone();
                    let execution = execution.clone();
                    let progress = progress.clone();
                    tokio::spawn(async move {
                        invoker
                            .handle_prompt(&run, execution, request, progress)
                            .await
                            .warn_and_discard("handling prompt");
                    });
                }
            },
            _ = ticker.tick() => {
                save_state(&invoker, &run, execution.as_ref(), false, None)
                    .await
                    .warn_and_discard(format!("periodic save of run state {}", run_name));
            }
        }
    }

    for frame in tracker.flush(&run_name) {
        let _ = progress.send(frame);
    }

    let state = execution.state();
    let error = match state {
        RunEngineState::Error => Some(
            execution
                .error()
                .unwrap_or_else(|| "run failed".to_string()),
        ),
        s if !s.is_terminal() => Some(format!("runtime stopped in state {}", s)),
        _ => None,
    };
    let final_state = if error.is_some() {
        RunEngineState::Error
    } else {
        state
    };

    if let Err(e) = save_state(&invoker, &run, execution.as_ref(), true, error.clone())
        .await
        .log(format!("final save of run state {}", run_name))
    {
        // Watchers still learn the outcome through the live log.
        warn!(run = %run_name, error = %e, "Run state not persisted");
    }

    let status = RunStatus {
        state: final_state,
        output: execution.output(),
        error: error.clone(),
        ended_at: Some(Utc::now()),
    };
    finish_records(&invoker, &run, status)
        .await
        .warn_and_discard(format!("writing final status of run {}", run_name));

    if let Some(message) = &error {
        let _ = progress.send(Progress::error(&run_name, message.clone()));
    }
    invoker.emitter.finish(&run_name, error);
    // Released only after the final status is written.
    drop(active);
    info!(run = %run_name, state = %final_state, "Run ended");
}

pub(super) async fn finish_records(invoker: &Invoker, run: &Run, status: RunStatus) -> AppResult<Run> {
    let run = invoker.store.update_status(run, status).await?;
    let run_name = run.metadata.name.clone();
    invoker
        .store
        .mutate_status::<Thread, _>(run.namespace(), &run.spec.thread_name, |thread| {
            // A newer turn may already own the thread.
            if thread.last_run_name.as_deref() == Some(run_name.as_str()) {
                thread.last_run_state = Some(run.status.state);
                thread.last_run_output = run.status.output.clone();
                thread.last_run_error = run.status.error.clone();
            }
        })
        .await?;
    Ok(run)
}

/// Persist the run's recovery record.
///
/// Creates it when absent and rewrites it only when its content changed.
/// A record already marked done is never touched again.
pub(super) async fn save_state(
    invoker: &Invoker,
    run: &Run,
    execution: &dyn RuntimeExecution,
    done: bool,
    error: Option<String>,
) -> AppResult<()> {
    let desired = RunStateSpec {
        thread_name: run.spec.thread_name.clone(),
        program: Some(CompressedBlob::encode(&execution.program())?),
        call_frame: Some(CompressedBlob::encode(&execution.call_frames())?),
        chat_state: execution
            .chat_state()
            .map(|state| CompressedBlob::encode(&state))
            .transpose()?,
        done,
        error,
    };

    let namespace = run.namespace();
    let name = run.name();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match invoker.store.find::<RunState>(namespace, name).await? {
            None => {
                let state = RunState {
                    metadata: ObjectMeta::named(namespace, name).owned_by(run.owner_ref()),
                    spec: desired.clone(),
                };
                invoker.store.create(&state).await.map(|_| ())
            }
            Some(existing) if existing.spec.done || existing.spec == desired => return Ok(()),
            Some(mut existing) => {
                existing.spec = desired.clone();
                invoker.store.update(&existing).await.map(|_| ())
            }
        };
        match result {
            Ok(()) => {
                debug!(run = %name, done, "Saved run state");
                return Ok(());
            }
            Err(AppError::Conflict(_)) | Err(AppError::AlreadyExists(_)) if attempt < SAVE_ATTEMPTS => {}
            Err(e) => return Err(e),
        }
    }
}

/// Mark the run's recovery record done.
///
/// An existing record keeps its program and frames so watchers still replay
/// what the turn produced. A missing one is created empty and carries the
/// previous turn's chat state forward.
pub(super) async fn seal_state(invoker: &Invoker, run: &Run, error: Option<String>) -> AppResult<()> {
    let namespace = run.namespace();
    let name = run.name();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match invoker.store.find::<RunState>(namespace, name).await? {
            Some(existing) if existing.spec.done => return Ok(()),
            Some(mut existing) => {
                existing.spec.done = true;
                existing.spec.error = error.clone();
                invoker.store.update(&existing).await.map(|_| ())
            }
            None => {
                let chat_state = invoker
                    .previous_chat_state(namespace, run.spec.previous_run_name.as_deref())
                    .await?;
                let state = RunState {
                    metadata: ObjectMeta::named(namespace, name).owned_by(run.owner_ref()),
                    spec: RunStateSpec {
                        thread_name: run.spec.thread_name.clone(),
                        program: Some(CompressedBlob::encode(&Program::default())?),
                        call_frame: Some(CompressedBlob::encode(&CallFrames::new())?),
                        chat_state,
                        done: true,
                        error: error.clone(),
                    },
                };
                invoker.store.create(&state).await.map(|_| ())
            }
        };
        match result {
            Ok(()) => {
                debug!(run = %name, "Sealed run state");
                return Ok(());
            }
            Err(AppError::Conflict(_)) | Err(AppError::AlreadyExists(_)) if attempt < SAVE_ATTEMPTS => {}
            Err(e) => return Err(e),
        }
    }
}
