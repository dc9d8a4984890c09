//! Single-invocation scenarios: every step runs inside one streamed response.
//!
//! The loop replaces cross-invocation chaining, so there is no continuation.
//! A kill is noticed before each step, while a step runs (by polling the
//! store), and when its completion is written.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepchain_core::config::SequentialConfig;
use stepchain_core::error::{Result, StepchainError};
use stepchain_core::event::RunEvent;
use stepchain_core::traits::{RunStore, StepExecutor};
use stepchain_core::types::{RunId, Scenario};

use crate::continuation::fail_quietly;
use crate::executor::format_ms;

const EVENT_BUFFER: usize = 32;

#[derive(Clone)]
pub struct SequentialRunner {
    store: Arc<dyn RunStore>,
    executor: Arc<dyn StepExecutor>,
    config: SequentialConfig,
    total_steps: u32,
}

/// Why a step stopped before completing normally.
enum Interrupted {
    Deadline,
    Stopped(String),
}

/// Per-stream bookkeeping shared by every emitted event.
struct EventSink {
    tx: mpsc::Sender<RunEvent>,
    run_id: RunId,
    started: Instant,
    completed: Vec<u32>,
}

impl EventSink {
    fn elapsed(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Fails with `Aborted` once the receiving side is gone.
    async fn emit(&self, event: RunEvent) -> Result<()> {
        debug!(run_id = %self.run_id, event = event.kind(), "Stream event");
        self.tx.send(event).await.map_err(|_| StepchainError::Aborted)
    }

    async fn manual_stop(&self, step: Option<u32>, message: String) -> Result<()> {
        info!(run_id = %self.run_id, step = ?step, "Stream stopped by kill");
        self.emit(RunEvent::ManualStop {
            run_id: self.run_id.clone(),
            completed_steps: self.completed.clone(),
            step,
            elapsed: self.elapsed(),
            message,
        })
        .await
    }
}

impl SequentialRunner {
    pub fn new(
        store: Arc<dyn RunStore>,
        executor: Arc<dyn StepExecutor>,
        config: SequentialConfig,
        total_steps: u32,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            total_steps,
        }
    }

    /// Create a run and start driving it. Events arrive on the returned
    /// stream; dropping the stream fails the run at its next event unless
    /// the run already finished or was killed.
    pub async fn start(&self, race: bool) -> Result<(RunId, ReceiverStream<RunEvent>)> {
        let scenario = if race { Scenario::Race } else { Scenario::Sequential };
        let run = self.store.create_run(scenario, None).await?;
        info!(run_id = %run.id, scenario = %scenario, "Streaming run created");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sink = EventSink {
            tx,
            run_id: run.id.clone(),
            started: Instant::now(),
            completed: Vec::new(),
        };
        tokio::spawn(self.clone().drive(sink, race));
        Ok((run.id, ReceiverStream::new(rx)))
    }

    async fn drive(self, mut sink: EventSink, race: bool) {
        let run_id = sink.run_id.clone();
        match self.run_steps(&mut sink, race).await {
            Ok(()) => {}
            Err(StepchainError::Aborted) => {
                warn!(run_id = %run_id, "Stream client went away");
                fail_quietly(
                    self.store.as_ref(),
                    &run_id,
                    "Stream client disconnected.",
                    None,
                )
                .await;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Streaming run failed");
                let message = e.to_string();
                fail_quietly(self.store.as_ref(), &run_id, &message, None).await;
                let _ = sink
                    .emit(RunEvent::Error {
                        run_id: run_id.clone(),
                        completed_steps: sink.completed.clone(),
                        elapsed: sink.elapsed(),
                        message,
                    })
                    .await;
            }
        }
    }

    async fn run_steps(&self, sink: &mut EventSink, race: bool) -> Result<()> {
        let run_id = sink.run_id.clone();
        let limit_ms = if race {
            self.config.race_timeout_ms
        } else {
            self.config.execution_budget_ms
        };
        let deadline = sink.started + Duration::from_millis(limit_ms);
        let duration = Duration::from_millis(self.config.step_duration_ms);

        sink.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            timestamp: sink.elapsed(),
        })
        .await?;

        for step in 1..=self.total_steps {
            if let Some(message) = self.stopped_message(&run_id).await? {
                return sink.manual_stop(Some(step), message).await;
            }
            if !self.store.mark_step_ongoing(&run_id, step).await? {
                let message = self.stopped_message(&run_id).await?.unwrap_or_default();
                return sink.manual_stop(Some(step), message).await;
            }

            sink.emit(RunEvent::Start {
                run_id: run_id.clone(),
                step,
                duration_ms: self.config.step_duration_ms,
                timestamp: sink.elapsed(),
            })
            .await?;

            let token = CancellationToken::new();
            let outcome = tokio::select! {
                result = self.executor.execute(step, duration, Some(token.clone())) => Ok(result),
                _ = tokio::time::sleep_until(deadline) => Err(Interrupted::Deadline),
                message = self.watch_for_termination(&run_id) => Err(Interrupted::Stopped(message)),
            };
            token.cancel();

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    if let Some(message) = self.stopped_message(&run_id).await? {
                        return sink.manual_stop(Some(step), message).await;
                    }
                    let message = e.to_string();
                    error!(run_id = %run_id, step, error = %message, "Streamed step failed");
                    self.store.mark_run_failed(&run_id, &message, Some(step)).await?;
                    return sink
                        .emit(RunEvent::Error {
                            run_id: run_id.clone(),
                            completed_steps: sink.completed.clone(),
                            elapsed: sink.elapsed(),
                            message,
                        })
                        .await;
                }
                Err(Interrupted::Stopped(message)) => {
                    return sink.manual_stop(Some(step), message).await;
                }
                Err(Interrupted::Deadline) => {
                    return self.deadline_reached(sink, step, race, limit_ms).await;
                }
            };

            if !self
                .store
                .mark_step_complete(&run_id, step, result.duration_ms)
                .await?
            {
                let message = self.stopped_message(&run_id).await?.unwrap_or_default();
                return sink.manual_stop(Some(step), message).await;
            }
            sink.completed.push(step);
            sink.emit(RunEvent::Complete {
                run_id: run_id.clone(),
                step,
                duration_ms: result.duration_ms,
                timestamp: sink.elapsed(),
            })
            .await?;
        }

        if !self.store.mark_run_complete(&run_id).await? {
            let message = self.stopped_message(&run_id).await?.unwrap_or_default();
            return sink.manual_stop(None, message).await;
        }
        info!(run_id = %run_id, elapsed_ms = sink.elapsed(), "Streaming run completed");
        sink.emit(RunEvent::Done {
            run_id,
            completed_steps: sink.completed.clone(),
            timestamp: sink.elapsed(),
        })
        .await
    }

    async fn deadline_reached(
        &self,
        sink: &EventSink,
        step: u32,
        race: bool,
        limit_ms: u64,
    ) -> Result<()> {
        let run_id = sink.run_id.clone();
        if let Some(message) = self.stopped_message(&run_id).await? {
            return sink.manual_stop(Some(step), message).await;
        }

        let elapsed = sink.elapsed();
        let event = if race {
            let message = format!(
                "Race timeout: step {} did not finish within {}. Failed gracefully before the platform limit.",
                step,
                format_ms(limit_ms)
            );
            warn!(run_id = %run_id, step, elapsed, "Race timeout");
            self.store.mark_run_failed(&run_id, &message, Some(step)).await?;
            RunEvent::RaceTimeout {
                run_id,
                completed_steps: sink.completed.clone(),
                failed_step: step,
                elapsed,
                message,
            }
        } else {
            let message = format!(
                "Execution budget of {} exceeded during step {}.",
                format_ms(limit_ms),
                step
            );
            warn!(run_id = %run_id, step, elapsed, "Execution budget exceeded");
            self.store.mark_run_failed(&run_id, &message, Some(step)).await?;
            RunEvent::Timeout {
                run_id,
                completed_steps: sink.completed.clone(),
                failed_step: step,
                elapsed,
                message,
            }
        };
        sink.emit(event).await
    }

    /// `Some(message)` once the run is terminal or gone.
    async fn stopped_message(&self, run_id: &RunId) -> Result<Option<String>> {
        Ok(match self.store.get_run(run_id).await? {
            Some(run) if !run.is_terminal() => None,
            Some(run) => Some(
                run.error
                    .unwrap_or_else(|| format!("Run is already {}.", run.status)),
            ),
            None => Some("Run no longer exists.".to_string()),
        })
    }

    /// Resolves once a poll sees the run terminal. Store errors only delay it.
    async fn watch_for_termination(&self, run_id: &RunId) -> String {
        let poll = Duration::from_millis(self.config.kill_poll_ms);
        loop {
            tokio::time::sleep(poll).await;
            match self.stopped_message(run_id).await {
                Ok(Some(message)) => return message,
                Ok(None) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "Kill poll failed"),
            }
        }
    }
}
