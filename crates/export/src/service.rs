//! Conform service.
//!
//! A single task owns the [`ConformEngine`] and the idle-fill scheduler.
//! Everything else talks to it through a [`ConformHandle`]. Playback and
//! export flags are set on the shared [`ActivityFlags`] before the command is
//! queued, so a batch that is already running stops at the next frame
//! boundary.

use std::sync::Arc;
use std::time::Duration;

use splice_common::{SpliceError, SpliceResult};
use splice_conform::frame_index::RebuildReport;
use splice_conform::{
    ActivityFlags, ConformEngine, CoverageReport, FillState, FillTicket, IdleFillScheduler, Packet,
};
use splice_timeline::{EncoderSettings, Sequence, SequenceId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::export::{run_export, ExportJob, ExportOutcome, ProgressCallback};
use crate::mux::Muxer;
use crate::source::SourceMedia;

type Reply<T> = oneshot::Sender<T>;

pub enum ConformCommand {
    TimelineChanged {
        sequence: Box<Sequence>,
        result: Reply<SpliceResult<RebuildReport>>,
    },
    SettingsChanged {
        sequence_id: SequenceId,
        settings: EncoderSettings,
        result: Reply<SpliceResult<bool>>,
    },
    SequenceActivated {
        sequence_id: SequenceId,
        result: Reply<SpliceResult<()>>,
    },
    SequenceRemoved {
        sequence_id: SequenceId,
        result: Reply<bool>,
    },
    PlaybackStarted,
    PlaybackStopped,
    Seeked {
        frame: u64,
    },
    GetPacket {
        sequence_id: SequenceId,
        frame: u64,
        result: Reply<Option<Packet>>,
    },
    IsFrameConformed {
        sequence_id: SequenceId,
        frame: u64,
        result: Reply<bool>,
    },
    Coverage {
        sequence_id: SequenceId,
        result: Reply<Option<CoverageReport>>,
    },
    Export {
        job: ExportJob,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
        result: Reply<SpliceResult<ExportOutcome>>,
    },
    /// Reply once idle fill has nothing scheduled.
    WaitForIdle {
        result: Reply<()>,
    },
    Shutdown {
        result: Reply<()>,
    },
}

/// Cloneable front door to the conform service.
#[derive(Clone)]
pub struct ConformHandle {
    tx: mpsc::Sender<ConformCommand>,
    activity: ActivityFlags,
    cancel: CancellationToken,
}

impl ConformHandle {
    pub fn activity(&self) -> &ActivityFlags {
        &self.activity
    }

    pub async fn timeline_changed(&self, sequence: Sequence) -> SpliceResult<RebuildReport> {
        self.request(|result| ConformCommand::TimelineChanged {
            sequence: Box::new(sequence),
            result,
        })
        .await?
    }

    pub async fn settings_changed(
        &self,
        sequence_id: SequenceId,
        settings: EncoderSettings,
    ) -> SpliceResult<bool> {
        self.request(|result| ConformCommand::SettingsChanged {
            sequence_id,
            settings,
            result,
        })
        .await?
    }

    pub async fn activate(&self, sequence_id: SequenceId) -> SpliceResult<()> {
        self.request(|result| ConformCommand::SequenceActivated {
            sequence_id,
            result,
        })
        .await?
    }

    pub async fn remove_sequence(&self, sequence_id: SequenceId) -> SpliceResult<bool> {
        self.request(|result| ConformCommand::SequenceRemoved {
            sequence_id,
            result,
        })
        .await
    }

    pub async fn playback_started(&self) -> SpliceResult<()> {
        self.activity.set_playback(true);
        self.send(ConformCommand::PlaybackStarted).await
    }

    pub async fn playback_stopped(&self) -> SpliceResult<()> {
        self.activity.set_playback(false);
        self.send(ConformCommand::PlaybackStopped).await
    }

    pub async fn seek(&self, frame: u64) -> SpliceResult<()> {
        self.send(ConformCommand::Seeked { frame }).await
    }

    pub async fn get_packet(&self, sequence_id: SequenceId, frame: u64) -> SpliceResult<Option<Packet>> {
        self.request(|result| ConformCommand::GetPacket {
            sequence_id,
            frame,
            result,
        })
        .await
    }

    pub async fn is_frame_conformed(&self, sequence_id: SequenceId, frame: u64) -> SpliceResult<bool> {
        self.request(|result| ConformCommand::IsFrameConformed {
            sequence_id,
            frame,
            result,
        })
        .await
    }

    pub async fn coverage(&self, sequence_id: SequenceId) -> SpliceResult<Option<CoverageReport>> {
        self.request(|result| ConformCommand::Coverage {
            sequence_id,
            result,
        })
        .await
    }

    /// Run an export. Cancel it through `cancel`.
    pub async fn export(
        &self,
        job: ExportJob,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> SpliceResult<ExportOutcome> {
        self.activity.set_export(true);
        let reply = self
            .request(|result| ConformCommand::Export {
                job,
                progress,
                cancel,
                result,
            })
            .await;
        if reply.is_err() {
            self.activity.set_export(false);
        }
        reply?
    }

    pub async fn wait_for_idle(&self) -> SpliceResult<()> {
        self.request(|result| ConformCommand::WaitForIdle { result })
            .await
    }

    /// Drain the encoder and stop the service.
    pub async fn shutdown(&self) -> SpliceResult<()> {
        self.request(|result| ConformCommand::Shutdown { result })
            .await
    }

    /// Stop the service without draining.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, command: ConformCommand) -> SpliceResult<()> {
        self.tx.send(command).await.map_err(|_| service_gone())
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ConformCommand) -> SpliceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| service_gone())
    }
}

fn service_gone() -> SpliceError {
    SpliceError::Other(anyhow::anyhow!("conform service has stopped"))
}

/// The task that owns the engine.
pub struct ConformService {
    engine: ConformEngine,
    source: Arc<dyn SourceMedia>,
    muxer: Arc<dyn Muxer>,
    scheduler: IdleFillScheduler,
    activity: ActivityFlags,
    active: Option<SequenceId>,
    pending: Option<(FillTicket, Instant)>,
    idle_waiters: Vec<Reply<()>>,
    retry_delay: Duration,
}

impl ConformService {
    /// Start the service on the current runtime.
    pub fn spawn(
        engine: ConformEngine,
        source: Arc<dyn SourceMedia>,
        muxer: Arc<dyn Muxer>,
    ) -> (ConformHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let activity = engine.activity().clone();
        let scheduler = IdleFillScheduler::new(engine.config());
        let retry_delay = Duration::from_millis(engine.config().retry_delay_ms);

        let service = Self {
            engine,
            source,
            muxer,
            scheduler,
            activity: activity.clone(),
            active: None,
            pending: None,
            idle_waiters: Vec::new(),
            retry_delay,
        };
        let task = tokio::spawn(service.run(rx, cancel.clone()));
        let handle = ConformHandle {
            tx,
            activity,
            cancel,
        };
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ConformCommand>, cancel: CancellationToken) {
        tracing::info!("Conform service started");
        loop {
            let deadline = self.pending.as_ref().map(|(_, at)| *at);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(ConformCommand::Shutdown { result }) => {
                        self.shutdown().await;
                        let _ = result.send(());
                        return;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.tick().await;
                }
                Some(event) = self.engine.next_event() => self.engine.handle_event(event),
            }
            self.notify_idle();
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, command: ConformCommand) {
        match command {
            ConformCommand::TimelineChanged { sequence, result } => {
                let id = sequence.id.clone();
                let report = self.engine.update_sequence(*sequence);
                if report.is_ok() && self.active.as_ref() == Some(&id) {
                    self.restart_fill();
                }
                let _ = result.send(report);
            }
            ConformCommand::SettingsChanged {
                sequence_id,
                settings,
                result,
            } => {
                let changed = self.engine.set_settings(&sequence_id, settings).await;
                if matches!(changed, Ok(true)) && self.active.as_ref() == Some(&sequence_id) {
                    self.restart_fill();
                }
                let _ = result.send(changed);
            }
            ConformCommand::SequenceActivated {
                sequence_id,
                result,
            } => {
                if self.engine.sequence(&sequence_id).is_none() {
                    let _ = result.send(Err(SpliceError::sequence_not_found(sequence_id.as_str())));
                    return;
                }
                tracing::info!(sequence = %sequence_id, "Idle fill target changed");
                self.active = Some(sequence_id);
                self.restart_fill();
                let _ = result.send(Ok(()));
            }
            ConformCommand::SequenceRemoved {
                sequence_id,
                result,
            } => {
                if self.active.as_ref() == Some(&sequence_id) {
                    self.active = None;
                    self.stop_fill();
                }
                let _ = result.send(self.engine.remove_sequence(&sequence_id));
            }
            ConformCommand::PlaybackStarted => {
                self.activity.set_playback(true);
                self.stop_fill();
            }
            ConformCommand::PlaybackStopped => {
                self.activity.set_playback(false);
                self.restart_fill();
            }
            ConformCommand::Seeked { frame } => {
                if let Some(id) = self.active.clone() {
                    self.engine.seek(&id, frame);
                    if !self.activity.is_playing() {
                        self.restart_fill();
                    }
                }
            }
            ConformCommand::GetPacket {
                sequence_id,
                frame,
                result,
            } => {
                self.engine.pump();
                let packet = self.engine.fetch_packet(&sequence_id, frame).await;
                let _ = result.send(packet);
            }
            ConformCommand::IsFrameConformed {
                sequence_id,
                frame,
                result,
            } => {
                self.engine.pump();
                let _ = result.send(self.engine.is_frame_conformed(&sequence_id, frame));
            }
            ConformCommand::Coverage {
                sequence_id,
                result,
            } => {
                self.engine.pump();
                let _ = result.send(self.engine.coverage(&sequence_id));
            }
            ConformCommand::Export {
                job,
                progress,
                cancel,
                result,
            } => {
                self.stop_fill();
                let outcome = run_export(
                    &mut self.engine,
                    self.source.as_ref(),
                    self.muxer.as_ref(),
                    job,
                    &cancel,
                    progress.as_ref(),
                )
                .await;
                let _ = result.send(outcome);
                self.restart_fill();
            }
            ConformCommand::WaitForIdle { result } => self.idle_waiters.push(result),
            ConformCommand::Shutdown { result } => {
                let _ = result.send(());
            }
        }
    }

    async fn tick(&mut self) {
        let Some((ticket, _)) = self.pending.take() else {
            return;
        };
        if !self.scheduler.begin(&ticket) {
            return;
        }
        match self.engine.fill_batch(&ticket.sequence_id).await {
            Ok(outcome) => {
                if let Some((next, delay)) = self.scheduler.finish(&ticket, &outcome) {
                    self.pending = Some((next, Instant::now() + delay));
                }
            }
            Err(e) if e.is_channel_crash() => {
                tracing::warn!(error = %e, "Encoder lost during idle fill; retrying");
                self.scheduler.abort(&ticket);
                let next = self.scheduler.restart(ticket.sequence_id);
                self.pending = Some((next, Instant::now() + self.retry_delay));
            }
            Err(e) => {
                tracing::warn!(sequence = %ticket.sequence_id, error = %e, "Idle fill stopped");
                self.scheduler.abort(&ticket);
            }
        }
    }

    fn restart_fill(&mut self) {
        let Some(id) = self.active.clone() else {
            return;
        };
        if self.activity.is_blocked() {
            return;
        }
        let ticket = self.scheduler.restart(id);
        self.pending = Some((ticket, Instant::now()));
    }

    fn stop_fill(&mut self) {
        self.scheduler.stop();
        self.pending = None;
    }

    fn notify_idle(&mut self) {
        if self.pending.is_some() || self.scheduler.state() != FillState::Idle {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn shutdown(&mut self) {
        self.stop_fill();
        if let Err(e) = self.engine.shutdown().await {
            tracing::warn!(error = %e, "Encoder did not shut down cleanly");
        }
        tracing::info!("Conform service stopped");
    }
}
