//! Encoder channel.
//!
//! The encoder backend runs on its own thread and talks to its owner only
//! through messages. Every request carries a correlation id; replies and
//! packets come back on a single response queue in the order the worker
//! produced them. The owner drives the queue: acknowledgements resolve the
//! request that is being awaited, packets and per-frame failures are queued
//! as [`EncoderCompletion`]s.

mod keyframe;
mod protocol;
mod worker;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use splice_common::{SpliceError, SpliceResult};
use splice_timeline::EncoderSettings;
use tokio::sync::mpsc;

use crate::media::VideoFrame;

pub use keyframe::{KeyframePolicy, KeyframeTracker};
pub use protocol::{
    CorrelationId, EncodedPacket, EncoderCompletion, EncoderMessage, EncoderResponse, FailureKind,
};

/// A video encoder driven synchronously on the worker thread.
pub trait EncoderBackend: Send {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Apply settings. Called before the first frame and on every change.
    fn configure(&mut self, settings: &EncoderSettings) -> SpliceResult<()>;

    /// Encode one frame. May return zero or more packets, including packets
    /// for earlier frames held back by the encoder.
    ///
    /// Returning [`SpliceError::ChannelCrash`] stops the worker.
    fn encode(
        &mut self,
        id: CorrelationId,
        frame: &VideoFrame,
        timestamp_us: u64,
        force_keyframe: bool,
    ) -> SpliceResult<Vec<EncodedPacket>>;

    /// Emit every packet still held by the encoder.
    fn flush(&mut self) -> SpliceResult<Vec<EncodedPacket>>;

    /// Release resources. The backend is not used afterwards.
    fn close(&mut self) {}
}

/// Creates a fresh backend for each (re)spawn of the worker.
pub type BackendFactory = Arc<dyn Fn() -> SpliceResult<Box<dyn EncoderBackend>> + Send + Sync>;

struct Ack {
    id: CorrelationId,
    result: SpliceResult<()>,
}

/// Owner side of the encoder worker.
pub struct EncoderChannel {
    factory: BackendFactory,
    backend_name: String,
    tx: mpsc::UnboundedSender<EncoderMessage>,
    rx: mpsc::UnboundedReceiver<EncoderResponse>,
    worker: Option<JoinHandle<()>>,
    next_id: CorrelationId,
    outstanding: HashSet<CorrelationId>,
    ready: VecDeque<EncoderCompletion>,
    active: Option<EncoderSettings>,
    alive: bool,
    closing: bool,
    crashes: u32,
}

impl std::fmt::Debug for EncoderChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderChannel")
            .field("backend", &self.backend_name)
            .field("alive", &self.alive)
            .field("outstanding", &self.outstanding.len())
            .field("active", &self.active)
            .finish()
    }
}

impl EncoderChannel {
    /// Create a backend and start its worker thread.
    pub fn spawn(factory: BackendFactory) -> SpliceResult<Self> {
        let (tx, rx, worker, backend_name) = start_worker(&factory)?;
        tracing::info!(backend = %backend_name, "Encoder worker started");
        Ok(Self {
            factory,
            backend_name,
            tx,
            rx,
            worker: Some(worker),
            next_id: 1,
            outstanding: HashSet::new(),
            ready: VecDeque::new(),
            active: None,
            alive: true,
            closing: false,
            crashes: 0,
        })
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Number of times the worker has died.
    pub fn crash_count(&self) -> u32 {
        self.crashes
    }

    /// Settings the worker is currently configured with.
    pub fn active_settings(&self) -> Option<&EncoderSettings> {
        self.active.as_ref()
    }

    /// Encode requests submitted but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Configure the worker. Idempotent: returns `Ok(false)` without a round
    /// trip when the settings are already active.
    ///
    /// Frames still held by the encoder are flushed out first; their packets
    /// remain queued as completions.
    pub async fn configure(&mut self, settings: &EncoderSettings) -> SpliceResult<bool> {
        if self.active.as_ref() == Some(settings) {
            return Ok(false);
        }
        let problems = settings.validate();
        if !problems.is_empty() {
            return Err(SpliceError::configuration(problems.join("; ")));
        }
        if !self.outstanding.is_empty() {
            self.flush().await?;
        }

        let id = self.allocate_id();
        let message = if self.active.is_some() {
            EncoderMessage::Reconfigure {
                id,
                settings: settings.clone(),
            }
        } else {
            EncoderMessage::Configure {
                id,
                settings: settings.clone(),
            }
        };
        self.active = None;
        self.send(message)?;
        self.await_ack(id).await?;
        self.active = Some(settings.clone());
        tracing::debug!(
            codec = settings.codec.as_str(),
            width = settings.width,
            height = settings.height,
            bitrate = settings.bitrate_bps,
            "Encoder configured"
        );
        Ok(true)
    }

    /// Queue a frame for encoding.
    pub fn submit(
        &mut self,
        frame: VideoFrame,
        timestamp_us: u64,
        force_keyframe: bool,
    ) -> SpliceResult<CorrelationId> {
        if self.active.is_none() {
            return Err(SpliceError::configuration("encoder is not configured"));
        }
        let id = self.allocate_id();
        self.send(EncoderMessage::Encode {
            id,
            frame,
            timestamp_us,
            force_keyframe,
        })?;
        self.outstanding.insert(id);
        Ok(id)
    }

    /// Drain frames held by the encoder. Their packets are queued as
    /// completions before this returns.
    pub async fn flush(&mut self) -> SpliceResult<()> {
        let id = self.allocate_id();
        self.send(EncoderMessage::Flush { id })?;
        self.await_ack(id).await
    }

    /// Shut the worker down cleanly.
    pub async fn close(&mut self) -> SpliceResult<()> {
        if !self.alive {
            return Ok(());
        }
        let id = self.allocate_id();
        self.closing = true;
        self.send(EncoderMessage::Close { id })?;
        let result = self.await_ack(id).await;
        self.alive = false;
        self.active = None;
        if let Some(worker) = self.worker.take() {
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
        result
    }

    /// Replace a dead (or live) worker with a fresh backend.
    pub fn respawn(&mut self) -> SpliceResult<()> {
        let (tx, rx, worker, backend_name) = start_worker(&self.factory)?;
        if self.alive {
            self.mark_crashed("worker replaced");
        }
        self.tx = tx;
        self.rx = rx;
        self.worker = Some(worker);
        self.backend_name = backend_name;
        self.alive = true;
        self.closing = false;
        self.active = None;
        tracing::info!(backend = %self.backend_name, crashes = self.crashes, "Encoder worker respawned");
        Ok(())
    }

    /// Next queued completion, without waiting.
    pub fn try_next_completion(&mut self) -> Option<EncoderCompletion> {
        self.pump();
        self.ready.pop_front()
    }

    /// Next completion, waiting for one. Returns `None` once the worker is
    /// gone and every completion has been handed out.
    pub async fn next_completion(&mut self) -> Option<EncoderCompletion> {
        loop {
            if let Some(completion) = self.ready.pop_front() {
                return Some(completion);
            }
            if !self.alive {
                return None;
            }
            match self.rx.recv().await {
                Some(response) => self.handle_unsolicited(response),
                None => self.mark_crashed("encoder worker exited"),
            }
        }
    }

    /// Wait up to `poll` for worker traffic, then process whatever arrived.
    pub async fn wait_briefly(&mut self, poll: Duration) {
        if !self.alive {
            return;
        }
        tokio::select! {
            response = self.rx.recv() => match response {
                Some(response) => self.handle_unsolicited(response),
                None => self.mark_crashed("encoder worker exited"),
            },
            _ = tokio::time::sleep(poll) => {}
        }
        self.pump();
    }

    fn allocate_id(&mut self) -> CorrelationId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn send(&mut self, message: EncoderMessage) -> SpliceResult<()> {
        if !self.alive {
            return Err(SpliceError::channel_crash("encoder worker is not running"));
        }
        if self.tx.send(message).is_err() {
            self.mark_crashed("encoder worker stopped accepting requests");
            return Err(SpliceError::channel_crash("encoder worker is not running"));
        }
        Ok(())
    }

    fn pump(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(response) => self.handle_unsolicited(response),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.mark_crashed("encoder worker exited");
                    break;
                }
            }
        }
    }

    async fn await_ack(&mut self, id: CorrelationId) -> SpliceResult<()> {
        loop {
            let Some(response) = self.rx.recv().await else {
                self.mark_crashed("encoder worker exited");
                return Err(SpliceError::channel_crash(
                    "encoder worker exited before replying",
                ));
            };
            if let Some(ack) = self.handle_response(response) {
                if ack.id == id {
                    return ack.result;
                }
                tracing::debug!(id = ack.id, "Dropping stray encoder acknowledgement");
            }
        }
    }

    fn handle_unsolicited(&mut self, response: EncoderResponse) {
        if let Some(ack) = self.handle_response(response) {
            tracing::debug!(id = ack.id, "Unawaited encoder acknowledgement");
        }
    }

    /// Route one response. Packets and frame failures become completions;
    /// everything else is an acknowledgement for the caller.
    fn handle_response(&mut self, response: EncoderResponse) -> Option<Ack> {
        match response {
            EncoderResponse::Packet(packet) => {
                self.outstanding.remove(&packet.id);
                self.ready.push_back(EncoderCompletion::Packet(packet));
                None
            }
            EncoderResponse::EncodeAccepted { id } => {
                tracing::trace!(id, "Frame accepted by encoder");
                None
            }
            EncoderResponse::Error { id, kind, message } => {
                if self.outstanding.remove(&id) {
                    self.ready.push_back(EncoderCompletion::Failed {
                        id,
                        error: kind.into_error(message),
                    });
                    None
                } else {
                    Some(Ack {
                        id,
                        result: Err(kind.into_error(message)),
                    })
                }
            }
            EncoderResponse::ConfigureDone { id }
            | EncoderResponse::FlushDone { id }
            | EncoderResponse::Closed { id } => Some(Ack { id, result: Ok(()) }),
        }
    }

    /// Fail everything in flight and report the crash once.
    fn mark_crashed(&mut self, message: &str) {
        if !self.alive {
            return;
        }
        self.alive = false;
        self.active = None;
        if self.closing {
            self.outstanding.clear();
            return;
        }
        self.crashes += 1;
        let mut pending: Vec<_> = self.outstanding.drain().collect();
        pending.sort_unstable();
        tracing::warn!(
            backend = %self.backend_name,
            pending = pending.len(),
            reason = message,
            "Encoder channel crashed"
        );
        for id in pending {
            self.ready.push_back(EncoderCompletion::Failed {
                id,
                error: SpliceError::channel_crash(message),
            });
        }
        self.ready.push_back(EncoderCompletion::Crashed {
            message: message.to_string(),
        });
    }
}

type WorkerParts = (
    mpsc::UnboundedSender<EncoderMessage>,
    mpsc::UnboundedReceiver<EncoderResponse>,
    JoinHandle<()>,
    String,
);

fn start_worker(factory: &BackendFactory) -> SpliceResult<WorkerParts> {
    let backend = (**factory)()?;
    let name = backend.name().to_string();
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let handle = std::thread::Builder::new()
        .name("splice-encoder".to_string())
        .spawn(move || worker::run(backend, request_rx, response_tx))?;
    Ok((request_tx, response_rx, handle, name))
}
