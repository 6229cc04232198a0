//! Worker thread loop.

use tokio::sync::mpsc;

use super::protocol::{EncodedPacket, EncoderMessage, EncoderResponse, FailureKind};
use super::EncoderBackend;

/// Serve requests until the owner goes away, `Close` arrives, or the
/// backend reports a fatal error.
pub(super) fn run(
    mut backend: Box<dyn EncoderBackend>,
    mut requests: mpsc::UnboundedReceiver<EncoderMessage>,
    responses: mpsc::UnboundedSender<EncoderResponse>,
) {
    while let Some(message) = requests.blocking_recv() {
        let keep_running = match message {
            EncoderMessage::Configure { id, settings }
            | EncoderMessage::Reconfigure { id, settings } => {
                match backend.configure(&settings) {
                    Ok(()) => responses.send(EncoderResponse::ConfigureDone { id }).is_ok(),
                    Err(e) => {
                        let kind = if e.is_channel_crash() {
                            FailureKind::Fatal
                        } else {
                            FailureKind::Configuration
                        };
                        report(&responses, id, kind, e.to_string())
                    }
                }
            }
            EncoderMessage::Encode {
                id,
                frame,
                timestamp_us,
                force_keyframe,
            } => match backend.encode(id, &frame, timestamp_us, force_keyframe) {
                Ok(packets) => {
                    responses.send(EncoderResponse::EncodeAccepted { id }).is_ok()
                        && forward(&responses, packets)
                }
                Err(e) => {
                    let kind = if e.is_channel_crash() {
                        FailureKind::Fatal
                    } else {
                        FailureKind::Frame
                    };
                    report(&responses, id, kind, e.to_string())
                }
            },
            EncoderMessage::Flush { id } => match backend.flush() {
                Ok(packets) => {
                    forward(&responses, packets)
                        && responses.send(EncoderResponse::FlushDone { id }).is_ok()
                }
                Err(e) => {
                    let kind = if e.is_channel_crash() {
                        FailureKind::Fatal
                    } else {
                        FailureKind::Frame
                    };
                    report(&responses, id, kind, e.to_string())
                }
            },
            EncoderMessage::Close { id } => {
                backend.close();
                let _ = responses.send(EncoderResponse::Closed { id });
                return;
            }
        };
        if !keep_running {
            break;
        }
    }
    backend.close();
}

fn forward(responses: &mpsc::UnboundedSender<EncoderResponse>, packets: Vec<EncodedPacket>) -> bool {
    packets
        .into_iter()
        .all(|packet| responses.send(EncoderResponse::Packet(packet)).is_ok())
}

/// Send an error reply. Returns whether the worker should keep running.
fn report(
    responses: &mpsc::UnboundedSender<EncoderResponse>,
    id: u64,
    kind: FailureKind,
    message: String,
) -> bool {
    if kind == FailureKind::Fatal {
        tracing::error!(id, error = %message, "Encoder backend failed fatally");
    }
    responses
        .send(EncoderResponse::Error { id, kind, message })
        .is_ok()
        && kind != FailureKind::Fatal
}
