//! Game plugin link. Every text frame from the game is forwarded as-is to the
//! pipeline; decoding happens there.

use super::{LinkError, LinkMonitor, LinkSettings};
use crate::pipeline::PipelineInput;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// One connection lifetime. Resolves `Ok` only after cancellation.
pub async fn run_game_session(
    settings: LinkSettings,
    monitor: LinkMonitor,
    events: mpsc::Sender<PipelineInput>,
    cancel: CancellationToken,
) -> Result<(), LinkError> {
    let timeout = settings.connect_timeout();
    let connect = tokio::time::timeout(timeout, connect_async(settings.game_url.as_str()));
    let (mut ws, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = connect => result.map_err(|_| LinkError::Timeout(timeout))??,
    };

    info!("Game link open at {}", settings.game_url);
    monitor.connected();
    events
        .send(PipelineInput::GameConnected)
        .await
        .map_err(|_| LinkError::PipelineClosed)?;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                break Ok(());
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if events.send(PipelineInput::GameFrame(text)).await.is_err() {
                        break Err(LinkError::PipelineClosed);
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if events.send(PipelineInput::GameFrame(text)).await.is_err() {
                            break Err(LinkError::PipelineClosed);
                        }
                    }
                    Err(_) => warn!("Dropping non UTF-8 binary frame from game"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("Game closed the link: {:?}", frame);
                    break Err(LinkError::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Err(LinkError::Closed),
            }
        }
    };

    let _ = events.send(PipelineInput::GameDisconnected).await;
    result
}
