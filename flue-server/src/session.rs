//! One streaming connection: handshake, request, progress, terminal event.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use flue_core::{ProgressReceiver, ScheduleError, ValidationError};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    auth::Credentials,
    handlers::Endpoint,
    protocol::{ServerMessage, SessionError, Termination},
    AppState,
};

/// Close frame reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

fn truncate_reason(reason: &mut String) {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), SessionError> {
    let text = serde_json::to_string(message).map_err(anyhow::Error::from)?;
    sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|_| SessionError::Disconnected)
}

pub struct Session {
    sender: SplitSink<WebSocket, Message>,
    receiver: SplitStream<WebSocket>,
}

impl Session {
    pub fn new(socket: WebSocket) -> Self {
        let (sender, receiver) = socket.split();
        Self { sender, receiver }
    }

    async fn recv_text(&mut self) -> Result<String, SessionError> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec()).map_err(|_| SessionError::NotJson)
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_)) | Err(_)) | None => {
                    return Err(SessionError::Disconnected)
                }
            }
        }
    }

    /// Next message as JSON; anything else is a protocol error.
    pub async fn recv_json(&mut self) -> Result<Value, SessionError> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).map_err(|_| SessionError::NotJson)
    }

    /// Next message decoded into `T`; JSON that does not fit the schema is a validation error.
    pub async fn recv_request<T: DeserializeOwned>(&mut self) -> Result<T, SessionError> {
        let value = self.recv_json().await?;
        serde_json::from_value(value)
            .map_err(|e| SessionError::Validation(ValidationError::new(e.to_string())))
    }

    /// Reads the credential handshake that must open every session.
    pub async fn authorize(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        let payload = self.recv_json().await?;
        if credentials.matches_handshake(&payload) {
            Ok(())
        } else {
            Err(SessionError::Unauthorized)
        }
    }

    pub async fn send(&mut self, message: &ServerMessage) -> Result<(), SessionError> {
        send_message(&mut self.sender, message).await
    }

    /// Runs `work` while forwarding its progress and watching for the client to leave.
    ///
    /// A disconnect cancels `cancel` and returns [`SessionError::Disconnected`]
    /// without sending anything further. Progress queued before `work`
    /// completed is flushed before returning its result.
    pub async fn drive<T>(
        &mut self,
        work: impl Future<Output = Result<T, ScheduleError>>,
        mut progress: ProgressReceiver,
        cancel: &CancellationToken,
    ) -> Result<T, SessionError> {
        tokio::pin!(work);

        let result = loop {
            tokio::select! {
                biased;
                Some(fraction) = progress.recv() => {
                    let message = ServerMessage::Progress { progress: fraction };
                    if let Err(err) = send_message(&mut self.sender, &message).await {
                        cancel.cancel();
                        return Err(err);
                    }
                }
                result = &mut work => break result,
                incoming = self.receiver.next() => match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => {
                        debug!("Client left while generating");
                        cancel.cancel();
                        return Err(SessionError::Disconnected);
                    }
                    Some(Ok(_)) => {}
                },
            }
        };

        while let Ok(fraction) = progress.try_recv() {
            self.send(&ServerMessage::Progress { progress: fraction })
                .await?;
        }
        Ok(result?)
    }

    async fn close(mut self, code: u16, mut reason: String) {
        truncate_reason(&mut reason);
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        // The peer may already be gone.
        let _ = self.sender.send(Message::Close(Some(frame))).await;
    }
}

/// Drives one streaming connection for `endpoint` from handshake to close.
pub async fn serve(socket: WebSocket, state: Arc<AppState>, endpoint: Endpoint) {
    let mut session = Session::new(socket);
    let cancel = CancellationToken::new();
    // Tearing the task down cancels any invocation still in flight.
    let _cancel_on_drop = cancel.clone().drop_guard();

    let outcome = async {
        session.authorize(&state.credentials).await?;
        let result = endpoint.handle(&mut session, &state, &cancel).await?;
        session.send(&ServerMessage::Finished { result }).await
    }
    .await;

    match outcome {
        Ok(()) => {
            info!(?endpoint, "Session finished");
            session.close(close_code::NORMAL, String::new()).await;
        }
        Err(err) => {
            let termination = err.termination();
            match &termination {
                Termination::Silent => debug!(?endpoint, "Session ended by client"),
                Termination::Policy(reason) => info!(?endpoint, %reason, "Closing session"),
                Termination::Internal => error!(?endpoint, error = ?err, "Session failed"),
            }
            if let Some(code) = termination.close_code() {
                session.close(code, termination.reason().to_string()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_reasons_are_cut_on_a_char_boundary() {
        let mut reason = "é".repeat(100);
        truncate_reason(&mut reason);
        assert_eq!(reason.len(), 122);

        let mut short = "Authorization error".to_string();
        truncate_reason(&mut short);
        assert_eq!(short, "Authorization error");
    }
}
