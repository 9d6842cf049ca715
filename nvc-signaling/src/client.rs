//! WebSocket signaling client
//!
//! The socket is split into a writer task fed by an unbounded channel and a
//! reader task that parses text frames and forwards them as
//! [`SignalingEvent`]s. Handles are cheap to clone; all clones write to the
//! same socket.

use crate::protocol::{CloseInfo, SignalingMessage, CLOSE_NORMAL, CLOSE_NO_STATUS};
use futures::{SinkExt, StreamExt};
use nvc_core::{NvcError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;
use tracing::{debug, info, warn};

/// Inbound traffic from the signaling socket
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// A parsed message
    Message(SignalingMessage),
    /// The socket closed; no further events follow
    Closed(CloseInfo),
}

/// Handle to an open signaling socket
#[derive(Debug, Clone)]
pub struct SignalingClient {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl SignalingClient {
    /// Connect to `url`, failing with [`NvcError::Timeout`] after `connect_timeout`
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        debug!("Connecting to signaling server at {}", url);
        let (ws_stream, _response) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| NvcError::Timeout {
                operation: format!("connect to {}", url),
                duration: connect_timeout,
            })?
            .map_err(|e| NvcError::Connection {
                url: url.to_string(),
                reason: e.to_string(),
                retry_in: None,
            })?;

        info!("Signaling connection established to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    warn!("Failed to write to signaling socket: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_open.store(false, Ordering::Release);
            let _ = write.close().await;
        });

        let reader_open = open.clone();
        let reader_url = url.to_string();
        tokio::spawn(async move {
            let close = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::parse(&text) {
                        Ok(message) => {
                            if let SignalingMessage::Unknown { kind, .. } = &message {
                                warn!("Unknown signaling message type: {}", kind);
                            }
                            if events_tx.send(SignalingEvent::Message(message)).is_err() {
                                break CloseInfo {
                                    code: CLOSE_NORMAL,
                                    reason: "receiver dropped".to_string(),
                                };
                            }
                        }
                        Err(e) => warn!("Dropping malformed signaling message: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => break close_info(frame),
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames are not part of the protocol
                    }
                    Some(Err(e)) => break CloseInfo::abnormal(e.to_string()),
                    None => break CloseInfo::abnormal("stream ended"),
                }
            };

            reader_open.store(false, Ordering::Release);
            info!(
                code = close.code,
                reason = %close.reason,
                "Signaling connection to {} closed", reader_url
            );
            let _ = events_tx.send(SignalingEvent::Closed(close));
        });

        Ok((
            Self {
                url: url.to_string(),
                outbound,
                open,
            },
            events_rx,
        ))
    }

    /// Server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the socket is still open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Queue a message for sending
    pub fn send(&self, message: &SignalingMessage) -> Result<()> {
        if !self.is_open() {
            return Err(NvcError::Transport {
                reason: format!(
                    "signaling connection closed, cannot send {}",
                    message.message_type()
                ),
            });
        }
        let json = message.to_json()?;
        debug!("Sending {} message", message.message_type());
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| NvcError::Transport {
                reason: "signaling writer stopped".to_string(),
            })
    }

    /// Close the socket with `code`
    pub fn close(&self, code: u16, reason: &str) {
        if !self.is_open() {
            return;
        }
        debug!(code, "Closing signaling connection: {}", reason);
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }
}

/// Map a received close frame to [`CloseInfo`]
///
/// A close frame without a status code is reported as 1005.
fn close_info(frame: Option<CloseFrame<'_>>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        },
        None => CloseInfo {
            code: CLOSE_NO_STATUS,
            reason: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_without_status_reconnects() {
        let close = close_info(None);
        assert_eq!(close.code, CLOSE_NO_STATUS);
        assert!(close.should_reconnect());

        let normal = close_info(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        assert_eq!(normal.code, CLOSE_NORMAL);
        assert_eq!(normal.reason, "bye");
        assert!(!normal.should_reconnect());
    }

    #[tokio::test]
    async fn test_reader_reports_bare_close_frame() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Close(None)).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let (_client, mut events) =
            SignalingClient::connect(&format!("ws://{}", addr), Duration::from_secs(2))
                .await
                .unwrap();

        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(SignalingEvent::Closed(close)) => {
                assert_eq!(close.code, CLOSE_NO_STATUS);
                assert!(close.should_reconnect());
            }
            other => panic!("expected close event, got {:?}", other),
        }
    }
}
