//! STDIO transport.
//!
//! Newline-delimited UTF-8 JSON frames on stdin/stdout; one session from
//! start to stdin EOF. Diagnostics go to stderr through `tracing`, never to
//! stdout. Writes are serialized by the single writer task.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::error::Result;
use crate::protocol::{decode_frame, JsonRpcResponse, Message, RequestId};
use crate::transport::Transport;

/// Outbound channel depth; a stalled stdout peer fails notification sends
/// rather than blocking the server.
const CHANNEL_DEPTH: usize = 100;

/// Stdio transport for one session.
pub struct StdioTransport {
    running: bool,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self { running: false }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&mut self) -> Result<(mpsc::Receiver<Message>, mpsc::Sender<Message>)> {
        self.running = true;

        let (incoming_tx, incoming_rx) = mpsc::channel::<Message>(CHANNEL_DEPTH);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(CHANNEL_DEPTH);

        // Reader: one frame per line. Malformed frames are answered with a
        // wire-error response instead of being dispatched.
        let reply_tx = outgoing_tx.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut reader = BufReader::new(stdin);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("EOF on stdin, stopping transport");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!("received frame: {trimmed}");

                        match decode_frame(trimmed) {
                            Ok(message) => {
                                if incoming_tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("rejecting malformed frame: {e}");
                                let response =
                                    JsonRpcResponse::err(RequestId::Null, e.to_jsonrpc());
                                if reply_tx.send(Message::Response(response)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("error reading stdin: {e}");
                        break;
                    }
                }
            }
        });

        // Writer: serializes all frames onto stdout, one per line.
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();

            while let Some(message) = outgoing_rx.recv().await {
                match message.to_json() {
                    Ok(json) => {
                        trace!("sending frame: {json}");
                        if stdout.write_all(json.as_bytes()).await.is_err()
                            || stdout.write_all(b"\n").await.is_err()
                            || stdout.flush().await.is_err()
                        {
                            error!("error writing to stdout");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("error serializing frame: {e}");
                    }
                }
            }
        });

        Ok((incoming_rx, outgoing_tx))
    }

    async fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }
}
