//! Newline-delimited text frames over any async read/write pair.
//!
//! This is the adapter for byte-stream transports: pipes, TCP sockets,
//! child-process stdio. One frame per line; wrap the endpoint in
//! [`crate::framing::JsonFraming`] to carry protocol messages. Frame flow
//! stops at EOF or on an I/O error; the endpoint itself closes when the
//! [`IoEndpoint`] value is dropped.

use crate::endpoint::{ENDPOINT_BUFFER, TextEndpoint};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// A [`TextEndpoint`] over an `AsyncRead`/`AsyncWrite` pair.
pub struct IoEndpoint {
    out_tx: mpsc::UnboundedSender<String>,
    inbound: broadcast::Sender<String>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl IoEndpoint {
    /// Spawn the reader and writer pumps over the given byte streams.
    pub fn spawn<R, W>(reader: R, writer: W) -> IoEndpoint
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound, _) = broadcast::channel(ENDPOINT_BUFFER);
        let relay = inbound.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let _ = relay.send(line);
                    }
                    Ok(None) => {
                        log::debug!("io endpoint reader reached EOF");
                        break;
                    }
                    Err(e) => {
                        log::warn!("io endpoint read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = out_rx.recv().await {
                let write = async {
                    writer.write_all(frame.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                };
                if let Err(e) = write.await {
                    log::warn!("io endpoint write failed: {}", e);
                    break;
                }
            }
        });

        IoEndpoint {
            out_tx,
            inbound,
            reader_task,
            writer_task,
        }
    }
}

impl TextEndpoint for IoEndpoint {
    fn post_text(&self, frame: String) {
        // One frame per line; an embedded newline would desynchronise the
        // peer's framing.
        if frame.contains('\n') {
            log::error!("dropping outbound frame containing a raw newline");
            return;
        }
        if self.out_tx.send(frame).is_err() {
            log::trace!("posted into a closed io endpoint");
        }
    }

    fn subscribe_text(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }
}

impl Drop for IoEndpoint {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}
