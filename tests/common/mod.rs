//! Shared test support: a scripted stand-in for the CAM server.
#![allow(dead_code)] // not every test crate uses every helper

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// A grammar-conforming acquisition filename for job 7.
pub const NAME_J7: &str =
    "image--L0003--S00--M00--U04--V06--J07--E00--O00--X01--Y02--T0003--Z02--C01.ome.tif";

/// In-process CAM server double. Accepts connections one at a time,
/// forwards every line pushed through [`MockCamServer::push`] to the
/// connected client and records every line the client writes. Dropping
/// the server closes the connection and stops accepting.
pub struct MockCamServer {
    pub addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<String>,
    received: mpsc::UnboundedReceiver<String>,
}

impl MockCamServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let mut buf = String::new();
                loop {
                    tokio::select! {
                        queued = out_rx.recv() => {
                            let Some(line) = queued else {
                                // Test dropped its handle: close and stop.
                                return;
                            };
                            if write_half.write_all(line.as_bytes()).await.is_err()
                                || write_half.write_all(b"\r\n").await.is_err()
                            {
                                break;
                            }
                            let _ = write_half.flush().await;
                        }
                        read = reader.read_line(&mut buf) => {
                            match read {
                                Ok(0) | Err(_) => break, // client gone; accept the next one
                                Ok(_) => {
                                    let _ = in_tx.send(buf.trim_end().to_string());
                                    buf.clear();
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            outgoing: out_tx,
            received: in_rx,
        }
    }

    /// Queue one line to be sent to the client (terminator appended).
    pub fn push(&self, line: impl Into<String>) {
        let _ = self.outgoing.send(line.into());
    }

    /// Announce an image by relative path, the way the server does.
    pub fn push_image(&self, relpath: &str) {
        self.push(format!("/app:matrix /cmd:image /relpath:{relpath}"));
    }

    /// Next line the client sent, or panic after two seconds.
    pub async fn expect_line(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("timed out waiting for a client line")
            .expect("server task ended")
    }

    /// Assert no further client line arrives within a short window.
    pub async fn expect_silence(&mut self) {
        let quiet =
            tokio::time::timeout(Duration::from_millis(150), self.received.recv()).await;
        assert!(quiet.is_err(), "unexpected client line: {quiet:?}");
    }
}
