//! The CAM protocol client.
//!
//! Owns the one TCP connection to the CAM server and exposes the four
//! primitives everything else is built from: `connect`/`disconnect`,
//! `send_command`, `flush_pending` and `wait_for_image`. Exactly one client
//! instance talks to exactly one server during a session; the session
//! controller owns the instance and hands it to whoever needs it.
//!
//! The wait loop carries two pieces of state across calls:
//!
//! - the last accepted filename, because the server occasionally announces
//!   the same file twice and the repeat must be absorbed, and
//! - the [`JobFilter`] latch: when no job of interest is configured, the
//!   first notification's job number is adopted and filters every later
//!   wait in the session. The latch moves `Unknown -> Fixed` exactly once.

use log::{debug, info, trace};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::ServerSettings;
use crate::error::{CamError, CamResult};
use crate::filename::FilenameMetadata;
use crate::protocol::{CamCommand, Notification};

/// How long one drain poll waits before deciding the inbound buffer is dry.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Which job's notifications are delivered by `wait_for_image`.
///
/// One-way latch: once `Fixed`, it stays fixed for the lifetime of the
/// client (runs within a session share it, matching the original
/// deployment where the adopted job number outlived individual runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    /// Not yet determined; the next notification decides.
    Unknown,
    Fixed(i32),
}

struct ClientIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client side of the persistent CAM server connection.
pub struct CamClient {
    host: String,
    port: u16,
    sys_id: u32,
    connect_timeout: Duration,
    io: Option<ClientIo>,
    last_filename: Option<String>,
    job_filter: JobFilter,
}

impl CamClient {
    pub fn new(host: impl Into<String>, port: u16, sys_id: u32) -> Self {
        Self {
            host: host.into(),
            port,
            sys_id,
            connect_timeout: Duration::from_secs(10),
            io: None,
            last_filename: None,
            job_filter: JobFilter::Unknown,
        }
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self::new(settings.address.clone(), settings.port, settings.sys_id)
            .with_connect_timeout(settings.connect_timeout)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Open the socket. Reconnecting is allowed; any prior socket is closed
    /// first.
    pub async fn connect(&mut self) -> CamResult<()> {
        if self.io.is_some() {
            debug!("reconnect requested, closing previous socket");
            self.disconnect();
        }
        let target = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| {
                CamError::Connection(format!(
                    "connect to {target} timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| CamError::Connection(format!("connect to {target} failed: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        self.io = Some(ClientIo {
            reader: BufReader::new(read_half),
            writer: write_half,
        });
        info!("connected to CAM server at {target}");
        Ok(())
    }

    /// Close the socket; a no-op when already disconnected.
    pub fn disconnect(&mut self) {
        if self.io.take().is_some() {
            info!("disconnected from CAM server");
        }
    }

    /// Whether `connect` succeeded and `disconnect` has not been called
    /// since. This is NOT a liveness probe: a dead peer is only noticed by
    /// the next read or write.
    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn job_filter(&self) -> JobFilter {
        self.job_filter
    }

    /// Forget the last accepted filename. Called at the start of a new
    /// analysis run so the first notification of the run is never taken
    /// for a duplicate of the previous run's last image.
    pub fn reset_duplicate_tracker(&mut self) {
        self.last_filename = None;
    }

    /// Serialize and send one command.
    pub async fn send_command(&mut self, command: &CamCommand) -> CamResult<()> {
        let line = command.encode(self.sys_id);
        let io = self.io.as_mut().ok_or(CamError::NotConnected)?;
        trace!("sending: {line}");
        io.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CamError::Write(e.to_string()))?;
        io.writer
            .write_all(b"\r\n")
            .await
            .map_err(|e| CamError::Write(e.to_string()))?;
        io.writer
            .flush()
            .await
            .map_err(|e| CamError::Write(e.to_string()))?;
        Ok(())
    }

    /// Drain and discard buffered inbound messages without processing
    /// them. Used at run start to get rid of notifications left over from
    /// a previous experiment. Returns the number of discarded lines.
    pub async fn flush_pending(&mut self) -> CamResult<usize> {
        let mut drained = 0;
        let mut line = String::new();
        let mut eof = false;
        loop {
            let io = self.io.as_mut().ok_or(CamError::NotConnected)?;
            line.clear();
            match tokio::time::timeout(DRAIN_POLL, io.reader.read_line(&mut line)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    eof = true;
                    break;
                }
                Ok(Ok(_)) => {
                    trace!("flushed stale message: {}", line.trim_end());
                    drained += 1;
                }
                Ok(Err(e)) => {
                    return Err(CamError::Connection(format!("read failed: {e}")));
                }
            }
        }
        if eof {
            self.disconnect();
        }
        if drained > 0 {
            debug!("flushed {drained} stale message(s) from the CAM server");
        }
        Ok(drained)
    }

    /// Block until the server announces an image for the job of interest,
    /// or until `timeout` elapses.
    ///
    /// `job_of_interest >= 0` fixes the filter; `-1` leaves it to the
    /// first notification, which is both adopted and delivered. Duplicates
    /// of the last accepted filename and notifications for other jobs are
    /// skipped without resetting the deadline. A filename that does not
    /// match the naming grammar aborts the wait.
    pub async fn wait_for_image(
        &mut self,
        job_of_interest: i32,
        timeout: Duration,
    ) -> CamResult<(String, FilenameMetadata)> {
        if job_of_interest >= 0 && self.job_filter == JobFilter::Unknown {
            self.job_filter = JobFilter::Fixed(job_of_interest);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut line = String::new();

        loop {
            let bytes = {
                let io = self.io.as_mut().ok_or(CamError::NotConnected)?;
                line.clear();
                match tokio::time::timeout_at(deadline, io.reader.read_line(&mut line)).await {
                    Err(_) => return Err(CamError::Timeout(timeout)),
                    Ok(result) => {
                        result.map_err(|e| CamError::Connection(format!("read failed: {e}")))?
                    }
                }
            };
            if bytes == 0 {
                self.disconnect();
                return Err(CamError::Connection(
                    "server closed the connection".to_string(),
                ));
            }

            let notification = Notification::parse(&line);
            let Some(filename) = notification.filename() else {
                trace!("skipping non-image message: {}", notification.raw());
                continue;
            };
            if self.last_filename.as_deref() == Some(filename) {
                trace!("discarding duplicate notification for {filename}");
                continue;
            }

            let metadata = FilenameMetadata::parse(filename)?;
            let job = metadata.job.value();
            match self.job_filter {
                JobFilter::Unknown => {
                    info!("adopting job {job} as the job of interest");
                    self.job_filter = JobFilter::Fixed(job);
                }
                JobFilter::Fixed(wanted) if wanted == job => {}
                JobFilter::Fixed(wanted) => {
                    trace!("ignoring notification for job {job} (waiting for {wanted})");
                    continue;
                }
            }

            let filename = filename.to_string();
            self.last_filename = Some(filename.clone());
            info!(
                "image ready: {filename} (received {})",
                notification.received_at()
            );
            return Ok((filename, metadata));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected_with_unknown_filter() {
        let client = CamClient::new("127.0.0.1", 8895, 0);
        assert!(!client.is_connected());
        assert_eq!(client.job_filter(), JobFilter::Unknown);
    }

    #[tokio::test]
    async fn commands_fail_fast_when_disconnected() {
        let mut client = CamClient::new("127.0.0.1", 8895, 0);
        assert!(matches!(
            client.send_command(&CamCommand::StartScan).await,
            Err(CamError::NotConnected)
        ));
        assert!(matches!(
            client.flush_pending().await,
            Err(CamError::NotConnected)
        ));
        assert!(matches!(
            client
                .wait_for_image(-1, Duration::from_millis(10))
                .await,
            Err(CamError::NotConnected)
        ));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut client = CamClient::new("127.0.0.1", 8895, 0);
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
    }
}
