//! Wire-level encoding of the CAM command dialect.
//!
//! The CAM server speaks a line-oriented text protocol: each message is a
//! sequence of `/key:value` tokens. Outgoing commands queue, start and
//! abandon imaging jobs; inbound messages announce completed acquisitions
//! by relative file path. Numbers are exchanged as text on the wire and
//! converted to typed integers immediately on either side of this module —
//! nothing string-typed leaks into the rest of the crate.

use chrono::{DateTime, Utc};

/// Default TCP port of the CAM server.
pub const DEFAULT_CAM_PORT: u16 = 8895;

/// Client identifier sent in every outgoing command.
const CLIENT_TOKEN: &str = "camlink";

/// One high-resolution scan request, built per imaged object and sent
/// immediately. All positional indices are 1-based as the server expects;
/// `dx`/`dy` are stage-relative pixel offsets and may be negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagingJob {
    pub job_name: String,
    pub dx: i32,
    pub dy: i32,
    pub slide: i32,
    pub well_x: i32,
    pub well_y: i32,
    pub field_x: i32,
    pub field_y: i32,
}

/// Outgoing command kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CamCommand {
    /// Clear all queued jobs.
    DeleteList,
    /// Append one job to the queue.
    AddJob(ImagingJob),
    /// Begin executing queued jobs.
    StartScan,
    /// Tell the server to stop waiting for further submissions.
    StopWaiting,
}

impl CamCommand {
    /// Serialize to one wire line (without terminator).
    pub fn encode(&self, sys_id: u32) -> String {
        let head = format!("/cli:{CLIENT_TOKEN} /app:matrix /sys:{sys_id}");
        match self {
            CamCommand::DeleteList => format!("{head} /cmd:deletelist"),
            CamCommand::AddJob(job) => format!(
                "{head} /cmd:add /tar:camlist /exp:{} /ext:none \
                 /slide:{} /wellx:{} /welly:{} /fieldx:{} /fieldy:{} /dxpos:{} /dypos:{}",
                job.job_name,
                job.slide,
                job.well_x,
                job.well_y,
                job.field_x,
                job.field_y,
                job.dx,
                job.dy,
            ),
            CamCommand::StartScan => format!("{head} /cmd:startscan"),
            CamCommand::StopWaiting => format!("{head} /cmd:stopwaitingforcam"),
        }
    }
}

/// One raw inbound message.
///
/// Parsing never fails; interpretation happens in [`Notification::filename`]:
/// a message either carries an image path (a `/relpath:` field, or a bare
/// path line) or it is protocol chatter to be skipped.
#[derive(Debug, Clone)]
pub struct Notification {
    raw: String,
    fields: Vec<(String, String)>,
    received_at: DateTime<Utc>,
}

impl Notification {
    pub fn parse(line: &str) -> Self {
        let raw = line.trim().to_string();
        let mut fields = Vec::new();
        if raw.starts_with('/') {
            for token in raw.split_whitespace() {
                if let Some(body) = token.strip_prefix('/') {
                    if let Some((key, value)) = body.split_once(':') {
                        fields.push((key.to_string(), value.to_string()));
                    }
                }
            }
        }
        Self {
            raw,
            fields,
            received_at: Utc::now(),
        }
    }

    /// Look up a `/key:value` field.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The image path this message announces, if any.
    ///
    /// Keyed messages must carry `/relpath:`; a keyed message without one
    /// (an acknowledgement, a banner) is not an image notification. A line
    /// with no `/key:value` structure is taken verbatim as a path.
    pub fn filename(&self) -> Option<&str> {
        if self.fields.is_empty() {
            if self.raw.is_empty() {
                None
            } else {
                Some(&self.raw)
            }
        } else {
            self.field("relpath")
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
