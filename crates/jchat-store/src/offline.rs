//! Per-recipient offline message log.
//!
//! Record layout, repeated back to back:
//!
//! ```text
//! <time>\n
//! <sender>\n
//! <receiver or group>\n
//! <body length in bytes>\n
//! <body, exactly that many bytes>
//! ```
//!
//! The body is raw and may itself contain newlines; it is read by byte count,
//! never by line.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use jchat_shared::constants::OFFLINE_LOG_EXTENSION;
use jchat_shared::types::is_valid_name;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// One message waiting for its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineRecord {
    pub time: String,
    pub sender: String,
    /// The recipient for direct messages, the group name for group messages.
    pub receiver: String,
    pub body: Bytes,
}

/// Directory of `<recipient>.jchat` append-only logs.
#[derive(Debug, Clone)]
pub struct OfflineLog {
    dir: PathBuf,
}

impl OfflineLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!(path = %dir.display(), "Offline message log initialized");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one record to `recipient`'s log, creating the log if needed.
    pub fn append(&self, recipient: &str, record: &OfflineRecord) -> Result<()> {
        for field in [&record.time, &record.sender, &record.receiver] {
            if field.contains('\n') {
                return Err(StoreError::InvalidField(field.clone()));
            }
        }

        let mut buf = Vec::with_capacity(
            record.time.len() + record.sender.len() + record.receiver.len() + record.body.len() + 24,
        );
        buf.extend_from_slice(record.time.as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(record.sender.as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(record.receiver.as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(record.body.len().to_string().as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(&record.body);

        let path = self.log_path(recipient)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&buf)?;

        debug!(
            recipient,
            sender = %record.sender,
            size = record.body.len(),
            "Appended offline record"
        );
        Ok(())
    }

    /// Read every record for `recipient` without consuming them.
    pub fn read(&self, recipient: &str) -> Result<Vec<OfflineRecord>> {
        let path = self.log_path(recipient)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_records(recipient, &data))
    }

    /// Read every record for `recipient`, then truncate the log.
    pub fn drain(&self, recipient: &str) -> Result<Vec<OfflineRecord>> {
        let records = self.read(recipient)?;
        let path = self.log_path(recipient)?;
        if path.exists() {
            File::create(&path)?;
            debug!(recipient, count = records.len(), "Drained offline log");
        }
        Ok(records)
    }

    fn log_path(&self, recipient: &str) -> Result<PathBuf> {
        if !is_valid_name(recipient) {
            return Err(StoreError::InvalidName(recipient.to_string()));
        }
        Ok(self
            .dir
            .join(format!("{recipient}.{OFFLINE_LOG_EXTENSION}")))
    }
}

fn parse_records(recipient: &str, data: &[u8]) -> Vec<OfflineRecord> {
    let mut records = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        match parse_one(rest) {
            Some((record, remaining)) => {
                records.push(record);
                rest = remaining;
            }
            None => {
                warn!(
                    recipient,
                    trailing = rest.len(),
                    "Skipping truncated offline record"
                );
                break;
            }
        }
    }
    records
}

fn parse_one(data: &[u8]) -> Option<(OfflineRecord, &[u8])> {
    let (time, rest) = take_line(data)?;
    let (sender, rest) = take_line(rest)?;
    let (receiver, rest) = take_line(rest)?;
    let (len, rest) = take_line(rest)?;
    let len: usize = len.trim().parse().ok()?;
    if rest.len() < len {
        return None;
    }
    let (body, rest) = rest.split_at(len);
    Some((
        OfflineRecord {
            time,
            sender,
            receiver,
            body: Bytes::copy_from_slice(body),
        },
        rest,
    ))
}

fn take_line(data: &[u8]) -> Option<(String, &[u8])> {
    let pos = data.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&data[..pos]).into_owned();
    Some((line, &data[pos + 1..]))
}
