//! Checkpoint Log
//!
//! Append-only history of one shard, laid out for backward scanning.
//!
//! ```text
//! header:  shard_id (u32)
//! record:  key_len (u32) | key | value | table_size (u32) | total_len (u32)
//! ```
//!
//! `total_len` counts everything before itself (`key_len + key + value + table_size`),
//! so reading the previous record from offset `O` is: read the `u32` at `O - 4`, step back
//! `total_len` more bytes and read the record. All integers are little-endian.

use crate::error::{Error, Result};
use crate::transport::types::ShardId;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: u64 = 4;
const LEN_FIELD: u64 = 4;
/// key_len field + table_size field.
const RECORD_OVERHEAD: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub table_size: u32,
}

pub struct CheckpointLog {
    path: PathBuf,
    file: File,
    /// End of the next record returned by `previous_entry`.
    cursor: u64,
}

impl CheckpointLog {
    /// Creates (or truncates) a log for `shard`.
    pub fn create(path: &Path, shard: ShardId) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&shard.to_le_bytes())?;
        file.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            cursor: HEADER_LEN,
        })
    }

    /// Opens an existing log for appending; backward reads start at the newest record.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(Error::Corrupt(format!(
                "{} is shorter than its header",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            cursor: len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, key: &[u8], value: &[u8], table_size: usize) -> Result<()> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| Error::Corrupt("checkpoint key longer than 4 GiB".into()))?;
        let total = RECORD_OVERHEAD as usize + key.len() + value.len();
        let total_len = u32::try_from(total)
            .map_err(|_| Error::Corrupt("checkpoint record longer than 4 GiB".into()))?;
        let table_size = u32::try_from(table_size)
            .map_err(|_| Error::Corrupt("table size does not fit in u32".into()))?;

        let mut record = Vec::with_capacity(total + LEN_FIELD as usize);
        record.extend_from_slice(&key_len.to_le_bytes());
        record.extend_from_slice(key);
        record.extend_from_slice(value);
        record.extend_from_slice(&table_size.to_le_bytes());
        record.extend_from_slice(&total_len.to_le_bytes());

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&record)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_shard_id(&mut self) -> Result<ShardId> {
        self.file.seek(SeekFrom::Start(0))?;
        read_u32(&mut self.file)
    }

    /// Table size stored with the newest record, `None` for an empty log.
    pub fn read_latest_table_size(&mut self) -> Result<Option<u32>> {
        let len = self.file.metadata()?.len();
        if len <= HEADER_LEN {
            return Ok(None);
        }
        if len < HEADER_LEN + RECORD_OVERHEAD + LEN_FIELD {
            return Err(Error::Corrupt(format!(
                "{} ends inside a record",
                self.path.display()
            )));
        }
        self.file.seek(SeekFrom::Start(len - 8))?;
        read_u32(&mut self.file).map(Some)
    }

    /// Moves the backward cursor back to the end of the file.
    pub fn rewind_to_end(&mut self) -> Result<()> {
        self.cursor = self.file.metadata()?.len();
        Ok(())
    }

    /// Reads the record ending at the cursor and moves the cursor before it.
    /// Returns `None` once the header is reached.
    pub fn previous_entry(&mut self) -> Result<Option<LogEntry>> {
        if self.cursor <= HEADER_LEN {
            return Ok(None);
        }
        if self.cursor < HEADER_LEN + LEN_FIELD {
            return Err(self.corrupt("truncated length field"));
        }

        self.file.seek(SeekFrom::Start(self.cursor - LEN_FIELD))?;
        let total = read_u32(&mut self.file)? as u64;
        if total < RECORD_OVERHEAD || self.cursor - LEN_FIELD < HEADER_LEN + total {
            return Err(self.corrupt("record length out of range"));
        }

        let start = self.cursor - LEN_FIELD - total;
        self.file.seek(SeekFrom::Start(start))?;
        let mut record = vec![0u8; total as usize];
        self.file.read_exact(&mut record)?;

        let key_len = le_u32(&record[..4]) as u64;
        if key_len > total - RECORD_OVERHEAD {
            return Err(self.corrupt("key length exceeds record"));
        }
        let value_len = total - RECORD_OVERHEAD - key_len;

        let key_end = 4 + key_len as usize;
        let value_end = key_end + value_len as usize;
        let entry = LogEntry {
            key: record[4..key_end].to_vec(),
            value: record[key_end..value_end].to_vec(),
            table_size: le_u32(&record[value_end..value_end + 4]),
        };

        self.cursor = start;
        Ok(Some(entry))
    }

    /// Drains the log newest-first from the current cursor.
    pub fn backward(&mut self) -> impl Iterator<Item = Result<LogEntry>> + '_ {
        std::iter::from_fn(move || self.previous_entry().transpose())
    }

    fn corrupt(&self, what: &str) -> Error {
        Error::Corrupt(format!(
            "{} at offset {}: {}",
            self.path.display(),
            self.cursor,
            what
        ))
    }
}

fn read_u32(file: &mut File) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}
