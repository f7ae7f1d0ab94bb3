//! Disk blocks and their files.
//!
//! A block file `<data_dir>/<prefix>_<block_number>` is a sequence of frames, each a
//! little-endian `u32` length followed by one bincode-encoded [`DiskBlock`].

use crate::error::{Error, Result};
use crate::sync::lock;
use crate::transport::types::{Rank, TableId};

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A batch of marshalled records belonging to one block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskBlock {
    pub table: TableId,
    pub block_number: u64,
    pub records: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskTableDescriptor {
    pub id: TableId,
    pub name_prefix: String,
    pub data_dir: PathBuf,
    /// Records per block; the block number rotates once a block holds this many.
    pub block_records: usize,
    /// Records per DATA_PUT_REQUEST message.
    pub buffer_records: usize,
    /// Capacity of the bounded buffer between producer and consumer.
    pub prefetch_blocks: usize,
    /// Sends every block to this rank instead of `block_number % servers`.
    pub fixed_server: Option<Rank>,
}

impl DiskTableDescriptor {
    pub fn new(id: TableId, name_prefix: &str, data_dir: &Path) -> Self {
        Self {
            id,
            name_prefix: name_prefix.to_string(),
            data_dir: data_dir.to_path_buf(),
            block_records: 10_000,
            buffer_records: 100,
            prefetch_blocks: 4,
            fixed_server: None,
        }
    }

    pub fn block_path(&self, block_number: u64) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}", self.name_prefix, block_number))
    }

    /// Block files of this table in block order.
    pub fn block_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        if !self.data_dir.exists() {
            return Ok(files);
        }

        let prefix = format!("{}_", self.name_prefix);
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(number) = name.strip_prefix(&prefix)
                && let Ok(number) = number.parse::<u64>()
            {
                files.push((number, entry.path()));
            }
        }

        files.sort_unstable_by_key(|(number, _)| *number);
        Ok(files)
    }
}

pub fn write_frame<W: Write>(writer: &mut W, block: &DiskBlock) -> Result<()> {
    let bytes = bincode::serialize(block)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Corrupt("disk block larger than 4 GiB".into()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Next frame, or `None` at a clean end of file.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<DiskBlock>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Corrupt(format!("truncated disk block frame: {}", e)))?;
    Ok(Some(bincode::deserialize(&bytes)?))
}

/// Reads every frame of one block file.
pub fn read_block_file(path: &Path) -> Result<Vec<DiskBlock>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut blocks = Vec::new();
    while let Some(block) = read_frame(&mut reader)? {
        blocks.push(block);
    }
    Ok(blocks)
}

struct OpenBlock {
    number: u64,
    writer: BufWriter<File>,
}

/// Receiving side of a disk table: appends incoming blocks to their block files.
pub struct BlockStore {
    descriptor: DiskTableDescriptor,
    current: Mutex<Option<OpenBlock>>,
}

impl BlockStore {
    pub fn new(descriptor: DiskTableDescriptor) -> Self {
        Self {
            descriptor,
            current: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TableId {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &DiskTableDescriptor {
        &self.descriptor
    }

    /// Appends `block` to its block file, switching files when the block number changes.
    pub fn dump(&self, block: &DiskBlock) -> Result<()> {
        let mut current = lock(&self.current);

        let reopen = !matches!(&*current, Some(open) if open.number == block.block_number);
        if reopen {
            if let Some(mut previous) = current.take() {
                previous.writer.flush()?;
            }
            std::fs::create_dir_all(&self.descriptor.data_dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.descriptor.block_path(block.block_number))?;
            *current = Some(OpenBlock {
                number: block.block_number,
                writer: BufWriter::new(file),
            });
        }

        match current.as_mut() {
            Some(open) => write_frame(&mut open.writer, block),
            None => Err(Error::Corrupt("block file not open".into())),
        }
    }

    /// Whether a block file is open for appends.
    pub fn is_open(&self) -> bool {
        lock(&self.current).is_some()
    }

    /// Flushes and syncs the open block file.
    pub fn finish(&self) -> Result<()> {
        if let Some(mut open) = lock(&self.current).take() {
            open.writer.flush()?;
            open.writer.get_ref().sync_all()?;
        }
        tracing::info!("Disk table {} persisted", self.descriptor.id);
        Ok(())
    }
}
