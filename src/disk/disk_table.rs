//! Disk Table
//!
//! Bulk records that live on disk rather than in partitions.
//!
//! ## Write path
//! `put` batches records into the current block. Every `buffer_records` records (and at
//! every block rotation) the batch is pushed into a bounded channel drained by a writer
//! task that sends it as DATA_PUT_REQUEST to the block's destination. The block number
//! rotates once a block holds `block_records` records. `finish_put` drains the writer and
//! runs a DATA_PUT_REQUEST_FINISH / DATA_PUT_REQUEST_DONE barrier over every rank,
//! this one included.
//!
//! ## Read path
//! `load` starts a loader on the blocking pool that walks this process's block files
//! and feeds decoded blocks into a bounded channel, so consumption overlaps with I/O.

use super::block::{DiskBlock, DiskTableDescriptor, read_frame};
use crate::error::{Error, Result};
use crate::table::marshal::{BincodeMarshal, Marshal};
use crate::transport::network::NetworkThread;
use crate::transport::types::{Message, Rank, Tag};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct BlockWriter {
    tx: mpsc::Sender<(Rank, DiskBlock)>,
    handle: JoinHandle<Result<()>>,
}

struct BlockReader {
    rx: mpsc::Receiver<Result<DiskBlock>>,
    block: Option<DiskBlock>,
    next_record: usize,
}

pub struct DiskTable<K, V> {
    descriptor: DiskTableDescriptor,
    key_marshal: Arc<dyn Marshal<K>>,
    value_marshal: Arc<dyn Marshal<V>>,
    net: Arc<NetworkThread>,
    servers: Vec<Rank>,
    writer: Option<BlockWriter>,
    current: DiskBlock,
    /// Records in `current` not yet handed to the writer.
    buffered: usize,
    /// Records written into the current block number.
    in_block: usize,
    rotations: u64,
    reader: Option<BlockReader>,
}

impl<K, V> DiskTable<K, V>
where
    K: Serialize + DeserializeOwned + 'static,
    V: Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        descriptor: DiskTableDescriptor,
        net: Arc<NetworkThread>,
        servers: Vec<Rank>,
    ) -> Result<Self> {
        Self::with_marshals(
            descriptor,
            net,
            servers,
            Arc::new(BincodeMarshal),
            Arc::new(BincodeMarshal),
        )
    }
}

impl<K, V> DiskTable<K, V> {
    pub fn with_marshals(
        descriptor: DiskTableDescriptor,
        net: Arc<NetworkThread>,
        servers: Vec<Rank>,
        key_marshal: Arc<dyn Marshal<K>>,
        value_marshal: Arc<dyn Marshal<V>>,
    ) -> Result<Self> {
        if descriptor.fixed_server.is_none() && servers.is_empty() {
            return Err(Error::Config(format!(
                "disk table {} has no destination servers",
                descriptor.id
            )));
        }
        if descriptor.block_records == 0 || descriptor.buffer_records == 0 {
            return Err(Error::Config("disk table thresholds must be positive".into()));
        }

        let current = DiskBlock {
            table: descriptor.id,
            block_number: 0,
            records: Vec::new(),
        };

        Ok(Self {
            descriptor,
            key_marshal,
            value_marshal,
            net,
            servers,
            writer: None,
            current,
            buffered: 0,
            in_block: 0,
            rotations: 0,
            reader: None,
        })
    }

    pub fn descriptor(&self) -> &DiskTableDescriptor {
        &self.descriptor
    }

    /// Block number the next record goes to.
    pub fn block_number(&self) -> u64 {
        self.current.block_number
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Records of the current block still waiting in the in-memory batch.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn destination(&self, block_number: u64) -> Rank {
        match self.descriptor.fixed_server {
            Some(rank) => rank,
            None => self.servers[(block_number % self.servers.len() as u64) as usize],
        }
    }

    fn writer(&mut self) -> &mpsc::Sender<(Rank, DiskBlock)> {
        let writer = self.writer.get_or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.descriptor.prefetch_blocks.max(1));
            let handle = tokio::spawn(write_loop(self.net.clone(), rx));
            BlockWriter { tx, handle }
        });
        &writer.tx
    }

    pub async fn put(&mut self, key: &K, value: &V) -> Result<()> {
        let key = self.key_marshal.marshal(key)?;
        let value = self.value_marshal.marshal(value)?;
        self.current.records.push((key, value));
        self.buffered += 1;
        self.in_block += 1;

        if self.in_block >= self.descriptor.block_records {
            self.send_buffer().await?;
            self.current.block_number += 1;
            self.in_block = 0;
            self.rotations += 1;
            tracing::debug!(
                "Disk table {} rotated to block {}",
                self.descriptor.id,
                self.current.block_number
            );
        } else if self.buffered >= self.descriptor.buffer_records {
            self.send_buffer().await?;
        }
        Ok(())
    }

    /// Hands the current batch to the writer. Blocks while the channel is full.
    async fn send_buffer(&mut self) -> Result<()> {
        if self.current.records.is_empty() {
            return Ok(());
        }

        let block = DiskBlock {
            table: self.current.table,
            block_number: self.current.block_number,
            records: std::mem::take(&mut self.current.records),
        };
        self.buffered = 0;

        let dst = self.destination(block.block_number);
        self.writer()
            .send((dst, block))
            .await
            .map_err(|_| Error::Transport("disk writer stopped".into()))
    }

    /// Flushes the partial block, stops the writer and waits until every peer has
    /// acknowledged that its blocks are on disk.
    pub async fn finish_put(&mut self) -> Result<()> {
        self.send_buffer().await?;

        if let Some(BlockWriter { tx, handle }) = self.writer.take() {
            drop(tx);
            handle
                .await
                .map_err(|e| Error::Transport(format!("disk writer panicked: {}", e)))??;
        }

        // This rank may hold blocks too, and broadcast skips the sender.
        let finish = Message::new(Tag::DataPutRequestFinish).with_table(self.descriptor.id, 0);
        let rank = self.net.rank();
        self.net.send(rank, finish.clone())?;
        self.net.read(Some(rank), Tag::DataPutRequestDone).await?;
        self.net
            .sync_broadcast(finish, Tag::DataPutRequestDone)
            .await?;

        tracing::info!(
            "Disk table {} finished after {} block rotations",
            self.descriptor.id,
            self.rotations
        );
        Ok(())
    }

    /// Starts reading the block files present in this process's data directory.
    /// Returns the number of block files found.
    pub fn load(&mut self) -> Result<usize> {
        let files = self.descriptor.block_files()?;
        let count = files.len();
        let (tx, rx) = mpsc::channel(self.descriptor.prefetch_blocks.max(1));

        tokio::task::spawn_blocking(move || {
            for (_, path) in files {
                let mut reader = match File::open(&path) {
                    Ok(file) => BufReader::new(file),
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e.into()));
                        return;
                    }
                };
                loop {
                    match read_frame(&mut reader) {
                        Ok(Some(block)) => {
                            if tx.blocking_send(Ok(block)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.blocking_send(Err(e));
                            return;
                        }
                    }
                }
            }
        });

        self.reader = Some(BlockReader {
            rx,
            block: None,
            next_record: 0,
        });
        tracing::info!("Loading {} block files of disk table {}", count, self.descriptor.id);
        Ok(count)
    }

    /// Next loaded record, `None` once every block file is exhausted.
    pub async fn next(&mut self) -> Result<Option<(K, V)>> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(Error::Config(format!(
                "disk table {} read before load",
                self.descriptor.id
            )));
        };

        loop {
            if let Some(block) = &reader.block
                && let Some((key, value)) = block.records.get(reader.next_record)
            {
                reader.next_record += 1;
                return Ok(Some((
                    self.key_marshal.unmarshal(key)?,
                    self.value_marshal.unmarshal(value)?,
                )));
            }

            match reader.rx.recv().await {
                Some(Ok(block)) => {
                    reader.block = Some(block);
                    reader.next_record = 0;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }
}

async fn write_loop(
    net: Arc<NetworkThread>,
    mut rx: mpsc::Receiver<(Rank, DiskBlock)>,
) -> Result<()> {
    while let Some((dst, block)) = rx.recv().await {
        tracing::trace!(
            "Sending {} records of block {} to rank {}",
            block.records.len(),
            block.block_number,
            dst
        );
        let msg = Message::new(Tag::DataPutRequest)
            .with_table(block.table, 0)
            .with_version(block.block_number)
            .with_payload(&block)?;
        net.send(dst, msg)?;
    }
    Ok(())
}
