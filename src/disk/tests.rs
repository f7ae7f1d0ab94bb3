//! Disk Module Tests
//!
//! ## Test Scopes
//! - **CheckpointLog**: binary layout, backward scanning, reopen-and-append and the
//!   newest-value-wins restore into a partition.
//! - **BlockStore**: block files and frame encoding.
//! - **DiskTable**: block rotation on the write path and the prefetching loader.

#[cfg(test)]
mod tests {
    use crate::disk::block::{BlockStore, DiskBlock, DiskTableDescriptor, read_block_file};
    use crate::disk::checkpoint::CheckpointLog;
    use crate::disk::disk_table::DiskTable;
    use crate::error::{Error, Result};
    use crate::table::handler::Replace;
    use crate::table::partition::LocalPartition;
    use crate::transport::fabric::MemoryFabric;
    use crate::transport::network::NetworkThread;
    use crate::transport::types::Tag;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn mesh_nets(size: usize) -> Vec<Arc<NetworkThread>> {
        let mut nets = Vec::new();
        for (fabric, inbox) in MemoryFabric::mesh(size) {
            let net = NetworkThread::new(fabric, inbox);
            net.clone().start().await;
            nets.push(net);
        }
        nets
    }

    // ============================================================
    // CHECKPOINT LOG TESTS
    // ============================================================

    #[test]
    fn test_checkpoint_layout_is_little_endian() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.ckpt");

        let mut log = CheckpointLog::create(&path, 3).unwrap();
        log.append(b"ab", b"xyz", 1).unwrap();
        log.sync().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let expected: Vec<u8> = [
            &3u32.to_le_bytes()[..],
            &2u32.to_le_bytes()[..],
            &b"ab"[..],
            &b"xyz"[..],
            &1u32.to_le_bytes()[..],
            &13u32.to_le_bytes()[..],
        ]
        .concat();
        assert_eq!(bytes, expected, "total_len should be key + value + 8");
    }

    #[test]
    fn test_checkpoint_scans_newest_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.ckpt");

        let mut log = CheckpointLog::create(&path, 0).unwrap();
        log.append(b"k1", b"v1", 1).unwrap();
        log.append(b"k2", b"", 2).unwrap();
        log.append(b"k1", b"v3", 2).unwrap();

        let mut reader = CheckpointLog::open(&path).unwrap();
        let entries: Vec<_> = reader.backward().collect::<Result<_>>().unwrap();

        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"k1"[..], &b"k2"[..], &b"k1"[..]]);
        assert_eq!(entries[0].value, b"v3");
        assert!(entries[1].value.is_empty(), "Empty values should survive");
        assert_eq!(entries[2].table_size, 1);
    }

    #[test]
    fn test_checkpoint_header_and_latest_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.ckpt");

        let mut log = CheckpointLog::create(&path, 11).unwrap();
        assert_eq!(log.read_latest_table_size().unwrap(), None, "Fresh log has no records");

        log.append(b"a", b"1", 1).unwrap();
        log.append(b"b", b"2", 2).unwrap();

        assert_eq!(log.read_shard_id().unwrap(), 11);
        assert_eq!(log.read_latest_table_size().unwrap(), Some(2));
    }

    #[test]
    fn test_checkpoint_reopen_appends_after_existing_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.ckpt");
        {
            let mut log = CheckpointLog::create(&path, 0).unwrap();
            log.append(b"a", b"old", 1).unwrap();
        }

        let mut log = CheckpointLog::open(&path).unwrap();
        log.append(b"a", b"new", 1).unwrap();
        log.rewind_to_end().unwrap();

        let newest = log.previous_entry().unwrap().unwrap();
        let oldest = log.previous_entry().unwrap().unwrap();
        assert_eq!(newest.value, b"new");
        assert_eq!(oldest.value, b"old");
        assert!(log.previous_entry().unwrap().is_none(), "Header ends the scan");
    }

    #[test]
    fn test_checkpoint_detects_garbage_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.ckpt");
        {
            let mut log = CheckpointLog::create(&path, 0).unwrap();
            log.append(b"a", b"1", 1).unwrap();
        }
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();

        let mut log = CheckpointLog::open(&path).unwrap();

        assert!(matches!(log.previous_entry(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_checkpoint_restore_keeps_last_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.ckpt");

        // ARRANGE: (k1, v1, 1) then (k1, v2, 1)
        let mut log = CheckpointLog::create(&path, 0).unwrap();
        log.append(b"k1", b"v1", 1).unwrap();
        log.append(b"k1", b"v2", 1).unwrap();

        // ACT
        let mut log = CheckpointLog::open(&path).unwrap();
        let desired = log.read_latest_table_size().unwrap().unwrap();
        log.rewind_to_end().unwrap();
        let mut partition: LocalPartition<Vec<u8>, Vec<u8>> =
            LocalPartition::new(0, 4, Arc::new(Replace::<Vec<u8>>::default()));
        let entries = log.backward().map(|e| e.map(|e| (e.key, e.value)));
        partition.restore(entries, desired as usize).unwrap();

        // ASSERT
        assert_eq!(partition.len(), 1);
        assert_eq!(partition.get(&b"k1".to_vec()).unwrap(), &b"v2".to_vec());
    }

    // ============================================================
    // BLOCK STORE TESTS
    // ============================================================

    #[test]
    fn test_block_store_writes_one_file_per_block() {
        let dir = TempDir::new().unwrap();
        let descriptor = DiskTableDescriptor::new(2, "train", dir.path());
        let store = BlockStore::new(descriptor.clone());

        let block = |number: u64, marker: u8| DiskBlock {
            table: 2,
            block_number: number,
            records: vec![(vec![marker], vec![marker, marker])],
        };
        store.dump(&block(0, 1)).unwrap();
        store.dump(&block(0, 2)).unwrap();
        store.dump(&block(10, 3)).unwrap();
        store.dump(&block(2, 4)).unwrap();
        store.finish().unwrap();

        let files = descriptor.block_files().unwrap();
        let numbers: Vec<u64> = files.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![0, 2, 10], "Block files should sort numerically");

        let first = read_block_file(&descriptor.block_path(0)).unwrap();
        assert_eq!(first.len(), 2, "Batches of one block share its file");
        assert_eq!(first[1].records[0].0, vec![2]);
    }

    #[test]
    fn test_missing_data_dir_has_no_blocks() {
        let dir = TempDir::new().unwrap();
        let descriptor = DiskTableDescriptor::new(1, "none", &dir.path().join("absent"));

        assert!(descriptor.block_files().unwrap().is_empty());
    }

    // ============================================================
    // DISK TABLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_five_hundred_records_rotate_once() {
        let dir = TempDir::new().unwrap();
        let nets = mesh_nets(2).await;
        let descriptor = DiskTableDescriptor {
            block_records: 500,
            buffer_records: 100,
            ..DiskTableDescriptor::new(1, "rot", dir.path())
        };
        let mut table: DiskTable<u32, u32> = DiskTable::new(descriptor, nets[0].clone(), vec![1]).unwrap();

        for i in 0..500 {
            table.put(&i, &i).await.unwrap();
        }
        assert_eq!(table.rotations(), 1, "Exactly one rotation after 500 records");
        assert_eq!(table.block_number(), 1);
        assert_eq!(table.buffered(), 0);

        table.put(&500, &500).await.unwrap();
        assert_eq!(table.rotations(), 1);
        assert_eq!(table.block_number(), 1, "Record 501 starts the second block");
        assert_eq!(table.buffered(), 1);

        // Five batches of 100 records went to rank 1 for block 0.
        for _ in 0..5 {
            let msg = nets[1].read(Some(0), Tag::DataPutRequest).await.unwrap();
            let block: DiskBlock = msg.payload().unwrap();
            assert_eq!(block.block_number, 0);
            assert_eq!(block.records.len(), 100);
        }
    }

    #[tokio::test]
    async fn test_blocks_round_robin_over_servers() {
        let dir = TempDir::new().unwrap();
        let nets = mesh_nets(3).await;
        let descriptor = DiskTableDescriptor::new(1, "rr", dir.path());
        let table: DiskTable<u32, u32> = DiskTable::new(descriptor.clone(), nets[0].clone(), vec![0, 1, 2]).unwrap();

        let owners: Vec<usize> = (0..5).map(|b| table.destination(b)).collect();
        assert_eq!(owners, vec![0, 1, 2, 0, 1]);

        let pinned = DiskTableDescriptor {
            fixed_server: Some(2),
            ..descriptor
        };
        let table: DiskTable<u32, u32> = DiskTable::new(pinned, nets[0].clone(), vec![0, 1]).unwrap();
        assert_eq!(table.destination(7), 2, "A fixed server overrides round robin");
    }

    #[tokio::test]
    async fn test_disk_table_without_destination_is_rejected() {
        let dir = TempDir::new().unwrap();
        let nets = mesh_nets(1).await;
        let descriptor = DiskTableDescriptor::new(1, "x", dir.path());

        let result = DiskTable::<u32, u32>::new(descriptor, nets[0].clone(), Vec::new());

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_load_streams_every_block_in_order() {
        let dir = TempDir::new().unwrap();
        let descriptor = DiskTableDescriptor {
            prefetch_blocks: 1,
            ..DiskTableDescriptor::new(4, "data", dir.path())
        };
        let store = BlockStore::new(descriptor.clone());
        for number in 0..3u64 {
            let records = (0..10u32)
                .map(|i| {
                    let key = number as u32 * 10 + i;
                    (bincode::serialize(&key).unwrap(), bincode::serialize(&(key * 2)).unwrap())
                })
                .collect();
            store
                .dump(&DiskBlock {
                    table: 4,
                    block_number: number,
                    records,
                })
                .unwrap();
        }
        store.finish().unwrap();

        let nets = mesh_nets(1).await;
        let mut table: DiskTable<u32, u32> = DiskTable::new(descriptor, nets[0].clone(), vec![0]).unwrap();
        assert_eq!(table.load().unwrap(), 3);

        let mut keys = Vec::new();
        while let Some((key, value)) = table.next().await.unwrap() {
            assert_eq!(value, key * 2);
            keys.push(key);
        }
        assert_eq!(keys, (0..30).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_next_before_load_fails() {
        let dir = TempDir::new().unwrap();
        let nets = mesh_nets(1).await;
        let descriptor = DiskTableDescriptor::new(1, "x", dir.path());
        let mut table: DiskTable<u32, u32> = DiskTable::new(descriptor, nets[0].clone(), vec![0]).unwrap();

        assert!(table.next().await.is_err());
    }
}
