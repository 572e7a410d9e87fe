//! RocksDB-backed block storage.
//!
//! Column families:
//! - `blocks`   - one entry per block id (bincode, LZ4 compressed)
//! - `metadata` - replica bookkeeping (Lamport clock)
//!
//! Every commit is a single `WriteBatch`, so a block write and the clock that
//! stamped it land together or not at all.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};

use folio_core::Block;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::backend::{BlockBackend, Commit};
use super::StoreError;

const CF_BLOCKS: &str = "blocks";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_BLOCKS, CF_METADATA];

const CLOCK_KEY: &[u8] = b"clock";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::StorageUnavailable(e.to_string())
    }
}

/// RocksDB block backend.
pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened block store at {}", config.path.display());

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_BLOCKS => {
                // Values are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn encode_block(block: &Block) -> Result<Vec<u8>, StoreError> {
        let bytes = bincode::serde::encode_to_vec(block, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode_block(value: &[u8]) -> Result<Block, StoreError> {
        let bytes = lz4_flex::decompress_size_prepended(value)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (block, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(block)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::StorageUnavailable(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl BlockBackend for RocksBackend {
    fn load_blocks(&self) -> Result<Vec<Block>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let mut blocks = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            match Self::decode_block(&value) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    log::warn!(
                        "Skipping unreadable block {}: {e}",
                        String::from_utf8_lossy(&key)
                    );
                }
            }
        }
        Ok(blocks)
    }

    fn load_clock(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, CLOCK_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            Some(_) => Err(StoreError::DeserializationError("malformed clock entry".into())),
            None => Ok(0),
        }
    }

    fn commit(&self, commit: Commit<'_>) -> Result<(), StoreError> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for block in &commit.writes {
            batch.put_cf(&cf_blocks, block.id.as_str().as_bytes(), Self::encode_block(block)?);
        }
        for id in &commit.erases {
            batch.delete_cf(&cf_blocks, id.as_str().as_bytes());
        }
        batch.put_cf(&cf_meta, CLOCK_KEY, commit.clock.to_be_bytes());

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(&cf, &key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rocksdb"
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{BlockPatch, ReplicaId, Stamp};

    fn block(id: &str, clock: u64) -> Block {
        Block::create(&BlockPatch::new(id).index(clock as i64), Stamp::new(clock, ReplicaId::from("r")))
    }

    #[test]
    fn test_open_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksBackend::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(backend.load_blocks().unwrap().is_empty());
        assert_eq!(backend.load_clock().unwrap(), 0);
        assert_eq!(backend.name(), "rocksdb");
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let (a, b) = (block("a", 1), block("b", 2));
        {
            let backend = RocksBackend::open(StoreConfig::for_testing(&path)).unwrap();
            backend
                .commit(Commit { writes: vec![&a, &b], erases: vec![], clock: 2 })
                .unwrap();
            backend
                .commit(Commit { writes: vec![], erases: vec![&a.id], clock: 3 })
                .unwrap();
        }

        let backend = RocksBackend::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(backend.load_blocks().unwrap(), vec![b]);
        assert_eq!(backend.load_clock().unwrap(), 3);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksBackend::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let a = block("a", 1);
        backend.commit(Commit { writes: vec![&a], erases: vec![], clock: 1 }).unwrap();
        backend.clear().unwrap();
        assert!(backend.load_blocks().unwrap().is_empty());
        assert_eq!(backend.load_clock().unwrap(), 1);
    }
}
