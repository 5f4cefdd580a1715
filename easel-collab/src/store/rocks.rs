//! RocksDB-backed persistent shape store.
//!
//! Column families:
//! - `shapes`: one document per shape, keyed by the 16-byte shape id,
//!   value = LZ4-compressed bincode `Shape`
//!
//! Every database call runs on tokio's blocking pool under one mutex, so
//! each `modify`/`remove_if` is atomic with respect to other writers in
//! this process and runtime workers never wait on disk. Bulk operations go
//! through one `WriteBatch`.

use async_trait::async_trait;
use easel_core::{CollabError, Shape, ShapeId};
use log::{debug, info};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::backend::{sort_shapes, BulkEdit, ShapeBackend, ShapeChange, ShapeCheck, ShapeEdit};
use crate::feed::{Feed, Subscription};

type Db = DBWithThreadMode<SingleThreaded>;

const CF_SHAPES: &str = "shapes";

const COLUMN_FAMILIES: &[&str] = &[CF_SHAPES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
    /// Snapshot feed capacity (default: 256)
    pub feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("easel_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
            feed_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided (usually temporary) directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::default()
        }
    }
}

struct RocksInner {
    db: Mutex<Db>,
    feed: Feed<Vec<Shape>>,
    sync_writes: bool,
}

impl RocksInner {
    fn db(&self) -> MutexGuard<'_, Db> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    /// Publish the post-commit snapshot. Called with the db mutex held.
    fn publish(&self, db: &Db) -> Result<(), CollabError> {
        let mut shapes = RocksBackend::scan(db)?;
        sort_shapes(&mut shapes);
        self.feed.publish(shapes);
        Ok(())
    }
}

/// Durable shape backend.
pub struct RocksBackend {
    inner: Arc<RocksInner>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open (or create) the store and load the current snapshot.
    pub fn open(config: StoreConfig) -> Result<Self, CollabError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors).map_err(db_err)?;

        let mut shapes = Self::scan(&db)?;
        sort_shapes(&mut shapes);
        info!("Opened shape store at {} ({} shapes)", config.path.display(), shapes.len());

        let inner = RocksInner {
            db: Mutex::new(db),
            feed: Feed::with_value(config.feed_capacity, shapes),
            sync_writes: config.sync_writes,
        };
        Ok(Self {
            inner: Arc::new(inner),
            config,
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub async fn sync(&self) -> Result<(), CollabError> {
        self.blocking(|_, db| db.flush().map_err(db_err)).await
    }

    /// Run `op` on the blocking pool with the db mutex held.
    async fn blocking<T, F>(&self, op: F) -> Result<T, CollabError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner, &Db) -> Result<T, CollabError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let db = inner.db();
            op(&inner, &db)
        })
        .await
        .map_err(|e| CollabError::StoreUnavailable(format!("store task failed: {e}")))?
    }

    fn scan(db: &Db) -> Result<Vec<Shape>, CollabError> {
        let cf = cf(db)?;
        let mut shapes = Vec::new();
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(db_err)?;
            shapes.push(decode_shape(&value)?);
        }
        Ok(shapes)
    }

    fn load(db: &Db, id: ShapeId) -> Result<Option<Shape>, CollabError> {
        match db.get_cf(cf(db)?, id.as_bytes()).map_err(db_err)? {
            Some(bytes) => Ok(Some(decode_shape(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ShapeBackend for RocksBackend {
    async fn insert(&self, shape: Shape) -> Result<(), CollabError> {
        self.blocking(move |inner, db| {
            if Self::load(db, shape.id)?.is_some() {
                return Err(CollabError::InvalidShape(format!("duplicate shape id {}", shape.id)));
            }
            db.put_cf_opt(cf(db)?, shape.id.as_bytes(), encode_shape(&shape)?, &inner.write_opts())
                .map_err(db_err)?;
            inner.publish(db)
        })
        .await
    }

    async fn get(&self, id: ShapeId) -> Result<Option<Shape>, CollabError> {
        self.blocking(move |_, db| Self::load(db, id)).await
    }

    async fn list(&self) -> Result<Vec<Shape>, CollabError> {
        self.blocking(|_, db| {
            let mut shapes = Self::scan(db)?;
            sort_shapes(&mut shapes);
            Ok(shapes)
        })
        .await
    }

    async fn modify(&self, id: ShapeId, edit: ShapeEdit) -> Result<ShapeChange, CollabError> {
        self.blocking(move |inner, db| {
            let before = Self::load(db, id)?.ok_or(CollabError::NotFound(id))?;
            let mut after = before.clone();
            edit(&mut after)?;

            let change = ShapeChange { before, after };
            if change.changed() {
                db.put_cf_opt(cf(db)?, id.as_bytes(), encode_shape(&change.after)?, &inner.write_opts())
                    .map_err(db_err)?;
                inner.publish(db)?;
            }
            Ok(change)
        })
        .await
    }

    async fn remove_if(&self, id: ShapeId, check: ShapeCheck) -> Result<Shape, CollabError> {
        self.blocking(move |inner, db| {
            let current = Self::load(db, id)?.ok_or(CollabError::NotFound(id))?;
            check(&current)?;
            db.delete_cf_opt(cf(db)?, id.as_bytes(), &inner.write_opts())
                .map_err(db_err)?;
            inner.publish(db)?;
            Ok(current)
        })
        .await
    }

    async fn modify_all(&self, mut edit: BulkEdit) -> Result<usize, CollabError> {
        let changed = self
            .blocking(move |inner, db| {
                let handle = cf(db)?;
                let mut batch = WriteBatch::default();
                let mut changed = 0;
                for mut shape in Self::scan(db)? {
                    if edit(&mut shape) {
                        batch.put_cf(handle, shape.id.as_bytes(), encode_shape(&shape)?);
                        changed += 1;
                    }
                }
                if changed > 0 {
                    db.write_opt(batch, &inner.write_opts()).map_err(db_err)?;
                    inner.publish(db)?;
                }
                Ok(changed)
            })
            .await?;
        debug!("Bulk edit changed {} shapes", changed);
        Ok(changed)
    }

    async fn remove_all(&self) -> Result<usize, CollabError> {
        self.blocking(|inner, db| {
            let handle = cf(db)?;
            let mut batch = WriteBatch::default();
            let mut removed = 0;
            for item in db.iterator_cf(handle, IteratorMode::Start) {
                let (key, _) = item.map_err(db_err)?;
                batch.delete_cf(handle, &key);
                removed += 1;
            }
            if removed > 0 {
                db.write_opt(batch, &inner.write_opts()).map_err(db_err)?;
                inner.publish(db)?;
            }
            Ok(removed)
        })
        .await
    }

    fn subscribe(&self) -> Subscription<Vec<Shape>> {
        self.inner.feed.subscribe()
    }
}

fn cf(db: &Db) -> Result<&rocksdb::ColumnFamily, CollabError> {
    db.cf_handle(CF_SHAPES)
        .ok_or_else(|| CollabError::StoreUnavailable(format!("column family '{CF_SHAPES}' not found")))
}

fn db_err(e: rocksdb::Error) -> CollabError {
    CollabError::StoreUnavailable(e.to_string())
}

fn encode_shape(shape: &Shape) -> Result<Vec<u8>, CollabError> {
    let bytes = bincode::serde::encode_to_vec(shape, bincode::config::standard())
        .map_err(|e| CollabError::Codec(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_shape(value: &[u8]) -> Result<Shape, CollabError> {
    let bytes = lz4_flex::decompress_size_prepended(value)
        .map_err(|e| CollabError::Codec(e.to_string()))?;
    let (shape, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| CollabError::Codec(e.to_string()))?;
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::{ShapeKind, ShapeLock, UserId};

    fn open(dir: &tempfile::TempDir) -> RocksBackend {
        RocksBackend::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn rect(created_at: u64) -> Shape {
        Shape::create(ShapeKind::rectangle(1.0, 2.0, 30.0, 40.0), UserId::from("alice"), created_at).unwrap()
    }

    #[test]
    fn test_store_config_for_testing() {
        let config = StoreConfig::for_testing("/tmp/x");
        assert_eq!(config.path, PathBuf::from("/tmp/x"));
        assert_eq!(config.max_open_files, 64);
        assert_eq!(config.feed_capacity, 256);
    }

    #[test]
    fn test_codec_roundtrip() {
        let shape = rect(5);
        let encoded = encode_shape(&shape).unwrap();
        assert_eq!(decode_shape(&encoded).unwrap(), shape);
        assert!(matches!(decode_shape(&[1, 2, 3]), Err(CollabError::Codec(_))));
    }

    #[tokio::test]
    async fn test_insert_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let a = rect(20);
        let b = rect(10);
        store.insert(a.clone()).await.unwrap();
        store.insert(b.clone()).await.unwrap();

        assert_eq!(store.get(a.id).await.unwrap(), Some(a.clone()));
        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![b, a]);
    }

    #[tokio::test]
    async fn test_shapes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let shape = rect(1);
        {
            let store = open(&dir);
            store.insert(shape.clone()).await.unwrap();
            store.sync().await.unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.list().await.unwrap(), vec![shape.clone()]);

        let mut sub = store.subscribe();
        assert_eq!(*sub.next().await.unwrap(), vec![shape]);
    }

    #[tokio::test]
    async fn test_modify_and_remove_if() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let shape = rect(1);
        let id = shape.id;
        store.insert(shape).await.unwrap();

        let change = store
            .modify(
                id,
                Box::new(|s: &mut Shape| {
                    s.lock = Some(ShapeLock { holder: UserId::from("bob"), locked_at: 9 });
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert!(change.changed());
        assert!(store.get(id).await.unwrap().unwrap().is_locked_by(&UserId::from("bob")));

        let alice = UserId::from("alice");
        let denied = store
            .remove_if(id, Box::new(move |s: &Shape| s.check_writable(&alice)))
            .await;
        assert!(matches!(denied, Err(CollabError::LockConflict { .. })));

        let bob = UserId::from("bob");
        let removed = store
            .remove_if(id, Box::new(move |s: &Shape| s.check_writable(&bob)))
            .await
            .unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(store.get(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_all_publishes_one_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for t in 0..5 {
            store.insert(rect(t)).await.unwrap();
        }
        let mut sub = store.subscribe();
        assert_eq!(sub.next().await.unwrap().len(), 5);

        assert_eq!(store.remove_all().await.unwrap(), 5);
        assert!(sub.next().await.unwrap().is_empty());
        assert_eq!(store.remove_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_modify_all_counts_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for t in 0..4 {
            store.insert(rect(t)).await.unwrap();
        }
        let changed = store
            .modify_all(Box::new(|s: &mut Shape| {
                if s.created_at % 2 == 0 {
                    s.updated_at = 100;
                    true
                } else {
                    false
                }
            }))
            .await
            .unwrap();
        assert_eq!(changed, 2);
        let updated = store.list().await.unwrap().iter().filter(|s| s.updated_at == 100).count();
        assert_eq!(updated, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_modifies_are_serialised() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir));
        let shape = rect(0);
        let id = shape.id;
        let start = shape.updated_at;
        store.insert(shape).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .modify(
                            id,
                            Box::new(|s: &mut Shape| {
                                s.updated_at += 1;
                                Ok(())
                            }),
                        )
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap().changed());
        }

        assert_eq!(store.get(id).await.unwrap().unwrap().updated_at, start + 16);
        let mut sub = store.subscribe();
        assert_eq!(sub.next().await.unwrap()[0].updated_at, start + 16);
    }
}
