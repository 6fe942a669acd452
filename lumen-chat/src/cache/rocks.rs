//! RocksDB-backed persistent message cache.
//!
//! Column families:
//! - `messages`    : LZ4-compressed bincode `Message`, keyed by
//!   `<room_id> 0x00 <created_at:8 BE> <message_id>` so a prefix scan yields
//!   display order
//! - `message_keys`: `<room_id> 0x00 <message_id>` → primary key in `messages`
//! - `rooms`       : bincode `Room`, keyed by room id
//!
//! The `message_keys` index is what makes upsert idempotent by id: a second
//! write for the same id replaces the first entry even if its timestamp
//! differs.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lumen_core::{Message, MessageId, Room, RoomId};

use super::{sort_for_display, CacheError, MessageCache, Observation, ObserverRegistry};

const CF_MESSAGES: &str = "messages";
const CF_MESSAGE_KEYS: &str = "message_keys";
const CF_ROOMS: &str = "rooms";

const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_MESSAGE_KEYS, CF_ROOMS];

/// Separates the room id from the rest of a key.
const KEY_SEPARATOR: u8 = 0x00;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lumen_chat_cache"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

/// Persistent message cache.
pub struct RocksCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
    /// Serializes read-modify-write sequences (index lookup, then batch).
    write_lock: Mutex<()>,
    observers: ObserverRegistry,
}

impl RocksCache {
    /// Open the cache, creating the database and column families if needed.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened message cache at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
            observers: ObserverRegistry::new(),
        })
    }

    fn cf_options(name: &str, config: &CacheConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed.
            CF_MESSAGES => opts.set_compression_type(DBCompressionType::None),
            CF_MESSAGE_KEYS | CF_ROOMS => opts.set_compression_type(DBCompressionType::Lz4),
            _ => {}
        }

        opts
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of stored messages in a room.
    pub fn message_count(&self, room_id: &RoomId) -> Result<usize, CacheError> {
        let cf = self.cf(CF_MESSAGE_KEYS)?;
        let prefix = room_prefix(room_id)?;
        let mut count = 0;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CacheError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn load_room(&self, room_id: &RoomId) -> Result<Option<Room>, CacheError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, room_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn newest_message(&self, room_id: &RoomId) -> Result<Option<Message>, CacheError> {
        Ok(self.query(room_id)?.pop())
    }
}

impl MessageCache for RocksCache {
    fn upsert(&self, messages: &[Message]) -> Result<(), CacheError> {
        if messages.is_empty() {
            return Ok(());
        }

        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_keys = self.cf(CF_MESSAGE_KEYS)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        // Observers are notified before the lock is released so snapshots
        // reach them in write order.
        let _guard = self.write_lock.lock().map_err(|_| CacheError::Poisoned)?;
        let touched: BTreeSet<RoomId> = {
            // Later duplicates within the batch win.
            let mut latest: BTreeMap<(RoomId, MessageId), &Message> = BTreeMap::new();
            for message in messages {
                latest.insert((message.room_id.clone(), message.id.clone()), message);
            }

            let mut batch = WriteBatch::default();
            let mut rooms: BTreeMap<RoomId, Option<Room>> = BTreeMap::new();

            for message in latest.values() {
                let index_key = index_key(&message.room_id, &message.id)?;
                let primary = primary_key(message)?;

                if let Some(previous) = self.db.get_cf(cf_keys, &index_key)? {
                    if previous != primary {
                        batch.delete_cf(cf_messages, &previous);
                    }
                }
                batch.put_cf(cf_keys, &index_key, &primary);
                batch.put_cf(cf_messages, &primary, encode_message(message)?);

                if !rooms.contains_key(&message.room_id) {
                    let room = self.load_room(&message.room_id)?;
                    rooms.insert(message.room_id.clone(), room);
                }
                if let Some(Some(room)) = rooms.get_mut(&message.room_id) {
                    room.observe_message(message);
                }
            }

            for room in rooms.values().flatten() {
                batch.put_cf(cf_rooms, room.id.as_str().as_bytes(), encode_record(room)?);
            }

            self.db.write_opt(batch, &self.write_options())?;
            rooms.into_keys().collect()
        };

        log::debug!("Upserted {} messages across {} rooms", messages.len(), touched.len());

        for room_id in touched {
            if self.observers.is_observed(&room_id) {
                let snapshot = self.query(&room_id)?;
                self.observers.notify(&room_id, snapshot);
            }
        }
        Ok(())
    }

    fn query(&self, room_id: &RoomId) -> Result<Vec<Message>, CacheError> {
        let cf = self.cf(CF_MESSAGES)?;
        let prefix = room_prefix(room_id)?;

        let mut messages = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            messages.push(decode_message(&value)?);
        }
        // Keys only carry millisecond precision.
        sort_for_display(&mut messages);
        Ok(messages)
    }

    fn observe(&self, room_id: &RoomId) -> Result<Observation, CacheError> {
        let _guard = self.write_lock.lock().map_err(|_| CacheError::Poisoned)?;
        let initial = self.query(room_id)?;
        Ok(self.observers.register(room_id, initial))
    }

    fn upsert_rooms(&self, rooms: &[Room]) -> Result<(), CacheError> {
        let cf = self.cf(CF_ROOMS)?;
        let _guard = self.write_lock.lock().map_err(|_| CacheError::Poisoned)?;

        let mut batch = WriteBatch::default();
        for room in rooms {
            room_prefix(&room.id)?;
            let mut room = room.clone();
            if let Some(newest) = self.newest_message(&room.id)? {
                room.observe_message(&newest);
            }
            batch.put_cf(cf, room.id.as_str().as_bytes(), encode_record(&room)?);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn rooms(&self) -> Result<Vec<Room>, CacheError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rooms.push(decode_record::<Room>(&value)?);
        }
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rooms)
    }
}

/// `<room_id> 0x00`
fn room_prefix(room_id: &RoomId) -> Result<Vec<u8>, CacheError> {
    let bytes = room_id.as_str().as_bytes();
    if bytes.contains(&KEY_SEPARATOR) {
        return Err(CacheError::InvalidKey(format!("room id {room_id:?} contains NUL")));
    }
    let mut key = Vec::with_capacity(bytes.len() + 1);
    key.extend_from_slice(bytes);
    key.push(KEY_SEPARATOR);
    Ok(key)
}

/// `<room_id> 0x00 <created_at:8 BE> <message_id>`
fn primary_key(message: &Message) -> Result<Vec<u8>, CacheError> {
    let mut key = room_prefix(&message.room_id)?;
    key.extend_from_slice(&ordered_millis(message.created_at.timestamp_millis()));
    key.extend_from_slice(message.id.as_str().as_bytes());
    Ok(key)
}

/// `<room_id> 0x00 <message_id>`
fn index_key(room_id: &RoomId, message_id: &MessageId) -> Result<Vec<u8>, CacheError> {
    let mut key = room_prefix(room_id)?;
    key.extend_from_slice(message_id.as_str().as_bytes());
    Ok(key)
}

/// Big-endian encoding of a signed timestamp that sorts bytewise.
fn ordered_millis(millis: i64) -> [u8; 8] {
    ((millis as u64) ^ (1 << 63)).to_be_bytes()
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CacheError::Serialization(e.to_string()))
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CacheError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn encode_message(message: &Message) -> Result<Vec<u8>, CacheError> {
    Ok(lz4_flex::compress_prepend_size(&encode_record(message)?))
}

fn decode_message(bytes: &[u8]) -> Result<Message, CacheError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    decode_record(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use lumen_core::UserSummary;
    use std::fs;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lumen_test_rocks_{name}_{}", uuid::Uuid::new_v4()))
    }

    fn cleanup(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn msg(id: &str, room: &str, millis: i64) -> Message {
        Message::new(id, room, UserSummary::new("u1", "Ada"), at(millis)).with_content(id)
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_ordered_millis_sorts_across_sign() {
        let mut encoded = vec![
            ordered_millis(5),
            ordered_millis(-5),
            ordered_millis(0),
            ordered_millis(i64::MIN),
        ];
        encoded.sort();
        assert_eq!(
            encoded,
            vec![
                ordered_millis(i64::MIN),
                ordered_millis(-5),
                ordered_millis(0),
                ordered_millis(5),
            ]
        );
    }

    #[test]
    fn test_upsert_query_in_display_order() {
        let path = temp_db_path("order");
        let cache = RocksCache::open(CacheConfig::for_testing(&path)).unwrap();

        cache
            .upsert(&[msg("m3", "r1", 3_000), msg("m1", "r1", 1_000), msg("m2", "r1", 2_000)])
            .unwrap();
        let messages = cache.query(&RoomId::from("r1")).unwrap();
        assert_eq!(ids(&messages), vec!["m1", "m2", "m3"]);
        assert_eq!(messages[0].content.as_deref(), Some("m1"));

        drop(cache);
        cleanup(&path);
    }

    #[test]
    fn test_duplicate_ids_are_idempotent() {
        let path = temp_db_path("dupes");
        let cache = RocksCache::open(CacheConfig::for_testing(&path)).unwrap();
        let room = RoomId::from("r1");

        cache.upsert(&[msg("m1", "r1", 1_000), msg("m2", "r1", 2_000)]).unwrap();
        cache.upsert(&[msg("m2", "r1", 2_000), msg("m1", "r1", 1_000)]).unwrap();
        // Same id, shifted timestamp: still one entry.
        cache.upsert(&[msg("m1", "r1", 2_500)]).unwrap();

        let messages = cache.query(&room).unwrap();
        assert_eq!(ids(&messages), vec!["m2", "m1"]);
        assert_eq!(cache.message_count(&room).unwrap(), 2);

        drop(cache);
        cleanup(&path);
    }

    #[test]
    fn test_room_prefixes_do_not_bleed() {
        let path = temp_db_path("prefix");
        let cache = RocksCache::open(CacheConfig::for_testing(&path)).unwrap();

        // "r1" is a byte prefix of "r10"; the separator keeps them apart.
        cache.upsert(&[msg("a", "r1", 1), msg("b", "r10", 1)]).unwrap();
        assert_eq!(ids(&cache.query(&RoomId::from("r1")).unwrap()), vec!["a"]);
        assert_eq!(ids(&cache.query(&RoomId::from("r10")).unwrap()), vec!["b"]);

        drop(cache);
        cleanup(&path);
    }

    #[test]
    fn test_room_id_with_nul_is_rejected() {
        let path = temp_db_path("nul");
        let cache = RocksCache::open(CacheConfig::for_testing(&path)).unwrap();

        let result = cache.upsert(&[msg("m1", "bad\0room", 1)]);
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));

        drop(cache);
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_observe_gets_full_snapshots() {
        let path = temp_db_path("observe");
        let cache = RocksCache::open(CacheConfig::for_testing(&path)).unwrap();
        let room = RoomId::from("r1");

        cache.upsert(&[msg("m1", "r1", 1_000)]).unwrap();
        let mut obs = cache.observe(&room).unwrap();
        assert_eq!(obs.next().await.unwrap().messages.len(), 1);

        cache.upsert(&[msg("m2", "r1", 2_000)]).unwrap();
        let snapshot = obs.next().await.unwrap();
        assert_eq!(ids(&snapshot.messages), vec!["m1", "m2"]);

        drop(obs);
        drop(cache);
        cleanup(&path);
    }

    #[test]
    fn test_concurrent_writers_deliver_growing_snapshots() {
        let path = temp_db_path("concurrent");
        let cache = std::sync::Arc::new(RocksCache::open(CacheConfig::for_testing(&path)).unwrap());
        let mut obs = cache.observe(&RoomId::from("r1")).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        let id = format!("w{w}-{i}");
                        cache.upsert(&[msg(&id, "r1", 1_000 + i)]).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut sizes = Vec::new();
        while let Some(snapshot) = obs.try_next() {
            sizes.push(snapshot.messages.len());
        }
        assert_eq!(sizes.len(), 41);
        assert!(sizes.windows(2).all(|pair| pair[0] < pair[1]), "out of order: {sizes:?}");

        drop(obs);
        drop(cache);
        cleanup(&path);
    }

    #[test]
    fn test_rooms_track_last_message() {
        let path = temp_db_path("rooms");
        let cache = RocksCache::open(CacheConfig::for_testing(&path)).unwrap();

        cache
            .upsert_rooms(&[
                Room::new("r1", at(0)).with_name("Film presets"),
                Room::new("r2", at(0)),
            ])
            .unwrap();
        cache.upsert(&[msg("m1", "r2", 5_000)]).unwrap();

        let rooms = cache.rooms().unwrap();
        assert_eq!(rooms[0].id.as_str(), "r2");
        assert_eq!(rooms[0].last_message.as_ref().unwrap().id.as_str(), "m1");
        assert_eq!(rooms[1].name.as_deref(), Some("Film presets"));

        drop(cache);
        cleanup(&path);
    }

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.block_cache_size, 32 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::InvalidKey("x".into());
        assert!(err.to_string().contains("invalid key"));
        let err = CacheError::Database("boom".into());
        assert!(err.to_string().contains("database error"));
    }
}
