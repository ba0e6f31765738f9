//! RocksDB-backed experiment store
//!
//! One database, namespaced by key prefix:
//!
//! ```text
//! test/{test_id}                                  -> ABTest (rollups zeroed)
//! rollup/{variant_id}                             -> VariantRollup
//! participant/{participant_id}                    -> Participant
//! identity/{test_id}/{identity_key}               -> ParticipantId
//! member/{test_id}/{participant_id}               -> ()
//! event/{test_id}/{seq:020}                       -> Event
//! analysis/{test_id}/{seq:020}                    -> AnalysisResult
//! meta/sequence                                   -> u64
//! ```
//!
//! Values are bincode (serde, standard config). Every read-modify-write path
//! runs under one mutex and commits through a single `WriteBatch`, so the
//! identity index, the participant row and the rollup counter always move
//! together.
//!
//! Events and snapshots are keyed by a store-wide sequence number handed out
//! under that mutex and persisted in the same batch, so prefix scans return
//! them in commit order even when timestamps tie.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use rocksdb::{Direction, FlushOptions, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::analyzer::AnalysisResult;
use super::lifecycle::ensure_admitted;
use super::store::{
    apply_conversion_to_rollup, apply_event_to_participant, AssignOutcome, EventEffect,
    ExperimentStore,
};
use super::types::{
    ABTest, Event, Identity, Participant, ParticipantId, TestId, TestStatus, VariantId,
    VariantRollup,
};
use crate::errors::{ExperimentError, Result};
use crate::metrics;

/// Helper trait to iterate over RocksDB results, logging instead of dropping errors
trait LogErrors<T> {
    fn log_errors(self) -> impl Iterator<Item = T>;
}

impl<I, T, E> LogErrors<T> for I
where
    I: Iterator<Item = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    fn log_errors(self) -> impl Iterator<Item = T> {
        self.filter_map(|r| match r {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("RocksDB iterator error (continuing): {}", e);
                None
            }
        })
    }
}

/// Write durability for storage operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// fsync on every write; survives power loss
    Sync,
    /// Buffered in the OS page cache; survives process crashes only
    #[default]
    Async,
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" => Ok(WriteMode::Sync),
            "async" => Ok(WriteMode::Async),
            other => Err(format!("unknown write mode '{other}' (expected sync or async)")),
        }
    }
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ExperimentError::Serialization(format!("failed to encode {what}: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| ExperimentError::Serialization(format!("failed to decode {what}: {e}")))
}

fn test_key(id: &TestId) -> String {
    format!("test/{id}")
}

fn rollup_key(id: &VariantId) -> String {
    format!("rollup/{id}")
}

fn participant_key(id: &ParticipantId) -> String {
    format!("participant/{id}")
}

fn identity_key(test_id: &TestId, identity: &Identity) -> String {
    format!("identity/{test_id}/{}", identity.key())
}

fn member_key(test_id: &TestId, participant_id: &ParticipantId) -> String {
    format!("member/{test_id}/{participant_id}")
}

fn event_key(test_id: &TestId, seq: u64) -> String {
    format!("event/{test_id}/{seq:020}")
}

fn analysis_key(test_id: &TestId, seq: u64) -> String {
    format!("analysis/{test_id}/{seq:020}")
}

const SEQUENCE_KEY: &str = "meta/sequence";

/// Persistent store surviving process restarts
pub struct RocksStore {
    db: Arc<DB>,
    storage_path: PathBuf,
    write_mode: WriteMode,
    /// Serializes read-modify-write sections; holds the last issued sequence
    write_lock: Mutex<u64>,
}

impl RocksStore {
    pub fn open(path: &Path, write_mode: WriteMode) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create storage dir {}", path.display()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_manual_wal_flush(false);
        opts.set_max_background_jobs(2);

        let db_path = path.join("experiments");
        let db = DB::open(&opts, &db_path)
            .with_context(|| format!("Failed to open RocksDB at {}", db_path.display()))?;

        let last_sequence = match db
            .get(SEQUENCE_KEY.as_bytes())
            .context("Failed to read sequence counter")?
        {
            Some(bytes) => decode::<u64>(&bytes, SEQUENCE_KEY)?,
            None => 0,
        };

        tracing::info!(
            path = %db_path.display(),
            last_sequence,
            "Experiment storage initialized with {:?} write mode",
            write_mode
        );

        Ok(Self {
            db: Arc::new(db),
            storage_path: path.to_path_buf(),
            write_mode,
            write_lock: Mutex::new(last_sequence),
        })
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    /// Block until memtables are flushed to disk
    pub fn flush(&self) -> Result<()> {
        let mut flush_opts = FlushOptions::default();
        flush_opts.set_wait(true);
        self.db
            .flush_opt(&flush_opts)
            .context("Failed to flush experiment database")?;
        Ok(())
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.write_mode == WriteMode::Sync);
        write_opts
    }

    fn commit(&self, op: &'static str, batch: WriteBatch) -> Result<()> {
        let result = self
            .db
            .write_opt(batch, &self.write_opts())
            .with_context(|| format!("Failed to commit {op} batch"));
        metrics::record_store_op(op, result.is_ok());
        Ok(result?)
    }

    fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let bytes = self
            .db
            .get(key.as_bytes())
            .with_context(|| format!("Failed to read {key}"))?;
        bytes.map(|b| decode(&b, key)).transpose()
    }

    fn scan_prefix(&self, prefix: &str) -> Vec<(Box<[u8]>, Box<[u8]>)> {
        self.db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
            .log_errors()
            .take_while(|(key, _)| key.starts_with(prefix.as_bytes()))
            .collect()
    }

    fn scan_values<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.scan_prefix(prefix)
            .iter()
            .map(|(_, value)| decode(value, prefix))
            .collect()
    }

    fn rollup(&self, variant_id: &VariantId) -> Result<VariantRollup> {
        Ok(self
            .get_value(&rollup_key(variant_id))?
            .unwrap_or_default())
    }

    fn with_rollups(&self, mut test: ABTest) -> Result<ABTest> {
        for variant in &mut test.variants {
            variant.rollup = self.rollup(&variant.id)?;
        }
        Ok(test)
    }

    /// Status gate evaluated while the caller holds `write_lock`
    fn check_status(&self, test_id: &TestId, admit: &[TestStatus]) -> Result<()> {
        let test: Option<ABTest> = self.get_value(&test_key(test_id))?;
        ensure_admitted(test_id, test.as_ref(), admit)
    }

    /// Reserve the next sequence number into `batch`
    ///
    /// The caller advances `*last` only after the batch commits.
    fn next_sequence(last: u64, batch: &mut WriteBatch) -> Result<u64> {
        let seq = last + 1;
        batch.put(SEQUENCE_KEY, encode(&seq, "sequence")?);
        Ok(seq)
    }

    fn put_test(batch: &mut WriteBatch, test: &ABTest) -> Result<()> {
        let mut stored = test.clone();
        for variant in &mut stored.variants {
            variant.rollup = VariantRollup::default();
        }
        batch.put(test_key(&test.id), encode(&stored, "test")?);
        Ok(())
    }
}

impl ExperimentStore for RocksStore {
    fn insert_test(&self, test: &ABTest) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.get_value::<ABTest>(&test_key(&test.id))?.is_some() {
            return Err(ExperimentError::TestAlreadyExists(test.id.to_string()));
        }
        let mut batch = WriteBatch::default();
        Self::put_test(&mut batch, test)?;
        self.commit("insert_test", batch)
    }

    fn get_test(&self, id: &TestId) -> Result<Option<ABTest>> {
        match self.get_value::<ABTest>(&test_key(id))? {
            Some(test) => Ok(Some(self.with_rollups(test)?)),
            None => Ok(None),
        }
    }

    fn update_test(&self, test: &ABTest) -> Result<ABTest> {
        let _guard = self.write_lock.lock();
        let current: ABTest = self
            .get_value(&test_key(&test.id))?
            .ok_or_else(|| ExperimentError::TestNotFound(test.id.to_string()))?;

        if current.revision != test.revision {
            return Err(ExperimentError::ConcurrencyConflict {
                resource: format!("test {}", test.id),
                attempts: 1,
            });
        }

        let mut next = test.clone();
        next.revision = current.revision + 1;
        let mut batch = WriteBatch::default();
        Self::put_test(&mut batch, &next)?;
        self.commit("update_test", batch)?;

        self.with_rollups(next)
    }

    fn list_tests(&self) -> Result<Vec<ABTest>> {
        let stored: Vec<ABTest> = self.scan_values("test/")?;
        let mut tests = stored
            .into_iter()
            .map(|t| self.with_rollups(t))
            .collect::<Result<Vec<_>>>()?;
        tests.sort_by_key(|t| t.created_at);
        Ok(tests)
    }

    fn get_or_create_participant(
        &self,
        test_id: &TestId,
        identity: &Identity,
        variant_id: &VariantId,
        admit: &[TestStatus],
    ) -> Result<AssignOutcome> {
        let _guard = self.write_lock.lock();
        self.check_status(test_id, admit)?;
        let index_key = identity_key(test_id, identity);

        if let Some(participant_id) = self.get_value::<ParticipantId>(&index_key)? {
            let participant = self.get_participant(&participant_id)?.ok_or_else(|| {
                ExperimentError::ConcurrencyConflict {
                    resource: format!("participant {participant_id}"),
                    attempts: 1,
                }
            })?;
            return Ok(AssignOutcome::Existing(participant));
        }

        let participant = Participant::new(*test_id, identity.clone(), *variant_id);
        let mut rollup = self.rollup(variant_id)?;
        rollup.participants_count += 1;

        let mut batch = WriteBatch::default();
        batch.put(
            participant_key(&participant.id),
            encode(&participant, "participant")?,
        );
        batch.put(index_key, encode(&participant.id, "participant id")?);
        batch.put(member_key(test_id, &participant.id), b"");
        batch.put(rollup_key(variant_id), encode(&rollup, "rollup")?);
        self.commit("assign", batch)?;

        tracing::debug!(test_id = %test_id, participant_id = %participant.id, "participant created");
        Ok(AssignOutcome::Created(participant))
    }

    fn get_participant(&self, id: &ParticipantId) -> Result<Option<Participant>> {
        self.get_value(&participant_key(id))
    }

    fn find_participant(
        &self,
        test_id: &TestId,
        identity: &Identity,
    ) -> Result<Option<Participant>> {
        match self.get_value::<ParticipantId>(&identity_key(test_id, identity))? {
            Some(participant_id) => self.get_participant(&participant_id),
            None => Ok(None),
        }
    }

    fn list_participants(&self, test_id: &TestId) -> Result<Vec<Participant>> {
        let prefix = format!("member/{test_id}/");
        let mut participants = Vec::new();
        for (key, _) in self.scan_prefix(&prefix) {
            let key_str = String::from_utf8_lossy(&key);
            let Some(id_str) = key_str.strip_prefix(&prefix) else {
                continue;
            };
            match uuid::Uuid::parse_str(id_str) {
                Ok(uuid) => {
                    if let Some(p) = self.get_participant(&ParticipantId(uuid))? {
                        participants.push(p);
                    }
                }
                Err(e) => tracing::warn!("Skipping malformed member key {}: {}", key_str, e),
            }
        }
        participants.sort_by_key(|p| p.assigned_at);
        Ok(participants)
    }

    fn append_event(&self, event: &Event, admit: &[TestStatus]) -> Result<EventEffect> {
        let mut last_sequence = self.write_lock.lock();
        self.check_status(&event.test_id, admit)?;
        let mut participant = self
            .get_participant(&event.participant_id)?
            .ok_or_else(|| ExperimentError::ParticipantNotFound(event.participant_id.to_string()))?;

        let first_conversion = apply_event_to_participant(&mut participant, event);

        let mut batch = WriteBatch::default();
        let seq = Self::next_sequence(*last_sequence, &mut batch)?;
        batch.put(event_key(&event.test_id, seq), encode(event, "event")?);
        batch.put(
            participant_key(&participant.id),
            encode(&participant, "participant")?,
        );
        if first_conversion {
            let mut rollup = self.rollup(&participant.variant_id)?;
            apply_conversion_to_rollup(&mut rollup, event.value);
            batch.put(
                rollup_key(&participant.variant_id),
                encode(&rollup, "rollup")?,
            );
        }
        self.commit("append_event", batch)?;
        *last_sequence = seq;

        Ok(EventEffect {
            participant,
            first_conversion,
        })
    }

    fn list_events(&self, test_id: &TestId) -> Result<Vec<Event>> {
        self.scan_values(&format!("event/{test_id}/"))
    }

    fn rollups(&self, test_id: &TestId) -> Result<HashMap<VariantId, VariantRollup>> {
        let test: ABTest = self
            .get_value(&test_key(test_id))?
            .ok_or_else(|| ExperimentError::TestNotFound(test_id.to_string()))?;
        let mut rollups = HashMap::with_capacity(test.variants.len());
        for variant in &test.variants {
            rollups.insert(variant.id, self.rollup(&variant.id)?);
        }
        Ok(rollups)
    }

    fn save_analysis(&self, result: &AnalysisResult) -> Result<()> {
        let mut last_sequence = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let seq = Self::next_sequence(*last_sequence, &mut batch)?;
        batch.put(
            analysis_key(&result.test_id, seq),
            encode(result, "analysis")?,
        );
        self.commit("save_analysis", batch)?;
        *last_sequence = seq;
        Ok(())
    }

    fn list_analyses(&self, test_id: &TestId) -> Result<Vec<AnalysisResult>> {
        self.scan_values(&format!("analysis/{test_id}/"))
    }
}
