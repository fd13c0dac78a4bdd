//! File-backed store: an append-only journal of committed change sets.
//!
//! The journal is replayed into an in-memory [`ObjectTable`] at open time;
//! every later save is appended and then applied to the table.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ctxgraph_types::{ChangeSet, CommitSeq, ManagedObject, ObjectRef};

use crate::error::{StoreError, StoreResult};
use crate::schema::{ObjectGraphSchema, SchemaFingerprint};
use crate::table::ObjectTable;
use crate::traits::PersistentStore;

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: u64 = 8;

/// Flush/sync strategy for journal appends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every append (safest, highest latency).
    EveryWrite,
    /// Flush to the OS page cache only.
    #[default]
    OsDefault,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default)]
    pub sync_mode: SyncMode,
}

/// One journal record.
///
/// On-disk framing:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (JSON-encoded JournalRecord)]
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum JournalRecord {
    Header {
        fingerprint: String,
        created_at_ms: u64,
    },
    Commit {
        change_set: ChangeSet,
    },
}

struct JournalWriter {
    /// Opened in append mode, so every write lands at the end of the file.
    writer: BufWriter<File>,
    /// Offset just past the last complete record.
    offset: u64,
    /// Set when a failed append could not be cut off; the journal must be
    /// reopened before it accepts more records.
    poisoned: bool,
}

impl JournalWriter {
    fn new(file: File, offset: u64) -> Self {
        Self {
            writer: BufWriter::new(file),
            offset,
            poisoned: false,
        }
    }

    /// Cut the file back to `offset` and discard whatever is still buffered
    /// from a failed append.
    fn rewind(&mut self, offset: u64) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let failed = mem::replace(&mut self.writer, BufWriter::new(file));
        // Unwritten bytes belong to the failed record.
        let (_, _unwritten) = failed.into_parts();
        self.writer.get_ref().set_len(offset)?;
        self.offset = offset;
        Ok(())
    }
}

struct OpenJournal {
    fingerprint: SchemaFingerprint,
    writer: Mutex<JournalWriter>,
}

/// Persistent store backed by a single journal file.
///
/// Saves are serialized by the writer mutex; fetches only take the table's
/// read lock, so a slow `fsync` never blocks readers.
pub struct JournalStore {
    path: PathBuf,
    config: JournalConfig,
    journal: RwLock<Option<OpenJournal>>,
    table: RwLock<ObjectTable>,
}

impl JournalStore {
    /// Create a store for the journal at `path`. Nothing is read or written
    /// until [`PersistentStore::open`].
    pub fn new(path: impl Into<PathBuf>, config: JournalConfig) -> Self {
        Self {
            path: path.into(),
            config,
            journal: RwLock::new(None),
            table: RwLock::new(ObjectTable::new()),
        }
    }

    /// Path to the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fingerprint of the schema the journal was created with.
    pub fn fingerprint(&self) -> Option<SchemaFingerprint> {
        self.journal
            .read()
            .expect("journal lock poisoned")
            .as_ref()
            .map(|j| j.fingerprint)
    }

    /// Size of the journal in bytes.
    pub fn journal_len(&self) -> u64 {
        self.journal
            .read()
            .expect("journal lock poisoned")
            .as_ref()
            .map(|j| j.writer.lock().expect("journal writer poisoned").offset)
            .unwrap_or(0)
    }

    fn create(&self, schema: &ObjectGraphSchema) -> StoreResult<OpenJournal> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Only reached for a missing or empty file.
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let fingerprint = schema.fingerprint();
        let mut writer = JournalWriter::new(file, 0);
        let header = JournalRecord::Header {
            fingerprint: fingerprint.to_hex(),
            created_at_ms: now_ms(),
        };
        append_record(&mut writer, &header, SyncMode::EveryWrite)?;
        info!(path = %self.path.display(), schema = %fingerprint.short_hex(), "journal created");
        Ok(OpenJournal {
            fingerprint,
            writer: Mutex::new(writer),
        })
    }

    fn replay(&self, schema: &ObjectGraphSchema) -> StoreResult<(OpenJournal, ObjectTable)> {
        let requested = schema.fingerprint();
        let (records, valid_len, file_len) = read_records(&self.path)?;

        let mut records = records.into_iter();
        let fingerprint = match records.next() {
            Some((_, JournalRecord::Header { fingerprint, .. })) => {
                SchemaFingerprint::from_hex(&fingerprint)?
            }
            Some((offset, JournalRecord::Commit { .. })) => {
                return Err(StoreError::Corrupt {
                    offset,
                    reason: "journal does not start with a header".into(),
                })
            }
            None => {
                return Err(StoreError::Corrupt {
                    offset: 0,
                    reason: "journal has no readable header".into(),
                })
            }
        };
        if fingerprint != requested {
            return Err(StoreError::SchemaMismatch {
                stored: fingerprint.short_hex(),
                requested: requested.short_hex(),
            });
        }

        let mut table = ObjectTable::new();
        let mut commits = 0usize;
        for (offset, record) in records {
            match record {
                JournalRecord::Commit { change_set } => {
                    table.apply(&change_set).map_err(|e| StoreError::Corrupt {
                        offset,
                        reason: format!("commit does not replay: {e}"),
                    })?;
                    commits += 1;
                }
                JournalRecord::Header { .. } => {
                    return Err(StoreError::Corrupt {
                        offset,
                        reason: "unexpected second header".into(),
                    })
                }
            }
        }

        let file = OpenOptions::new().append(true).open(&self.path)?;
        if valid_len < file_len {
            warn!(
                path = %self.path.display(),
                valid_len,
                file_len,
                "discarding torn journal tail"
            );
            file.set_len(valid_len)?;
        }

        info!(
            path = %self.path.display(),
            commits,
            objects = table.len(),
            "journal replayed"
        );
        let journal = OpenJournal {
            fingerprint,
            writer: Mutex::new(JournalWriter::new(file, valid_len)),
        };
        Ok((journal, table))
    }
}

impl PersistentStore for JournalStore {
    fn open(&self, schema: &ObjectGraphSchema) -> StoreResult<()> {
        let mut journal = self.journal.write().expect("journal lock poisoned");
        if let Some(open) = journal.as_ref() {
            let requested = schema.fingerprint();
            if open.fingerprint != requested {
                return Err(StoreError::SchemaMismatch {
                    stored: open.fingerprint.short_hex(),
                    requested: requested.short_hex(),
                });
            }
            return Ok(());
        }

        let exists = fs::metadata(&self.path).map(|m| m.len() > 0).unwrap_or(false);
        if exists {
            let (open, table) = self.replay(schema)?;
            *self.table.write().expect("table lock poisoned") = table;
            *journal = Some(open);
        } else {
            *journal = Some(self.create(schema)?);
        }
        Ok(())
    }

    fn save(&self, change_set: &ChangeSet) -> StoreResult<()> {
        let journal = self.journal.read().expect("journal lock poisoned");
        let open = journal.as_ref().ok_or(StoreError::NotOpen)?;
        let mut writer = open.writer.lock().expect("journal writer poisoned");
        if writer.poisoned {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "journal has an uncut partial record; reopen the store",
            )));
        }

        self.table
            .read()
            .expect("table lock poisoned")
            .check(change_set)?;

        let record = JournalRecord::Commit {
            change_set: change_set.clone(),
        };
        let start = writer.offset;
        if let Err(e) = append_record(&mut writer, &record, self.config.sync_mode) {
            // Cut the partial record so the journal stays replayable.
            if let Err(rewind) = writer.rewind(start) {
                warn!(error = %rewind, offset = start, "failed to cut partial journal record");
                writer.poisoned = true;
            }
            return Err(e);
        }

        self.table
            .write()
            .expect("table lock poisoned")
            .apply(change_set)?;

        debug!(
            seq = ?change_set.seq(),
            offset = start,
            entries = change_set.len(),
            "journal append"
        );
        Ok(())
    }

    fn fetch(&self, reference: &ObjectRef) -> StoreResult<Option<ManagedObject>> {
        if self.fingerprint().is_none() {
            return Err(StoreError::NotOpen);
        }
        Ok(self
            .table
            .read()
            .expect("table lock poisoned")
            .get(reference)
            .cloned())
    }

    fn references(&self) -> StoreResult<Vec<ObjectRef>> {
        if self.fingerprint().is_none() {
            return Err(StoreError::NotOpen);
        }
        Ok(self.table.read().expect("table lock poisoned").references())
    }

    fn last_commit_seq(&self) -> StoreResult<Option<CommitSeq>> {
        Ok(self.table.read().expect("table lock poisoned").last_seq())
    }
}

impl std::fmt::Debug for JournalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalStore")
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn append_record(
    writer: &mut JournalWriter,
    record: &JournalRecord,
    sync_mode: SyncMode,
) -> StoreResult<()> {
    let payload =
        serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let length = u32::try_from(payload.len())
        .map_err(|_| StoreError::Serialization("journal record exceeds 4 GiB".into()))?;
    let crc = crc32fast::hash(&payload);

    writer.writer.write_all(&length.to_le_bytes())?;
    writer.writer.write_all(&crc.to_le_bytes())?;
    writer.writer.write_all(&payload)?;
    writer.writer.flush()?;
    if sync_mode == SyncMode::EveryWrite {
        writer.writer.get_ref().sync_all()?;
    }

    writer.offset += HEADER_SIZE + payload.len() as u64;
    Ok(())
}

/// Read every complete record.
///
/// Returns the records with their offsets, the length of the valid prefix
/// and the file length. A damaged record that reaches the end of the file is
/// a torn write and ends the valid prefix, as does a zero-filled tail;
/// damage followed by more data is corruption.
fn read_records(path: &Path) -> StoreResult<(Vec<(u64, JournalRecord)>, u64, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut records = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE <= file_len {
        let mut header = [0u8; HEADER_SIZE as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 {
            // A zero-filled tail is a torn write; a zero frame followed by
            // data is a gap in the journal.
            let mut rest = Vec::new();
            file.read_to_end(&mut rest)?;
            if expected_crc == 0 && rest.iter().all(|b| *b == 0) {
                warn!(offset, file_len, "zero-filled journal tail; treating as torn write");
                break;
            }
            return Err(StoreError::Corrupt {
                offset,
                reason: "zero-length record followed by data".into(),
            });
        }

        let end = offset + HEADER_SIZE + length;
        if end > file_len {
            warn!(offset, length, file_len, "journal record runs past end of file; stopping replay");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload)?;

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            if end == file_len {
                warn!(offset, "CRC mismatch in last journal record; treating as torn write");
                break;
            }
            return Err(StoreError::Corrupt {
                offset,
                reason: format!("CRC mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"),
            });
        }

        let record = serde_json::from_slice::<JournalRecord>(&payload).map_err(|e| {
            StoreError::Corrupt {
                offset,
                reason: format!("undecodable record: {e}"),
            }
        })?;
        records.push((offset, record));
        offset = end;
    }

    Ok((records, offset, file_len))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeKind, EntityDescription};
    use ctxgraph_types::{diff_attributes, Attributes, CommitStamp, ContextId};
    use serde_json::json;
    use std::io::{Seek, SeekFrom};

    fn temp_store() -> (tempfile::TempDir, JournalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path().join("graph.journal"), JournalConfig::default());
        store.open(&ObjectGraphSchema::empty()).unwrap();
        (dir, store)
    }

    fn reopen(dir: &tempfile::TempDir) -> StoreResult<JournalStore> {
        let store = JournalStore::new(dir.path().join("graph.journal"), JournalConfig::default());
        store.open(&ObjectGraphSchema::empty())?;
        Ok(store)
    }

    fn insert(store: &JournalStore, seq: u64, title: &str) -> ManagedObject {
        let obj = ManagedObject::new("Note", Attributes::from([("title".to_string(), json!(title))]));
        let cs = ChangeSet::builder(ContextId::new())
            .insert(obj.clone())
            .build()
            .stamped(CommitStamp::now(CommitSeq::new(seq)));
        store.save(&cs).unwrap();
        obj
    }

    #[test]
    fn save_and_replay() {
        let (dir, store) = temp_store();
        let a = insert(&store, 1, "a");
        let b = insert(&store, 2, "b");

        let diff = diff_attributes(&a.attributes, &Attributes::from([("title".to_string(), json!("a2"))]));
        let cs = ChangeSet::builder(ContextId::new())
            .update(a.reference, "Note", diff)
            .delete(b.reference)
            .build()
            .stamped(CommitStamp::now(CommitSeq::new(3)));
        store.save(&cs).unwrap();
        drop(store);

        let store = reopen(&dir).unwrap();
        assert_eq!(store.references().unwrap(), vec![a.reference]);
        let a_back = store.fetch(&a.reference).unwrap().unwrap();
        assert_eq!(a_back.get("title"), Some(&json!("a2")));
        assert_eq!(store.last_commit_seq().unwrap(), Some(CommitSeq::new(3)));
    }

    #[test]
    fn rejected_save_is_not_journaled() {
        let (dir, store) = temp_store();
        let a = insert(&store, 1, "a");
        let before = store.journal_len();

        let duplicate = ChangeSet::builder(ContextId::new())
            .insert(a.clone())
            .build()
            .stamped(CommitStamp::now(CommitSeq::new(2)));
        assert!(matches!(store.save(&duplicate), Err(StoreError::Conflict { .. })));
        assert_eq!(store.journal_len(), before);
        drop(store);

        let store = reopen(&dir).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn schema_mismatch_on_reopen() {
        let (dir, store) = temp_store();
        insert(&store, 1, "a");
        drop(store);

        let other = ObjectGraphSchema::empty().with_entity(
            "Note",
            EntityDescription::new().attribute("title", AttributeKind::String, true),
        );
        let store = JournalStore::new(dir.path().join("graph.journal"), JournalConfig::default());
        assert!(matches!(
            store.open(&other),
            Err(StoreError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn open_is_idempotent() {
        let (_dir, store) = temp_store();
        insert(&store, 1, "a");
        store.open(&ObjectGraphSchema::empty()).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let (dir, store) = temp_store();
        let a = insert(&store, 1, "a");
        insert(&store, 2, "b");
        let total = store.journal_len();
        drop(store);

        {
            let file = OpenOptions::new()
                .write(true)
                .open(dir.path().join("graph.journal"))
                .unwrap();
            file.set_len(total - 4).unwrap();
        }

        let store = reopen(&dir).unwrap();
        assert_eq!(store.references().unwrap(), vec![a.reference]);

        // Appends after recovery land on a clean boundary.
        let c = insert(&store, 2, "c");
        drop(store);
        let store = reopen(&dir).unwrap();
        assert_eq!(store.len().unwrap(), 2);
        assert!(store.fetch(&c.reference).unwrap().is_some());
    }

    #[test]
    fn failed_append_is_cut_before_next_commit() {
        let (dir, store) = temp_store();
        let a = insert(&store, 1, "a");
        let start = store.journal_len();
        {
            let journal = store.journal.read().unwrap();
            let mut writer = journal.as_ref().unwrap().writer.lock().unwrap();
            // Part of a record reached the file, the rest is still buffered.
            writer.writer.write_all(&[0xAB; 64]).unwrap();
            writer.writer.flush().unwrap();
            writer.writer.write_all(&[0xCD; 16]).unwrap();
            writer.rewind(start).unwrap();
        }
        let path = dir.path().join("graph.journal");
        assert_eq!(fs::metadata(&path).unwrap().len(), start);

        let b = insert(&store, 2, "b");
        assert_eq!(fs::metadata(&path).unwrap().len(), store.journal_len());
        drop(store);

        let store = reopen(&dir).unwrap();
        assert!(store.fetch(&a.reference).unwrap().is_some());
        assert!(store.fetch(&b.reference).unwrap().is_some());
        assert_eq!(store.last_commit_seq().unwrap(), Some(CommitSeq::new(2)));
    }

    #[test]
    fn poisoned_writer_refuses_saves() {
        let (_dir, store) = temp_store();
        {
            let journal = store.journal.read().unwrap();
            journal.as_ref().unwrap().writer.lock().unwrap().poisoned = true;
        }
        let cs = ChangeSet::builder(ContextId::new())
            .insert(ManagedObject::new("Note", Attributes::new()))
            .build()
            .stamped(CommitStamp::now(CommitSeq::first()));
        assert!(matches!(store.save(&cs), Err(StoreError::Io(_))));
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn zero_filled_gap_is_corruption() {
        let (dir, store) = temp_store();
        insert(&store, 1, "a");
        let boundary = store.journal_len();
        insert(&store, 2, "b");
        drop(store);

        let path = dir.path().join("graph.journal");
        let mut bytes = fs::read(&path).unwrap();
        let at = boundary as usize;
        bytes.splice(at..at, [0u8; 32]);
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            reopen(&dir),
            Err(StoreError::Corrupt { offset, .. }) if offset == boundary
        ));
    }

    #[test]
    fn zero_filled_tail_is_discarded() {
        let (dir, store) = temp_store();
        insert(&store, 1, "a");
        insert(&store, 2, "b");
        let total = store.journal_len();
        drop(store);

        let path = dir.path().join("graph.journal");
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0u8; 32]);
        fs::write(&path, &bytes).unwrap();

        let store = reopen(&dir).unwrap();
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), total);
    }

    #[test]
    fn mid_journal_corruption_is_reported() {
        let (dir, store) = temp_store();
        insert(&store, 1, "a");
        insert(&store, 2, "b");
        drop(store);

        let path = dir.path().join("graph.journal");
        {
            // Flip the first payload byte of the header record.
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(HEADER_SIZE)).unwrap();
            let mut buf = [0u8; 1];
            file.read_exact(&mut buf).unwrap();
            buf[0] ^= 0xFF;
            file.seek(SeekFrom::Start(HEADER_SIZE)).unwrap();
            file.write_all(&buf).unwrap();
            file.sync_all().unwrap();
        }

        assert!(matches!(reopen(&dir), Err(StoreError::Corrupt { offset: 0, .. })));
    }

    #[test]
    fn save_before_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path().join("x.journal"), JournalConfig::default());
        let cs = ChangeSet::empty(ContextId::new());
        assert!(matches!(store.save(&cs), Err(StoreError::NotOpen)));
    }

    #[test]
    fn sync_every_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalConfig {
            sync_mode: SyncMode::EveryWrite,
        };
        let store = JournalStore::new(dir.path().join("nested/dir/sync.journal"), config);
        store.open(&ObjectGraphSchema::empty()).unwrap();
        insert(&store, 1, "durable");
        assert_eq!(store.len().unwrap(), 1);
    }
}
