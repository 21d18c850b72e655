//! Write-ahead log, format v2.
//!
//! A 24-byte header (magic, format version, base sequence) is followed by
//! framed records: `u32` body length, `u32` CRC32, body. Bodies carry
//! strings rather than ids so replay re-interns in commit order and
//! reconstructs identical dictionary ids.
//!
//! A batch runs from `Begin` to its matching `Commit`/`Abort`. Replay
//! returns committed batches only; a torn record at the tail truncates the
//! log back to the last good boundary, while a record whose checksum
//! verifies but whose body cannot be decoded is corruption.

use crate::{Error, Result, WAL_MAGIC};
use crc32fast::Hasher;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const WAL_FORMAT_VERSION: u32 = 2;
const HEADER_LEN: u64 = 8 + 4 + 4 + 8;
const MAX_WAL_RECORD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Begin {
        tx_id: String,
        session_id: Option<String>,
        ts_millis: i64,
    },
    Add {
        s: String,
        p: String,
        o: String,
    },
    Delete {
        s: String,
        p: String,
        o: String,
    },
    NodeProps {
        node: String,
        bytes: Vec<u8>,
        version: u64,
    },
    EdgeProps {
        s: String,
        p: String,
        o: String,
        bytes: Vec<u8>,
        version: u64,
    },
    Commit {
        tx_id: String,
        durable: bool,
    },
    Abort {
        tx_id: String,
    },
}

impl WalRecord {
    fn record_type(&self) -> u8 {
        match self {
            WalRecord::Begin { .. } => 1,
            WalRecord::Add { .. } => 2,
            WalRecord::Delete { .. } => 3,
            WalRecord::NodeProps { .. } => 4,
            WalRecord::EdgeProps { .. } => 5,
            WalRecord::Commit { .. } => 6,
            WalRecord::Abort { .. } => 7,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.record_type());
        match self {
            WalRecord::Begin {
                tx_id,
                session_id,
                ts_millis,
            } => {
                push_str(&mut out, tx_id);
                push_opt_str(&mut out, session_id.as_deref());
                out.extend_from_slice(&ts_millis.to_le_bytes());
            }
            WalRecord::Add { s, p, o } | WalRecord::Delete { s, p, o } => {
                push_str(&mut out, s);
                push_str(&mut out, p);
                push_str(&mut out, o);
            }
            WalRecord::NodeProps {
                node,
                bytes,
                version,
            } => {
                push_str(&mut out, node);
                push_bytes(&mut out, bytes);
                out.extend_from_slice(&version.to_le_bytes());
            }
            WalRecord::EdgeProps {
                s,
                p,
                o,
                bytes,
                version,
            } => {
                push_str(&mut out, s);
                push_str(&mut out, p);
                push_str(&mut out, o);
                push_bytes(&mut out, bytes);
                out.extend_from_slice(&version.to_le_bytes());
            }
            WalRecord::Commit { tx_id, durable } => {
                push_str(&mut out, tx_id);
                out.push(u8::from(*durable));
            }
            WalRecord::Abort { tx_id } => {
                push_str(&mut out, tx_id);
            }
        }
        out
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes: body, pos: 0 };
        let ty = cursor.read_u8()?;
        let record = match ty {
            1 => WalRecord::Begin {
                tx_id: cursor.read_str()?,
                session_id: cursor.read_opt_str()?,
                ts_millis: cursor.read_i64()?,
            },
            2 => WalRecord::Add {
                s: cursor.read_str()?,
                p: cursor.read_str()?,
                o: cursor.read_str()?,
            },
            3 => WalRecord::Delete {
                s: cursor.read_str()?,
                p: cursor.read_str()?,
                o: cursor.read_str()?,
            },
            4 => WalRecord::NodeProps {
                node: cursor.read_str()?,
                bytes: cursor.read_bytes()?,
                version: cursor.read_u64()?,
            },
            5 => WalRecord::EdgeProps {
                s: cursor.read_str()?,
                p: cursor.read_str()?,
                o: cursor.read_str()?,
                bytes: cursor.read_bytes()?,
                version: cursor.read_u64()?,
            },
            6 => WalRecord::Commit {
                tx_id: cursor.read_str()?,
                durable: cursor.read_u8()? != 0,
            },
            7 => WalRecord::Abort {
                tx_id: cursor.read_str()?,
            },
            _ => return Err(Error::WalProtocol("unknown record type")),
        };
        if cursor.pos != body.len() {
            return Err(Error::WalProtocol("trailing bytes in record body"));
        }
        Ok(record)
    }
}

/// One committed batch recovered from the log, in append order.
#[derive(Debug, Clone)]
pub struct CommittedBatch {
    pub tx_id: String,
    pub session_id: Option<String>,
    pub ts_millis: i64,
    pub ops: Vec<WalRecord>,
}

#[derive(Debug, Default)]
pub struct ReplayOutcome {
    pub batches: Vec<CommittedBatch>,
    /// Sequence of the last record read, for the manifest checkpoint.
    pub last_seq: u64,
    /// True when a torn tail was cut off.
    pub truncated: bool,
    /// Tx ids that were skipped because the registry already had them.
    pub deduplicated: usize,
}

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    len: u64,
    base_seq: u64,
    records_appended: u64,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();

        let base_seq;
        if len < HEADER_LEN {
            // Fresh (or torn-before-header) log.
            base_seq = 0;
            write_header(&mut file, base_seq)?;
        } else {
            file.seek(SeekFrom::Start(0))?;
            let mut header = [0u8; HEADER_LEN as usize];
            file.read_exact(&mut header)?;
            if header[0..8] != WAL_MAGIC {
                return Err(Error::WalProtocol("bad wal header magic"));
            }
            let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
            if version != WAL_FORMAT_VERSION {
                return Err(Error::UnsupportedFormatVersion(version));
            }
            base_seq = u64::from_le_bytes(header[16..24].try_into().unwrap());
        }

        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            len,
            base_seq,
            records_appended: 0,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= HEADER_LEN
    }

    #[inline]
    pub fn next_seq(&self) -> u64 {
        self.base_seq + self.records_appended
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<u64> {
        let body = record.encode_body();
        let len = u32::try_from(body.len()).map_err(|_| Error::WalRecordTooLarge(u32::MAX))?;
        if len > MAX_WAL_RECORD_LEN {
            return Err(Error::WalRecordTooLarge(len));
        }
        let crc = crc32(&body);

        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&body)?;
        self.file.flush()?;
        self.len += 4 + 4 + body.len() as u64;
        self.records_appended += 1;
        Ok(self.next_seq())
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Empties the log after a successful flush, carrying the sequence
    /// forward so it stays monotone across resets.
    pub fn reset(&mut self, next_base_seq: u64) -> Result<()> {
        self.file.set_len(0)?;
        write_header(&mut self.file, next_base_seq)?;
        self.base_seq = next_base_seq;
        self.records_appended = 0;
        self.len = HEADER_LEN;
        self.file.sync_data()?;
        Ok(())
    }

    /// Scans the whole log and returns every committed batch whose tx id
    /// `already_applied` does not recognize. Unterminated and aborted
    /// batches are dropped. With `repair_tail` (writer handles only), a
    /// torn tail is truncated in place; readers just stop at it, the file
    /// belongs to the writer.
    pub fn replay(
        &mut self,
        repair_tail: bool,
        already_applied: impl Fn(&str) -> bool,
    ) -> Result<ReplayOutcome> {
        let mut outcome = ReplayOutcome::default();
        let mut open: HashMap<String, CommittedBatch> = HashMap::new();
        // Mutations are attributed to the most recently begun batch.
        let mut current: Option<String> = None;
        let mut reader = WalReader {
            file: OpenOptions::new().read(true).open(&self.path)?,
            offset: HEADER_LEN,
            end: self.len,
        };
        let mut seq = self.base_seq;
        let mut last_good = HEADER_LEN;

        loop {
            match reader.next_record()? {
                Tail::Record(record) => {
                    seq += 1;
                    last_good = reader.offset;
                    match record {
                        WalRecord::Begin {
                            tx_id,
                            session_id,
                            ts_millis,
                        } => {
                            current = Some(tx_id.clone());
                            open.insert(
                                tx_id.clone(),
                                CommittedBatch {
                                    tx_id,
                                    session_id,
                                    ts_millis,
                                    ops: Vec::new(),
                                },
                            );
                        }
                        WalRecord::Commit { tx_id, durable: _ } => {
                            if current.as_deref() == Some(tx_id.as_str()) {
                                current = None;
                            }
                            match open.remove(&tx_id) {
                                Some(batch) => {
                                    if already_applied(&tx_id) {
                                        outcome.deduplicated += 1;
                                        debug!(%tx_id, "skipping already-applied batch");
                                    } else {
                                        outcome.batches.push(batch);
                                    }
                                }
                                // A repeated commit marker for a batch already
                                // closed above: idempotent, ignore.
                                None => outcome.deduplicated += 1,
                            }
                        }
                        WalRecord::Abort { tx_id } => {
                            if current.as_deref() == Some(tx_id.as_str()) {
                                current = None;
                            }
                            open.remove(&tx_id);
                        }
                        op => {
                            let Some(batch) =
                                current.as_ref().and_then(|tx| open.get_mut(tx))
                            else {
                                return Err(Error::WalProtocol("mutation outside batch"));
                            };
                            batch.ops.push(op);
                        }
                    }
                }
                Tail::Clean => break,
                Tail::Torn => {
                    if repair_tail {
                        warn!(
                            offset = last_good,
                            dropped = self.len - last_good,
                            "truncating torn wal tail"
                        );
                        self.file.set_len(last_good)?;
                        self.file.sync_data()?;
                        self.len = last_good;
                    }
                    outcome.truncated = true;
                    break;
                }
            }
        }

        if !open.is_empty() {
            debug!(count = open.len(), "discarding unterminated batches");
        }
        self.records_appended = seq - self.base_seq;
        outcome.last_seq = seq;
        Ok(outcome)
    }
}

enum Tail {
    Record(WalRecord),
    Clean,
    Torn,
}

struct WalReader {
    file: File,
    offset: u64,
    end: u64,
}

impl WalReader {
    fn next_record(&mut self) -> Result<Tail> {
        if self.offset >= self.end {
            return Ok(Tail::Clean);
        }
        self.file.seek(SeekFrom::Start(self.offset))?;

        let Some(len) = self.try_read_u32()? else {
            return Ok(Tail::Torn);
        };
        if len > MAX_WAL_RECORD_LEN {
            return Ok(Tail::Torn);
        }
        let Some(crc) = self.try_read_u32()? else {
            return Ok(Tail::Torn);
        };

        let mut body = vec![0u8; len as usize];
        if let Err(e) = self.file.read_exact(&mut body) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(Tail::Torn);
            }
            return Err(Error::Io(e));
        }

        if crc32(&body) != crc {
            return Ok(Tail::Torn);
        }

        let record_offset = self.offset;
        self.offset += 4 + 4 + len as u64;

        // A record with a valid checksum must decode; failure here is
        // corruption, not a torn write.
        WalRecord::decode_body(&body)
            .map(Tail::Record)
            .map_err(|_| Error::WalCorrupt {
                offset: record_offset,
            })
    }

    fn try_read_u32(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn write_header(file: &mut File, base_seq: u64) -> Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    header[0..8].copy_from_slice(&WAL_MAGIC);
    header[8..12].copy_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
    header[16..24].copy_from_slice(&base_seq.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.flush()?;
    Ok(())
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn push_opt_str(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            out.push(1);
            push_str(out, s);
        }
        None => out.push(0),
    }
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(Error::WalProtocol("truncated record body"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_str(&mut self) -> Result<String> {
        String::from_utf8(self.read_bytes()?).map_err(|_| Error::WalProtocol("invalid UTF-8"))
    }

    fn read_opt_str(&mut self) -> Result<Option<String>> {
        if self.read_u8()? == 0 {
            Ok(None)
        } else {
            Ok(Some(self.read_str()?))
        }
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn begin(tx: &str) -> WalRecord {
        WalRecord::Begin {
            tx_id: tx.to_string(),
            session_id: None,
            ts_millis: 0,
        }
    }

    fn add(s: &str, p: &str, o: &str) -> WalRecord {
        WalRecord::Add {
            s: s.to_string(),
            p: p.to_string(),
            o: o.to_string(),
        }
    }

    fn commit(tx: &str) -> WalRecord {
        WalRecord::Commit {
            tx_id: tx.to_string(),
            durable: false,
        }
    }

    #[test]
    fn replay_returns_only_committed_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&begin("t1")).unwrap();
            wal.append(&add("a", "r", "b")).unwrap();
            wal.append(&commit("t1")).unwrap();
            wal.append(&begin("t2")).unwrap();
            wal.append(&add("b", "r", "c")).unwrap();
            // t2 never commits.
            wal.fsync().unwrap();
        }

        let mut wal = Wal::open(&path).unwrap();
        let outcome = wal.replay(true, |_| false).unwrap();
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.batches[0].tx_id, "t1");
        assert_eq!(outcome.batches[0].ops, vec![add("a", "r", "b")]);
    }

    #[test]
    fn aborted_batch_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&begin("t1")).unwrap();
        wal.append(&add("a", "r", "b")).unwrap();
        wal.append(&WalRecord::Abort {
            tx_id: "t1".to_string(),
        })
        .unwrap();
        let outcome = wal.replay(true, |_| false).unwrap();
        assert!(outcome.batches.is_empty());
    }

    #[test]
    fn torn_tail_is_truncated_silently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let good_len;
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&begin("t1")).unwrap();
            wal.append(&add("a", "r", "b")).unwrap();
            wal.append(&commit("t1")).unwrap();
            good_len = wal.len();
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x17, 0x00]).unwrap();
        }

        let mut wal = Wal::open(&path).unwrap();
        let outcome = wal.replay(true, |_| false).unwrap();
        assert!(outcome.truncated);
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(wal.len(), good_len);
    }

    #[test]
    fn crc_flip_on_last_record_drops_only_the_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let tail_offset;
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&begin("t1")).unwrap();
            wal.append(&commit("t1")).unwrap();
            tail_offset = wal.len();
            wal.append(&begin("t2")).unwrap();
        }
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(tail_offset + 4)).unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
        }

        let mut wal = Wal::open(&path).unwrap();
        let outcome = wal.replay(true, |_| false).unwrap();
        assert!(outcome.truncated);
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.batches[0].tx_id, "t1");
    }

    #[test]
    fn duplicate_commit_applies_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&begin("t1")).unwrap();
        wal.append(&add("a", "r", "b")).unwrap();
        wal.append(&commit("t1")).unwrap();
        wal.append(&commit("t1")).unwrap();

        let outcome = wal.replay(true, |_| false).unwrap();
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.deduplicated, 1);
    }

    #[test]
    fn registry_hit_skips_whole_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&begin("t1")).unwrap();
        wal.append(&add("a", "r", "b")).unwrap();
        wal.append(&commit("t1")).unwrap();

        let outcome = wal.replay(true, |tx| tx == "t1").unwrap();
        assert!(outcome.batches.is_empty());
        assert_eq!(outcome.deduplicated, 1);
    }

    #[test]
    fn reset_carries_sequence_forward() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&begin("t1")).unwrap();
        let seq = wal.append(&commit("t1")).unwrap();
        wal.reset(seq).unwrap();
        assert!(wal.is_empty());
        assert_eq!(wal.next_seq(), seq);

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.next_seq(), seq);
    }

    #[test]
    fn property_records_roundtrip() {
        let record = WalRecord::EdgeProps {
            s: "a".into(),
            p: "r".into(),
            o: "b".into(),
            bytes: vec![6, 0, 0, 0, 0],
            version: 9,
        };
        let body = record.encode_body();
        assert_eq!(WalRecord::decode_body(&body).unwrap(), record);
    }
}
