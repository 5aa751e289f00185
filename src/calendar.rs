use anyhow::{bail, Context, Result};
use indexmap::IndexSet;
use opentimestamps::attestation::Attestation;
use opentimestamps::ser::{Deserializer, Serializer};
use opentimestamps::timestamp::Timestamp;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use crate::index::Index;
use crate::journal::Journal;
use crate::merkle::{self, Digest, DIGEST_LEN};

const RECORD_TAG: u8 = 0x01;

/// Violations of the store's durability invariants. These are never retried:
/// the caller logs them and takes the process down.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("journal record at offset {offset} is corrupt: {reason}")]
    Corrupt { offset: u64, reason: String },
    #[error("index entry for {digest} does not resolve within the record at offset {offset}")]
    Dangling { digest: String, offset: u64 },
    #[error(
        "conflicting upgrade for commitment {commitment}: \
         already attested in block {existing}, refusing block {proposed}"
    )]
    ConflictingUpgrade { commitment: String, existing: usize, proposed: usize },
}

pub struct Stats {
    pub commitments: u64,
    pub upgrades: u64,
    pub unconfirmed: usize,
    pub journal_bytes: u64,
    pub indexed_digests: u64,
}

struct Derived {
    tip: Option<Digest>,
    unconfirmed: IndexSet<Digest>,
}

/// Journal + index composition. Every record is a commitment digest plus the
/// path that currently extends it outward: to a `Pending` attestation when
/// the round closes, to a `Bitcoin` attestation once anchored.
pub struct Calendar {
    journal: Journal,
    index: Index,
    derived: Mutex<Derived>,
    commitments: AtomicU64,
    upgrades: AtomicU64,
}

pub fn timestamp_bytes(timestamp: &Timestamp) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = Serializer::new(&mut buf);
    timestamp.serialize(&mut ser).context("timestamp serialization failed")?;
    Ok(buf)
}

fn encode_record(commitment: &Digest, timestamp: &Timestamp) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(1 + DIGEST_LEN + 64);
    payload.push(RECORD_TAG);
    payload.extend_from_slice(commitment);
    payload.extend_from_slice(&timestamp_bytes(timestamp)?);
    Ok(payload)
}

fn decode_record(offset: u64, payload: &[u8]) -> Result<(Digest, Timestamp), StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt { offset, reason: reason.to_string() };
    if payload.len() < 1 + DIGEST_LEN + 1 {
        return Err(corrupt("record too short"));
    }
    if payload[0] != RECORD_TAG {
        return Err(corrupt("unknown record tag"));
    }
    let commitment = merkle::digest_from_slice(&payload[1..1 + DIGEST_LEN]).unwrap();
    let mut deser = Deserializer::new(Cursor::new(&payload[1 + DIGEST_LEN..]));
    let timestamp = Timestamp::deserialize(&mut deser, commitment.to_vec())
        .map_err(|e| corrupt(&e.to_string()))?;
    Ok((commitment, timestamp))
}

impl Calendar {
    /// Open the calendar under `base`, recovering the journal and bringing
    /// the index and in-memory state back in sync with it.
    pub fn open(base: &Path) -> Result<Self> {
        let journal = Journal::open(&base.join("journal"))?;
        let index_dir = base.join("index");
        fs::create_dir_all(&index_dir)
            .with_context(|| format!("failed to create {}", index_dir.display()))?;
        let index = Index::new(index_dir.join("index.db"))?;

        let calendar = Calendar {
            journal,
            index,
            derived: Mutex::new(Derived { tip: None, unconfirmed: IndexSet::new() }),
            commitments: AtomicU64::new(0),
            upgrades: AtomicU64::new(0),
        };
        calendar.replay()?;
        Ok(calendar)
    }

    /// Replay the journal: rebuild tip/unconfirmed/counters from the full
    /// record stream, and index any tail the index has not yet seen. If the
    /// journal shrank behind a durable index (torn tail recovery), the index
    /// is rebuilt from scratch.
    fn replay(&self) -> Result<()> {
        let committed = self.journal.committed_len();
        let mut watermark = self.index.indexed_through()?;
        if watermark > committed {
            warn!(
                "index watermark {watermark} is past journal length {committed}, rebuilding index"
            );
            self.index.clear()?;
            watermark = 0;
        }

        let mut derived = self.derived.lock().unwrap();
        let mut entries: Vec<(Digest, u64)> = Vec::new();
        for record in self.journal.iter(0)? {
            let (offset, payload) = record?;
            let (commitment, timestamp) = decode_record(offset, &payload)?;
            match merkle::terminal(&timestamp) {
                Some((Attestation::Pending { .. }, _)) => {
                    derived.unconfirmed.insert(commitment);
                    derived.tip = Some(commitment);
                    self.commitments.fetch_add(1, Ordering::Relaxed);
                }
                Some((Attestation::Bitcoin { .. }, _)) => {
                    derived.unconfirmed.shift_remove(&commitment);
                    self.upgrades.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    return Err(StoreError::Corrupt {
                        offset,
                        reason: "record path has no usable attestation".into(),
                    }
                    .into())
                }
            }
            if offset >= watermark {
                entries.push((commitment, offset));
                for digest in merkle::intermediates(&timestamp) {
                    entries.push((digest, offset));
                }
            }
        }
        if !entries.is_empty() || watermark < committed {
            self.index.put_many(&entries, committed)?;
        }
        if !entries.is_empty() {
            info!("indexed {} digests from the journal tail", entries.len());
        }
        Ok(())
    }

    /// Persist a fresh round commitment with its provisional path. The path
    /// must start at the commitment and end in a `Pending` attestation; the
    /// record is fsynced before this returns.
    pub fn add_commitment(&self, commitment: &Digest, timestamp: &Timestamp) -> Result<u64> {
        if timestamp.start_digest != commitment.as_slice() {
            bail!("commitment path does not start at the commitment");
        }
        match merkle::terminal(timestamp) {
            Some((Attestation::Pending { .. }, _)) => {}
            _ => bail!("commitment path must end in a pending attestation"),
        }
        let payload = encode_record(commitment, timestamp)?;
        let offset = self.journal.append(&payload)?;

        let mut entries = vec![(*commitment, offset)];
        for digest in merkle::intermediates(timestamp) {
            entries.push((digest, offset));
        }
        self.index.put_many(&entries, self.journal.committed_len())?;

        let mut derived = self.derived.lock().unwrap();
        derived.tip = Some(*commitment);
        derived.unconfirmed.insert(*commitment);
        drop(derived);
        self.commitments.fetch_add(1, Ordering::Relaxed);
        Ok(offset)
    }

    /// Attach a final attestation to a previously added commitment. The path
    /// must start at the commitment and end in `Bitcoin { height }`.
    /// Re-running an identical upgrade is a no-op; a different block for the
    /// same commitment is an invariant violation.
    pub fn upgrade_commitment(&self, commitment: &Digest, timestamp: &Timestamp) -> Result<()> {
        if timestamp.start_digest != commitment.as_slice() {
            bail!("upgrade path does not start at the commitment");
        }
        let (proposed, attested) = match merkle::terminal(timestamp) {
            Some((Attestation::Bitcoin { height }, attested)) => (*height, attested.to_vec()),
            _ => bail!("upgrade path must end in a block attestation"),
        };
        // The path is about to be served forever; refuse one that does not
        // actually carry the commitment to the attested digest.
        if merkle::apply(&merkle::ops_of(timestamp), commitment) != attested {
            bail!("upgrade path does not apply to commitment {}", hex::encode(commitment));
        }
        let current = self
            .get(commitment)?
            .with_context(|| format!("unknown commitment {}", hex::encode(commitment)))?;
        match merkle::terminal(&current) {
            Some((Attestation::Bitcoin { height }, _)) if *height == proposed => return Ok(()),
            Some((Attestation::Bitcoin { height }, _)) => {
                return Err(StoreError::ConflictingUpgrade {
                    commitment: hex::encode(commitment),
                    existing: *height,
                    proposed,
                }
                .into());
            }
            _ => {}
        }

        let payload = encode_record(commitment, timestamp)?;
        let offset = self.journal.append(&payload)?;

        let mut entries = vec![(*commitment, offset)];
        for digest in merkle::intermediates(timestamp) {
            entries.push((digest, offset));
        }
        self.index.put_many(&entries, self.journal.committed_len())?;

        self.derived.lock().unwrap().unconfirmed.shift_remove(commitment);
        self.upgrades.fetch_add(1, Ordering::Relaxed);
        info!("commitment {} attested in block {proposed}", hex::encode(commitment));
        Ok(())
    }

    /// Best known outward path from `digest`: the stored chain of the record
    /// its index entry points at, re-rooted at `digest`.
    pub fn get(&self, digest: &[u8]) -> Result<Option<Timestamp>> {
        let Some(offset) = self.index.get(digest)? else {
            return Ok(None);
        };
        let payload = self.journal.read_at(offset).map_err(|e| StoreError::Corrupt {
            offset,
            reason: e.to_string(),
        })?;
        let (commitment, timestamp) = decode_record(offset, &payload)?;
        if digest == commitment.as_slice() {
            return Ok(Some(timestamp));
        }
        match merkle::reroot(&timestamp, digest) {
            Some(sub) => Ok(Some(sub)),
            None => {
                Err(StoreError::Dangling { digest: hex::encode(digest), offset }.into())
            }
        }
    }

    /// Latest commitment and its current outward path.
    pub fn tip(&self) -> Result<Option<(Digest, Timestamp)>> {
        let tip = self.derived.lock().unwrap().tip;
        match tip {
            Some(commitment) => {
                let timestamp = self.get(&commitment)?.with_context(|| {
                    format!("tip commitment {} not indexed", hex::encode(commitment))
                })?;
                Ok(Some((commitment, timestamp)))
            }
            None => Ok(None),
        }
    }

    /// Commitments with no final attestation yet, in journal order.
    pub fn unconfirmed(&self) -> Vec<Digest> {
        self.derived.lock().unwrap().unconfirmed.iter().copied().collect()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            commitments: self.commitments.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            unconfirmed: self.derived.lock().unwrap().unconfirmed.len(),
            journal_bytes: self.journal.committed_len(),
            indexed_digests: self.index.entry_count().unwrap_or(0),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::sha256;
    use assert_fs::TempDir;
    use opentimestamps::op::Op;

    const URI: &str = "http://test/";

    fn add_round(calendar: &Calendar, byte: u8) -> Digest {
        let commitment = sha256(&[byte]);
        calendar.add_commitment(&commitment, &merkle::pending(&commitment, URI)).unwrap();
        commitment
    }

    fn upgrade_path(commitment: &Digest, height: usize) -> Timestamp {
        let ops = vec![Op::Append(vec![0xfe; 32]), Op::Sha256, Op::Sha256];
        merkle::chain(commitment, &ops, Attestation::Bitcoin { height })
    }

    #[test]
    fn add_then_get_returns_the_pending_path() -> Result<()> {
        let dir = TempDir::new()?;
        let calendar = Calendar::open(dir.path())?;
        let commitment = add_round(&calendar, 1);
        let timestamp = calendar.get(&commitment)?.unwrap();
        match merkle::terminal(&timestamp) {
            Some((Attestation::Pending { uri }, attested)) => {
                assert_eq!(uri, URI);
                assert_eq!(attested, commitment.as_slice());
            }
            _ => panic!("expected pending attestation"),
        }
        assert_eq!(calendar.unconfirmed(), vec![commitment]);
        assert!(calendar.get(&[0u8; 32])?.is_none());
        Ok(())
    }

    #[test]
    fn upgrade_is_idempotent_and_conflicts_fail() -> Result<()> {
        let dir = TempDir::new()?;
        let calendar = Calendar::open(dir.path())?;
        let commitment = add_round(&calendar, 2);
        let path = upgrade_path(&commitment, 800_000);
        calendar.upgrade_commitment(&commitment, &path)?;
        assert!(calendar.unconfirmed().is_empty());

        // Exact re-execution is a no-op.
        calendar.upgrade_commitment(&commitment, &path)?;
        assert_eq!(calendar.stats().upgrades, 1);

        // A different block for the same commitment must fail loudly.
        let conflict = upgrade_path(&commitment, 800_001);
        let err = calendar.upgrade_commitment(&commitment, &conflict).unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
        Ok(())
    }

    #[test]
    fn upgraded_intermediates_resolve() -> Result<()> {
        let dir = TempDir::new()?;
        let calendar = Calendar::open(dir.path())?;
        let commitment = add_round(&calendar, 3);
        let path = upgrade_path(&commitment, 812_345);
        calendar.upgrade_commitment(&commitment, &path)?;

        for digest in merkle::intermediates(&path) {
            let sub = calendar.get(&digest)?.expect("intermediate digest must resolve");
            assert_eq!(sub.start_digest, digest.to_vec());
            match merkle::terminal(&sub) {
                Some((Attestation::Bitcoin { height }, _)) => assert_eq!(*height, 812_345),
                _ => panic!("expected block attestation"),
            }
        }
        Ok(())
    }

    #[test]
    fn reopen_rebuilds_state_and_resolves_everything() -> Result<()> {
        let dir = TempDir::new()?;
        let (a, b, c) = {
            let calendar = Calendar::open(dir.path())?;
            let a = add_round(&calendar, 10);
            let b = add_round(&calendar, 11);
            let c = add_round(&calendar, 12);
            calendar.upgrade_commitment(&a, &upgrade_path(&a, 900_000))?;
            (a, b, c)
        };
        let calendar = Calendar::open(dir.path())?;
        assert_eq!(calendar.unconfirmed(), vec![b, c]);
        assert_eq!(calendar.tip()?.unwrap().0, c);
        assert_eq!(calendar.stats().commitments, 3);
        assert_eq!(calendar.stats().upgrades, 1);
        for digest in [a, b, c] {
            assert!(calendar.get(&digest)?.is_some());
        }
        match merkle::terminal(&calendar.get(&a)?.unwrap()) {
            Some((Attestation::Bitcoin { height }, _)) => assert_eq!(*height, 900_000),
            _ => panic!("expected the upgraded path to win"),
        }
        Ok(())
    }

    #[test]
    fn index_ahead_of_truncated_journal_is_rebuilt() -> Result<()> {
        let dir = TempDir::new()?;
        let commitment;
        {
            let calendar = Calendar::open(dir.path())?;
            commitment = add_round(&calendar, 20);
            add_round(&calendar, 21);
        }
        // Lose the journal but keep the durable index.
        std::fs::write(dir.path().join("journal").join(crate::journal::SEGMENT_FILE), b"")?;
        let calendar = Calendar::open(dir.path())?;
        assert!(calendar.get(&commitment)?.is_none());
        assert_eq!(calendar.stats().commitments, 0);
        assert!(calendar.unconfirmed().is_empty());
        Ok(())
    }

    #[test]
    fn deleted_index_is_rebuilt_from_the_journal() -> Result<()> {
        let dir = TempDir::new()?;
        let commitment;
        {
            let calendar = Calendar::open(dir.path())?;
            commitment = add_round(&calendar, 30);
        }
        std::fs::remove_file(dir.path().join("index").join("index.db"))?;
        let calendar = Calendar::open(dir.path())?;
        assert!(calendar.get(&commitment)?.is_some());
        Ok(())
    }
}
