use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest as _, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub const SEGMENT_FILE: &str = "records.log";

const LEN_BYTES: usize = 4;
const CHECKSUM_BYTES: usize = 8;
// Records are a few hundred bytes; anything past this is a garbage frame.
const MAX_PAYLOAD: u32 = 1 << 20;

/// Append-only record log. One writer, any number of readers; readers only
/// ever touch offsets at or below the committed length, which is published
/// after the fsync of the append that produced it.
///
/// Frame layout: `[len: u32 LE][payload][checksum: 8B]`, checksum being the
/// leading bytes of SHA-256 over the payload.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<File>,
    committed: AtomicU64,
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut sum = [0u8; CHECKSUM_BYTES];
    sum.copy_from_slice(&digest[..CHECKSUM_BYTES]);
    sum
}

enum Frame {
    Record(Vec<u8>),
    /// Partial frame or checksum mismatch at the current position.
    Damaged,
    Eof,
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; LEN_BYTES];
    match reader.read(&mut len_buf)? {
        0 => return Ok(Frame::Eof),
        n if n < LEN_BYTES => {
            if read_exact_or_eof(reader, &mut len_buf[n..])?.is_none() {
                return Ok(Frame::Damaged);
            }
        }
        _ => {}
    }
    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_PAYLOAD {
        return Ok(Frame::Damaged);
    }
    let mut payload = vec![0u8; len as usize];
    if read_exact_or_eof(reader, &mut payload)?.is_none() {
        return Ok(Frame::Damaged);
    }
    let mut sum = [0u8; CHECKSUM_BYTES];
    if read_exact_or_eof(reader, &mut sum)?.is_none() {
        return Ok(Frame::Damaged);
    }
    if sum != checksum(&payload) {
        return Ok(Frame::Damaged);
    }
    Ok(Frame::Record(payload))
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

impl Journal {
    /// Open (creating if needed) the journal under `dir`, recovering from a
    /// torn trailing write by truncating back to the last complete record.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create journal directory {}", dir.display()))?;
        let path = dir.join(SEGMENT_FILE);
        let writer = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open journal {}", path.display()))?;
        let committed = Self::recover(&path)?;
        Ok(Journal { path, writer: Mutex::new(writer), committed: AtomicU64::new(committed) })
    }

    fn recover(path: &Path) -> Result<u64> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut good = 0u64;
        loop {
            match read_frame(&mut reader)? {
                Frame::Record(payload) => {
                    good += (LEN_BYTES + payload.len() + CHECKSUM_BYTES) as u64;
                }
                Frame::Eof => break,
                Frame::Damaged => {
                    warn!(
                        "journal: truncating torn tail at offset {good} ({} bytes dropped)",
                        file_len - good
                    );
                    let writable = OpenOptions::new().write(true).open(path)?;
                    writable.set_len(good)?;
                    writable.sync_data()?;
                    break;
                }
            }
        }
        Ok(good)
    }

    /// Append one record and fsync. Returns the record's starting offset.
    pub fn append(&self, payload: &[u8]) -> Result<u64> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD as usize {
            bail!("journal record payload of {} bytes out of range", payload.len());
        }
        let mut frame = Vec::with_capacity(LEN_BYTES + payload.len() + CHECKSUM_BYTES);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&checksum(payload));

        let file = self.writer.lock().unwrap();
        let offset = self.committed.load(Ordering::Acquire);
        (&*file).write_all(&frame).context("journal append failed")?;
        file.sync_data().context("journal fsync failed")?;
        self.committed.store(offset + frame.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// Read the record starting at `offset`. Only offsets previously returned
    /// by `append` (possibly in an earlier run) are valid.
    pub fn read_at(&self, offset: u64) -> Result<Vec<u8>> {
        let committed = self.committed_len();
        if offset >= committed {
            bail!("journal offset {offset} past committed length {committed}");
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        match read_frame(&mut file)? {
            Frame::Record(payload) => Ok(payload),
            _ => Err(anyhow!("corrupt journal record at offset {offset}")),
        }
    }

    /// Lazy iterator over `(offset, payload)` starting at `from`, bounded by
    /// the committed length at call time. Safe to run while appends continue;
    /// records committed after creation may or may not be observed.
    pub fn iter(&self, from: u64) -> Result<JournalIter> {
        let end = self.committed_len();
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(from))?;
        Ok(JournalIter { reader: BufReader::new(file), offset: from, end })
    }

    pub fn committed_len(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Path of the segment file, for raw streaming by the backup feed.
    pub fn segment_path(&self) -> &Path {
        &self.path
    }
}

pub struct JournalIter {
    reader: BufReader<File>,
    offset: u64,
    end: u64,
}

impl Iterator for JournalIter {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        match read_frame(&mut self.reader) {
            Ok(Frame::Record(payload)) => {
                let offset = self.offset;
                self.offset += (LEN_BYTES + payload.len() + CHECKSUM_BYTES) as u64;
                Some(Ok((offset, payload)))
            }
            Ok(Frame::Eof) => None,
            Ok(Frame::Damaged) => {
                let offset = self.offset;
                self.offset = self.end;
                Some(Err(anyhow!("corrupt journal record at offset {offset}")))
            }
            Err(e) => {
                self.offset = self.end;
                Some(Err(e.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;

    #[test]
    fn append_then_read_round_trips() -> Result<()> {
        let dir = TempDir::new()?;
        let journal = Journal::open(dir.path())?;
        let a = journal.append(b"first record")?;
        let b = journal.append(b"second")?;
        assert_eq!(a, 0);
        assert!(b > a);
        assert_eq!(journal.read_at(a)?, b"first record");
        assert_eq!(journal.read_at(b)?, b"second");
        Ok(())
    }

    #[test]
    fn iter_yields_records_in_order() -> Result<()> {
        let dir = TempDir::new()?;
        let journal = Journal::open(dir.path())?;
        let mut offsets = Vec::new();
        for i in 0u8..5 {
            offsets.push(journal.append(&[i; 10])?);
        }
        let seen: Vec<(u64, Vec<u8>)> = journal.iter(0)?.collect::<Result<_>>()?;
        assert_eq!(seen.len(), 5);
        for (i, (offset, payload)) in seen.iter().enumerate() {
            assert_eq!(*offset, offsets[i]);
            assert_eq!(payload, &vec![i as u8; 10]);
        }
        // Restart mid-stream.
        let tail: Vec<_> = journal.iter(offsets[3])?.collect::<Result<Vec<_>>>()?;
        assert_eq!(tail.len(), 2);
        Ok(())
    }

    #[test]
    fn torn_tail_is_truncated_on_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let good_len;
        {
            let journal = Journal::open(dir.path())?;
            journal.append(b"durable record")?;
            good_len = journal.committed_len();
            // Simulate a crash halfway through the next append.
            let mut file =
                OpenOptions::new().append(true).open(dir.path().join(SEGMENT_FILE))?;
            let half = &(100u32.to_le_bytes())[..];
            file.write_all(half)?;
            file.write_all(b"partial")?;
        }
        let journal = Journal::open(dir.path())?;
        assert_eq!(journal.committed_len(), good_len);
        assert_eq!(journal.read_at(0)?, b"durable record");
        // The log is clean again and accepts new records.
        let offset = journal.append(b"after recovery")?;
        assert_eq!(offset, good_len);
        assert_eq!(journal.read_at(offset)?, b"after recovery");
        Ok(())
    }

    #[test]
    fn corrupted_payload_fails_checksum() -> Result<()> {
        let dir = TempDir::new()?;
        let journal = Journal::open(dir.path())?;
        journal.append(b"will be flipped")?;
        drop(journal);
        let path = dir.path().join(SEGMENT_FILE);
        let mut bytes = fs::read(&path)?;
        bytes[6] ^= 0xff;
        fs::write(&path, &bytes)?;
        // Recovery treats the damaged record as a torn tail.
        let journal = Journal::open(dir.path())?;
        assert_eq!(journal.committed_len(), 0);
        Ok(())
    }
}
