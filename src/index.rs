use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::merkle::Digest;

/// Persistent ordered map from digest to journal offset, plus a watermark of
/// how many journal bytes have been indexed. Entries are only ever inserted
/// or re-pointed at a later record; nothing is deleted while serving.
#[derive(Clone)]
pub struct Index {
    conn: Arc<Mutex<Connection>>,
}

impl Index {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS digests (
                digest BLOB PRIMARY KEY,
                offset INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn get(&self, digest: &[u8]) -> Result<Option<u64>> {
        let conn = self.conn.lock().unwrap();
        let offset: Option<i64> = conn
            .query_row("SELECT offset FROM digests WHERE digest = ?1", params![digest], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(offset.map(|v| v as u64))
    }

    /// Insert (or re-point) a batch of entries and advance the watermark, all
    /// in one transaction so the watermark never runs ahead of the entries.
    pub fn put_many(&self, entries: &[(Digest, u64)], indexed_through: u64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (digest, offset) in entries {
            tx.execute(
                "INSERT INTO digests (digest, offset) VALUES (?1, ?2)
                 ON CONFLICT(digest) DO UPDATE SET offset = ?2",
                params![digest.as_slice(), *offset as i64],
            )?;
        }
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('indexed_through', ?1)
             ON CONFLICT(key) DO UPDATE SET value = ?1",
            params![indexed_through as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Journal bytes already reflected in the index; replay resumes here.
    pub fn indexed_through(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let value: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'indexed_through'", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }

    /// Ordered scan of every digest starting with `prefix`.
    #[allow(dead_code)]
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut upper = prefix.to_vec();
        while let Some(last) = upper.last_mut() {
            if *last < 0xff {
                *last += 1;
                break;
            }
            upper.pop();
        }
        let mut rows = Vec::new();
        if upper.is_empty() {
            let mut stmt = conn
                .prepare("SELECT digest, offset FROM digests WHERE digest >= ?1 ORDER BY digest")?;
            let mapped = stmt.query_map(params![prefix], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in mapped {
                let (digest, offset) = row?;
                rows.push((digest, offset as u64));
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT digest, offset FROM digests
                 WHERE digest >= ?1 AND digest < ?2 ORDER BY digest",
            )?;
            let mapped = stmt.query_map(params![prefix, upper], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in mapped {
                let (digest, offset) = row?;
                rows.push((digest, offset as u64));
            }
        }
        Ok(rows)
    }

    pub fn entry_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM digests", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Drop everything for a full rebuild after the journal shrank under us.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM digests", [])?;
        tx.execute("DELETE FROM meta", [])?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> Digest {
        [byte; 32]
    }

    #[test]
    fn put_get_and_repoint() -> Result<()> {
        let index = Index::new(":memory:")?;
        index.put_many(&[(digest(1), 0), (digest(2), 40)], 80)?;
        assert_eq!(index.get(&digest(1))?, Some(0));
        assert_eq!(index.get(&digest(2))?, Some(40));
        assert_eq!(index.get(&digest(9))?, None);
        assert_eq!(index.indexed_through()?, 80);
        // Upgrades re-point an existing digest at a later record.
        index.put_many(&[(digest(1), 120)], 200)?;
        assert_eq!(index.get(&digest(1))?, Some(120));
        assert_eq!(index.entry_count()?, 2);
        Ok(())
    }

    #[test]
    fn prefix_scan_is_ordered() -> Result<()> {
        let index = Index::new(":memory:")?;
        let mut d1 = digest(0xab);
        d1[1] = 0x01;
        let mut d2 = digest(0xab);
        d2[1] = 0x02;
        index.put_many(&[(d2, 40), (d1, 0), (digest(0xcd), 80)], 120)?;
        let hits = index.scan_prefix(&[0xab])?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, d1.to_vec());
        assert_eq!(hits[1].0, d2.to_vec());
        assert_eq!(index.scan_prefix(&[0xff])?.len(), 0);
        Ok(())
    }

    #[test]
    fn survives_reopen() -> Result<()> {
        let dir = assert_fs::TempDir::new()?;
        let path = dir.path().join("index.db");
        {
            let index = Index::new(&path)?;
            index.put_many(&[(digest(7), 16)], 56)?;
        }
        let index = Index::new(&path)?;
        assert_eq!(index.get(&digest(7))?, Some(16));
        assert_eq!(index.indexed_through()?, 56);
        Ok(())
    }
}
