use anyhow::{bail, Result};
use opentimestamps::op::Op;
use sha2::{Digest as _, Sha256};

use crate::merkle::Digest;

/// Opt-in replace-by-fee marker.
pub const RBF_SEQUENCE: u32 = 0xffff_fffd;
pub const TX_VERSION: i32 = 2;

const OP_RETURN: u8 = 0x6a;

pub fn sha256d(data: &[u8]) -> Digest {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPoint {
    /// Referenced txid in internal byte order.
    pub txid: Digest,
    pub vout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// The non-witness view of a transaction: exactly the bytes the txid commits
/// to. Witness data never participates in a timestamp proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.bytes.len() - self.pos {
            bail!("transaction truncated at byte {}", self.pos);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn varint(&mut self) -> Result<u64> {
        Ok(match self.u8()? {
            0xfd => u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as u64,
            0xfe => self.u32()? as u64,
            0xff => self.u64()?,
            n => n as u64,
        })
    }

    fn var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.varint()?;
        Ok(self.take(len as usize)?.to_vec())
    }
}

impl Transaction {
    /// Non-witness serialization, the form the txid is computed over.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.previous.txid);
            buf.extend_from_slice(&input.previous.vout.to_le_bytes());
            write_varint(&mut buf, input.script_sig.len() as u64);
            buf.extend_from_slice(&input.script_sig);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut buf, output.script_pubkey.len() as u64);
            buf.extend_from_slice(&output.script_pubkey);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    pub fn txid(&self) -> Digest {
        sha256d(&self.serialize())
    }

    /// Parse a raw transaction, accepting both the legacy and the segwit
    /// encoding; witness items are consumed and dropped.
    pub fn parse(bytes: &[u8]) -> Result<Transaction> {
        let mut reader = Reader { bytes, pos: 0 };
        let version = i32::from_le_bytes(reader.take(4)?.try_into().unwrap());

        let mut input_count = reader.varint()?;
        let mut segwit = false;
        if input_count == 0 {
            // Marker byte: a real transaction never has zero inputs.
            if reader.u8()? != 0x01 {
                bail!("unsupported transaction encoding flag");
            }
            segwit = true;
            input_count = reader.varint()?;
        }

        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let txid: Digest = reader.take(32)?.try_into().unwrap();
            let vout = reader.u32()?;
            let script_sig = reader.var_bytes()?;
            let sequence = reader.u32()?;
            inputs.push(TxIn { previous: OutPoint { txid, vout }, script_sig, sequence });
        }

        let output_count = reader.varint()?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = reader.u64()?;
            let script_pubkey = reader.var_bytes()?;
            outputs.push(TxOut { value, script_pubkey });
        }

        if segwit {
            for _ in 0..input_count {
                let items = reader.varint()?;
                for _ in 0..items {
                    reader.var_bytes()?;
                }
            }
        }

        let lock_time = reader.u32()?;
        if reader.pos != bytes.len() {
            bail!("{} trailing bytes after transaction", bytes.len() - reader.pos);
        }
        Ok(Transaction { version, inputs, outputs, lock_time })
    }
}

/// Provably-unspendable output script carrying a commitment payload.
pub fn op_return_script(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= 75);
    let mut script = Vec::with_capacity(2 + payload.len());
    script.push(OP_RETURN);
    script.push(payload.len() as u8);
    script.extend_from_slice(payload);
    script
}

/// Payload of an `OP_RETURN <push>` script, if that is what `script` is.
pub fn parse_op_return(script: &[u8]) -> Option<&[u8]> {
    if script.len() < 2 || script[0] != OP_RETURN {
        return None;
    }
    let len = script[1] as usize;
    if (1..=75).contains(&len) && script.len() == 2 + len {
        Some(&script[2..])
    } else {
        None
    }
}

/// Split serialized transaction bytes around an embedded payload, yielding
/// the prepend/append context that carries the payload to the txid.
pub fn split_at_payload(tx_bytes: &[u8], payload: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let at = tx_bytes.windows(payload.len()).position(|window| window == payload)?;
    Some((tx_bytes[..at].to_vec(), tx_bytes[at + payload.len()..].to_vec()))
}

/// Operations embedding a commitment into transaction bytes and hashing down
/// to the txid.
pub fn tx_embed_ops(tx_bytes: &[u8], payload: &[u8]) -> Option<Vec<Op>> {
    let (prefix, suffix) = split_at_payload(tx_bytes, payload)?;
    Some(vec![Op::Prepend(prefix), Op::Append(suffix), Op::Sha256, Op::Sha256])
}

/// Merkle root over a block's txids (internal byte order), duplicating the
/// trailing node of odd levels, as block headers commit to it.
pub fn block_merkle_root(txids: &[Digest]) -> Digest {
    let mut level: Vec<Digest> = txids.to_vec();
    while level.len() > 1 {
        let mut parents = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = *pair.get(1).unwrap_or(&pair[0]);
            let mut cat = Vec::with_capacity(64);
            cat.extend_from_slice(&left);
            cat.extend_from_slice(&right);
            parents.push(sha256d(&cat));
        }
        level = parents;
    }
    level.first().copied().unwrap_or([0u8; 32])
}

/// Operations proving inclusion of `txids[position]` under the block's
/// merkle root.
pub fn block_merkle_ops(txids: &[Digest], position: usize) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut level: Vec<Digest> = txids.to_vec();
    let mut index = position;
    while level.len() > 1 {
        let sibling = if index % 2 == 0 {
            *level.get(index + 1).unwrap_or(&level[index])
        } else {
            level[index - 1]
        };
        if index % 2 == 0 {
            ops.push(Op::Append(sibling.to_vec()));
        } else {
            ops.push(Op::Prepend(sibling.to_vec()));
        }
        ops.push(Op::Sha256);
        ops.push(Op::Sha256);

        let mut parents = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = *pair.get(1).unwrap_or(&pair[0]);
            let mut cat = Vec::with_capacity(64);
            cat.extend_from_slice(&left);
            cat.extend_from_slice(&right);
            parents.push(sha256d(&cat));
        }
        level = parents;
        index /= 2;
    }
    ops
}

/// RPC interfaces show txids reversed; proofs need internal byte order.
pub fn txid_from_hex(display: &str) -> Result<Digest> {
    let mut bytes = hex::decode(display)?;
    if bytes.len() != 32 {
        bail!("txid must be 32 bytes, got {}", bytes.len());
    }
    bytes.reverse();
    Ok(bytes.try_into().unwrap())
}

pub fn txid_to_hex(txid: &Digest) -> String {
    let mut bytes = *txid;
    bytes.reverse();
    hex::encode(bytes)
}
