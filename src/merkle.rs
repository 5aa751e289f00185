use opentimestamps::attestation::Attestation;
use opentimestamps::op::Op;
use opentimestamps::timestamp::{Step, StepData, Timestamp};
use sha2::{Digest as _, Sha256};

/// All keys in the calendar are SHA-256 digests.
pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Parent digest of two adjacent nodes: H(left ∥ right).
pub fn merge(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

pub fn digest_from_slice(bytes: &[u8]) -> Option<Digest> {
    <Digest>::try_from(bytes).ok()
}

/// One round's (or one anchor's) aggregation: the top digest plus, for every
/// leaf, the operation sequence carrying that leaf up to the top.
pub struct MountainRange {
    pub root: Digest,
    pub paths: Vec<Vec<Op>>,
}

struct Peak {
    digest: Digest,
    height: u32,
    leaves: std::ops::Range<usize>,
}

fn merge_peaks(left: Peak, right: Peak, paths: &mut [Vec<Op>]) -> Peak {
    for i in left.leaves.clone() {
        paths[i].push(Op::Append(right.digest.to_vec()));
        paths[i].push(Op::Sha256);
    }
    for i in right.leaves.clone() {
        paths[i].push(Op::Prepend(left.digest.to_vec()));
        paths[i].push(Op::Sha256);
    }
    Peak {
        digest: merge(&left.digest, &right.digest),
        height: left.height.max(right.height) + 1,
        leaves: left.leaves.start..right.leaves.end,
    }
}

/// Combine an ordered list of leaves into a Merkle mountain range.
///
/// Adjacent equal-height trees are merged as leaves arrive, then the
/// remaining peaks are bagged left to right. Submission order fully
/// determines the root, so every node computing over the same ordered
/// input arrives at the same digest.
pub fn mountain_range(leaves: &[Digest]) -> Option<MountainRange> {
    if leaves.is_empty() {
        return None;
    }
    let mut paths: Vec<Vec<Op>> = vec![Vec::new(); leaves.len()];
    let mut peaks: Vec<Peak> = Vec::new();
    for (i, leaf) in leaves.iter().enumerate() {
        peaks.push(Peak { digest: *leaf, height: 0, leaves: i..i + 1 });
        while peaks.len() >= 2 && peaks[peaks.len() - 1].height == peaks[peaks.len() - 2].height {
            let right = peaks.pop().unwrap();
            let left = peaks.pop().unwrap();
            peaks.push(merge_peaks(left, right, &mut paths));
        }
    }
    let mut iter = peaks.into_iter();
    let mut top = iter.next().unwrap();
    for peak in iter {
        top = merge_peaks(top, peak, &mut paths);
    }
    Some(MountainRange { root: top.digest, paths })
}

/// Fold a sequence of operations over an input digest.
pub fn apply(ops: &[Op], input: &[u8]) -> Vec<u8> {
    let mut digest = input.to_vec();
    for op in ops {
        digest = op.execute(&digest);
    }
    digest
}

/// Build a linear timestamp: `start` carried through `ops`, terminated by
/// `attestation`. Every step has exactly one successor.
pub fn chain(start: &[u8], ops: &[Op], attestation: Attestation) -> Timestamp {
    let mut digests = Vec::with_capacity(ops.len() + 1);
    digests.push(start.to_vec());
    for op in ops {
        let next = op.execute(digests.last().unwrap());
        digests.push(next);
    }
    let mut step = Step {
        data: StepData::Attestation(attestation),
        output: digests.last().unwrap().clone(),
        next: Vec::new(),
    };
    for (op, output) in ops.iter().zip(digests.iter().skip(1)).rev() {
        step = Step {
            data: StepData::Op(op.clone()),
            output: output.clone(),
            next: vec![step],
        };
    }
    Timestamp { start_digest: start.to_vec(), first_step: step }
}

/// The provisional tail attached to every fresh commitment.
pub fn pending(commitment: &Digest, uri: &str) -> Timestamp {
    chain(commitment, &[], Attestation::Pending { uri: uri.to_string() })
}

/// Terminal attestation of a linear timestamp, with the digest it attests.
pub fn terminal(timestamp: &Timestamp) -> Option<(&Attestation, &[u8])> {
    let mut step = &timestamp.first_step;
    loop {
        match &step.data {
            StepData::Attestation(att) => return Some((att, &step.output)),
            _ => step = step.next.first()?,
        }
    }
}

/// Digests reachable from the start of a linear timestamp, excluding the
/// start itself: the input of every step past the first.
pub fn intermediates(timestamp: &Timestamp) -> Vec<Digest> {
    let mut found = Vec::new();
    let mut step = &timestamp.first_step;
    while let StepData::Op(_) = &step.data {
        if let Some(digest) = digest_from_slice(&step.output) {
            found.push(digest);
        }
        match step.next.first() {
            Some(next) => step = next,
            None => break,
        }
    }
    found
}

/// Re-root a linear timestamp at `digest`, which must be its start or one of
/// its intermediate digests. Returns the remaining suffix of the chain.
pub fn reroot(timestamp: &Timestamp, digest: &[u8]) -> Option<Timestamp> {
    let mut start = timestamp.start_digest.clone();
    let mut step = &timestamp.first_step;
    loop {
        if start == digest {
            return Some(Timestamp { start_digest: start, first_step: step.clone() });
        }
        match &step.data {
            StepData::Attestation(_) => return None,
            _ => {
                start = step.output.clone();
                step = step.next.first()?;
            }
        }
    }
}

/// Operations of a linear timestamp, in application order.
pub fn ops_of(timestamp: &Timestamp) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut step = &timestamp.first_step;
    while let StepData::Op(op) = &step.data {
        ops.push(op.clone());
        match step.next.first() {
            Some(next) => step = next,
            None => break,
        }
    }
    ops
}

/// Append the ops and terminal of `tail` onto the end of `ops`, producing a
/// full linear timestamp from `start`. `tail` must begin where the ops end.
/// Returns None if `tail` is not a linear attested chain.
pub fn extend(start: &[u8], ops: &[Op], tail: &Timestamp) -> Option<Timestamp> {
    let mut all = ops.to_vec();
    all.extend(ops_of(tail));
    let (attestation, _) = terminal(tail)?;
    Some(chain(start, &all, attestation.clone()))
}
