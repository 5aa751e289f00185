use anyhow::{bail, Context, Result};
use opentimestamps::attestation::Attestation;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::bitcoin::rpc::BitcoinRpc;
use crate::bitcoin::tx::{
    self, OutPoint, Transaction, TxIn, TxOut, RBF_SEQUENCE, TX_VERSION,
};
use crate::calendar::{Calendar, StoreError};
use crate::merkle::{self, Digest, MountainRange};

/// Headroom added to the unsigned serialization when estimating the final
/// size: covers the scriptSig or witness the wallet attaches to one input.
const SIGNATURE_ALLOWANCE: usize = 110;

/// How many wallet transactions the startup scan looks back through.
const RESUME_SCAN_DEPTH: usize = 100;

pub struct StamperConfig {
    /// Minimum time between anchors (and the cooldown after a failed cycle).
    pub anchor_interval: Duration,
    /// Confirmation poll cadence while a transaction is in flight.
    pub poll_interval: Duration,
    /// How long a broadcast may sit unconfirmed before a fee bump is
    /// considered.
    pub bump_after: Duration,
    /// Feerate floor, sat/vB.
    pub min_relay_feerate: u64,
    /// Absolute fee ceiling, satoshis. Never exceeded, bumps included.
    pub max_fee: u64,
    /// Confirmation target handed to the fee estimator.
    pub conf_target: u16,
    /// Depth required before attestations are published.
    pub confirmations: i64,
    /// Transient-error retries per broadcast.
    pub broadcast_attempts: u32,
}

/// The wallet is for this calendar's exclusive use; any commitment-bearing
/// transaction in it that this server cannot account for is someone else
/// spending our outputs, and the only safe reaction is to stop.
#[derive(Debug, Error)]
#[error("wallet transaction {txid} carries commitment {payload} this calendar did not create")]
pub struct ForeignWalletActivity {
    txid: String,
    payload: String,
}

struct Anchor {
    commitments: Vec<Digest>,
    range: MountainRange,
    txid_hex: String,
    input: OutPoint,
    input_value: u64,
    fee: u64,
    feerate: u64,
    broadcast_at: Instant,
}

/// Anchoring state machine. One instance per calendar; at most one anchor
/// transaction is in flight at any time, driven idle → building → broadcast
/// → confirming → finalized by `anchor_pending`.
pub struct Stamper<R> {
    rpc: R,
    calendar: Arc<Calendar>,
    cfg: StamperConfig,
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StoreError>().is_some()
        || err.downcast_ref::<ForeignWalletActivity>().is_some()
}

async fn sleep_while_running(duration: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
        else {
            return true;
        };
        tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
    }
}

impl<R: BitcoinRpc> Stamper<R> {
    pub fn new(rpc: R, calendar: Arc<Calendar>, cfg: StamperConfig) -> Self {
        Stamper { rpc, calendar, cfg }
    }

    /// Stamper task: waits out the anchor interval, then anchors whatever
    /// commitments accumulated. Store invariant violations and foreign wallet
    /// activity propagate out and take the server down; everything else is a
    /// logged cooldown.
    pub async fn run(&self, running: Arc<AtomicBool>) -> Result<()> {
        info!(
            "stamper started, anchoring at most every {}s",
            self.cfg.anchor_interval.as_secs()
        );
        while sleep_while_running(self.cfg.anchor_interval, &running).await {
            match self.anchor_pending().await {
                Ok(_) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => warn!("anchoring attempt failed: {e:#}; cooling down"),
            }
        }
        Ok(())
    }

    /// Run one full anchor cycle over the currently unconfirmed commitments.
    /// Returns false when there was nothing to anchor.
    pub async fn anchor_pending(&self) -> Result<bool> {
        let commitments = self.calendar.unconfirmed();
        if commitments.is_empty() {
            return Ok(false);
        }

        let anchor = match self.find_in_flight(&commitments).await? {
            Some(resumed) => resumed,
            None => {
                let range = merkle::mountain_range(&commitments).expect("commitments non-empty");
                info!(
                    "anchoring {} commitments under {}",
                    commitments.len(),
                    hex::encode(range.root)
                );
                self.build_and_broadcast(commitments.clone(), range).await?
            }
        };
        self.confirm_and_finalize(anchor).await?;
        Ok(true)
    }

    /// Crash recovery: look for a wallet transaction that already carries the
    /// commitment root of a prefix of the unconfirmed set, and adopt it in
    /// the confirming state instead of double-spending fees on a fresh one.
    async fn find_in_flight(&self, commitments: &[Digest]) -> Result<Option<Anchor>> {
        let recent = self.rpc.list_recent_transactions(RESUME_SCAN_DEPTH).await?;
        if recent.is_empty() {
            return Ok(None);
        }
        let mut prefix_roots: Option<Vec<Digest>> = None;
        for summary in recent {
            if summary.confirmations < 0 {
                // Conflicted leftovers of earlier replacements.
                continue;
            }
            let Ok(raw) = self.rpc.raw_transaction(&summary.txid).await else {
                continue;
            };
            let Ok(parsed) = Transaction::parse(&raw) else {
                continue;
            };
            let Some(payload) = parsed
                .outputs
                .iter()
                .find_map(|o| tx::parse_op_return(&o.script_pubkey))
                .and_then(merkle::digest_from_slice)
            else {
                continue;
            };
            let roots = prefix_roots.get_or_insert_with(|| {
                (1..=commitments.len())
                    .map(|k| {
                        merkle::mountain_range(&commitments[..k])
                            .expect("prefix non-empty")
                            .root
                    })
                    .collect()
            });
            match roots.iter().position(|root| *root == payload) {
                Some(at) => {
                    info!(
                        "resuming in-flight anchor {} covering {} commitments",
                        summary.txid,
                        at + 1
                    );
                    let subset = commitments[..=at].to_vec();
                    let range = merkle::mountain_range(&subset).expect("prefix non-empty");
                    return Ok(Some(self.adopt(summary.txid, parsed, subset, range).await?));
                }
                None if summary.confirmations == 0 => {
                    return Err(ForeignWalletActivity {
                        txid: summary.txid,
                        payload: hex::encode(payload),
                    }
                    .into());
                }
                // Confirmed strangers are finalized anchors from past runs.
                None => {}
            }
        }
        Ok(None)
    }

    /// Rebuild the fee bookkeeping of an adopted transaction so replacement
    /// logic keeps working after a restart.
    async fn adopt(
        &self,
        txid_hex: String,
        parsed: Transaction,
        commitments: Vec<Digest>,
        range: MountainRange,
    ) -> Result<Anchor> {
        let input = parsed
            .inputs
            .first()
            .context("anchor transaction has no input")?
            .previous
            .clone();
        let funding_raw = self.rpc.raw_transaction(&tx::txid_to_hex(&input.txid)).await?;
        let funding = Transaction::parse(&funding_raw)?;
        let input_value = funding
            .outputs
            .get(input.vout as usize)
            .context("anchor input refers to a missing output")?
            .value;
        let spent: u64 = parsed.outputs.iter().map(|o| o.value).sum();
        let fee = input_value.saturating_sub(spent);
        let feerate = fee / self.estimated_vsize(&range.root) as u64;
        Ok(Anchor {
            commitments,
            range,
            txid_hex,
            input,
            input_value,
            fee,
            feerate,
            broadcast_at: Instant::now(),
        })
    }

    fn build_tx(&self, input: &OutPoint, input_value: u64, root: &Digest, fee: u64) -> Transaction {
        Transaction {
            version: TX_VERSION,
            inputs: vec![TxIn {
                previous: input.clone(),
                script_sig: Vec::new(),
                sequence: RBF_SEQUENCE,
            }],
            outputs: vec![TxOut {
                value: input_value.saturating_sub(fee),
                script_pubkey: tx::op_return_script(root),
            }],
            lock_time: 0,
        }
    }

    fn estimated_vsize(&self, root: &Digest) -> usize {
        let skeleton = self.build_tx(&OutPoint { txid: [0; 32], vout: 0 }, 0, root, 0);
        skeleton.serialize().len() + SIGNATURE_ALLOWANCE
    }

    async fn current_feerate(&self) -> Result<u64> {
        let estimate = self
            .rpc
            .estimate_fee_rate(self.cfg.conf_target)
            .await?
            .unwrap_or(self.cfg.min_relay_feerate);
        Ok(estimate.max(self.cfg.min_relay_feerate))
    }

    /// Building → broadcast: pick an output, build the commitment
    /// transaction, have the wallet sign it, and push it out.
    async fn build_and_broadcast(
        &self,
        commitments: Vec<Digest>,
        range: MountainRange,
    ) -> Result<Anchor> {
        let feerate = self.current_feerate().await?;
        let vsize = self.estimated_vsize(&range.root) as u64;
        let fee = (feerate * vsize).min(self.cfg.max_fee);

        let mut candidates = self.rpc.list_unspent(1).await?;
        candidates.retain(|utxo| utxo.value > fee);
        candidates.sort_by_key(|utxo| utxo.value);
        let chosen = candidates
            .first()
            .context("wallet has no spendable output large enough for the anchor fee")?;
        let input = OutPoint { txid: tx::txid_from_hex(&chosen.txid)?, vout: chosen.vout };

        let unsigned = self.build_tx(&input, chosen.value, &range.root, fee);
        let signed_hex = self
            .rpc
            .sign_raw_transaction(&hex::encode(unsigned.serialize()))
            .await
            .context("wallet refused to sign the anchor")?;
        let txid_hex = self.broadcast(&signed_hex).await?;
        info!("anchor {} broadcast at {} sat/vB ({} sat fee)", txid_hex, feerate, fee);
        Ok(Anchor {
            commitments,
            range,
            txid_hex,
            input,
            input_value: chosen.value,
            fee,
            feerate,
            broadcast_at: Instant::now(),
        })
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            match self.rpc.send_raw_transaction(tx_hex).await {
                Ok(txid) => return Ok(txid),
                Err(e) if e.is_transient() && attempt + 1 < self.cfg.broadcast_attempts => {
                    attempt += 1;
                    warn!("broadcast attempt {attempt} failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e).context("anchor broadcast failed"),
            }
        }
    }

    /// Confirming: poll until the settlement depth is reached, bumping the
    /// fee via replacement when the transaction lingers and the market moved.
    async fn confirm_and_finalize(&self, mut anchor: Anchor) -> Result<()> {
        let block_hash = loop {
            match self.rpc.wallet_transaction(&anchor.txid_hex).await {
                Ok(Some(wtx)) if wtx.confirmations >= self.cfg.confirmations => {
                    break wtx
                        .block_hash
                        .context("confirmed transaction reported no block")?;
                }
                Ok(Some(wtx)) if wtx.confirmations < 0 => {
                    bail!("anchor {} was conflicted away; will re-anchor", anchor.txid_hex);
                }
                Ok(_) => {
                    if anchor.broadcast_at.elapsed() >= self.cfg.bump_after {
                        self.maybe_bump(&mut anchor).await?;
                    }
                }
                Err(e) if e.is_transient() => warn!("confirmation poll failed: {e}"),
                Err(e) => return Err(e).context("confirmation poll failed"),
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        };
        self.finalize(&anchor, &block_hash).await
    }

    /// Replacement requires strict improvement in both feerate and absolute
    /// fee, and never pierces the fee ceiling. The commitment payload is
    /// carried over unchanged.
    async fn maybe_bump(&self, anchor: &mut Anchor) -> Result<()> {
        let feerate = self.current_feerate().await?;
        if feerate <= anchor.feerate {
            return Ok(());
        }
        let vsize = self.estimated_vsize(&anchor.range.root) as u64;
        let fee = (feerate * vsize).min(self.cfg.max_fee);
        if fee <= anchor.fee || fee >= anchor.input_value {
            debug!(
                "skipping fee bump: {} sat does not improve on {} sat under the cap",
                fee, anchor.fee
            );
            return Ok(());
        }

        let unsigned = self.build_tx(&anchor.input, anchor.input_value, &anchor.range.root, fee);
        let signed_hex = self.rpc.sign_raw_transaction(&hex::encode(unsigned.serialize())).await?;
        let txid_hex = self.broadcast(&signed_hex).await?;
        info!(
            "replaced anchor {} with {} ({} → {} sat/vB, {} → {} sat)",
            anchor.txid_hex, txid_hex, anchor.feerate, feerate, anchor.fee, fee
        );
        anchor.txid_hex = txid_hex;
        anchor.fee = fee;
        anchor.feerate = feerate;
        anchor.broadcast_at = Instant::now();
        Ok(())
    }

    /// Finalize: stitch every anchored commitment to the block through the
    /// transaction bytes and the block merkle tree, then upgrade the
    /// calendar records.
    async fn finalize(&self, anchor: &Anchor, block_hash: &str) -> Result<()> {
        let raw = self.rpc.raw_transaction(&anchor.txid_hex).await?;
        let parsed = Transaction::parse(&raw)?;
        let tx_bytes = parsed.serialize();
        let embed = tx::tx_embed_ops(&tx_bytes, &anchor.range.root)
            .context("anchor transaction lost its commitment payload")?;

        let block = self.rpc.block(block_hash).await?;
        let txids = block
            .txids
            .iter()
            .map(|display| tx::txid_from_hex(display))
            .collect::<Result<Vec<Digest>>>()?;
        let txid = parsed.txid();
        let position = txids
            .iter()
            .position(|candidate| *candidate == txid)
            .context("anchor transaction missing from its own block")?;
        let header_root = tx::txid_from_hex(&block.merkle_root_hex)?;
        if tx::block_merkle_root(&txids) != header_root {
            bail!("block {} txids do not reproduce the header merkle root", block_hash);
        }
        let merkle_ops = tx::block_merkle_ops(&txids, position);

        let attestation = Attestation::Bitcoin { height: block.height };
        for (commitment, to_root) in anchor.commitments.iter().zip(&anchor.range.paths) {
            let mut ops = to_root.clone();
            ops.extend(embed.iter().cloned());
            ops.extend(merkle_ops.iter().cloned());
            let timestamp = merkle::chain(commitment, &ops, attestation.clone());
            self.calendar.upgrade_commitment(commitment, &timestamp)?;
        }
        info!(
            "anchor {} finalized: {} commitments attested in block {}",
            anchor.txid_hex,
            anchor.commitments.len(),
            block.height
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::rpc::{Block, ChainInfo, RpcError, Unspent, WalletTx, WalletTxSummary};
    use crate::merkle::sha256;
    use assert_fs::TempDir;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const URI: &str = "http://test/";
    const BLOCK_HASH: &str = "0b"; // opaque handle, never parsed
    const BLOCK_HEIGHT: usize = 850_000;

    struct MockState {
        utxos: Vec<Unspent>,
        feerate: u64,
        feerate_after_broadcast: Option<u64>,
        confirm_after_polls: usize,
        polls: usize,
        broadcasts: Vec<Vec<u8>>,
        raw: HashMap<String, Vec<u8>>,
        recent: Vec<WalletTxSummary>,
    }

    struct MockNode {
        state: Mutex<MockState>,
    }

    impl MockNode {
        fn with_wallet(confirm_after_polls: usize) -> Self {
            let funding = funding_tx();
            let funding_txid = tx::txid_to_hex(&funding.txid());
            let mut raw = HashMap::new();
            raw.insert(funding_txid.clone(), funding.serialize());
            MockNode {
                state: Mutex::new(MockState {
                    utxos: vec![Unspent { txid: funding_txid, vout: 0, value: 100_000 }],
                    feerate: 1,
                    feerate_after_broadcast: None,
                    confirm_after_polls,
                    polls: 0,
                    broadcasts: Vec::new(),
                    raw: HashMap::new(),
                    recent: Vec::new(),
                }),
            }
            .preload(raw)
        }

        fn preload(self, raw: HashMap<String, Vec<u8>>) -> Self {
            self.state.lock().unwrap().raw.extend(raw);
            self
        }

        fn broadcast_count(&self) -> usize {
            self.state.lock().unwrap().broadcasts.len()
        }

        fn broadcast_tx(&self, at: usize) -> Transaction {
            Transaction::parse(&self.state.lock().unwrap().broadcasts[at]).unwrap()
        }

        fn latest_txid(&self) -> Option<Digest> {
            let state = self.state.lock().unwrap();
            state.broadcasts.last().map(|raw| Transaction::parse(raw).unwrap().txid())
        }

        fn block_txids(&self) -> Vec<Digest> {
            // A fake coinbase plus the anchor, like the smallest real block.
            let coinbase = tx::sha256d(b"coinbase");
            match self.latest_txid() {
                Some(anchor) => vec![coinbase, anchor],
                None => vec![coinbase],
            }
        }
    }

    fn funding_tx() -> Transaction {
        Transaction {
            version: TX_VERSION,
            inputs: vec![TxIn {
                previous: OutPoint { txid: [0x99; 32], vout: 0 },
                script_sig: vec![0x00],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOut { value: 100_000, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    #[async_trait]
    impl BitcoinRpc for MockNode {
        async fn chain_info(&self) -> Result<ChainInfo, RpcError> {
            Ok(ChainInfo { chain: "regtest".into(), blocks: BLOCK_HEIGHT as u64 })
        }

        async fn list_unspent(&self, _min: u32) -> Result<Vec<Unspent>, RpcError> {
            Ok(self.state.lock().unwrap().utxos.clone())
        }

        async fn list_recent_transactions(
            &self,
            _count: usize,
        ) -> Result<Vec<WalletTxSummary>, RpcError> {
            Ok(self.state.lock().unwrap().recent.clone())
        }

        async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, RpcError> {
            self.state.lock().unwrap().raw.get(txid).cloned().ok_or(RpcError::Node {
                method: "getrawtransaction".into(),
                code: -5,
                message: "No such transaction".into(),
            })
        }

        async fn sign_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
            // The scripted wallet "signs" without changing the bytes.
            Ok(tx_hex.to_string())
        }

        async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
            let raw = hex::decode(tx_hex).unwrap();
            let txid = tx::txid_to_hex(&Transaction::parse(&raw).unwrap().txid());
            let mut state = self.state.lock().unwrap();
            state.raw.insert(txid.clone(), raw.clone());
            state.broadcasts.push(raw);
            state.recent.push(WalletTxSummary { txid: txid.clone(), confirmations: 0 });
            if let Some(raised) = state.feerate_after_broadcast.take() {
                state.feerate = raised;
            }
            Ok(txid)
        }

        async fn wallet_transaction(&self, _txid: &str) -> Result<Option<WalletTx>, RpcError> {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            if state.polls >= state.confirm_after_polls {
                Ok(Some(WalletTx {
                    confirmations: 6,
                    block_hash: Some(BLOCK_HASH.to_string()),
                }))
            } else {
                Ok(Some(WalletTx { confirmations: 0, block_hash: None }))
            }
        }

        async fn block(&self, _hash: &str) -> Result<Block, RpcError> {
            let txids = self.block_txids();
            Ok(Block {
                height: BLOCK_HEIGHT,
                merkle_root_hex: tx::txid_to_hex(&tx::block_merkle_root(&txids)),
                txids: txids.iter().map(tx::txid_to_hex).collect(),
            })
        }

        async fn estimate_fee_rate(&self, _target: u16) -> Result<Option<u64>, RpcError> {
            Ok(Some(self.state.lock().unwrap().feerate))
        }
    }

    fn test_config() -> StamperConfig {
        StamperConfig {
            anchor_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
            bump_after: Duration::from_secs(3600),
            min_relay_feerate: 1,
            max_fee: 50_000,
            conf_target: 2,
            confirmations: 6,
            broadcast_attempts: 3,
        }
    }

    fn calendar_with_rounds(dir: &TempDir, rounds: u8) -> Arc<Calendar> {
        let calendar = Arc::new(Calendar::open(dir.path()).unwrap());
        for i in 0..rounds {
            let commitment = sha256(&[i]);
            calendar
                .add_commitment(&commitment, &merkle::pending(&commitment, URI))
                .unwrap();
        }
        calendar
    }

    #[tokio::test]
    async fn anchor_confirms_and_upgrades_every_commitment() {
        let dir = TempDir::new().unwrap();
        let calendar = calendar_with_rounds(&dir, 2);
        let commitments = calendar.unconfirmed();
        let node = MockNode::with_wallet(1);
        let stamper = Stamper::new(node, calendar.clone(), test_config());

        assert!(stamper.anchor_pending().await.unwrap());
        assert!(calendar.unconfirmed().is_empty());
        assert_eq!(stamper.rpc.broadcast_count(), 1);

        let anchor_tx = stamper.rpc.broadcast_tx(0);
        assert_eq!(anchor_tx.inputs.len(), 1);
        assert_eq!(anchor_tx.outputs.len(), 1);
        let root = merkle::mountain_range(&commitments).unwrap().root;
        assert_eq!(tx::parse_op_return(&anchor_tx.outputs[0].script_pubkey), Some(root.as_slice()));
        assert_eq!(anchor_tx.inputs[0].sequence, RBF_SEQUENCE);

        let block_root = tx::block_merkle_root(&stamper.rpc.block_txids());
        for commitment in commitments {
            let timestamp = calendar.get(&commitment).unwrap().unwrap();
            match merkle::terminal(&timestamp) {
                Some((Attestation::Bitcoin { height }, attested)) => {
                    assert_eq!(*height, BLOCK_HEIGHT);
                    assert_eq!(attested, block_root.as_slice());
                }
                _ => panic!("expected a block attestation"),
            }
            // The full path must carry the commitment to the block root.
            let ops = merkle::ops_of(&timestamp);
            assert_eq!(merkle::apply(&ops, &commitment), block_root.to_vec());
        }
    }

    #[tokio::test]
    async fn lingering_anchor_is_replaced_with_a_higher_fee() {
        let dir = TempDir::new().unwrap();
        let calendar = calendar_with_rounds(&dir, 1);
        let node = MockNode::with_wallet(3);
        node.state.lock().unwrap().feerate_after_broadcast = Some(5);
        let mut cfg = test_config();
        cfg.bump_after = Duration::ZERO;
        let stamper = Stamper::new(node, calendar.clone(), cfg);

        assert!(stamper.anchor_pending().await.unwrap());
        assert_eq!(stamper.rpc.broadcast_count(), 2);

        let first = stamper.rpc.broadcast_tx(0);
        let second = stamper.rpc.broadcast_tx(1);
        let fee = |t: &Transaction| 100_000 - t.outputs[0].value;
        assert!(fee(&second) > fee(&first), "replacement must pay strictly more");
        assert_eq!(fee(&second), 5 * fee(&first), "feerate rose fivefold");
        // The payload is carried over unchanged.
        assert_eq!(
            tx::parse_op_return(&first.outputs[0].script_pubkey),
            tx::parse_op_return(&second.outputs[0].script_pubkey),
        );
        // Same input spent by both: a replacement, not a second anchor.
        assert_eq!(first.inputs[0].previous, second.inputs[0].previous);
        assert!(calendar.unconfirmed().is_empty());
    }

    #[tokio::test]
    async fn fee_is_capped_by_the_configured_maximum() {
        let dir = TempDir::new().unwrap();
        let calendar = calendar_with_rounds(&dir, 1);
        let node = MockNode::with_wallet(1);
        node.state.lock().unwrap().feerate = 1_000;
        let mut cfg = test_config();
        cfg.max_fee = 2_000;
        let stamper = Stamper::new(node, calendar.clone(), cfg);

        assert!(stamper.anchor_pending().await.unwrap());
        let anchor_tx = stamper.rpc.broadcast_tx(0);
        assert_eq!(100_000 - anchor_tx.outputs[0].value, 2_000);
    }

    #[tokio::test]
    async fn broadcast_but_unfinalized_anchor_is_resumed() {
        let dir = TempDir::new().unwrap();
        let calendar = calendar_with_rounds(&dir, 2);
        let commitments = calendar.unconfirmed();
        let root = merkle::mountain_range(&commitments).unwrap().root;

        // A previous run broadcast this anchor and crashed before finalizing.
        let funding = funding_tx();
        let inflight = Transaction {
            version: TX_VERSION,
            inputs: vec![TxIn {
                previous: OutPoint { txid: funding.txid(), vout: 0 },
                script_sig: Vec::new(),
                sequence: RBF_SEQUENCE,
            }],
            outputs: vec![TxOut { value: 99_500, script_pubkey: tx::op_return_script(&root) }],
            lock_time: 0,
        };
        let inflight_txid = tx::txid_to_hex(&inflight.txid());
        let node = MockNode::with_wallet(1);
        {
            let mut state = node.state.lock().unwrap();
            state.raw.insert(inflight_txid.clone(), inflight.serialize());
            state.broadcasts.push(inflight.serialize());
            state.recent.push(WalletTxSummary { txid: inflight_txid, confirmations: 0 });
        }
        let stamper = Stamper::new(node, calendar.clone(), test_config());

        assert!(stamper.anchor_pending().await.unwrap());
        // No new broadcast happened; the existing transaction was adopted.
        assert_eq!(stamper.rpc.broadcast_count(), 1);
        assert!(calendar.unconfirmed().is_empty());
    }

    #[tokio::test]
    async fn unknown_wallet_commitment_is_fatal() {
        let dir = TempDir::new().unwrap();
        let calendar = calendar_with_rounds(&dir, 1);
        let foreign = Transaction {
            version: TX_VERSION,
            inputs: vec![TxIn {
                previous: OutPoint { txid: [0x13; 32], vout: 0 },
                script_sig: Vec::new(),
                sequence: RBF_SEQUENCE,
            }],
            outputs: vec![TxOut { value: 0, script_pubkey: tx::op_return_script(&[0x66; 32]) }],
            lock_time: 0,
        };
        let foreign_txid = tx::txid_to_hex(&foreign.txid());
        let node = MockNode::with_wallet(1);
        {
            let mut state = node.state.lock().unwrap();
            state.raw.insert(foreign_txid.clone(), foreign.serialize());
            state.recent.push(WalletTxSummary { txid: foreign_txid, confirmations: 0 });
        }
        let stamper = Stamper::new(node, calendar, test_config());

        let err = stamper.anchor_pending().await.unwrap_err();
        assert!(err.downcast_ref::<ForeignWalletActivity>().is_some());
        assert!(is_fatal(&err));
    }
}
