//! In-memory chain and mempool
//!
//! Enough of a block chain to drive the networking engine: header
//! proof-of-work and merkle checks, orphan tracking, longest-chain
//! reorganization and locator handling. No script or UTXO validation.

use super::{BlockFlags, Chain, ChainEntry, ChainError, Mempool, VerifyError};
use crate::core::{Block, Network, Transaction};
use crate::crypto::Hash256;
use crate::wire::types::RejectCode;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Fee rate reported for transactions added without one
pub const DEFAULT_FEE_RATE: i64 = 1000;

// =============================================================================
// Chain
// =============================================================================

#[derive(Debug, Default)]
struct ChainState {
    entries: HashMap<Hash256, ChainEntry>,
    blocks: HashMap<Hash256, Block>,
    /// Main chain hashes indexed by height
    main: Vec<Hash256>,
    orphans: HashMap<Hash256, Block>,
    /// prev hash -> orphan hash
    orphan_prev: HashMap<Hash256, Hash256>,
    invalid: HashSet<Hash256>,
    synced: Option<bool>,
}

impl ChainState {
    fn tip(&self) -> Option<&ChainEntry> {
        self.main.last().and_then(|hash| self.entries.get(hash))
    }

    fn is_main(&self, entry: &ChainEntry) -> bool {
        self.main.get(entry.height as usize) == Some(&entry.hash)
    }

    fn ancestor(&self, entry: &ChainEntry, height: u32) -> Option<ChainEntry> {
        if self.is_main(entry) {
            return self
                .main
                .get(height as usize)
                .and_then(|hash| self.entries.get(hash))
                .copied();
        }
        let mut current = *entry;
        while current.height > height {
            current = *self.entries.get(&current.header.prev_block)?;
        }
        Some(current)
    }

    /// Point the main chain at `entry`, rewinding to the fork point
    fn reorganize(&mut self, entry: &ChainEntry) {
        let mut path = Vec::new();
        let mut current = *entry;
        while !self.is_main(&current) {
            path.push(current.hash);
            match self.entries.get(&current.header.prev_block) {
                Some(prev) => current = *prev,
                None => return,
            }
        }

        if current.height as usize + 1 != self.main.len() {
            log::info!(
                "Chain reorganization: fork at {} height={}",
                current.hash,
                current.height
            );
        }

        self.main.truncate(current.height as usize + 1);
        self.main.extend(path.into_iter().rev());
    }

    fn connect(&mut self, block: Block) -> ChainEntry {
        let hash = block.hash();
        let height = self
            .entries
            .get(&block.header.prev_block)
            .map(|prev| prev.height + 1)
            .unwrap_or(0);
        let entry = ChainEntry {
            hash,
            height,
            header: block.header,
        };

        self.entries.insert(hash, entry);
        self.blocks.insert(hash, block);

        let tip_height = self.tip().map(|tip| tip.height).unwrap_or(0);
        if entry.height > tip_height {
            self.reorganize(&entry);
        }

        entry
    }
}

/// Block chain kept entirely in memory
#[derive(Debug)]
pub struct MemoryChain {
    network: Network,
    state: Mutex<ChainState>,
}

impl MemoryChain {
    pub fn new(network: Network) -> Self {
        let genesis = Block::new(network.genesis, Vec::new());
        let hash = genesis.hash();
        let mut state = ChainState::default();
        state.entries.insert(
            hash,
            ChainEntry {
                hash,
                height: 0,
                header: genesis.header,
            },
        );
        state.blocks.insert(hash, genesis);
        state.main.push(hash);

        Self {
            network,
            state: Mutex::new(state),
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Override the tip-age based sync state
    pub fn set_synced(&self, synced: Option<bool>) {
        self.lock().synced = synced;
    }

    pub fn orphan_count(&self) -> usize {
        self.lock().orphans.len()
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn verify(&self, block: &Block, flags: BlockFlags) -> Result<(), VerifyError> {
        let hash = block.hash();

        if flags.contains(BlockFlags::VERIFY_POW) && !block.header.verify_pow() {
            return Err(VerifyError::new(hash, RejectCode::Invalid, "high-hash", 50));
        }

        if flags.contains(BlockFlags::VERIFY_BODY) {
            if block.txs.is_empty() || !block.txs[0].is_coinbase() {
                return Err(VerifyError::new(hash, RejectCode::Invalid, "bad-cb-missing", 100));
            }
            if block.txs[1..].iter().any(Transaction::is_coinbase) {
                return Err(VerifyError::new(hash, RejectCode::Invalid, "bad-cb-multiple", 100));
            }
            if block.compute_merkle_root() != block.header.merkle_root {
                return Err(VerifyError::new(
                    hash,
                    RejectCode::Invalid,
                    "bad-txnmrklroot",
                    100,
                ));
            }
        }

        Ok(())
    }
}

impl Chain for MemoryChain {
    fn height(&self) -> u32 {
        self.lock().tip().map(|tip| tip.height).unwrap_or(0)
    }

    fn tip(&self) -> ChainEntry {
        let state = self.lock();
        match state.tip() {
            Some(tip) => *tip,
            None => ChainEntry {
                hash: self.network.genesis_hash(),
                height: 0,
                header: self.network.genesis,
            },
        }
    }

    fn synced(&self) -> bool {
        let state = self.lock();
        if let Some(synced) = state.synced {
            return synced;
        }
        let Some(tip) = state.tip() else {
            return false;
        };
        if tip.height < self.network.last_checkpoint() {
            return false;
        }
        tip.header.time as i64 + self.network.max_tip_age >= chrono::Utc::now().timestamp()
    }

    fn get_locator(&self, start: Option<Hash256>) -> Vec<Hash256> {
        let state = self.lock();
        let mut hashes = Vec::new();

        let Some(tip) = state.tip().copied() else {
            return hashes;
        };

        let start = start.unwrap_or(tip.hash);
        let entry = match state.entries.get(&start) {
            Some(entry) => *entry,
            None => {
                hashes.push(start);
                tip
            }
        };

        hashes.push(entry.hash);

        let mut height = entry.height;
        let mut step = 1;
        while height > 0 {
            height = height.saturating_sub(step);

            if hashes.len() > 10 {
                step *= 2;
            }

            match state.ancestor(&entry, height) {
                Some(ancestor) => hashes.push(ancestor.hash),
                None => break,
            }
        }

        hashes
    }

    fn add(
        &self,
        block: Block,
        flags: BlockFlags,
        peer: Option<u64>,
    ) -> Result<Option<ChainEntry>, ChainError> {
        let hash = block.hash();
        let mut state = self.lock();

        if state.entries.contains_key(&hash) || state.orphans.contains_key(&hash) {
            return Err(VerifyError::new(hash, RejectCode::Duplicate, "duplicate", 0).into());
        }

        if state.invalid.contains(&hash) {
            return Err(VerifyError::new(hash, RejectCode::Invalid, "duplicate", 100).into());
        }

        if let Err(err) = self.verify(&block, flags) {
            if err.score >= 100 {
                state.invalid.insert(hash);
            }
            return Err(err.into());
        }

        if !state.entries.contains_key(&block.header.prev_block) {
            log::debug!(
                "Storing orphan block {} (peer={:?})",
                hash,
                peer
            );
            state.orphan_prev.insert(block.header.prev_block, hash);
            state.orphans.insert(hash, block);
            return Ok(None);
        }

        let entry = state.connect(block);

        // Resolve orphans waiting on the newly connected block.
        let mut parent = entry.hash;
        while let Some(child) = state.orphan_prev.remove(&parent) {
            let Some(orphan) = state.orphans.remove(&child) else {
                break;
            };
            if self.verify(&orphan, flags).is_err() {
                state.invalid.insert(child);
                break;
            }
            parent = state.connect(orphan).hash;
        }

        Ok(Some(entry))
    }

    fn has(&self, hash: &Hash256) -> bool {
        let state = self.lock();
        state.entries.contains_key(hash) || state.orphans.contains_key(hash)
    }

    fn get_entry(&self, hash: &Hash256) -> Option<ChainEntry> {
        self.lock().entries.get(hash).copied()
    }

    fn get_entry_by_height(&self, height: u32) -> Option<ChainEntry> {
        let state = self.lock();
        state
            .main
            .get(height as usize)
            .and_then(|hash| state.entries.get(hash))
            .copied()
    }

    fn is_main_chain(&self, entry: &ChainEntry) -> bool {
        self.lock().is_main(entry)
    }

    fn get_block(&self, hash: &Hash256) -> Option<Block> {
        self.lock().blocks.get(hash).cloned()
    }

    fn get_next_hash(&self, hash: &Hash256) -> Option<Hash256> {
        let state = self.lock();
        let entry = state.entries.get(hash)?;
        if !state.is_main(entry) {
            return None;
        }
        state.main.get(entry.height as usize + 1).copied()
    }

    fn find_locator(&self, locator: &[Hash256]) -> Hash256 {
        let state = self.lock();
        for hash in locator {
            if let Some(entry) = state.entries.get(hash) {
                if state.is_main(entry) {
                    return *hash;
                }
            }
        }
        state.main.first().copied().unwrap_or(Hash256::ZERO)
    }

    fn has_orphan(&self, hash: &Hash256) -> bool {
        self.lock().orphans.contains_key(hash)
    }

    fn get_orphan_root(&self, hash: &Hash256) -> Option<Hash256> {
        let state = self.lock();
        let mut root = None;
        let mut current = *hash;
        while let Some(orphan) = state.orphans.get(&current) {
            root = Some(current);
            current = orphan.header.prev_block;
        }
        root
    }
}

// =============================================================================
// Mempool
// =============================================================================

#[derive(Debug, Default)]
struct PoolState {
    txs: HashMap<Hash256, (Transaction, i64)>,
    /// Insertion order, so iteration is deterministic
    order: Vec<Hash256>,
    rejects: HashSet<Hash256>,
}

/// Transaction pool kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryMempool {
    state: Mutex<PoolState>,
}

impl MemoryMempool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert with an explicit fee rate
    pub fn add_with_rate(&self, tx: Transaction, rate: i64) -> Result<(), ChainError> {
        let hash = tx.txid();
        let mut state = self.lock();

        if state.txs.contains_key(&hash) {
            return Err(VerifyError::new(
                hash,
                RejectCode::Duplicate,
                "txn-already-in-mempool",
                0,
            )
            .into());
        }

        if tx.is_coinbase() {
            state.rejects.insert(hash);
            return Err(VerifyError::new(hash, RejectCode::Invalid, "coinbase", 100).into());
        }

        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            state.rejects.insert(hash);
            return Err(VerifyError::new(
                hash,
                RejectCode::Invalid,
                "bad-txns-vin-vout-empty",
                100,
            )
            .into());
        }

        state.order.push(hash);
        state.txs.insert(hash, (tx, rate));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Mempool for MemoryMempool {
    fn add_tx(&self, tx: Transaction, _peer: Option<u64>) -> Result<Vec<Hash256>, ChainError> {
        self.add_with_rate(tx, DEFAULT_FEE_RATE)?;
        Ok(Vec::new())
    }

    fn get_tx(&self, hash: &Hash256) -> Option<Transaction> {
        self.lock().txs.get(hash).map(|(tx, _)| tx.clone())
    }

    fn has(&self, hash: &Hash256) -> bool {
        self.lock().txs.contains_key(hash)
    }

    fn has_reject(&self, hash: &Hash256) -> bool {
        self.lock().rejects.contains(hash)
    }

    fn transactions(&self) -> Vec<Transaction> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|hash| state.txs.get(hash))
            .map(|(tx, _)| tx.clone())
            .collect()
    }

    fn fee_rate(&self, hash: &Hash256) -> Option<i64> {
        self.lock().txs.get(hash).map(|(_, rate)| *rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::tests::make_block;
    use crate::core::transaction::tests::spend;

    fn chain() -> MemoryChain {
        MemoryChain::new(Network::regtest())
    }

    fn extend(chain: &MemoryChain, tag: u32, count: u32) -> Vec<Block> {
        let mut prev = chain.tip().hash;
        let mut blocks = Vec::new();
        for i in 0..count {
            let block = make_block(prev, tag + i, 1, false);
            prev = block.hash();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn test_add_and_duplicate() {
        let chain = chain();
        let block = extend(&chain, 100, 1).remove(0);

        let entry = chain
            .add(block.clone(), BlockFlags::DEFAULT, None)
            .unwrap()
            .unwrap();
        assert_eq!(entry.height, 1);
        assert_eq!(chain.tip().hash, block.hash());

        match chain.add(block, BlockFlags::DEFAULT, None) {
            Err(ChainError::Verify(err)) => {
                assert_eq!(err.code, RejectCode::Duplicate);
                assert_eq!(err.score, 0);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_bad_merkle_root_is_invalid() {
        let chain = chain();
        let mut block = extend(&chain, 110, 1).remove(0);
        block.txs.pop();

        match chain.add(block, BlockFlags::DEFAULT, None) {
            Err(ChainError::Verify(err)) => {
                assert_eq!(err.reason, "bad-txnmrklroot");
                assert_eq!(err.score, 100);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_orphans_resolve() {
        let chain = chain();
        let blocks = extend(&chain, 120, 3);

        assert_eq!(chain.add(blocks[2].clone(), BlockFlags::DEFAULT, None), Ok(None));
        assert_eq!(chain.add(blocks[1].clone(), BlockFlags::DEFAULT, None), Ok(None));
        assert!(chain.has_orphan(&blocks[2].hash()));
        assert_eq!(chain.get_orphan_root(&blocks[2].hash()), Some(blocks[1].hash()));

        chain.add(blocks[0].clone(), BlockFlags::DEFAULT, None).unwrap();
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.orphan_count(), 0);
        assert_eq!(chain.tip().hash, blocks[2].hash());
    }

    #[test]
    fn test_reorg_to_longer_fork() {
        let chain = chain();
        let main = extend(&chain, 130, 2);
        for block in &main {
            chain.add(block.clone(), BlockFlags::DEFAULT, None).unwrap();
        }

        let genesis = chain.get_entry_by_height(0).unwrap().hash;
        let mut prev = genesis;
        let mut fork = Vec::new();
        for tag in 140..143 {
            let block = make_block(prev, tag, 0, false);
            prev = block.hash();
            fork.push(block);
        }
        for block in &fork {
            chain.add(block.clone(), BlockFlags::DEFAULT, None).unwrap();
        }

        assert_eq!(chain.height(), 3);
        assert_eq!(chain.tip().hash, fork[2].hash());
        let old = chain.get_entry(&main[1].hash()).unwrap();
        assert!(!chain.is_main_chain(&old));
        assert_eq!(chain.get_next_hash(&genesis), Some(fork[0].hash()));
    }

    #[test]
    fn test_locator_and_find() {
        let chain = chain();
        for block in extend(&chain, 150, 20) {
            chain.add(block, BlockFlags::DEFAULT, None).unwrap();
        }

        let locator = chain.get_locator(None);
        assert_eq!(locator[0], chain.tip().hash);
        assert_eq!(*locator.last().unwrap(), chain.get_entry_by_height(0).unwrap().hash);
        // Dense for the first entries, then exponential.
        assert_eq!(chain.get_entry(&locator[1]).unwrap().height, 19);
        assert!(locator.len() < 20);

        let unknown = Hash256::new([0xee; 32]);
        let at_five = chain.get_entry_by_height(5).unwrap().hash;
        assert_eq!(chain.find_locator(&[unknown, at_five]), at_five);
        assert_eq!(
            chain.find_locator(&[unknown]),
            chain.get_entry_by_height(0).unwrap().hash
        );
    }

    #[test]
    fn test_regtest_is_synced() {
        let chain = chain();
        assert!(chain.synced());
        chain.set_synced(Some(false));
        assert!(!chain.synced());
    }

    #[test]
    fn test_mempool_accept_and_reject() {
        let pool = MemoryMempool::new();
        let tx = spend(Hash256::new([1; 32]), 0, false);
        let hash = tx.txid();

        assert_eq!(pool.add_tx(tx.clone(), None).unwrap(), Vec::<Hash256>::new());
        assert!(pool.has(&hash));
        assert_eq!(pool.fee_rate(&hash), Some(DEFAULT_FEE_RATE));
        assert!(pool.add_tx(tx, None).is_err());

        let coinbase = Transaction::coinbase(b"cb", 50);
        let cb_hash = coinbase.txid();
        assert!(pool.add_tx(coinbase, None).is_err());
        assert!(pool.has_reject(&cb_hash));
        assert_eq!(pool.transactions().len(), 1);
    }
}
