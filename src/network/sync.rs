//! Header-first chain synchronization
//!
//! While the chain is behind the last hardcoded checkpoint the loader peer
//! is asked for headers up to the next checkpoint. Accepted headers queue
//! up here until their blocks are requested and connected; reaching the
//! last checkpoint hands over to locator based `getblocks` sync.

use crate::chain::ChainEntry;
use crate::core::{BlockHeader, Checkpoint, Network};
use crate::crypto::Hash256;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderChainError {
    #[error("Peer sent an invalid header ({0})")]
    InvalidHeader(Hash256),
    #[error("Peer sent a bad header chain ({0})")]
    BadChain(Hash256),
    #[error("Peer sent an invalid checkpoint ({0})")]
    BadCheckpoint(Hash256),
    #[error("Header hash mismatch {got} != {expected}")]
    Mismatch { got: Hash256, expected: Hash256 },
    #[error("Header chain is not active")]
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderEntry {
    pub hash: Hash256,
    pub height: u32,
}

/// Result of appending a `headers` batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersOutcome {
    /// The batch reached the pending checkpoint; request the blocks
    Checkpoint,
    /// Ask for more headers starting at this hash
    Continue(Hash256),
}

/// What to do after a block from the header chain is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Checkpoint block arrived; fetch headers up to the next one
    NextCheckpoint(Checkpoint),
    /// Keep downloading queued blocks
    Continue,
    /// Last checkpoint passed; switch to `getblocks`
    Switch,
}

#[derive(Debug, Clone, Default)]
pub struct HeaderChain {
    entries: VecDeque<HeaderEntry>,
    /// Index of the first header whose block was not requested yet
    next: Option<usize>,
    tip: Option<Checkpoint>,
    last_checkpoint: u32,
    checkpoints: Vec<Checkpoint>,
}

impl HeaderChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start header sync from `tip` if it is behind the last checkpoint
    pub fn init(&mut self, tip: &ChainEntry, network: &Network) -> bool {
        self.reset();

        self.checkpoints = network.checkpoints.clone();
        self.last_checkpoint = network.last_checkpoint();

        if tip.height >= self.last_checkpoint {
            return false;
        }

        self.tip = network.next_checkpoint(tip.height);
        self.entries.push_back(HeaderEntry {
            hash: tip.hash,
            height: tip.height,
        });

        log::info!(
            "Initialized header chain to height {} (checkpoint={}).",
            tip.height,
            self.tip.map(|c| c.hash).unwrap_or_default()
        );

        self.tip.is_some()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.next = None;
        self.tip = None;
    }

    pub fn is_active(&self) -> bool {
        self.tip.is_some()
    }

    /// Checkpoint currently being synced toward
    pub fn tip(&self) -> Option<Checkpoint> {
        self.tip
    }

    pub fn head(&self) -> Option<&HeaderEntry> {
        self.entries.front()
    }

    pub fn tail(&self) -> Option<&HeaderEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tip(&self, height: u32) -> Option<Checkpoint> {
        self.checkpoints.iter().find(|c| c.height > height).copied()
    }

    fn shift(&mut self) {
        if self.entries.pop_front().is_some() {
            self.next = match self.next {
                Some(0) | None => None,
                Some(index) => Some(index - 1),
            };
        }
    }

    /// Validate and append a batch of headers
    pub fn add_headers(
        &mut self,
        headers: &[BlockHeader],
    ) -> Result<HeadersOutcome, HeaderChainError> {
        let tip = self.tip.ok_or(HeaderChainError::Inactive)?;
        let mut last = *self.tail().ok_or(HeaderChainError::Inactive)?;
        let mut checkpoint = false;

        for header in headers {
            let hash = header.hash();

            if !header.verify_pow() {
                return Err(HeaderChainError::InvalidHeader(hash));
            }

            if header.prev_block != last.hash {
                return Err(HeaderChainError::BadChain(hash));
            }

            let entry = HeaderEntry {
                hash,
                height: last.height + 1,
            };

            if entry.height == tip.height {
                if entry.hash != tip.hash {
                    return Err(HeaderChainError::BadCheckpoint(hash));
                }
                checkpoint = true;
            }

            if self.next.is_none() {
                self.next = Some(self.entries.len());
            }

            self.entries.push_back(entry);
            last = entry;

            if checkpoint {
                break;
            }
        }

        if checkpoint {
            // The starting point is already connected.
            self.shift();
            return Ok(HeadersOutcome::Checkpoint);
        }

        Ok(HeadersOutcome::Continue(last.hash))
    }

    /// Hashes of queued headers whose blocks still need requesting
    pub fn take_pending(&mut self, max: usize) -> Vec<Hash256> {
        let Some(start) = self.next else {
            return Vec::new();
        };

        let end = (start + max).min(self.entries.len());
        let hashes = self
            .entries
            .range(start..end)
            .map(|entry| entry.hash)
            .collect();

        self.next = if end < self.entries.len() {
            Some(end)
        } else {
            None
        };

        hashes
    }

    /// A block arrived from the loader; it must be the head of the chain
    pub fn resolve(&mut self, hash: &Hash256) -> Result<ResolveOutcome, HeaderChainError> {
        let head = *self.head().ok_or(HeaderChainError::Inactive)?;
        let tip = self.tip.ok_or(HeaderChainError::Inactive)?;

        if head.hash != *hash {
            return Err(HeaderChainError::Mismatch {
                got: *hash,
                expected: head.hash,
            });
        }

        if head.height < self.last_checkpoint {
            if head.height == tip.height {
                log::info!("Received checkpoint {} ({}).", head.hash, head.height);
                let next = self
                    .next_tip(head.height)
                    .ok_or(HeaderChainError::Inactive)?;
                self.tip = Some(next);
                return Ok(ResolveOutcome::NextCheckpoint(next));
            }

            self.shift();
            return Ok(ResolveOutcome::Continue);
        }

        self.reset();
        Ok(ResolveOutcome::Switch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::header::tests::mine;

    fn headers_from(prev: Hash256, count: u32) -> Vec<BlockHeader> {
        let mut prev = prev;
        let mut headers = Vec::new();
        for i in 0..count {
            let header = mine(BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: Hash256::new([i as u8; 32]),
                time: 1_600_000_000 + i,
                bits: 0x207fffff,
                nonce: 0,
            });
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    fn network_with_checkpoints(headers: &[BlockHeader], heights: &[u32]) -> Network {
        let mut network = Network::regtest();
        network.checkpoints = heights
            .iter()
            .map(|h| Checkpoint {
                height: *h,
                hash: headers[*h as usize - 1].hash(),
            })
            .collect();
        network
    }

    fn genesis_entry(network: &Network) -> ChainEntry {
        ChainEntry {
            hash: network.genesis_hash(),
            height: 0,
            header: network.genesis,
        }
    }

    #[test]
    fn test_inactive_past_last_checkpoint() {
        let network = Network::regtest();
        let mut chain = HeaderChain::new();
        assert!(!chain.init(&genesis_entry(&network), &network));
        assert!(!chain.is_active());
    }

    #[test]
    fn test_checkpoint_walk() {
        let genesis = Network::regtest().genesis_hash();
        let headers = headers_from(genesis, 6);
        let network = network_with_checkpoints(&headers, &[3, 6]);

        let mut chain = HeaderChain::new();
        assert!(chain.init(&genesis_entry(&network), &network));
        assert_eq!(chain.tip().unwrap().height, 3);

        assert_eq!(
            chain.add_headers(&headers[..2]).unwrap(),
            HeadersOutcome::Continue(headers[1].hash())
        );
        assert_eq!(
            chain.add_headers(&headers[2..3]).unwrap(),
            HeadersOutcome::Checkpoint
        );

        let pending = chain.take_pending(50_000);
        assert_eq!(
            pending,
            headers[..3].iter().map(BlockHeader::hash).collect::<Vec<_>>()
        );
        assert!(chain.take_pending(50_000).is_empty());

        assert_eq!(
            chain.resolve(&headers[0].hash()).unwrap(),
            ResolveOutcome::Continue
        );
        assert_eq!(
            chain.resolve(&headers[1].hash()).unwrap(),
            ResolveOutcome::Continue
        );
        assert!(matches!(
            chain.resolve(&headers[2].hash()).unwrap(),
            ResolveOutcome::NextCheckpoint(c) if c.height == 6
        ));

        assert_eq!(
            chain.add_headers(&headers[3..]).unwrap(),
            HeadersOutcome::Checkpoint
        );
        assert_eq!(chain.take_pending(50_000).len(), 3);
        chain.resolve(&headers[3].hash()).unwrap();
        chain.resolve(&headers[4].hash()).unwrap();
        assert_eq!(
            chain.resolve(&headers[5].hash()).unwrap(),
            ResolveOutcome::Switch
        );
        assert!(!chain.is_active());
    }

    #[test]
    fn test_rejects_bad_chains() {
        let genesis = Network::regtest().genesis_hash();
        let headers = headers_from(genesis, 4);
        let network = network_with_checkpoints(&headers, &[4]);

        let mut chain = HeaderChain::new();
        chain.init(&genesis_entry(&network), &network);

        // Gap in the chain.
        assert_eq!(
            chain.add_headers(&headers[1..2]),
            Err(HeaderChainError::BadChain(headers[1].hash()))
        );

        // Wrong block at the checkpoint height.
        let forked = headers_from(genesis, 4);
        let mut bad = headers[..3].to_vec();
        let mut last = forked[3];
        last.prev_block = headers[2].hash();
        last.merkle_root = Hash256::new([0xaa; 32]);
        bad.push(mine(last));
        assert!(matches!(
            chain.add_headers(&bad),
            Err(HeaderChainError::BadCheckpoint(_))
        ));
    }

    #[test]
    fn test_resolve_mismatch() {
        let genesis = Network::regtest().genesis_hash();
        let headers = headers_from(genesis, 2);
        let network = network_with_checkpoints(&headers, &[2]);

        let mut chain = HeaderChain::new();
        chain.init(&genesis_entry(&network), &network);
        chain.add_headers(&headers).unwrap();
        assert!(matches!(
            chain.resolve(&headers[1].hash()),
            Err(HeaderChainError::Mismatch { .. })
        ));
    }
}
