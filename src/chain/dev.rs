//! An in-memory chain used for development runs and tests. Transactions
//! are "included" one block after submission; blocks only advance when
//! `advance_blocks` is called, which keeps confirmation timing fully
//! deterministic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ChainEvent, NeoRpc, TxInfo};
use crate::error::{ServiceError, ServiceResult};

const DEV_FEE: i64 = 1_000_000; // 0.01 GAS per transaction

#[derive(Default)]
struct DevChainState {
    height: u64,
    // hash -> inclusion height
    included: HashMap<String, u64>,
    mempool: HashSet<String>,
    events: Vec<ChainEvent>,
    // Errors injected for upcoming send_raw calls.
    send_failures: VecDeque<ServiceError>,
    dropped: HashSet<String>,
}

#[derive(Default)]
pub struct DevChain {
    state: Mutex<DevChainState>,
}

impl DevChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the chain head, moving mempool transactions into the next
    /// block.
    pub fn advance_blocks(&self, n: u64) {
        let mut state = self.state.lock().unwrap();

        for _ in 0..n {
            state.height += 1;
            let height = state.height;
            let pending: Vec<String> = state.mempool.drain().collect();
            for hash in pending {
                state.included.insert(hash, height);
            }
        }
    }

    /// The next `n` send_raw calls will fail with the given error kind.
    pub fn fail_next_sends(&self, n: usize, err: ServiceError) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..n {
            state.send_failures.push_back(err.clone());
        }
    }

    /// Simulates a reorg that drops the transaction from the chain.
    pub fn drop_transaction(&self, hash: &str) {
        let mut state = self.state.lock().unwrap();
        state.included.remove(hash);
        state.dropped.insert(hash.to_string());
    }

    pub fn push_event(&self, event: ChainEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    #[must_use]
    pub fn height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    fn hash_of(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        format!("0x{}", hex::encode(digest))
    }
}

#[async_trait]
impl NeoRpc for DevChain {
    async fn get_block_height(&self) -> ServiceResult<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn get_transaction(&self, hash: &str) -> ServiceResult<Option<TxInfo>> {
        let state = self.state.lock().unwrap();

        if state.dropped.contains(hash) {
            return Ok(None);
        }

        if let Some(height) = state.included.get(hash) {
            return Ok(Some(TxInfo {
                hash: hash.to_string(),
                block_height: Some(*height),
                fee_paid: Some(DEV_FEE),
            }));
        }

        if state.mempool.contains(hash) {
            return Ok(Some(TxInfo {
                hash: hash.to_string(),
                block_height: None,
                fee_paid: None,
            }));
        }

        Ok(None)
    }

    async fn send_raw(&self, bytes: &[u8]) -> ServiceResult<String> {
        let mut state = self.state.lock().unwrap();

        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }

        let hash = Self::hash_of(bytes);
        if state.included.contains_key(&hash) || state.mempool.contains(&hash) {
            return Err(ServiceError::conflict("transaction already known"));
        }

        state.mempool.insert(hash.clone());
        Ok(hash)
    }

    async fn is_in_mempool(&self, hash: &str) -> ServiceResult<bool> {
        Ok(self.state.lock().unwrap().mempool.contains(hash))
    }

    async fn get_events(
        &self,
        contract: &str,
        event_name: &str,
        from_block: u64,
        to_block: u64,
    ) -> ServiceResult<Vec<ChainEvent>> {
        let state = self.state.lock().unwrap();

        Ok(state
            .events
            .iter()
            .filter(|e| {
                e.contract.eq_ignore_ascii_case(contract)
                    && e.event_name == event_name
                    && e.block_height >= from_block
                    && e.block_height <= to_block
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submitted_transactions_confirm_after_a_block() -> ServiceResult<()> {
        let chain = DevChain::new();

        let hash = chain.send_raw(b"payload").await?;
        assert!(chain.is_in_mempool(&hash).await?);
        assert_eq!(
            chain.get_transaction(&hash).await?.unwrap().block_height,
            None
        );

        chain.advance_blocks(1);

        let info = chain.get_transaction(&hash).await?.unwrap();
        assert_eq!(info.block_height, Some(1));
        assert!(!chain.is_in_mempool(&hash).await?);

        Ok(())
    }

    #[tokio::test]
    async fn injected_failures_surface_then_clear() -> ServiceResult<()> {
        let chain = DevChain::new();
        chain.fail_next_sends(2, ServiceError::unavailable("node down"));

        assert!(chain.send_raw(b"tx").await.is_err());
        assert!(chain.send_raw(b"tx").await.is_err());
        assert!(chain.send_raw(b"tx").await.is_ok());

        Ok(())
    }

    #[tokio::test]
    async fn dropped_transactions_disappear() -> ServiceResult<()> {
        let chain = DevChain::new();

        let hash = chain.send_raw(b"tx").await?;
        chain.advance_blocks(1);
        chain.drop_transaction(&hash);

        assert_eq!(chain.get_transaction(&hash).await?, None);
        assert!(!chain.is_in_mempool(&hash).await?);

        Ok(())
    }
}
