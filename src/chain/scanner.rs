use std::sync::Arc;

use super::{ChainEvent, NeoRpc};
use crate::error::ServiceResult;

/// Walks the chain in bounded windows, returning the notifications of each
/// window exactly once.
pub struct BlockScanner {
    rpc: Arc<dyn NeoRpc>,
    current_block: u64,
    window_size: u64,

    // How many blocks from the chain head to scan to
    // e.g. if latest block is 20 and offset is set to 3
    // then the scanner will scan until block 17
    chain_head_offset: u64,
}

impl BlockScanner {
    pub async fn new_latest(rpc: Arc<dyn NeoRpc>, window_size: u64) -> ServiceResult<Self> {
        let latest_block = rpc.get_block_height().await?;

        Ok(Self {
            rpc,
            current_block: latest_block,
            window_size,
            chain_head_offset: 0,
        })
    }

    #[must_use]
    pub fn with_offset(mut self, chain_head_offset: u64) -> Self {
        self.chain_head_offset = chain_head_offset;
        self
    }

    #[must_use]
    pub fn with_start_block(mut self, start_block: u64) -> Self {
        self.current_block = start_block;
        self
    }

    pub async fn next(
        &mut self,
        contract: &str,
        event_name: &str,
    ) -> ServiceResult<Vec<ChainEvent>> {
        let latest_block = self.rpc.get_block_height().await?;
        let latest_block = latest_block.saturating_sub(self.chain_head_offset);

        if self.current_block >= latest_block {
            return Ok(Vec::new());
        }

        let from_block = self.current_block;
        let to_block = latest_block.min(from_block + self.window_size);

        let events = self
            .rpc
            .get_events(contract, event_name, from_block, to_block)
            .await?;

        self.current_block = to_block + 1;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::chain::dev::DevChain;

    fn event_at(height: u64) -> ChainEvent {
        ChainEvent {
            contract: "0xabc".to_string(),
            event_name: "Transfer".to_string(),
            block_height: height,
            tx_hash: format!("0x{height:064x}"),
            state: json!([height]),
        }
    }

    #[tokio::test]
    async fn scans_in_windows_without_duplicates() -> anyhow::Result<()> {
        let chain = Arc::new(DevChain::new());
        chain.advance_blocks(10);
        for height in [2, 5, 9] {
            chain.push_event(event_at(height));
        }

        let mut scanner = BlockScanner::new_latest(chain.clone(), 3)
            .await?
            .with_start_block(0);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.extend(scanner.next("0xabc", "Transfer").await?);
        }

        let heights: Vec<u64> = seen.iter().map(|e| e.block_height).collect();
        assert_eq!(heights, vec![2, 5, 9]);

        // Caught up to the head; no events are re-delivered.
        assert!(scanner.next("0xabc", "Transfer").await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn head_offset_holds_back_recent_blocks() -> anyhow::Result<()> {
        let chain = Arc::new(DevChain::new());
        chain.advance_blocks(10);
        chain.push_event(event_at(9));

        let mut scanner = BlockScanner::new_latest(chain.clone(), 100)
            .await?
            .with_start_block(0)
            .with_offset(3);

        assert!(scanner.next("0xabc", "Transfer").await?.is_empty());

        chain.advance_blocks(3);
        let events = scanner.next("0xabc", "Transfer").await?;
        assert_eq!(events.len(), 1);

        Ok(())
    }
}
