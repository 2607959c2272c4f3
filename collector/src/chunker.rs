//! Adaptive splitting of `eth_getLogs` block ranges.
//!
//! Providers cap log responses by block span or result count, and the
//! caps differ per provider and per moment. The chunker walks the
//! requested range left to right, halving the query span whenever the
//! endpoint refuses a range as too wide and doubling it again after
//! successes, so one oversized window does not pin every later query to
//! tiny spans.

use client::{EthRpc, Result};
use ethers::types::{Address, Log, H256};
use metrics::{ChainScope, LOG_CHUNKS_TOTAL, LOG_CHUNK_SPAN_BLOCKS};

use crate::tokens::format_address;

/// Spans are never split below this many blocks; an error at the floor
/// is permanent for that block.
pub const LOG_SPLIT_MIN_BLOCK_SPAN: u64 = 1;

/// Ceiling the span may grow back to after successful sub-queries.
pub const LOG_MAX_CHUNK_SIZE: u64 = 2_000;

/// Fetch all logs for `(address, topic0)` over `[from, to]`, splitting
/// adaptively around provider payload caps.
///
/// The result is the concatenation of the sub-query responses; callers
/// must treat it as an unordered multiset.
pub async fn fetch_logs(
    rpc: &dyn EthRpc,
    scope: &ChainScope,
    address: Address,
    topic0: H256,
    from: u64,
    to: u64,
) -> Result<Vec<Log>> {
    let contract = format_address(address);
    let mut logs = Vec::new();

    let mut span = to - from + 1;
    let mut cursor = from;

    while cursor <= to {
        let end = cursor.saturating_add(span - 1).min(to);
        let queried_span = end - cursor + 1;

        scope.inc_counter(LOG_CHUNKS_TOTAL, &[scope.chain(), &contract]);
        scope.observe_histogram(
            LOG_CHUNK_SPAN_BLOCKS,
            &[scope.chain(), &contract],
            queried_span as f64,
        );

        match rpc.logs(cursor, end, address, topic0).await {
            Ok(batch) => {
                logs.extend(batch);
                cursor = end + 1;
                span = span
                    .saturating_mul(2)
                    .min(LOG_MAX_CHUNK_SIZE)
                    .max(queried_span);
            }
            Err(error) if error.is_range_too_wide() => {
                if queried_span <= LOG_SPLIT_MIN_BLOCK_SPAN {
                    return Err(error);
                }

                span = (queried_span / 2).max(LOG_SPLIT_MIN_BLOCK_SPAN);
                tracing::debug!(
                    chain = %scope.chain(),
                    contract = %contract,
                    from = cursor,
                    to = end,
                    new_span = span,
                    "splitting log query refused as too wide",
                );
            }
            Err(error) => return Err(error),
        }
    }

    Ok(logs)
}
