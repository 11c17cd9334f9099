//! Contract event ABI definitions and topic hash computation.
//!
//! We define minimal ABIs covering just the events the pipeline decodes,
//! using pre-computed keccak256 topic0 hashes for log filters.

use alloy::primitives::{b256, Address, B256, U256};

// ─── Event topic0 hashes (keccak256 of event signature) ──────────────────────

/// keccak256("OrderFilled(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)")
pub const ORDER_FILLED_TOPIC: B256 =
    b256!("d0a08e8c493f9c94f29311604c9de1b4e8c8d4c06bd0c789af57f2d65bfec0f6");

/// keccak256("PositionSplit(address,address,bytes32,bytes32,uint256[],uint256)")
pub const POSITION_SPLIT_TOPIC: B256 =
    b256!("2e6bb91f8cbcda0c93623c54d0403a43514fabc40084ec96b6d5379a74786298");

/// keccak256("PositionsMerge(address,address,bytes32,bytes32,uint256[],uint256)")
pub const POSITIONS_MERGE_TOPIC: B256 =
    b256!("6f13ca62553fcc2bcd2372180a43949c1e4cebba603901ede2f4e14f36b282ca");

/// Compute keccak256 hash of a byte slice.
pub fn keccak256(data: &[u8]) -> B256 {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Verify that our pre-computed topic hashes match the event signatures.
/// Call this at startup to catch any signature mismatches.
pub fn verify_topic_hashes() -> Vec<(String, bool)> {
    let checks = vec![
        (
            "OrderFilled(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)",
            ORDER_FILLED_TOPIC,
        ),
        (
            "PositionSplit(address,address,bytes32,bytes32,uint256[],uint256)",
            POSITION_SPLIT_TOPIC,
        ),
        (
            "PositionsMerge(address,address,bytes32,bytes32,uint256[],uint256)",
            POSITIONS_MERGE_TOPIC,
        ),
    ];

    checks
        .into_iter()
        .map(|(sig, expected)| {
            let computed = keccak256(sig.as_bytes());
            (sig.to_string(), computed == expected)
        })
        .collect()
}

// ─── Conditional-token id derivation ─────────────────────────────────────────
//
// collectionId = keccak256(parentCollectionId ‖ conditionId ‖ indexSet)
// positionId   = keccak256(collateral ‖ collectionId)
//
// indexSet 1 selects the first outcome slot (YES), 2 the second (NO).

/// Index set for the YES outcome slot of a binary condition.
pub const INDEX_SET_YES: u64 = 1;
/// Index set for the NO outcome slot of a binary condition.
pub const INDEX_SET_NO: u64 = 2;

/// Derive the collection id for one side of a condition.
pub fn collection_id(parent: B256, condition_id: B256, index_set: u64) -> B256 {
    let mut buf = [0u8; 96];
    buf[0..32].copy_from_slice(parent.as_slice());
    buf[32..64].copy_from_slice(condition_id.as_slice());
    buf[64..96].copy_from_slice(&U256::from(index_set).to_be_bytes::<32>());
    keccak256(&buf)
}

/// Derive the ERC-1155 position (token) id for a collateral/collection pair.
pub fn position_id(collateral: Address, collection: B256) -> U256 {
    let mut buf = [0u8; 52];
    buf[0..20].copy_from_slice(collateral.as_slice());
    buf[20..52].copy_from_slice(collection.as_slice());
    U256::from_be_bytes(keccak256(&buf).0)
}

/// Both outcome token ids (YES, NO) for a binary condition.
pub fn outcome_token_ids(collateral: Address, condition_id: B256) -> (U256, U256) {
    let yes = position_id(
        collateral,
        collection_id(B256::ZERO, condition_id, INDEX_SET_YES),
    );
    let no = position_id(
        collateral,
        collection_id(B256::ZERO, condition_id, INDEX_SET_NO),
    );
    (yes, no)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn topic_hashes_match_signatures() {
        for (sig, ok) in verify_topic_hashes() {
            assert!(ok, "topic hash mismatch for {sig}");
        }
    }

    #[test]
    fn keccak_known_vector() {
        // keccak256 of the empty string.
        assert_eq!(
            keccak256(b""),
            b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
    }

    #[test]
    fn token_derivation_is_deterministic_and_distinct() {
        let collateral = address!("2791bca1f2de4661ed88a30c99a7a9449aa84174");
        let condition = keccak256(b"condition-under-test");

        let (yes_a, no_a) = outcome_token_ids(collateral, condition);
        let (yes_b, no_b) = outcome_token_ids(collateral, condition);

        assert_eq!(yes_a, yes_b);
        assert_eq!(no_a, no_b);
        assert_ne!(yes_a, no_a);

        // Recomputing each leg reproduces the pair.
        assert_eq!(
            yes_a,
            position_id(
                collateral,
                collection_id(B256::ZERO, condition, INDEX_SET_YES)
            )
        );
        assert_eq!(
            no_a,
            position_id(
                collateral,
                collection_id(B256::ZERO, condition, INDEX_SET_NO)
            )
        );
    }

    #[test]
    fn different_conditions_give_different_tokens() {
        let collateral = address!("2791bca1f2de4661ed88a30c99a7a9449aa84174");
        let (yes_a, _) = outcome_token_ids(collateral, keccak256(b"a"));
        let (yes_b, _) = outcome_token_ids(collateral, keccak256(b"b"));
        assert_ne!(yes_a, yes_b);
    }
}
