use chaindex_chain::locator::{locator_from_hex, locator_to_hex};
use chaindex_chain::{chain_params, HeaderChain, Network};
use chaindex_primitives::{BlockHeader, Hash256};
use proptest::prelude::*;

fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(64);
    ProptestConfig {
        cases,
        ..ProptestConfig::default()
    }
}

fn child_header(prev_block: Hash256, tag: u64) -> BlockHeader {
    let mut merkle_root = [0u8; 32];
    merkle_root[..8].copy_from_slice(&tag.to_le_bytes());
    BlockHeader {
        version: 4,
        prev_block,
        merkle_root,
        time: 1_600_000_000 + tag as u32,
        bits: 0x207fffff,
        nonce: 0,
    }
}

fn build_chain(length: u32, tag_base: u64) -> HeaderChain {
    let mut chain = HeaderChain::new(chain_params(Network::Regtest).genesis);
    let mut prev = chain.genesis().hash;
    let mut headers = Vec::new();
    for offset in 0..length {
        let header = child_header(prev, tag_base + offset as u64);
        prev = header.hash();
        headers.push(header);
    }
    chain.connect(&headers).expect("connect");
    chain
}

proptest! {
    #![proptest_config(proptest_config())]
    fn locator_heights_strictly_decrease((length, probe) in (1u32..200, 0u32..200)) {
        let chain = build_chain(length, 0);
        let probe = probe.min(length);
        let from = chain.get_by_height(probe).expect("probe").hash;
        let locator = chain.locator_of(&from).expect("locator");

        let heights: Vec<u32> = locator
            .iter()
            .map(|hash| chain.get_by_hash(hash).expect("known").height)
            .collect();
        prop_assert_eq!(heights[0], probe);
        prop_assert_eq!(*heights.last().expect("nonempty"), 0);
        for pair in heights.windows(2) {
            prop_assert!(pair[0] > pair[1]);
        }
        // Thinning keeps the list logarithmic past the dense window.
        prop_assert!(locator.len() as u32 <= 12 + 2 * 32);
    }
}

proptest! {
    #![proptest_config(proptest_config())]
    fn fork_of_own_locator_is_self((length, probe) in (1u32..150, 0u32..150)) {
        let chain = build_chain(length, 0);
        let probe = probe.min(length);
        let entry = chain.get_by_height(probe).expect("probe");
        let locator = chain.locator_of(&entry.hash).expect("locator");
        let fork = chain.find_fork(&locator);
        prop_assert_eq!(fork.height, probe);
        prop_assert_eq!(fork.hash, entry.hash);
    }
}

proptest! {
    #![proptest_config(proptest_config())]
    fn fork_after_reorg_is_at_or_below_fork_point(
        (length, back, extra) in (10u32..120, 1u32..9, 1u32..20)
    ) {
        let mut chain = build_chain(length, 0);
        let stale_locator = chain.tip_locator();
        let fork_height = length - back;
        let fork_hash = chain.get_by_height(fork_height).expect("fork").hash;

        // Competing branch long enough to win.
        let mut prev = fork_hash;
        let mut branch = Vec::new();
        for offset in 0..(back + extra) {
            let header = child_header(prev, 1_000_000 + offset as u64);
            prev = header.hash();
            branch.push(header);
        }
        let outcome = chain.connect(&branch).expect("connect branch");
        prop_assert!(outcome.reorged);
        prop_assert_eq!(outcome.fork_height, fork_height);
        prop_assert_eq!(chain.height(), fork_height + back + extra);

        let found = chain.find_fork(&stale_locator);
        prop_assert!(found.height <= fork_height);
        // The dense locator window recovers the fork point exactly.
        if back <= 10 {
            prop_assert_eq!(found.height, fork_height);
            prop_assert_eq!(found.hash, fork_hash);
        }
    }
}

proptest! {
    #![proptest_config(proptest_config())]
    fn locator_hex_roundtrip(length in 1u32..100) {
        let chain = build_chain(length, 7);
        let locator = chain.tip_locator();
        let decoded = locator_from_hex(&locator_to_hex(&locator)).expect("roundtrip");
        prop_assert_eq!(decoded, locator);
    }
}
