use chaindex_chain::{chain_params, ChainError, HeaderChain, Network};
use chaindex_primitives::{BlockHeader, Hash256};

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

fn extend(chain: &mut HeaderChain, from: Hash256, count: u64, tag_base: u64) -> Vec<BlockHeader> {
    let mut headers = Vec::new();
    let mut prev = from;
    for offset in 0..count {
        let header = child_header(prev, tag_base + offset);
        prev = header.hash();
        headers.push(header);
    }
    chain.connect(&headers).expect("connect");
    headers
}

fn new_chain() -> HeaderChain {
    HeaderChain::new(chain_params(Network::Regtest).genesis)
}

#[test]
fn heights_link_back_to_genesis() {
    let mut chain = new_chain();
    let genesis = chain.genesis();
    let headers = extend(&mut chain, genesis.hash, 10, 0);

    assert_eq!(chain.height(), 10);
    assert_eq!(chain.tip().hash, headers[9].hash());
    for (offset, header) in headers.iter().enumerate() {
        let entry = chain.get_by_height(offset as u32 + 1).expect("by height");
        assert_eq!(entry.hash, header.hash());
        let by_hash = chain.get_by_hash(&header.hash()).expect("by hash");
        assert_eq!(by_hash.height, offset as u32 + 1);
        assert_eq!(by_hash.header.prev_block, header.prev_block);
    }
}

#[test]
fn duplicate_headers_are_skipped() {
    let mut chain = new_chain();
    let genesis = chain.genesis();
    let headers = extend(&mut chain, genesis.hash, 5, 0);

    let outcome = chain.connect(&headers).expect("reconnect");
    assert_eq!(outcome.accepted, 0);
    assert!(!outcome.reorged);
    assert_eq!(chain.height(), 5);
}

#[test]
fn orphan_header_rejects_batch() {
    let mut chain = new_chain();
    let orphan = child_header([0xee; 32], 7);
    match chain.connect(&[orphan]) {
        Err(ChainError::OrphanHeader(prev)) => assert_eq!(prev, [0xee; 32]),
        other => panic!("expected orphan rejection, got {other:?}"),
    }
}

#[test]
fn enumerate_after_returns_in_order_successors() {
    let mut chain = new_chain();
    let genesis = chain.genesis();
    let headers = extend(&mut chain, genesis.hash, 8, 0);

    let successors = chain
        .enumerate_after(&headers[2].hash())
        .expect("enumerate");
    let heights: Vec<u32> = successors.iter().map(|entry| entry.height).collect();
    assert_eq!(heights, vec![4, 5, 6, 7, 8]);
}

#[test]
fn locator_is_dense_then_thins_to_genesis() {
    let mut chain = new_chain();
    let genesis = chain.genesis();
    extend(&mut chain, genesis.hash, 100, 0);

    let locator = chain.tip_locator();
    let heights: Vec<u32> = locator
        .iter()
        .map(|hash| chain.get_by_hash(hash).expect("active").height)
        .collect();

    assert_eq!(heights[0], 100);
    // Dense window: the first steps walk back one block at a time.
    for pair in heights.windows(2).take(10) {
        assert_eq!(pair[0] - pair[1], 1);
    }
    // Thinned tail: gaps grow.
    let gaps: Vec<u32> = heights.windows(2).map(|pair| pair[0] - pair[1]).collect();
    assert!(gaps.iter().any(|gap| *gap > 1));
    assert_eq!(*heights.last().expect("nonempty"), 0);
    assert!(locator.len() < 30);
}

#[test]
fn find_fork_with_foreign_locator_is_genesis() {
    let mut chain = new_chain();
    let genesis = chain.genesis();
    extend(&mut chain, genesis.hash, 20, 0);

    let fork = chain.find_fork(&[[0xab; 32], [0xcd; 32]]);
    assert_eq!(fork.height, 0);
    assert_eq!(fork.hash, genesis.hash);
}

#[test]
fn longer_branch_reorgs_and_relinks_heights() {
    let mut chain = new_chain();
    let genesis = chain.genesis();
    let main = extend(&mut chain, genesis.hash, 5, 0);
    let old_tip = chain.tip();

    // Fork off height 3 with a longer branch.
    let branch = extend(&mut chain, main[2].hash(), 4, 100);
    assert_eq!(chain.height(), 7);
    assert_eq!(chain.tip().hash, branch[3].hash());

    // Heights 4 and 5 now resolve to the branch.
    assert_eq!(chain.get_by_height(4).expect("h4").hash, branch[0].hash());
    assert_eq!(chain.get_by_height(5).expect("h5").hash, branch[1].hash());
    assert!(!chain.is_active(&old_tip.hash));
    assert!(chain.contains(&old_tip.hash));

    // The replaced tip enumerates from the fork point.
    let successors = chain.enumerate_after(&old_tip.hash).expect("enumerate");
    assert_eq!(successors.first().expect("nonempty").height, 4);
    assert_eq!(successors.first().expect("nonempty").hash, branch[0].hash());
}

#[test]
fn equal_length_branch_keeps_current_chain() {
    let mut chain = new_chain();
    let genesis = chain.genesis();
    let main = extend(&mut chain, genesis.hash, 5, 0);
    let tip = chain.tip();

    let side = extend(&mut chain, main[3].hash(), 1, 200);
    assert_eq!(chain.tip().hash, tip.hash);
    assert!(!chain.is_active(&side[0].hash()));
}

#[test]
fn fork_point_found_from_stale_locator() {
    let mut chain = new_chain();
    let genesis = chain.genesis();
    let main = extend(&mut chain, genesis.hash, 6, 0);
    let stale_locator = chain.tip_locator();

    extend(&mut chain, main[3].hash(), 5, 300);
    let fork = chain.find_fork(&stale_locator);
    assert_eq!(fork.height, 4);
    assert_eq!(fork.hash, main[3].hash());
}
