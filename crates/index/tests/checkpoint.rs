mod common;

use std::time::Duration;

use chaindex_index::checkpoint::{CheckpointStore, CHECKPOINT_BALANCES, CHECKPOINT_BLOCKS};

use common::harness;

#[test]
fn fresh_checkpoint_starts_at_genesis() {
    let harness = harness(10, 0);
    let checkpoints = CheckpointStore::new(harness.blobs.clone());
    let chain = harness.chain.read();

    assert!(checkpoints.get(CHECKPOINT_BLOCKS).expect("get").is_none());
    assert_eq!(
        checkpoints
            .fork_height(CHECKPOINT_BLOCKS, &chain)
            .expect("fork height"),
        0
    );
}

#[test]
fn save_progress_advances_and_refuses_rewind() {
    let harness = harness(20, 0);
    let checkpoints = CheckpointStore::new(harness.blobs.clone());
    let chain = harness.chain.read();

    let at_10 = chain
        .locator_of(&chain.get_by_height(10).expect("h10").hash)
        .expect("locator");
    let at_5 = chain
        .locator_of(&chain.get_by_height(5).expect("h5").hash)
        .expect("locator");

    assert!(checkpoints
        .save_progress(CHECKPOINT_BLOCKS, &at_10, &chain, None)
        .expect("advance"));
    assert_eq!(
        checkpoints
            .fork_height(CHECKPOINT_BLOCKS, &chain)
            .expect("fork height"),
        10
    );

    // A later completion of an earlier range must not move the frontier back.
    assert!(!checkpoints
        .save_progress(CHECKPOINT_BLOCKS, &at_5, &chain, None)
        .expect("rewind attempt"));
    assert_eq!(
        checkpoints
            .fork_height(CHECKPOINT_BLOCKS, &chain)
            .expect("fork height"),
        10
    );
}

#[test]
fn rewind_is_permitted_under_lease() {
    let harness = harness(20, 0);
    let checkpoints = CheckpointStore::new(harness.blobs.clone());
    let chain = harness.chain.read();

    let at_10 = chain
        .locator_of(&chain.get_by_height(10).expect("h10").hash)
        .expect("locator");
    let at_5 = chain
        .locator_of(&chain.get_by_height(5).expect("h5").hash)
        .expect("locator");

    checkpoints
        .save_progress(CHECKPOINT_BLOCKS, &at_10, &chain, None)
        .expect("advance");

    let lease = checkpoints
        .lease(CHECKPOINT_BLOCKS, Duration::from_secs(60))
        .expect("lease");
    assert!(checkpoints
        .save_progress(CHECKPOINT_BLOCKS, &at_5, &chain, Some(&lease))
        .expect("rewind under lease"));
    assert_eq!(
        checkpoints
            .fork_height(CHECKPOINT_BLOCKS, &chain)
            .expect("fork height"),
        5
    );
    checkpoints.release(&lease).expect("release");
}

#[test]
fn checkpoints_are_independent_per_index() {
    let harness = harness(20, 0);
    let checkpoints = CheckpointStore::new(harness.blobs.clone());
    let chain = harness.chain.read();

    let at_15 = chain
        .locator_of(&chain.get_by_height(15).expect("h15").hash)
        .expect("locator");
    checkpoints
        .save_progress(CHECKPOINT_BALANCES, &at_15, &chain, None)
        .expect("advance balances");

    assert_eq!(
        checkpoints
            .fork_height(CHECKPOINT_BALANCES, &chain)
            .expect("fork height"),
        15
    );
    assert_eq!(
        checkpoints
            .fork_height(CHECKPOINT_BLOCKS, &chain)
            .expect("fork height"),
        0
    );
}

#[test]
fn checkpoint_survives_reorg_at_fork_point() {
    let mut harness = harness(10, 0);
    let checkpoints = CheckpointStore::new(harness.blobs.clone());

    {
        let chain = harness.chain.read();
        let at_8 = chain
            .locator_of(&chain.get_by_height(8).expect("h8").hash)
            .expect("locator");
        checkpoints
            .save_progress(CHECKPOINT_BLOCKS, &at_8, &chain, None)
            .expect("advance");
    }

    // Replace the top two blocks with a longer competing branch.
    let fork_parent = harness.blocks[8].hash();
    let branch_a = common::build_block(fork_parent, 9, 1);
    let branch_b = common::build_block(branch_a.hash(), 10, 1);
    let branch_c = common::build_block(branch_b.hash(), 11, 1);
    harness.append_block(branch_a);
    harness.append_block(branch_b);
    harness.append_block(branch_c);

    let chain = harness.chain.read();
    assert_eq!(chain.height(), 11);
    // Height 8 survived the reorg, so the checkpoint still resolves there.
    assert_eq!(
        checkpoints
            .fork_height(CHECKPOINT_BLOCKS, &chain)
            .expect("fork height"),
        8
    );
}
