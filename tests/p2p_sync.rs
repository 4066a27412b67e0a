//! Two-node network: handshake catch-up for a lagging dialer, then live
//! head-hash gossip with pull-on-miss.

use std::sync::Arc;
use std::time::Duration;

use cx_chain::chain::{Blockchain, GenesisBlock};
use cx_chain::config::NodeConfig;
use cx_chain::consensus::Engine;
use cx_chain::crypto::Keypair;
use cx_chain::p2p::Node;
use cx_chain::storage::Storage;
use cx_chain::types::{unix_time, Block, BlockHeader};

fn engine_for(validator: &Keypair) -> Arc<Engine> {
    let engine = Arc::new(Engine::new(1_000, 100, 10, 0, vec![validator.address()]));
    engine.select_validator();
    engine
}

fn child_of(engine: &Engine, validator: &Keypair, parent: &Block, nonce: u64) -> Block {
    let height = parent.height() + 1;
    let header = BlockHeader {
        height,
        prev: parent.hash,
        timestamp: unix_time(),
        nonce,
        gas_target: 1_000_000,
        difficulty: parent.header.difficulty,
        validator: validator.address(),
        validator_proof: engine.validator_proof().to_vec(),
        consensus_proof: engine.consensus_proof(height).unwrap().to_vec(),
        ..BlockHeader::default()
    };
    let mut block = Block::new(header, Vec::new());
    block.sign(validator).unwrap();
    engine.seal_block(&mut block).unwrap();
    block
}

async fn wait_for_height(chain: &Blockchain, height: u64) -> bool {
    for _ in 0..100 {
        if chain.get_latest_block().height() >= height {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

#[tokio::test]
async fn handshake_syncs_lagging_dialer_then_gossip_extends_it() {
    let validator = Keypair::from_secret_bytes(&[0x61; 32]).unwrap();
    let engine_x = engine_for(&validator);
    let config = NodeConfig::default();

    let dir_x = tempfile::tempdir().unwrap();
    let storage_x = Storage::open(dir_x.path()).unwrap();
    let chain_x = Blockchain::new(
        storage_x,
        engine_x.clone(),
        &config,
        validator.address(),
        None,
    )
    .unwrap();

    // Both sides must share history up to the bootstrap block, so seed the
    // second store from the first before opening it.
    let dir_y = tempfile::tempdir().unwrap();
    let storage_y = Storage::open(dir_y.path()).unwrap();
    storage_y.init_tables().unwrap();
    storage_y
        .commit_block(&chain_x.get_block_by_height(0).unwrap().unwrap())
        .unwrap();
    storage_y
        .commit_block(&chain_x.get_block_by_height(1).unwrap().unwrap())
        .unwrap();

    let key_y = Keypair::from_secret_bytes(&[0x62; 32]).unwrap();
    let engine_y = engine_for(&validator);
    let chain_y =
        Blockchain::new(storage_y, engine_y, &config, key_y.address(), None).unwrap();

    // Advance X to height 3 while Y stays at the bootstrap height.
    for nonce in [0x1001u64, 0x1002] {
        let parent = chain_x.get_latest_block();
        let block = child_of(&engine_x, &validator, &parent, nonce);
        chain_x.add_remote_block(block).unwrap();
    }
    assert_eq!(chain_x.get_latest_block().height(), 3);
    assert_eq!(chain_y.get_latest_block().height(), 1);

    let node_x = Node::new(validator.clone(), "127.0.0.1:0".parse().unwrap(), chain_x.clone());
    let addr_x = node_x.start(&[]).await.unwrap();
    let node_y = Node::new(key_y.clone(), "127.0.0.1:0".parse().unwrap(), chain_y.clone());
    node_y.start(&[]).await.unwrap();

    // The dialer announces its latest hash; the accepting side streams the
    // two missing blocks back.
    node_y.connect(addr_x, &node_x.public_key()).await.unwrap();
    assert!(wait_for_height(&chain_y, 3).await, "handshake sync stalled");
    assert_eq!(
        chain_y.get_latest_block().hash,
        chain_x.get_latest_block().hash
    );

    // A new block on X reaches Y through HASH -> ASK -> BLOCK.
    let parent = chain_x.get_latest_block();
    let block = child_of(&engine_x, &validator, &parent, 0x1003);
    chain_x.add_remote_block(block.clone()).unwrap();

    assert!(wait_for_height(&chain_y, 4).await, "gossip propagation stalled");
    assert_eq!(chain_y.get_latest_block().hash, block.hash);
    assert!(node_y.has_received(&block.hash));

    node_y.stop().await;
    node_x.stop().await;
    chain_y.stop().await;
    chain_x.stop().await;
}

#[tokio::test]
async fn head_announcement_reaches_peers_that_join_after_an_ask_round() {
    let validator = Keypair::from_secret_bytes(&[0x71; 32]).unwrap();
    let engine_x = engine_for(&validator);
    let config = NodeConfig::default();

    let dir_x = tempfile::tempdir().unwrap();
    let storage_x = Storage::open(dir_x.path()).unwrap();
    let chain_x = Blockchain::new(
        storage_x,
        engine_x.clone(),
        &config,
        validator.address(),
        None,
    )
    .unwrap();

    let dir_y = tempfile::tempdir().unwrap();
    let storage_y = Storage::open(dir_y.path()).unwrap();
    storage_y.init_tables().unwrap();
    storage_y
        .commit_block(&chain_x.get_block_by_height(0).unwrap().unwrap())
        .unwrap();
    storage_y
        .commit_block(&chain_x.get_block_by_height(1).unwrap().unwrap())
        .unwrap();
    let key_y = Keypair::from_secret_bytes(&[0x72; 32]).unwrap();
    let chain_y = Blockchain::new(
        storage_y,
        engine_for(&validator),
        &config,
        key_y.address(),
        None,
    )
    .unwrap();

    for nonce in [0x2001u64, 0x2002] {
        let parent = chain_x.get_latest_block();
        let block = child_of(&engine_x, &validator, &parent, nonce);
        chain_x.add_remote_block(block).unwrap();
    }

    let node_x = Node::new(validator.clone(), "127.0.0.1:0".parse().unwrap(), chain_x.clone());
    let addr_x = node_x.start(&[]).await.unwrap();
    let node_y = Node::new(key_y.clone(), "127.0.0.1:0".parse().unwrap(), chain_y.clone());
    node_y.start(&[]).await.unwrap();
    node_y.connect(addr_x, &node_x.public_key()).await.unwrap();
    assert!(wait_for_height(&chain_y, 3).await, "handshake sync stalled");

    // First gossip round: Y pulls the new head over ASK, which marks the
    // hash as transmitted on X's side.
    let parent = chain_x.get_latest_block();
    let head = child_of(&engine_x, &validator, &parent, 0x2003);
    chain_x.add_remote_block(head.clone()).unwrap();
    assert!(wait_for_height(&chain_y, 4).await, "gossip propagation stalled");
    assert!(node_y.has_received(&head.hash));

    // Z joins late on an unrelated bootstrap history, so the handshake has
    // nothing to offer it; only the per-peer head announcement can tell it
    // about the current head.
    let dir_z = tempfile::tempdir().unwrap();
    let storage_z = Storage::open(dir_z.path()).unwrap();
    let key_z = Keypair::from_secret_bytes(&[0x73; 32]).unwrap();
    let genesis_z = GenesisBlock {
        nonce: 0x7777,
        ..GenesisBlock::default()
    };
    let chain_z = Blockchain::new(
        storage_z,
        engine_for(&validator),
        &config,
        key_z.address(),
        Some(genesis_z),
    )
    .unwrap();
    assert_eq!(chain_z.get_latest_block().height(), 1);

    let node_z = Node::new(key_z.clone(), "127.0.0.1:0".parse().unwrap(), chain_z.clone());
    node_z.start(&[]).await.unwrap();
    node_z.connect(addr_x, &node_x.public_key()).await.unwrap();

    assert!(
        wait_for_height(&chain_z, 4).await,
        "late joiner never heard the head announcement"
    );
    assert_eq!(chain_z.get_latest_block().hash, head.hash);
    assert!(node_z.has_received(&head.hash));

    node_z.stop().await;
    node_y.stop().await;
    node_x.stop().await;
    chain_z.stop().await;
    chain_y.stop().await;
    chain_x.stop().await;
}
