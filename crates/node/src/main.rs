use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chaindex_chain::{chain_params, ChainParams, HeaderChain, Network, SharedHeaderChain};
use chaindex_node::broadcast::{BroadcastTable, Broadcaster};
use chaindex_node::bulk::{BulkIndexer, BulkOptions};
use chaindex_node::events::EventBus;
use chaindex_node::group::NodesGroup;
use chaindex_node::listener::{ListenerCore, LiveListener};
use chaindex_node::p2p::{parse_headers, Peer};
use chaindex_node::repository::{serve_block_fetches, PeerBlockRepository};
use chaindex_node::stats::Stats;
use chaindex_storage::fjall::FjallStore;
use chaindex_storage::{Column, KvBlobStore, KvQueue};
use tokio::sync::watch;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_BLOCK_GRANULARITY: u32 = 100;
const DEFAULT_TRANSACTIONS_PER_WORK: u64 = 2_000_000;

struct Config {
    network: Network,
    node_endpoint: Option<SocketAddr>,
    data_dir: PathBuf,
    block_granularity: u32,
    transactions_per_work: u64,
    run_bulk: bool,
}

fn usage() -> &'static str {
    "chaindexd [options]\n\
     \n\
     --network <mainnet|testnet|regtest>   chain to index (default mainnet)\n\
     --node <host:port>                    peer to stream blocks from (required)\n\
     --datadir <path>                      state directory (default ./data)\n\
     --block-granularity <n>               sampling stride for bulk windows (default 100)\n\
     --transactions-per-work <n>           estimated txs per bulk range (default 2000000)\n\
     --run-bulk                            backfill over the work queue before listening\n"
}

fn parse_args() -> Result<Config, String> {
    let mut config = Config {
        network: Network::Mainnet,
        node_endpoint: None,
        data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        block_granularity: DEFAULT_BLOCK_GRANULARITY,
        transactions_per_work: DEFAULT_TRANSACTIONS_PER_WORK,
        run_bulk: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => {
                let value = args.next().ok_or("--network requires a value")?;
                config.network = Network::from_str(&value)
                    .ok_or_else(|| format!("unknown network {value}"))?;
            }
            "--node" => {
                let value = args.next().ok_or("--node requires a value")?;
                config.node_endpoint =
                    Some(value.parse().map_err(|_| format!("bad endpoint {value}"))?);
            }
            "--datadir" => {
                let value = args.next().ok_or("--datadir requires a value")?;
                config.data_dir = PathBuf::from(value);
            }
            "--block-granularity" => {
                let value = args.next().ok_or("--block-granularity requires a value")?;
                config.block_granularity = value
                    .parse()
                    .map_err(|_| format!("bad block granularity {value}"))?;
            }
            "--transactions-per-work" => {
                let value = args
                    .next()
                    .ok_or("--transactions-per-work requires a value")?;
                config.transactions_per_work = value
                    .parse()
                    .map_err(|_| format!("bad transactions per work {value}"))?;
            }
            "--run-bulk" => config.run_bulk = true,
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(config)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = parse_args()?;
    let params = chain_params(config.network);
    let endpoint = config.node_endpoint.ok_or("--node host:port is required")?;

    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;
    let store = Arc::new(
        FjallStore::open(config.data_dir.join("db")).map_err(|err| err.to_string())?,
    );
    let blobs = Arc::new(KvBlobStore::new(Arc::clone(&store)));
    let work_queue = Arc::new(
        KvQueue::open(Arc::clone(&store), Column::WorkQueue).map_err(|err| err.to_string())?,
    );
    let broadcast_queue = Arc::new(
        KvQueue::open(Arc::clone(&store), Column::BroadcastQueue)
            .map_err(|err| err.to_string())?,
    );
    let chain = SharedHeaderChain::new(HeaderChain::new(params.genesis));
    let stats = Arc::new(Stats::new());
    log::info!(
        "chaindexd on {} via {endpoint}, data in {}",
        params.network.as_str(),
        config.data_dir.display()
    );

    if config.run_bulk {
        run_bulk(&config, &params, endpoint, &store, &blobs, &work_queue, &chain).await?;
    }

    let group = Arc::new(NodesGroup::default());
    let table = Arc::new(BroadcastTable::default());
    let core = Arc::new(ListenerCore::new(
        Arc::clone(&store),
        chain.clone(),
        Arc::clone(&blobs),
        EventBus::new(),
        Arc::clone(&table),
        Arc::clone(&stats),
    ));
    let listener = LiveListener::start(
        Arc::clone(&core),
        Arc::clone(&group),
        &params,
        &[endpoint],
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broadcaster = Broadcaster::new(
        Arc::clone(&store),
        chain.clone(),
        Arc::clone(&broadcast_queue),
        Arc::clone(&group),
        table,
        Arc::clone(&stats),
    );
    let broadcaster_task = tokio::spawn(async move { broadcaster.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| err.to_string())?;
    log::info!("shutting down");
    let _ = shutdown_tx.send(true);
    match broadcaster_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("broadcaster stopped with error: {err}"),
        Err(err) => log::warn!("broadcaster task failed: {err}"),
    }
    listener.shutdown().await?;
    println!("{}", stats.snapshot(chain.read().height()).to_json());
    Ok(())
}

async fn run_bulk(
    config: &Config,
    params: &ChainParams,
    endpoint: SocketAddr,
    store: &Arc<FjallStore>,
    blobs: &Arc<KvBlobStore<Arc<FjallStore>>>,
    work_queue: &Arc<KvQueue<Arc<FjallStore>>>,
    chain: &SharedHeaderChain,
) -> Result<(), String> {
    let mut peer = Peer::connect(endpoint, params.magic).await?;
    peer.handshake(chain.read().height() as i32).await?;
    bootstrap_headers(&mut peer, chain).await?;

    let (repository, fetch_requests) = PeerBlockRepository::new();
    let fetch_service = tokio::spawn(serve_block_fetches(
        peer,
        Arc::clone(blobs),
        fetch_requests,
    ));

    let bulk = BulkIndexer::new(
        Arc::clone(store),
        Arc::clone(blobs),
        Arc::clone(work_queue),
        repository,
        chain.clone(),
        BulkOptions {
            block_granularity: config.block_granularity,
            transactions_per_work: config.transactions_per_work,
        },
    );
    let processed = tokio::task::spawn_blocking(move || bulk.run())
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?;
    log::info!("bulk indexing processed {processed} messages");
    fetch_service.abort();
    Ok(())
}

async fn bootstrap_headers(peer: &mut Peer, chain: &SharedHeaderChain) -> Result<(), String> {
    loop {
        let locator = chain.read().tip_locator();
        peer.send_getheaders(&locator).await?;
        let headers = loop {
            let (command, payload) = peer.read_message().await?;
            match command.as_str() {
                "headers" => break parse_headers(&payload)?,
                "ping" => peer.send_message("pong", &payload).await?,
                _ => {}
            }
        };
        if headers.is_empty() {
            return Ok(());
        }
        chain
            .write()
            .connect(&headers)
            .map_err(|err| err.to_string())?;
        log::info!("header chain at height {}", chain.read().height());
    }
}
