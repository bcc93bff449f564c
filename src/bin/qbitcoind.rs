use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use colored::*;
use qbitcoin::config::Config;
use qbitcoin::consensus::chain::ChainManager;
use qbitcoin::consensus::genesis::{mine_genesis_block, GenesisManifest};
use qbitcoin::mempool::Mempool;
use qbitcoin::miner;
use qbitcoin::net::p2p::P2PNetwork;
use qbitcoin::rpc::server::{self, RpcState};

fn banner() {
    println!("{}", " ██████╗ ██████╗ ██╗████████╗".bright_cyan());
    println!("{}", "██╔═══██╗██╔══██╗██║╚══██╔══╝".bright_cyan());
    println!("{}", "██║   ██║██████╔╝██║   ██║   ".bright_cyan().bold());
    println!("{}", "██║▄▄ ██║██╔══██╗██║   ██║   ".bright_cyan().bold());
    println!("{}", "╚██████╔╝██████╔╝██║   ██║   ".blue());
    println!("{}", " ╚══▀▀═╝ ╚═════╝ ╚═╝   ╚═╝   ".blue());
    println!();
    println!("{}", "      Quantum-Resistant Full Node".bright_green().bold());
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();
    banner();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)?;
    println!("{} data dir: {}", "[init]".bright_blue().bold(), config.data_dir.display());

    let chain = Arc::new(ChainManager::open(&config.data_dir, config.chain_id)?);
    println!("{} chain height: {}", "[init]".bright_blue().bold(), chain.current_height());

    if chain.current_height() < 0 {
        let manifest_path = config.data_dir.join("genesis.json");
        if manifest_path.exists() {
            println!("{} mining genesis block from manifest", "[init]".bright_blue().bold());
            let manifest = GenesisManifest::load(&manifest_path)?;
            let stop = AtomicBool::new(false);
            let genesis = mine_genesis_block(&manifest, &stop)?;
            let mempool = Mempool::new();
            chain.add_block(genesis, &mempool)?;
            println!("{} genesis block mined and applied", "[init]".bright_blue().bold());
        } else {
            println!(
                "{} no genesis manifest at {}; waiting for peer sync",
                "[init]".bright_yellow().bold(),
                manifest_path.display()
            );
        }
    }

    let mempool = Arc::new(Mempool::new());
    let mempool_file = config.data_dir.join("mempool.dat");
    if mempool_file.exists() {
        match mempool.load_from_file(&mempool_file) {
            Ok(n) => println!("{} loaded {n} mempool transaction(s)", "[init]".bright_blue().bold()),
            Err(e) => eprintln!("{} failed to load mempool: {e}", "[init]".bright_red().bold()),
        }
    }

    let p2p = Arc::new(P2PNetwork::new(chain.clone(), mempool.clone(), config.p2p_port));
    let p2p_bind = qbitcoin::config::p2p_bind_address();
    let p2p_for_run = p2p.clone();
    tokio::spawn(async move {
        if let Err(e) = p2p_for_run.run(&p2p_bind).await {
            eprintln!("{} error: {e}", "[p2p]".bright_red().bold());
        }
    });

    if let Ok(reward_address) = std::env::var("QBIT_MINER_ADDRESS") {
        let miner_chain = chain.clone();
        let miner_mempool = mempool.clone();
        std::thread::spawn(move || {
            let stop = AtomicBool::new(false);
            miner::run(&miner_chain, &miner_mempool, &reward_address, &stop);
        });
        println!("{} mining enabled", "[miner]".bright_magenta().bold());
    }

    println!(
        "{} RPC listening on {}:{}",
        "[rpc]".bright_magenta().bold(),
        qbitcoin::config::RPC_BIND_ADDRESS,
        config.api_port
    );
    println!(
        "{} P2P listening on {}:{}",
        "[p2p]".bright_green().bold(),
        p2p_bind,
        config.p2p_port
    );

    let rpc_state = Arc::new(RpcState { chain, mempool, p2p });
    server::run(rpc_state, config.api_port).await?;
    Ok(())
}
