// Protocol constants and runtime configuration.
//
// Defaults are plain consts; `QBIT_*` environment variables override them
// at startup (see `Config::from_env`). There is no external config-file
// crate here — the set of knobs is small and flat enough that an env-only
// layer is the right fit, same as the project this is adapted from.

/// Quarks per qbitcoin: internal ledger arithmetic is integer, wire amounts
/// are `f64` qbitcoin. `quarks = round(amount * QUARKS_PER_QBIT)`.
pub const QUARKS_PER_QBIT: u64 = 1_000_000_000;

pub const DEFAULT_P2P_PORT: u16 = 9567;
pub const DEFAULT_API_PORT: u16 = 9568;

pub const TARGET_BLOCK_TIME_SECS: u64 = 60;
pub const MAX_SUPPLY_QBIT: u64 = 30_000_000;
pub const INITIAL_SUPPLY_QBIT: u64 = 20_000_000;
pub const INITIAL_REWARD_QBIT: f64 = 2.5;
pub const HALVING_INTERVAL_BLOCKS: u64 = 1_051_200;
pub const MAX_HALVINGS: u32 = 64;
pub const INITIAL_DIFFICULTY: f64 = 0.001;
pub const MIN_DIFFICULTY: f64 = 0.001;
pub const DIFFICULTY_ADJUSTMENT_BLOCKS: u32 = 3;
pub const MAX_BLOCK_SIZE_BYTES: usize = 2 * 1024 * 1024;
pub const MAX_TX_SIZE_BYTES: usize = 100 * 1024;
pub const MEMPOOL_MAX_SIZE_BYTES: usize = 300 * 1024 * 1024;
pub const MEMPOOL_EXPIRY_HOURS: u64 = 48;
pub const COINBASE_MATURITY_BLOCKS: u32 = 10;
pub const FUTURE_DRIFT_SECS: u64 = 7200;

pub const MAX_BLOCK_FILE_SIZE: u64 = 128 * 1024 * 1024;

pub const MAX_PEERS: usize = 125;
pub const OUTBOUND_PEER_TARGET: usize = 8;
pub const MAX_WIRE_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

pub const RPC_BIND_ADDRESS: &str = "127.0.0.1";
pub const P2P_BIND_ADDRESS_DEFAULT: &str = "0.0.0.0";
pub const DATA_DIR_NAME: &str = ".qbitcoin/mainnet";

#[derive(Debug, Clone)]
pub struct Config {
    pub p2p_port: u16,
    pub api_port: u16,
    pub data_dir: std::path::PathBuf,
    pub debug: bool,
    pub testnet: bool,
    pub chain_id: u32,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("QBIT_DATA_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let p2p_port = std::env::var("QBIT_P2P_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_P2P_PORT);

        let api_port = std::env::var("QBIT_API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_API_PORT);

        let debug = std::env::var("QBIT_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let testnet = std::env::var("QBIT_TESTNET")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Config {
            p2p_port,
            api_port,
            data_dir,
            debug,
            testnet,
            chain_id: if testnet { 2 } else { 1 },
        }
    }
}

pub fn p2p_bind_address() -> String {
    let v = std::env::var("QBIT_P2P_BIND").unwrap_or_else(|_| P2P_BIND_ADDRESS_DEFAULT.to_string());
    if v.trim().is_empty() {
        P2P_BIND_ADDRESS_DEFAULT.to_string()
    } else {
        v
    }
}

pub fn default_data_dir() -> std::path::PathBuf {
    std::path::PathBuf::from(resolve_home_dir()).join(DATA_DIR_NAME)
}

fn resolve_home_dir() -> String {
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            return home;
        }
    }
    #[cfg(windows)]
    {
        if let Ok(home) = std::env::var("USERPROFILE") {
            if !home.trim().is_empty() {
                return home;
            }
        }
        let drive = std::env::var("HOMEDRIVE").unwrap_or_default();
        let path = std::env::var("HOMEPATH").unwrap_or_default();
        if !drive.is_empty() || !path.is_empty() {
            return format!("{drive}{path}");
        }
    }
    ".".to_string()
}

/// Converts a wire-format qbitcoin amount to integer quarks, rounding to
/// the nearest quark. This is the only place float-to-integer conversion
/// for ledger amounts should happen.
pub fn quarks_from_amount(amount: f64) -> u64 {
    (amount * QUARKS_PER_QBIT as f64).round() as u64
}

pub fn amount_from_quarks(quarks: u64) -> f64 {
    quarks as f64 / QUARKS_PER_QBIT as f64
}
