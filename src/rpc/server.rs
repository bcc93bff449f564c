// Minimal HTTP status/submit surface (§6 external interfaces): the core's
// only outward-facing API beyond the P2P wire protocol. Kept intentionally
// thin — no JSON-RPC method dispatch, no wallet key management, just enough
// for a caller to read chain state and submit a signed transaction.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::RPC_BIND_ADDRESS;
use crate::consensus::chain::ChainManager;
use crate::crypto::hash::hash_from_hex;
use crate::mempool::Mempool;
use crate::net::p2p::P2PNetwork;
use crate::primitives::transaction::Transaction;

pub struct RpcState {
    pub chain: Arc<ChainManager>,
    pub mempool: Arc<Mempool>,
    pub p2p: Arc<P2PNetwork>,
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn ok(body: Value) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

fn err(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, json!({"error": message}))
}

async fn handle(state: Arc<RpcState>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["status"]) => {
            let height = state.chain.current_height();
            ok(json!({
                "height": height,
                "best_hash": crate::crypto::hash::hash_to_hex(&state.chain.best_hash()),
                "difficulty": state.chain.get_next_block_difficulty().unwrap_or(0.0),
                "chain_work": state.chain.chain_work(1000).unwrap_or(0.0),
                "mempool_size": state.mempool.len(),
            }))
        }
        (&Method::GET, ["validate"]) => match state.chain.validate_chain(1000) {
            Ok(valid) => ok(json!({"valid": valid})),
            Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (&Method::GET, ["block", "height", h]) => match h.parse::<u32>() {
            Ok(height) => match state.chain.get_block_by_height(height) {
                Ok(Some(block)) => ok(serde_json::to_value(&block).unwrap()),
                Ok(None) => err(StatusCode::NOT_FOUND, "block not found"),
                Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            Err(_) => err(StatusCode::BAD_REQUEST, "invalid height"),
        },
        (&Method::GET, ["block", "hash", h]) => match hash_from_hex(h) {
            Some(hash) => match state.chain.get_block_by_hash(&hash) {
                Ok(Some(block)) => ok(serde_json::to_value(&block).unwrap()),
                Ok(None) => err(StatusCode::NOT_FOUND, "block not found"),
                Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            None => err(StatusCode::BAD_REQUEST, "invalid hash"),
        },
        (&Method::GET, ["balance", address]) => {
            ok(json!({"address": address, "balance": state.chain.balance(address)}))
        }
        (&Method::GET, ["mempool"]) => ok(json!({"transactions": state.mempool.hashes()})),
        (&Method::GET, ["mempool", "transaction", h]) => match state.mempool.get_transaction(h) {
            Some(tx) => ok(serde_json::to_value(&tx).unwrap()),
            None => err(StatusCode::NOT_FOUND, "transaction not in mempool"),
        },
        (&Method::GET, ["mempool", "address", address]) => {
            ok(json!({"transactions": state.mempool.transactions_by_address(address)}))
        }
        (&Method::POST, ["transaction"]) => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => return Ok(err(StatusCode::BAD_REQUEST, "failed to read body")),
            };
            match serde_json::from_slice::<Transaction>(&body) {
                Ok(mut tx) => {
                    tx.finalize_hash();
                    let accounts = state.chain.accounts();
                    let store = state.chain.store();
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap()
                        .as_secs();
                    let result = state.mempool.add_transaction(tx.clone(), &accounts, &store, now);
                    drop(store);
                    drop(accounts);
                    match result {
                        Ok(true) => {
                            state.p2p.broadcast_transaction(&tx);
                            ok(json!({"accepted": true, "hash": crate::crypto::hash::hash_to_hex(&tx.hash)}))
                        }
                        Ok(false) => err(StatusCode::CONFLICT, "transaction rejected"),
                        Err(e) => err(StatusCode::BAD_REQUEST, &e.to_string()),
                    }
                }
                Err(e) => err(StatusCode::BAD_REQUEST, &format!("malformed transaction: {e}")),
            }
        }
        _ => err(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

pub async fn run(state: Arc<RpcState>, port: u16) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{RPC_BIND_ADDRESS}:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "rpc listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(state.clone(), req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                warn!(%peer_addr, error = %e, "rpc connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_err_response_carries_status_and_message() {
        let resp = err(StatusCode::NOT_FOUND, "block not found");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_state_reflects_empty_chain() {
        let dir = tempdir().unwrap();
        let chain = Arc::new(ChainManager::open(dir.path(), 1).unwrap());
        let mempool = Arc::new(Mempool::new());
        let p2p = Arc::new(P2PNetwork::new(chain.clone(), mempool.clone(), 9567));
        let state = RpcState { chain, mempool, p2p };
        assert_eq!(state.chain.current_height(), -1);
        assert_eq!(state.mempool.len(), 0);
    }

    #[tokio::test]
    async fn test_validate_chain_on_fresh_store_is_valid() {
        let dir = tempdir().unwrap();
        let chain = Arc::new(ChainManager::open(dir.path(), 1).unwrap());
        assert!(chain.validate_chain(1000).unwrap());
        assert_eq!(chain.chain_work(1000).unwrap(), 0.0);
    }
}
