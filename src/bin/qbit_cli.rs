// qbit-cli — lightweight HTTP client for the qbitcoind status/submit surface.
// Usage: qbit-cli <command> [args...]

use colored::*;
use std::env;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn print_usage() {
    println!("{}", "qbit-cli — Qbitcoin node control".bright_cyan().bold());
    println!();
    println!("  {} {:<28} {}", "❯".bright_black(), "status".bright_green(), "Chain height, tip hash, difficulty".white());
    println!("  {} {:<28} {}", "❯".bright_black(), "block-height <n>".bright_green(), "Fetch block by height".white());
    println!("  {} {:<28} {}", "❯".bright_black(), "block-hash <hex>".bright_green(), "Fetch block by hash".white());
    println!("  {} {:<28} {}", "❯".bright_black(), "balance <address>".bright_green(), "Account balance".white());
    println!("  {} {:<28} {}", "❯".bright_black(), "mempool".bright_green(), "List mempool transaction hashes".white());
    println!("  {} {:<28} {}", "❯".bright_black(), "submit-tx <json-file>".bright_green(), "Submit a signed transaction".white());
    println!();
}

async fn http_request(port: u16, method: &str, path: &str, body: Option<String>) -> Result<String, Box<dyn std::error::Error>> {
    let addr = format!("127.0.0.1:{port}");
    let mut stream = TcpStream::connect(&addr).await.map_err(|e| {
        format!("cannot connect to qbitcoind at {addr}: {e}. Is the daemon running? Start it with: qbitcoind")
    })?;

    let body = body.unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let response_str = String::from_utf8_lossy(&response);
    match response_str.find("\r\n\r\n") {
        Some(idx) => Ok(response_str[idx + 4..].to_string()),
        None => Ok(String::new()),
    }
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or(raw.to_string())),
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let port: u16 = std::env::var("QBIT_API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(qbitcoin::config::DEFAULT_API_PORT);

    let command = args[1].as_str();
    let result = match command {
        "status" => http_request(port, "GET", "/status", None).await,
        "block-height" => {
            let height = args.get(2).ok_or("usage: block-height <n>")?;
            http_request(port, "GET", &format!("/block/height/{height}"), None).await
        }
        "block-hash" => {
            let hash = args.get(2).ok_or("usage: block-hash <hex>")?;
            http_request(port, "GET", &format!("/block/hash/{hash}"), None).await
        }
        "balance" => {
            let address = args.get(2).ok_or("usage: balance <address>")?;
            http_request(port, "GET", &format!("/balance/{address}"), None).await
        }
        "mempool" => http_request(port, "GET", "/mempool", None).await,
        "submit-tx" => {
            let path = args.get(2).ok_or("usage: submit-tx <json-file>")?;
            let body = std::fs::read_to_string(path)?;
            http_request(port, "POST", "/transaction", Some(body)).await
        }
        _ => {
            print_usage();
            return Ok(());
        }
    };

    match result {
        Ok(raw) => print_json(&raw),
        Err(e) => {
            eprintln!("{} {e}", "error:".bright_red().bold());
            std::process::exit(1);
        }
    }

    Ok(())
}
