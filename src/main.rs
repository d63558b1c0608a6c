//! forge-bridge – persistent HTML → PDF bridge.
//!
//! Usage:
//!   forge-bridge < requests.jsonl > documents.pdf
//!
//! Reads one JSON request per line (`{"html": ..., "css": ..., "request_id": ...}`)
//! and writes one raw PDF per request to stdout. `forge bridge ready` on
//! stderr signals that fonts are loaded and input is being read. Set
//! `RUST_LOG=debug` for progress on stderr.

use std::io;
use std::process::ExitCode;

use forge_bridge::bridge::fast;
use forge_bridge::{FontConfiguration, RenderOptions, Renderer};

fn main() -> ExitCode {
    env_logger::init();

    let renderer = Renderer::new(FontConfiguration::discover(), RenderOptions::default());

    let stdin = io::stdin();
    let stdout = io::stdout();
    let stderr = io::stderr();
    match fast::serve(&renderer, stdin.lock(), &mut stdout.lock(), &mut stderr.lock()) {
        Ok(served) => {
            log::info!("Served {served} request(s)");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
