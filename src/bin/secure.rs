//! forge-bridge-secure – single-shot HTML → PDF bridge.
//!
//! Usage:
//!   echo '{"html": "<h1>Hi</h1>", "request_id": "42"}' | forge-bridge-secure
//!
//! Writes one JSON line to stdout:
//! `{"success":true,"request_id":"42","pdf_base64":"...","size":1234}` or
//! `{"success":false,"request_id":"42","error":"..."}`. Exit status is 0 on
//! success and 1 otherwise.

use std::io;
use std::process::ExitCode;

use forge_bridge::bridge::secure;
use forge_bridge::{FontConfiguration, RenderOptions, Renderer};

fn main() -> ExitCode {
    env_logger::init();

    let renderer = Renderer::new(FontConfiguration::discover(), RenderOptions::default());

    let stdin = io::stdin();
    let stdout = io::stdout();
    let stderr = io::stderr();
    match secure::handle(&renderer, stdin.lock(), &mut stdout.lock(), &mut stderr.lock()) {
        Ok(response) if response.success => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error writing response: {e}");
            ExitCode::FAILURE
        }
    }
}
