//! Terminal chat client binary.
//!
//! Connects to a GxvnsChat hub, signs in, and bridges stdin lines into
//! the room. The session logic lives in the `chat` module; this file
//! keeps the argument handling and reconnect loop minimal.
//!
mod chat;

use std::io::BufRead;

use tokio::sync::mpsc;
use tokio::time::sleep;

const DEFAULT_URL: &str = "ws://127.0.0.1:8765/ws";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <username> <password> [url]", args[0]);
        std::process::exit(2);
    }
    let username = args[1].clone();
    let password = args[2].clone();
    let url = args
        .get(3)
        .cloned()
        .unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("🚀 GxvnsChat client started for {username}");
    println!("💬 Type a message and press enter; /quit leaves");

    let mut input = spawn_stdin_reader();
    let mut delay = chat::INITIAL_RECONNECT_DELAY;
    let mut attempts = 0;

    loop {
        attempts += 1;
        println!("🔄 Connecting #{attempts} to {url}...");
        match chat::run(&username, &password, &url, &mut input).await {
            Ok(chat::SessionEnd::Quit) => {
                println!("👋 Bye!");
                return;
            }
            Ok(chat::SessionEnd::Dropped) => {
                eprintln!("⚠️ Connection lost");
                delay = chat::INITIAL_RECONNECT_DELAY;
            }
            Err(chat::ChatError::Login(message)) => {
                eprintln!("❌ Login rejected: {message}");
                std::process::exit(1);
            }
            Err(e @ chat::ChatError::Connect { .. }) => {
                eprintln!("⚠️ {e}");
            }
            Err(e) => {
                // The connection was up, so the next attempt starts fresh.
                eprintln!("⚠️ Connection error: {e}");
                delay = chat::INITIAL_RECONNECT_DELAY;
            }
        }
        println!("⏳ Reconnect in {} seconds...", delay.as_secs());
        sleep(delay).await;
        delay = chat::next_delay(delay);
    }
}

/// Forward stdin lines over a channel from a blocking reader thread.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
