//! framewire-client: send one request and print the reply.
//!
//! `search` sends a structured request; any other action sends VALUE as
//! opaque bytes.

use clap::Parser;
use framewire::client::{Client, SearchRequest, CLIENT_BINARY_CONTENT_TYPE};
use framewire::protocol::{Message, Payload};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "framewire-client")]
#[command(version = "0.1.0")]
#[command(about = "Send one request to a framewire server", long_about = None)]
struct Args {
    /// Server address (HOST:PORT)
    #[arg(short, long, default_value = "127.0.0.1:65000")]
    connect: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Request action, e.g. `search`
    action: String,

    /// Request value
    value: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let payload = if args.action == "search" {
        SearchRequest::new(args.action, args.value).to_payload()
    } else {
        Payload::binary(args.value.into_bytes(), CLIENT_BINARY_CONTENT_TYPE)
    };

    let mut client = Client::connect(args.connect.as_str())?;
    let frame = client.request(&payload)?;

    match frame.message()? {
        Message::Structured(map) => match map.get("result").and_then(|v| v.as_str()) {
            Some(result) => println!("got result: {result}"),
            None => println!("got response: {}", serde_json::Value::Object(map)),
        },
        Message::Opaque(bytes) => println!(
            "got response ({}): {:?}",
            frame.metadata.content_type,
            String::from_utf8_lossy(&bytes)
        ),
    }
    Ok(())
}
