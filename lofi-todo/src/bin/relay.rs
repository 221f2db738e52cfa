//! Standalone relay for lofi scopes.
//!
//! ```text
//! lofi-relay [--bind 127.0.0.1:4444]
//! ```

use lofi_replica::relay::{Relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut bind_addr = "127.0.0.1:4444".to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--bind" => {
                if let Some(v) = args.next() {
                    bind_addr = v;
                }
            }
            other => {
                eprintln!("unknown argument: {other}");
                eprintln!("usage: lofi-relay [--bind host:port]");
                std::process::exit(2);
            }
        }
    }

    let relay = Relay::new(RelayConfig {
        bind_addr,
        ..RelayConfig::default()
    });
    relay.run().await
}
