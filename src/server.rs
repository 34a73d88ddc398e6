//! Listening TCP front-end (4.G item 1). Grounded in
//! `examples/original_source/oauth2imap/server.py`'s `ImapTCPHandler` /
//! `ImapServer` (a `socketserver.ForkingTCPServer`). Rust has no safe,
//! portable `fork()`, so this is thread-per-connection instead of
//! process-per-connection — see SPEC_FULL.md §9 decision 5. A panicking
//! session thread cannot bring down the listener either way, which is the
//! isolation property spec.md §5 actually asks for.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::provider;
use crate::session::{self, TcpTransport};

pub fn run(config: Config) -> Result<()> {
    let addr = (config.downstream.server.as_str(), config.downstream.port);
    let listener = TcpListener::bind(addr).with_context(|| {
        format!(
            "binding downstream listener on {}:{}",
            config.downstream.server, config.downstream.port
        )
    })?;

    info!(
        "listening on {}:{}",
        config.downstream.server, config.downstream.port
    );

    // `incoming()` blocks in `accept()`; install an explicit handler so a
    // Ctrl-C still logs a clean shutdown instead of just dying, matching
    // server.py's `except KeyboardInterrupt: pass` around `serve_forever()`.
    let _ = ctrlc::set_handler(|| {
        info!("received interrupt, shutting down");
        std::process::exit(0);
    });

    let config = Arc::new(config);

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let config = Arc::clone(&config);

        std::thread::spawn(move || {
            info!("{peer}: new connection");
            if let Err(e) = handle_connection(&config, stream, &peer) {
                error!("{peer}: {e:#}");
            }
            debug!("{peer}: finish");
        });
    }

    Ok(())
}

fn handle_connection(config: &Config, stream: TcpStream, peer: &str) -> Result<()> {
    let provider = provider::resolve(config.provider_name()?, &config.upstream)?;
    let downstream = TcpTransport::new(peer.to_string(), stream);

    session::run(
        downstream,
        &provider,
        &config.tokens_file(),
        config.downstream.username.clone(),
        config.downstream.password.clone(),
    )
}
