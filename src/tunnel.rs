//! Stdio front-end (4.G item 2): a single session piped over stdin/stdout,
//! grounded in `examples/original_source/oauth2imap/tunnel.py`.

use anyhow::Result;
use log::{debug, info};

use crate::config::Config;
use crate::provider;
use crate::session::{self, StdioTransport};

pub fn run(config: Config) -> Result<()> {
    let provider = provider::resolve(config.provider_name()?, &config.upstream)?;

    info!("new connection");

    let downstream = StdioTransport::new();
    session::run(
        downstream,
        &provider,
        &config.tokens_file(),
        config.downstream.username.clone(),
        config.downstream.password.clone(),
    )?;

    debug!("finish");
    Ok(())
}
