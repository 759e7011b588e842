//! # tidings
//!
//! Terminal front end for the sync engine. Connects with the credentials
//! from the environment, prints every engine event as JSON and reads
//! commands from stdin:
//!
//! - `/open <conversation>` make a conversation active and load its history
//! - `/more` load the next older page of the active conversation
//! - `/read <conversation>` mark a conversation read
//! - `/typing <conversation>` signal typing in a conversation
//! - `/quit` shut down
//! - `<conversation> <text>` send a text message

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use tidings_client::{init_tracing, ClientConfig, HttpRestApi, SyncEvent, SyncHandle};
use tidings_net::{Credential, WsConnector};
use tidings_shared::constants::APP_NAME;
use tidings_shared::types::ConversationId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    let Some(user_id) = config.user_id else {
        bail!("TIDINGS_USER_ID is not set");
    };
    let Some(token) = config.token.clone() else {
        bail!("TIDINGS_TOKEN is not set");
    };
    info!(
        ws = %config.ws_url,
        api = %config.api_url,
        user = %user_id,
        "Loaded configuration"
    );

    let connector = WsConnector::new(config.ws_url.clone());
    let rest = HttpRestApi::new(config.api_url.clone(), token.clone());
    let (handle, engine) = tidings_client::spawn(&config, user_id, connector, rest);

    let printer = tokio::spawn(print_events(handle.subscribe()));
    handle
        .connect(Credential::new(token))
        .await
        .context("connect")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = run_command(&handle, line).await {
            warn!(error = %e, "Command failed");
        }
    }

    handle.shutdown().await?;
    engine.await?;
    printer.abort();
    Ok(())
}

async fn run_command(handle: &SyncHandle, line: &str) -> anyhow::Result<()> {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    match head {
        "/open" => {
            let state = handle.open_conversation(parse_conversation(rest)?).await?;
            println!("{}", serde_json::to_string(&state)?);
        }
        "/more" => {
            let state = handle.load_more().await?;
            println!("{}", serde_json::to_string(&state)?);
        }
        "/read" => {
            handle.mark_read(parse_conversation(rest)?).await?;
        }
        "/typing" => {
            handle.send_typing(parse_conversation(rest)?, true).await?;
        }
        _ if head.starts_with('/') => bail!("unknown command {head}"),
        _ => {
            if rest.is_empty() {
                bail!("usage: <conversation> <text>");
            }
            handle.send_text(parse_conversation(head)?, rest).await?;
        }
    }
    Ok(())
}

fn parse_conversation(raw: &str) -> anyhow::Result<ConversationId> {
    let id = raw
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid conversation id {raw:?}"))?;
    Ok(ConversationId(id))
}

async fn print_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "Could not encode event"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "Event printer lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
