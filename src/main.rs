use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ticket_gateway::{
    GatewayConfig, MessageKind, OutboundRequest, ResponseEnvelope, ResponseListener, TicketGateway,
};

const USAGE: &str = "usage: ticket-gateway <kind> <message-id> <payload-file> [--blocking]";

struct Args {
    kind: MessageKind,
    message_id: String,
    payload_file: PathBuf,
    blocking: bool,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut blocking = false;
    for arg in std::env::args().skip(1) {
        if arg == "--blocking" {
            blocking = true;
        } else {
            positional.push(arg);
        }
    }
    let [kind, message_id, payload_file] = <[String; 3]>::try_from(positional)
        .map_err(|_| anyhow::anyhow!(USAGE))?;

    let kind = kind.parse::<MessageKind>().map_err(|e| anyhow::anyhow!(e))?;
    if blocking && !kind.expects_reply() {
        bail!("{} messages get no reply, drop --blocking", kind);
    }
    Ok(Args {
        kind,
        message_id,
        payload_file: PathBuf::from(payload_file),
        blocking,
    })
}

/// Prints replies of async sends as they arrive.
struct PrintListener;

impl ResponseListener for PrintListener {
    fn on_response(&self, response: ResponseEnvelope) {
        println!("{} {}", response.correlation_id, String::from_utf8_lossy(&response.body));
    }

    fn on_response_timed_out(&self, request: OutboundRequest) {
        println!("{} timed out", request.message_id);
    }
}

fn load_config() -> Result<GatewayConfig> {
    match GatewayConfig::load() {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!("No usable config file ({:#}), reading TICKET_GATEWAY_* environment", e);
            GatewayConfig::from_env()
        }
    }
}

async fn send_once(gateway: &TicketGateway, args: &Args, request: OutboundRequest) -> ticket_gateway::rabbitmq::Result<()> {
    if args.blocking {
        let reply = gateway.send_blocking(args.kind, request).await?;
        println!("{}", String::from_utf8_lossy(&reply.body));
        return Ok(());
    }
    if args.kind.expects_reply() {
        gateway.set_listener(args.kind, Arc::new(PrintListener))?;
    }
    gateway.send(args.kind, request).await?;
    println!("{} {} published", args.kind, args.message_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let payload = fs::read(&args.payload_file)
        .with_context(|| format!("Failed to read payload file {}", args.payload_file.display()))?;
    let config = load_config()?;

    let gateway = TicketGateway::connect(config)
        .await
        .context("Failed to connect to the trading service broker")?;
    let request = OutboundRequest::new(args.message_id.clone(), payload);

    let outcome = tokio::select! {
        outcome = send_once(&gateway, &args, request) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, closing gateway");
            Ok(())
        }
    };

    // Closing waits for a pending async reply up to the kind's timeout.
    gateway.close().await?;
    outcome?;
    info!(kind = %args.kind, message_id = %args.message_id, "Done");
    Ok(())
}
