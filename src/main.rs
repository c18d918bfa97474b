//! xmmsv - command-line client for the daemon's IPC protocol.
//!
//! ```text
//! xmmsv send <object-id> <command-id> [json-args]   one request, reply as JSON
//! xmmsv listen <broadcast-id>                       print every broadcast as JSON
//! xmmsv encode <json>                               hex dump of the wire encoding
//! ```
//!
//! The server address comes from `XMMS_PATH` or the per-user default.

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xmmsv_ipc::ipc::mainloop;
use xmmsv_ipc::serialize::serialize_to_bytes;
use xmmsv_ipc::{ClientConfig, Connection, Value};

const USAGE: &str = "usage: xmmsv send <object-id> <command-id> [json-args]\n       \
                     xmmsv listen <broadcast-id>\n       \
                     xmmsv encode <json>";

fn parse_json(raw: Option<&String>) -> Result<Value> {
    match raw {
        Some(raw) => {
            let json: serde_json::Value = serde_json::from_str(raw).context("Arguments are not valid JSON")?;
            Ok(Value::from(json))
        }
        None => Ok(Value::new_none()),
    }
}

fn parse_id(raw: Option<&String>, what: &str) -> Result<u32> {
    let raw = raw.with_context(|| format!("Missing {what}\n{USAGE}"))?;
    raw.parse().with_context(|| format!("Invalid {what}: {raw}"))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn connect() -> Result<Connection> {
    let config = ClientConfig::from_env();
    Connection::connect_with(&config).with_context(|| format!("Failed to connect to {}", config.address()))
}

fn send(args: &[String]) -> Result<()> {
    let object_id = parse_id(args.first(), "object id")?;
    let command_id = parse_id(args.get(1), "command id")?;
    let payload = parse_json(args.get(2))?;

    let conn = connect()?;
    let reply = conn.send_command(object_id, command_id, &payload)?.wait()?;
    print_json(&reply)
}

fn listen(args: &[String]) -> Result<()> {
    let id = parse_id(args.first(), "broadcast id")?;
    let conn = connect()?;
    let subscription = conn.subscribe_broadcast(id)?;
    subscription.set_notifier(|value| {
        if let Err(e) = print_json(value) {
            tracing::warn!("Cannot print broadcast: {}", e);
        }
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(mainloop::run(&conn))?;
    tracing::info!("Server closed the connection");
    Ok(())
}

fn encode(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("Missing value\n{USAGE}");
    }
    let bytes = serialize_to_bytes(&parse_json(args.first())?)?;
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    println!("{}", hex.join(" "));
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xmmsv_ipc=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("send") => send(&args[1..]),
        Some("listen") => listen(&args[1..]),
        Some("encode") => encode(&args[1..]),
        _ => bail!("{USAGE}"),
    }
}
