mod cli;
mod logging;

use anyhow::Context;
use clap::Parser;
use janus_client::{
    AttachOptions, DestroyOptions, DetachOptions, HandleCallbacks, MessageOutcome, Session,
    SessionHandlers,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::{signal, time};
use tracing::{error, info, warn};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = cli
        .to_session_config()
        .context("invalid session configuration")?;
    let handlers = SessionHandlers::default()
        .on_error(|err| error!(error = %err, "session lost"))
        .on_destroyed(|()| info!("session destroyed"));
    let session = Session::builder(config)
        .handlers(handlers)
        .connect()
        .await
        .context("failed to create session")?;
    info!(
        session_id = ?session.session_id(),
        server = ?session.server(),
        "session ready"
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Value>();
    let mut options = AttachOptions::new(cli.plugin.clone()).callbacks(forwarding(events_tx));
    if let Some(opaque_id) = &cli.opaque_id {
        options = options.opaque_id(opaque_id.clone());
    }
    let handle = session
        .attach(options)
        .await
        .with_context(|| format!("failed to attach to {}", cli.plugin))?;
    println!(
        "{}",
        json!({"event": "attached", "plugin": handle.plugin(), "handle_id": handle.id()})
    );

    if let Some(body) = cli.message.clone() {
        match handle.send(body, None).await {
            Ok(MessageOutcome::Ack) => println!("{}", json!({"event": "ack"})),
            Ok(MessageOutcome::Success(data)) => {
                println!("{}", json!({"event": "success", "data": data}))
            }
            Err(err) => warn!(error = %err, "plugin message failed"),
        }
    }

    let deadline = time::sleep(cli.listen_for());
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => println!("{event}"),
            _ = &mut deadline => break,
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Err(err) = handle.detach(DetachOptions::default()).await {
        warn!(error = %err, "detach failed");
    }
    session
        .destroy(DestroyOptions::default())
        .await
        .context("failed to destroy session")?;
    Ok(())
}

/// Callbacks that turn handle notifications into JSON lines.
fn forwarding(tx: mpsc::UnboundedSender<Value>) -> HandleCallbacks {
    let message_tx = tx.clone();
    let webrtc_tx = tx.clone();
    let media_tx = tx.clone();
    let slow_tx = tx.clone();
    let data_tx = tx.clone();
    HandleCallbacks::default()
        .on_message(move |msg| {
            let _ = message_tx.send(json!({"event": "message", "data": msg.data, "jsep": msg.jsep}));
        })
        .on_webrtc_state(move |state| {
            let _ = webrtc_tx.send(json!({"event": "webrtc", "up": state.up, "reason": state.reason}));
        })
        .on_media_state(move |state| {
            let _ = media_tx.send(json!({
                "event": "media",
                "type": state.kind.as_str(),
                "receiving": state.receiving,
            }));
        })
        .on_slow_link(move |link| {
            let _ = slow_tx.send(json!({"event": "slowlink", "uplink": link.uplink, "lost": link.lost}));
        })
        .on_data(move |msg| {
            let _ = data_tx.send(json!({"event": "data", "label": msg.label, "data": msg.data}));
        })
        .on_detached(move |()| {
            let _ = tx.send(json!({"event": "detached"}));
        })
}
