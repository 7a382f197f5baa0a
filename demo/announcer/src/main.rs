mod config;
use config::AnnouncerConfig;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use verba_core::{SpeechEventKind, SpeechSession};
use verba_engines::CliEngineFactory;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,verba_core=info,announcer=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(target = "announcer", "Starting announcer demo");

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = AnnouncerConfig::load();

    let factory = Arc::new(CliEngineFactory::new(cfg.engine_config()));
    let session = Arc::new(SpeechSession::new(factory));
    session.configure(cfg.voice_update());

    if let Some(ref engine) = cfg.engine {
        session.set_engine(engine).await?;
    }

    // Mirror every session event into the log
    let (_sub_id, mut events) = session.subscribe(vec![]);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(target = "announcer", event = %json, "speech event"),
                Err(e) => warn!(target = "announcer", error = %e, "event serialization failed"),
            }
        }
    });

    // Completion notifications for the utterances we queue
    let (_done_sub, mut done_rx) = session.subscribe(vec![
        SpeechEventKind::Finish,
        SpeechEventKind::Error,
        SpeechEventKind::Stopped,
    ]);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        let text = args.join(" ");
        let id = session.speak(&text).await?;
        info!(target = "announcer", id = %id, "Queued announcement");
        while let Some(event) = done_rx.recv().await {
            if event.id == id {
                break;
            }
        }
    } else {
        println!("Type lines to speak; Ctrl-D to exit.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut last_id = None;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            match session.speak(&line).await {
                Ok(id) => {
                    info!(target = "announcer", id = %id, "Queued announcement");
                    last_id = Some(id);
                }
                Err(e) => warn!(target = "announcer", error = %e, "Failed to queue"),
            }
        }
        // Let the tail of the queue drain before tearing down.
        if let Some(id) = last_id {
            while let Some(event) = done_rx.recv().await {
                if event.id == id {
                    break;
                }
            }
        }
    }

    session.shutdown();
    info!(target = "announcer", "Announcer shut down");
    Ok(())
}
