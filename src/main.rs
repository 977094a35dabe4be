use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use intake_chat::config::ClientConfig;
use intake_chat::engine::{ChatEngine, ChatSnapshot};
use intake_chat::model::Sender;
use intake_chat::push::PushChannel;
use intake_chat::transport::RestClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage (wss://)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::from_env().context("Invalid client configuration")?;

    eprintln!("Intake Chat v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API:  {}", config.api_url);
    eprintln!("   Push: {}", config.ws_url);
    eprintln!("   Type your answer and press Enter. /quit to exit.\n");

    let api = Arc::new(RestClient::new(config.clone()));
    let push = Arc::new(PushChannel::websocket(config));
    let engine = ChatEngine::new(api, push);

    let outcome = run(&engine).await;
    engine.teardown().await;
    outcome
}

async fn run(engine: &ChatEngine) -> anyhow::Result<()> {
    let mut updates = engine.subscribe();
    engine.initialize().await?;

    let mut view = View::default();
    view.render(&updates.borrow_and_update());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprint!("> ");

    loop {
        if engine.snapshot().is_completed() {
            wait_for_farewell(&mut updates, &mut view).await;
            eprintln!("\nIntake complete. Thank you!");
            return Ok(());
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                view.render(&updates.borrow_and_update());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Error reading stdin")? else {
                    return Ok(());
                };
                let line = line.trim();
                if line == "/quit" {
                    return Ok(());
                }
                if line.is_empty() {
                    eprint!("> ");
                    continue;
                }
                // Failure is already in the snapshot; keep the prompt alive.
                if let Err(e) = engine.send_message(line).await {
                    tracing::debug!(error = %e, "Send failed");
                }
                view.render(&updates.borrow_and_update());
            }
        }
    }
}

/// Give the closing bot message a moment to arrive over the push channel.
async fn wait_for_farewell(updates: &mut watch::Receiver<ChatSnapshot>, view: &mut View) {
    let wait = tokio::time::timeout(Duration::from_secs(2), async {
        while updates.borrow().is_typing() {
            if updates.changed().await.is_err() {
                break;
            }
        }
    });
    let _ = wait.await;
    view.render(&updates.borrow_and_update());
}

/// What has already been written to the terminal.
#[derive(Default)]
struct View {
    shown: usize,
    progress: Option<u8>,
    typing: bool,
    error: Option<String>,
}

impl View {
    fn render(&mut self, snapshot: &ChatSnapshot) {
        let messages = snapshot.messages();
        if messages.len() > self.shown {
            for message in &messages[self.shown..] {
                // The user's own lines are already on screen.
                if message.sender == Sender::Bot {
                    println!("\n{}\n", message.content);
                }
            }
            self.shown = messages.len();
            eprint!("> ");
        }

        let progress = snapshot.progress_percent();
        if snapshot.session().is_some() && self.progress != Some(progress) {
            eprintln!("[progress {progress}%]");
            self.progress = Some(progress);
        }

        let error = snapshot.error().map(str::to_string);
        if error.is_some() && error != self.error {
            eprintln!("⚠️  {}", error.as_deref().unwrap_or_default());
        }
        self.error = error;

        if snapshot.is_typing() && !self.typing {
            eprintln!("⏳ ...");
        }
        self.typing = snapshot.is_typing();
    }
}
