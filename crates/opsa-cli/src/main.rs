//! # opsa
//!
//! Command-line controller for the opsa media server. Wires one
//! [`ServerIo`] to one [`ConnectionManager`] and runs a single command
//! against it.

#![deny(unsafe_code)]

mod render;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use opsa_client::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, RequestHandle, ServerIo,
    SubscriptionEvent, WsConnector,
};
use opsa_settings::OpsaSettings;
use serde_json::{Value, json};
use tracing::debug;

/// How long a clean unsubscribe may take before the command gives up on it.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Control client for the opsa media server.
#[derive(Parser, Debug)]
#[command(name = "opsa", about = "Control client for the opsa media server")]
struct Cli {
    /// WebSocket URL of the server (overrides settings).
    #[arg(long, global = true)]
    url: Option<String>,

    /// Connection attempts per round (overrides settings).
    #[arg(long, global = true)]
    attempts: Option<u32>,

    /// Log filter, e.g. `debug` or `opsa_client=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue one request and print the response.
    Request {
        /// Method name.
        method: String,
        /// Request data as JSON.
        #[arg(long)]
        data: Option<String>,
    },
    /// Subscribe to a topic and print every update.
    Watch {
        /// Topic name.
        topic: String,
        /// Filter object as JSON.
        #[arg(long)]
        filter: Option<String>,
        /// Stop after this many updates.
        #[arg(long)]
        count: Option<usize>,
    },
    /// Watch discovered cast devices.
    Devices {
        /// Stop after this many updates.
        #[arg(long)]
        count: Option<usize>,
    },
    /// Print the media library once.
    Library,
    /// Play a library file on a cast device.
    Play {
        /// Library file id.
        file_id: String,
        /// Device uuid.
        #[arg(long)]
        device: String,
    },
    /// Host a library file for local playback and print its URL.
    PlayLocal {
        /// Library file id.
        file_id: String,
        /// Audio stream index.
        #[arg(long, default_value_t = 0)]
        audio: u32,
    },
    /// Connect and print engine state.
    Status,
}

impl Cli {
    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut OpsaSettings) {
        if let Some(ref url) = self.url {
            settings.server.url.clone_from(url);
        }
        if let Some(attempts) = self.attempts {
            settings.connection.max_attempts = attempts;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

fn connection_config(settings: &OpsaSettings) -> ConnectionConfig {
    ConnectionConfig {
        url: settings.server.url.clone(),
        max_attempts: settings.connection.max_attempts,
        retry_delay: Duration::from_millis(settings.connection.retry_delay_ms),
        auto_reconnect: settings.connection.auto_reconnect,
        send_queue: settings.connection.send_queue,
    }
}

fn request_timeout(settings: &OpsaSettings) -> Option<Duration> {
    match settings.connection.request_timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

fn parse_json(arg: Option<&str>, what: &str) -> Result<Value> {
    match arg {
        None => Ok(Value::Null),
        Some(text) => serde_json::from_str(text).with_context(|| format!("invalid {what} JSON")),
    }
}

/// Print connection loss and recovery on stderr while a command runs.
fn report_connection(manager: &ConnectionManager) {
    let mut events = manager.subscribe_events();
    drop(tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => eprintln!("connected"),
                ConnectionEvent::Disconnected { reason } => {
                    eprintln!("disconnected: {}", reason.as_deref().unwrap_or("connection lost"));
                }
                ConnectionEvent::Reconnecting { attempt } => eprintln!("reconnecting (round {attempt})"),
                ConnectionEvent::RetryExhausted { attempts } => {
                    eprintln!("server unreachable after {attempts} attempts, will keep trying");
                }
            }
        }
    }));
}

struct App {
    io: ServerIo,
    timeout: Option<Duration>,
}

impl App {
    async fn call(&self, method: &str, data: Value) -> Result<Value> {
        let handle: RequestHandle = self.io.request(method, data)?;
        let response = match self.timeout {
            Some(limit) => handle.response_timeout(limit).await,
            None => handle.response().await,
        };
        response.with_context(|| format!("request '{method}' failed"))
    }

    async fn watch(
        &self,
        topic: &str,
        filter: Value,
        count: Option<usize>,
        render: fn(&Value) -> String,
    ) -> Result<()> {
        let (handle, mut rx) = self.io.subscribe_channel(topic, filter)?;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut seen = 0_usize;

        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                event = rx.recv() => match event {
                    Some(SubscriptionEvent::Update(value)) => {
                        println!("{}", render(&value));
                        seen += 1;
                        if count.is_some_and(|n| seen >= n) {
                            break;
                        }
                    }
                    Some(SubscriptionEvent::Removed) => bail!("server removed subscription '{topic}'"),
                    None => break,
                },
            }
        }

        tokio::time::timeout(CANCEL_TIMEOUT, handle.cancel())
            .await
            .context("timed out unsubscribing")?
            .context("failed to unsubscribe")?;
        debug!(topic, updates = seen, "watch finished");
        Ok(())
    }

    async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Request { method, data } => {
                let data = parse_json(data.as_deref(), "data")?;
                let value = self.call(&method, data).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Command::Watch {
                topic,
                filter,
                count,
            } => {
                let filter = parse_json(filter.as_deref(), "filter")?;
                self.watch(&topic, filter, count, |value| value.to_string()).await?;
            }
            Command::Devices { count } => {
                self.watch("ccdiscovery", json!({}), count, render::devices).await?;
            }
            Command::Library => {
                let handle = self.io.subscribe("listfiles", json!({}), opsa_client::NoopHandler)?;
                let value = handle.wait().await.context("library subscription failed")?;
                println!("{}", render::library(&value));
                tokio::time::timeout(CANCEL_TIMEOUT, handle.cancel())
                    .await
                    .context("timed out unsubscribing")??;
            }
            Command::Play { file_id, device } => {
                let _ = self
                    .call(
                        "playfile",
                        json!({"chromecast_uuid": device, "file_id": file_id}),
                    )
                    .await?;
                println!("playing {file_id} on {device}");
            }
            Command::PlayLocal { file_id, audio } => {
                let value = self
                    .call(
                        "playlocal",
                        json!({"file_id": file_id, "audio_stream_index": audio}),
                    )
                    .await?;
                match value.get("url").and_then(Value::as_str) {
                    Some(url) => println!("{url}"),
                    None => bail!("server could not host file {file_id}"),
                }
            }
            Command::Status => {
                println!("attached: {}", self.io.is_attached());
                println!("pending requests: {}", self.io.pending_requests().len());
                for request in self.io.pending_requests() {
                    println!("  #{} {} ({:?})", request.index, request.method, request.state);
                }
                let subscriptions = self.io.active_subscriptions();
                println!("active subscriptions: {}", subscriptions.len());
                for sub in subscriptions {
                    println!("  {} {} ({})", sub.id, sub.topic, sub.state);
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = opsa_settings::load_settings().context("failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("invalid settings")?;

    if settings.logging.json {
        opsa_logging::init_json_subscriber(&settings.logging.level);
    } else {
        opsa_logging::init_subscriber(&settings.logging.level);
    }

    let config = connection_config(&settings);
    let attempts = config.max_attempts;
    let connector = Arc::new(WsConnector::from_config(&config));
    let manager = ConnectionManager::new(ServerIo::new(), connector, config);
    report_connection(&manager);

    manager
        .connect_with_retry(attempts)
        .await
        .with_context(|| format!("failed to connect to {}", settings.server.url))?;

    let app = App {
        io: manager.io().clone(),
        timeout: request_timeout(&settings),
    };
    let outcome = app.run(cli.command).await;
    manager.shutdown();
    outcome
}
