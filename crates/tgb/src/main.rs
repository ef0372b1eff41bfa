use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use tgb_core::{
    auth::{SessionAuthenticator, TerminalInput},
    config::Config,
    contacts::{self, digits_only, RawContacts},
    dispatch::{BulkSendRequest, DispatchLoop},
    domain::ImageRef,
    events::{EventSink, TracingEvents},
    ledger::{ResendFilter, SendLedger},
    ports::ProtocolClient,
    utils::{DeliveryLog, SessionStore},
};
use tgb_gateway::{GatewayClient, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "tgb")]
#[command(about = "Send a personalized Telegram message to a list of contacts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in interactively and store the resumable session
    Login,

    /// Send to every contact in a CSV or JSON file
    Send {
        /// Contact list (.csv with a phone column, or .json array of rows)
        #[arg(short, long)]
        contacts: PathBuf,

        /// Message used when a contact row has none
        #[arg(short, long)]
        message: Option<String>,

        /// Read the default message from a file
        #[arg(long, conflicts_with = "message")]
        message_file: Option<PathBuf>,

        /// Default image attached to every message
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Pause between contacts, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Only send to contacts with no successful delivery in the last N days
        #[arg(long)]
        not_sent_within_days: Option<u32>,

        /// Cap on contacts selected by --not-sent-within-days (default 1000)
        #[arg(long, requires = "not_sent_within_days")]
        limit: Option<usize>,
    },

    /// Export the account's own contacts as JSON rows usable by `send`
    ImportContacts {
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tgb_core::logging::init("tgb")?;
    let cli = Cli::parse();

    let cfg = Config::load()?;
    let store = SessionStore::new(&cfg.session_file);
    let session = store.load()?.or_else(|| cfg.session.clone());

    let client: Arc<dyn ProtocolClient> = Arc::new(GatewayClient::new(
        GatewayConfig::from_config(&cfg, session),
    )?);
    let events: Arc<dyn EventSink> = Arc::new(TracingEvents);

    // Every command needs an authorized client; a valid stored session skips the prompts.
    authenticate(client.as_ref(), events.clone(), &store).await?;

    match cli.command {
        Command::Login => Ok(()),
        Command::Send {
            contacts,
            message,
            message_file,
            image,
            delay_ms,
            not_sent_within_days,
            limit,
        } => {
            let message = match message_file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => message.or_else(|| cfg.default_message.clone()).unwrap_or_default(),
            };
            let image = image.or_else(|| cfg.default_image.clone());
            let delay = delay_ms.map(Duration::from_millis).unwrap_or(cfg.send_delay);
            let resend = not_sent_within_days.map(|days| ResendFilter::new(days, limit));
            let opts = SendOptions {
                contacts,
                resend,
                message,
                image,
                delay,
            };
            send(&cfg, client, events, opts).await
        }
        Command::ImportContacts { out } => import_contacts(client.as_ref(), out).await,
    }
}

async fn authenticate(
    client: &dyn ProtocolClient,
    events: Arc<dyn EventSink>,
    store: &SessionStore,
) -> anyhow::Result<()> {
    let auth = SessionAuthenticator::new(Arc::new(TerminalInput::new()), events);
    let token = auth.authenticate(client).await?;
    store.save(&token)?;
    tracing::info!("Session saved to {}", store.path().display());
    Ok(())
}

struct SendOptions {
    contacts: PathBuf,
    resend: Option<ResendFilter>,
    message: String,
    image: Option<PathBuf>,
    delay: Duration,
}

async fn send(
    cfg: &Config,
    client: Arc<dyn ProtocolClient>,
    events: Arc<dyn EventSink>,
    opts: SendOptions,
) -> anyhow::Result<()> {
    let sink = DeliveryLog::new(&cfg.delivery_log_path, cfg.delivery_log_json);

    let mut source = contacts::load_contacts_file(&opts.contacts)?;
    if let Some(filter) = opts.resend {
        let all = contacts::normalize(&source)?;
        let ledger = SendLedger::from_log(&sink)?;
        let total = all.len();
        let due = filter.select(all, &ledger, chrono::Utc::now());
        tracing::info!(
            "{} of {} contacts are due (known senders: {})",
            due.len(),
            total,
            ledger.len()
        );
        if due.is_empty() {
            anyhow::bail!("no contacts are due for a message");
        }
        source = RawContacts::Records(due);
    }

    let dispatch = Arc::new(DispatchLoop::new(client, events));

    let stopper = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move {
            let stop = async move {
                dispatch.stop().await;
            };
            if watch_interrupts(tokio::signal::ctrl_c, stop).await {
                tracing::warn!("Second interrupt, exiting without waiting for the current send.");
                std::process::exit(130);
            }
        })
    };

    let report = dispatch
        .start(
            BulkSendRequest {
                source,
                message_template: opts.message,
                default_image: opts.image.map(ImageRef::Path),
                delay: opts.delay,
            },
            &sink,
        )
        .await;
    stopper.abort();
    let report = report?;

    tracing::info!(
        total = report.total,
        sent = report.succeeded,
        skipped = report.skipped,
        failed = report.failed,
        flood_waits = report.rate_limit_pauses,
        stopped = report.stopped,
        "delivery log: {}",
        sink.path().display()
    );
    if report.sink_failures > 0 {
        tracing::warn!(
            "{} outcomes could not be written to the delivery log",
            report.sink_failures
        );
    }
    Ok(())
}

/// First interrupt runs `stop`; returns true once a second interrupt arrives.
async fn watch_interrupts<I, F, S>(mut interrupt: I, stop: S) -> bool
where
    I: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
    S: Future<Output = ()>,
{
    if interrupt().await.is_err() {
        return false;
    }
    stop.await;
    interrupt().await.is_ok()
}

async fn import_contacts(client: &dyn ProtocolClient, out: PathBuf) -> anyhow::Result<()> {
    let users = client.list_contacts().await?;
    let rows: Vec<_> = users
        .iter()
        .filter_map(|u| {
            let phone = digits_only(u.phone.as_deref()?);
            (!phone.is_empty()).then(|| json!({ "phone": phone, "name": u.display_name() }))
        })
        .collect();

    std::fs::write(&out, serde_json::to_string_pretty(&rows)?)
        .with_context(|| format!("writing {}", out.display()))?;
    tracing::info!(
        "Import finished! {} contacts written to {}",
        rows.len(),
        out.display()
    );
    Ok(())
}
