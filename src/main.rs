use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::StreamExt;
use provider_bridge::browser::endpoint::resolve;
use provider_bridge::{
    chat_turn, login_flow, normalize_result, store_api_key, BrowserMode, BrowserSession,
    BrowserSettings, ChatBackend, ChromeSession, CredentialStore, DefaultModelRegistry,
    JsonFileStore, MessageMeta, NormalizedEvent, ProviderKind, SessionState, Timings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Credential file (defaults to the user config directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture credentials for a provider and store them
    Login {
        provider: String,
        /// API key for key-based providers
        #[arg(long, env = "MANUS_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        #[command(flatten)]
        browser: BrowserArgs,
    },
    /// Send one message and print the normalized events as JSON lines
    Chat {
        provider: String,
        message: String,
        #[arg(long, default_value = "default")]
        model: String,
        /// Continue an existing conversation (or task)
        #[arg(long)]
        conversation: Option<String>,
        /// Override the task API base URL
        #[arg(long)]
        task_api: Option<String>,
        #[command(flatten)]
        browser: BrowserArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct BrowserArgs {
    /// Launch a managed Chrome instead of attaching to a running one
    #[arg(long)]
    launch: bool,
    /// Remote debugging port
    #[arg(long, default_value_t = provider_bridge::config::DEFAULT_CDP_PORT)]
    cdp_port: u16,
    /// Explicit DevTools control URL
    #[arg(long)]
    cdp_url: Option<String>,
    /// Chrome executable for --launch
    #[arg(long)]
    chrome_path: Option<PathBuf>,
    #[arg(long)]
    headless: bool,
    #[arg(long)]
    no_sandbox: bool,
    /// Leave a launched Chrome running afterwards
    #[arg(long)]
    keep_alive: bool,
}

impl BrowserArgs {
    fn settings(&self) -> BrowserSettings {
        BrowserSettings {
            mode: if self.launch {
                BrowserMode::Launch
            } else {
                BrowserMode::Attach
            },
            cdp_port: self.cdp_port,
            cdp_url: self.cdp_url.clone(),
            chrome_path: self.chrome_path.clone(),
            headless: self.headless,
            no_sandbox: self.no_sandbox,
            keep_alive: self.keep_alive,
        }
    }
}

fn progress(message: &str) {
    eprintln!("{}", message);
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let store = match &args.store {
        Some(path) => JsonFileStore::new(path.clone()),
        None => JsonFileStore::default_location()?,
    };
    log::debug!("Using credential store {}", store.path().display());
    let timings = Timings::default();

    match args.command {
        Command::Login {
            provider,
            api_key,
            browser,
        } => {
            let provider: ProviderKind = provider.parse()?;
            if provider.capture_policy().is_none() {
                let key = api_key.context("an API key is required (--api-key or MANUS_API_KEY)")?;
                store_api_key(provider, &key, &store)?;
            } else {
                login_flow(provider, &browser.settings(), &timings, &store, &progress)
                    .await
                    .with_context(|| format!("{} login failed", provider))?;
            }
            eprintln!("Credentials for {} saved to {}", provider, store.path().display());
        }
        Command::Chat {
            provider,
            message,
            model,
            conversation,
            task_api,
            browser,
        } => {
            let provider: ProviderKind = provider.parse()?;
            let bundle = store
                .load(provider.id())?
                .with_context(|| {
                    format!("no credentials for {}; run `login {}` first", provider, provider)
                })?;

            let mut state = SessionState {
                conversation_id: conversation,
            };
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            // Resolved browser is kept so a launched one is released afterwards
            let mut resolved = None;
            let backend = if provider.site().is_some() {
                let settings = browser.settings();
                let found = resolve(&settings, &timings, &progress).await?;
                let session = match connect_site(provider, &found.endpoint).await {
                    Ok(session) => session,
                    Err(e) => {
                        if let Err(release) = found.release().await {
                            log::warn!("[{}] Failed to release browser: {}", provider, release);
                        }
                        return Err(e);
                    }
                };
                resolved = Some(found);
                ChatBackend::web(provider, session, &bundle, timings.clone()).await
            } else if provider.capture_policy().is_none() {
                ChatBackend::task(provider, &bundle, timings.clone(), task_api.as_deref())
            } else {
                Err(provider_bridge::BridgeError::Unsupported(format!(
                    "{} has no chat transport",
                    provider
                )))
            };

            let printed = match backend {
                Ok(backend) => {
                    let mut events = chat_turn(
                        &backend,
                        &DefaultModelRegistry,
                        &model,
                        &message,
                        &mut state,
                        cancel,
                    )
                    .await;
                    let mut printed = Ok(());
                    while let Some(event) = events.next().await {
                        if printed.is_ok() {
                            printed = print_event(&event);
                        }
                    }
                    printed
                }
                Err(e) => {
                    log::error!("[{}] {}", provider, e);
                    normalize_result(Err(e), MessageMeta::new(provider.id(), &model))
                        .iter()
                        .try_for_each(print_event)
                }
            };

            if let Some(id) = &state.conversation_id {
                eprintln!("conversation: {}", id);
            }
            if let Some(found) = resolved {
                found.release().await?;
            }
            printed?;
        }
    }

    Ok(())
}

fn print_event(event: &NormalizedEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

/// Attach to the browser, preferring a tab that already shows the site
async fn connect_site(
    provider: ProviderKind,
    endpoint: &provider_bridge::BrowserEndpoint,
) -> Result<Arc<dyn BrowserSession>> {
    let mut session = ChromeSession::connect(endpoint)
        .await
        .context("failed to attach to Chrome")?;
    if let Some(site) = provider.site() {
        if let Some(page) = session.find_page(&site.host).await {
            log::info!("[{}] Reusing open {} tab", provider, site.host);
            session.use_page(page);
        }
    }
    Ok(Arc::new(session))
}
