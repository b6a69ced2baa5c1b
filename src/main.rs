mod artifact_cache;
mod backend;
mod config;
mod error;
mod formats;
mod handlers;
mod i18n;
mod jobs;
mod messenger;
mod normalize;
mod pipeline;
mod scheduler;
mod store;
mod tokens;
mod tools;

use crate::{
    backend::YtDlpClient, config::Config, error::AppError, messenger::TelegramMessenger,
    pipeline::DeliveryPipeline, store::JsonUserStore,
};
use handlers::{build_handler, AppServices};
use std::{sync::Arc, time::Duration};
use teloxide::{net::default_reqwest_settings, prelude::*};
use tracing::{error, info, instrument, warn, Instrument};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    if let Err(err) = run().await {
        eprintln!("fatal error: {err}");
        error!(error = %err, "Application terminated with fatal error");
        return Err(err);
    }
    info!("Application shutdown complete");
    Ok(())
}

#[instrument]
async fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    dotenv::dotenv().ok();
    info!("Initializing media delivery bot");

    let config = Arc::new(Config::from_env()?);

    let client = default_reqwest_settings()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(600))
        .build()
        .map_err(|e| {
            error!(error = %e, "Failed to build HTTP client");
            e
        })?;

    let bot = build_bot(&config, client.clone())?;
    info!(local_api = config.local_bot_api_url.is_some(), "Telegram bot initialized");

    let ytdlp = Arc::new(YtDlpClient::new(config.ytdlp.clone(), client.clone()));
    let messenger = Arc::new(TelegramMessenger::new(bot.clone()));
    let pipeline = Arc::new(DeliveryPipeline::new(&config, ytdlp.clone(), messenger));
    let users = Arc::new(JsonUserStore::open(config.data_dir.clone()).await?);
    let services = AppServices::new(config.clone(), pipeline, ytdlp, users, client);
    info!("Application services initialized");

    let mut dispatcher = Dispatcher::builder(bot, build_handler())
        .dependencies(dptree::deps![services])
        .build();

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown");
            if let Ok(wait) = shutdown_token.shutdown() {
                wait.await;
                info!("Graceful shutdown completed");
            } else {
                warn!("Failed to initiate graceful shutdown");
            }
        }
        .in_current_span(),
    );

    info!("Starting dispatcher event loop");
    dispatcher.dispatch().await;
    info!("Dispatcher stopped");
    Ok(())
}

/// `TELOXIDE_TOKEN` as teloxide expects it, with `BOT_TOKEN` accepted as well.
fn build_bot(config: &Config, client: reqwest::Client) -> Result<Bot, AppError> {
    let token = std::env::var("TELOXIDE_TOKEN")
        .or_else(|_| std::env::var("BOT_TOKEN"))
        .map_err(|_| AppError::Config("TELOXIDE_TOKEN or BOT_TOKEN must be set".into()))?;
    let mut bot = Bot::with_client(token.trim(), client);
    if let Some(api_url) = &config.local_bot_api_url {
        let url = url::Url::parse(api_url)
            .map_err(|e| AppError::Config(format!("LOCAL_BOT_API_URL is invalid: {e}")))?;
        bot = bot.set_api_url(url);
    }
    Ok(bot)
}

#[cfg(unix)]
#[instrument]
async fn shutdown_signal() {
    let term = signal(SignalKind::terminate());
    let interrupt = signal(SignalKind::interrupt());
    match (term, interrupt) {
        (Ok(mut term), Ok(mut interrupt)) => {
            tokio::select! {
                _ = term.recv() => {
                    info!("Received SIGTERM signal");
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT signal");
                }
            }
        }
        (Ok(mut term), Err(err)) => {
            warn!(error = %err, "Failed to register SIGINT handler, falling back to SIGTERM only");
            let _ = term.recv().await;
        }
        (Err(err), Ok(mut interrupt)) => {
            warn!(error = %err, "Failed to register SIGTERM handler, falling back to SIGINT only");
            let _ = interrupt.recv().await;
        }
        (Err(term_err), Err(int_err)) => {
            error!(sigterm_error = %term_err, sigint_error = %int_err, "Failed to register signal handlers, waiting for Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
#[instrument]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C signal");
}
