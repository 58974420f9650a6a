mod api;
mod auth;
mod config;
mod constants;
mod drive;
mod format;
mod handlers;
mod state;
mod telegram;
mod transfer;

use std::{error::Error, sync::Arc};

use clap::Parser;
use teloxide::{prelude::*, utils::command::BotCommands};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::{Authenticator, ClientSecrets, FileTokenStore},
    config::Config,
    drive::DriveClient,
    handlers::message_handler,
    state::State,
};

/// These commands are supported:
#[derive(BotCommands)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    /// Display this text
    Help,
    /// Start
    Start,
}

#[derive(Parser, Debug, Default, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path of config toml file.
    #[arg(short, long)]
    pub config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_file = Args::parse()
        .config
        .or_else(|| {
            std::env::var("CONFIG_PATH")
                .ok()
                .and_then(|s| if s.is_empty() { None } else { Some(s) })
        })
        .unwrap_or_else(|| "config.toml".to_string());
    tracing::info!("Use config file: {config_file}");
    let config = Config::load(&config_file)?;
    tracing::info!("Config file {config_file} load successfully");

    // Authorization problems are fatal before the bot starts polling.
    let secrets = ClientSecrets::load_from(&config.drive.credentials_path)?;
    let token_store = Arc::new(FileTokenStore::new(&config.drive.token_cache));
    let auth = Arc::new(Authenticator::new(
        secrets,
        token_store,
        reqwest::Client::new(),
    ));
    auth.authorize().await?;
    tracing::info!("Google drive authorized");

    tokio::fs::create_dir_all(&config.transfer.temp_dir).await?;

    let bot = Bot::new(&config.telegram.token);
    let drive = Arc::new(DriveClient::new(&config, auth)?);
    let state = Arc::new(State::new(&config, Arc::new(bot.clone()), drive));

    let handler = dptree::entry().branch(Update::filter_message().endpoint(message_handler));
    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state.clone()])
        .enable_ctrlc_handler()
        .build();

    tracing::info!("Bot created and running");
    if config.api.enabled {
        tokio::try_join!(
            async {
                dispatcher.dispatch().await;
                Ok::<(), anyhow::Error>(())
            },
            api::serve(&config, state),
        )?;
    } else {
        dispatcher.dispatch().await;
    }
    Ok(())
}
