mod art;
mod config;
mod fdo;
mod net;

use clap::Parser;
use common::logging::init_root_logger;
use config::ServerConfig;
use credentials::{AuthenticatorConfig, InMemoryCredentialStore, UsersFile};
use p3core::context::Services;
use p3core::convid::ConversationIdManager;
use p3core::guest::EphemeralGuestRegistry;
use p3core::ports::NullBotPipeline;
use p3core::registry::UserRegistry;
use slog::{info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "p3server", version, about = "P3 client-line-protocol server")]
struct Args {
    /// Path to the server's JSON config file.
    #[arg(long, default_value = "server_config.json")]
    config: PathBuf,

    /// Overrides the listen address from the config file.
    #[arg(long)]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = ServerConfig::load(&args.config).unwrap_or_else(|err| {
        eprintln!("failed to load {:?} ({err}), falling back to defaults", args.config);
        ServerConfig::default()
    });
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }

    let logger = init_root_logger(config.log_level());

    let auth_config = std::fs::read_to_string(&config.auth_config_file)
        .ok()
        .and_then(|raw| serde_json::from_str::<AuthenticatorConfig>(&raw).ok())
        .unwrap_or_default();

    let credentials = InMemoryCredentialStore::load(&config.users_file).unwrap_or_else(|err| {
        warn!(logger, "failed to load users file, starting with no registered users";
            "path" => ?config.users_file, "error" => %err);
        InMemoryCredentialStore::new(UsersFile::default().users)
    });

    if let Err(err) = std::fs::create_dir_all(&config.upload_root) {
        warn!(logger, "failed to create upload directory"; "path" => ?config.upload_root, "error" => %err);
    }

    let services = Arc::new(Services {
        registry: Arc::new(UserRegistry::new(logger.clone())),
        conv_ids: Arc::new(ConversationIdManager::new()),
        guests: Arc::new(EphemeralGuestRegistry::new()),
        bots: Arc::new(NullBotPipeline),
        fdo: Arc::new(fdo::FilesystemFdoCompiler::new(config.fdo_template_root.clone())),
        art: Arc::new(art::FilesystemArtStore::new(config.art_store_root.clone())),
        credentials: Arc::new(credentials),
        idb_reference: Mutex::new(std::collections::HashMap::new()),
        burst: config.burst,
        co_timeout_secs: config.co_timeout_secs,
        xfer_xg_timeout_secs: config.xfer_xg_timeout_secs,
        allow_ephemeral: auth_config.allow_ephemeral,
        upload_root: config.upload_root.clone(),
        recent_events: Mutex::new(protocol::ring::RingBuffer::new(256)),
        logger: logger.clone(),
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {}: {err}", config.listen_addr));

    info!(logger, "listening"; "addr" => %config.listen_addr);
    net::run(listener, services, Arc::new(config)).await;
}
