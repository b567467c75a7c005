use clap::Parser;
use credentials::AuthenticatorConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gen_config", version, about = "Writes a default authenticator config file")]
struct Args {
    /// Path to the config file to create.
    config_file: PathBuf,

    /// Whether unregistered screennames may connect as ephemeral guests.
    #[arg(long)]
    allow_ephemeral: bool,
}

fn main() {
    let args = Args::parse();

    let config = AuthenticatorConfig { allow_ephemeral: args.allow_ephemeral };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&args.config_file)
        .expect("failed to open config file");

    serde_json::to_writer_pretty(file, &config).expect("config serialization failed");
}
