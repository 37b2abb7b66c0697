use anyhow::Result;
use clap::Parser;
use storyshare_chat::{api, auth, config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cfg.logging_enabled {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    if let Some(user_id) = cli.issue_token {
        let secret = auth::load_or_create_secret(&cfg.auth_file()).await?;
        println!("{}", auth::issue_jwt(&secret, user_id, time::Duration::days(30))?);
        return Ok(());
    }
    api::run_http_server(cfg).await
}
