use anyhow::{Context, Result};
use clap::Parser;
use docrag_retriever::DocragConfig;
use docrag_server::{ServerConfig, run_server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Serve docrag indexing, retrieval and RAG over HTTP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind (host:port)
    #[arg(long, env = "DOCRAG_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// TOML configuration file; built-in defaults are used when omitted
    #[arg(short, long, env = "DOCRAG_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overriding [database].url
    #[arg(long, env = "DOCRAG_DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = DocragConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }

    run_server(ServerConfig { bind: args.bind }, config).await
}
