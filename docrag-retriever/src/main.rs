use anyhow::Context;
use clap::{Parser, Subcommand};
use docrag_retriever::retrieval::indexing_pipeline::BuildRequest;
use docrag_retriever::retrieval::retrieval_service::RetrievalQuery;
use docrag_retriever::storage::{VectorStore, open_store};
use docrag_retriever::{DocragConfig, Services};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Build and query the docrag documentation index.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; built-in defaults are used when omitted
    #[arg(short, long, env = "DOCRAG_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overriding [database].url
    #[arg(long, env = "DOCRAG_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scrape, embed and deploy a new index generation
    Build {
        /// Page to index (repeatable); defaults to [indexing].urls
        #[arg(long = "url")]
        urls: Vec<String>,
        /// Chunk granularities (comma-separated); must be a subset of [indexing].granularities
        #[arg(long, value_delimiter = ',')]
        granularities: Vec<usize>,
        /// Texts per embedding call
        #[arg(long)]
        bucket_size: Option<usize>,
        /// Refuse to deploy when no live generation exists yet
        #[arg(long)]
        no_bootstrap: bool,
    },
    /// Retrieve the documents nearest to a query
    Search {
        /// Query text
        text: String,
        /// Granularity to search; snapped to the nearest configured one
        #[arg(long)]
        content_length: Option<i64>,
        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<i64>,
        /// Omit chunk contents from the output
        #[arg(long)]
        no_content: bool,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show the live generation and staging state
    Status {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = DocragConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Commands::Status { format } = &args.command {
        let store = open_store(&config.database, &config.indexing).await?;
        return print_status(store.as_ref(), format).await;
    }
    let services = Services::from_config(config)
        .await
        .context("initializing docrag")?;

    match args.command {
        Commands::Build {
            urls,
            granularities,
            bucket_size,
            no_bootstrap,
        } => {
            let request = BuildRequest {
                urls: (!urls.is_empty()).then_some(urls),
                granularities: (!granularities.is_empty()).then_some(granularities),
                bucket_size,
                allow_bootstrap: no_bootstrap.then_some(false),
            };
            let report = services.pipeline.run(request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Search {
            text,
            content_length,
            limit,
            no_content,
            format,
        } => {
            let query = RetrievalQuery {
                text,
                content_length,
                limit,
                include_content: !no_content,
            };
            let documents = services.retrieval.retrieve(&query).await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&documents)?);
                }
                OutputFormat::Summary => {
                    println!("Found {} documents:", documents.len());
                    for (rank, doc) in documents.iter().enumerate() {
                        println!(
                            "  {}. [{:.4}] {} ({})",
                            rank + 1,
                            doc.distance,
                            doc.title.as_deref().unwrap_or("untitled"),
                            doc.url
                        );
                        if let Some(content) = &doc.content {
                            println!(
                                "     {}",
                                content.chars().take(100).collect::<String>()
                            );
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Status { .. } => Ok(()),
    }
}

async fn print_status(store: &dyn VectorStore, format: &OutputFormat) -> anyhow::Result<()> {
    let status = store.status().await?;
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OutputFormat::Summary => {
            println!("Backend: {}", status.backend);
            match &status.live {
                Some(live) => {
                    println!(
                        "Live generation: {} ({} rows, model {}, {} dimensions, {} lists)",
                        live.generation,
                        live.row_count,
                        live.model,
                        live.dimension,
                        live.effective_lists
                    );
                    for (granularity, rows) in &status.rows_by_granularity {
                        println!("  content_length {granularity}: {rows} rows");
                    }
                }
                None => println!("Live generation: none (index not built yet)"),
            }
            println!(
                "Staging: {}",
                if status.staging_present { "present" } else { "absent" }
            );
        }
    }
    Ok(())
}
