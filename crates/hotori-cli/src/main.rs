use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hotori_core::{DealListFilters, DealSortKey};
use hotori_storage::{open_store, PgStore, StoreConfig};
use hotori_web::{AppState, WebConfig};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hotori")]
#[command(about = "Hotori hot-deal viewer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Print the deal list as JSON.
    Deals {
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long)]
        source: Option<String>,
        /// Repeatable.
        #[arg(long = "category")]
        category_ids: Vec<i64>,
        #[arg(long)]
        exclude_sold_out: bool,
        #[arg(long, value_enum, default_value_t = SortArg::Latest)]
        sort: SortArg,
    },
    /// Print one deal with its full history as JSON.
    Deal { id: i64 },
    /// Print the public category list as JSON.
    Categories,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortArg {
    Latest,
    Views,
    Votes,
    Comments,
}

impl From<SortArg> for DealSortKey {
    fn from(value: SortArg) -> Self {
        match value {
            SortArg::Latest => DealSortKey::Latest,
            SortArg::Views => DealSortKey::Views,
            SortArg::Votes => DealSortKey::Votes,
            SortArg::Comments => DealSortKey::Comments,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    debug!(
        crates = ?[hotori_core::CRATE_NAME, hotori_storage::CRATE_NAME, hotori_web::CRATE_NAME],
        "starting hotori"
    );
    let store_config = StoreConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { host: None, port: None }) {
        Commands::Serve { host, port } => {
            let mut web_config = WebConfig::from_env();
            if let Some(host) = host {
                web_config.host = host;
            }
            if let Some(port) = port {
                web_config.port = port;
            }
            let store = open_store(&store_config).await?;
            hotori_web::serve(AppState::new(store), web_config).await?;
        }
        Commands::Migrate => {
            let url = store_config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let store = PgStore::connect(url, store_config.max_connections).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Deals {
            query,
            source,
            category_ids,
            exclude_sold_out,
            sort,
        } => {
            let filters = DealListFilters {
                query,
                source,
                category_ids,
                exclude_sold_out,
                sort: sort.into(),
            }
            .normalized();
            let store = open_store(&store_config).await?;
            let deals = store.list_deals(&filters).await?;
            println!("{}", serde_json::to_string_pretty(&deals)?);
        }
        Commands::Deal { id } => {
            let store = open_store(&store_config).await?;
            let detail = store
                .deal_detail(id)
                .await?
                .with_context(|| format!("deal {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        Commands::Categories => {
            let store = open_store(&store_config).await?;
            println!("{}", serde_json::to_string_pretty(&store.list_categories().await?)?);
        }
    }

    Ok(())
}
