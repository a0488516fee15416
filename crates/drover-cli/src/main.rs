mod config;
mod serve_cmd;

use clap::{Parser, Subcommand};

use drover_db::pool;

use config::DroverConfig;

#[derive(Parser)]
#[command(name = "drover", about = "Goal execution engine for remote agents")]
struct Cli {
    /// Database URL (overrides DROVER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a drover config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/drover")]
        db_url: String,
        /// Planner service base URL
        #[arg(long, default_value = config::DEFAULT_PLANNER_URL)]
        planner_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the drover database (creates it and runs migrations)
    DbInit,
    /// Run the HTTP ingress and the execution engine
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Maximum number of concurrently running steps
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Planner service base URL (overrides DROVER_PLANNER_URL env var)
        #[arg(long)]
        planner_url: Option<String>,
    },
}

/// Execute the `drover init` command: write the config file.
fn cmd_init(db_url: &str, planner_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_owned(),
        },
        planner: config::PlannerSection {
            url: planner_url.to_owned(),
        },
        engine: config::EngineSection::default(),
        agents: vec![],
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  planner.url = {planner_url}");
    println!();
    println!("Add [[agents]] entries, then run `drover db-init` to create the database.");

    Ok(())
}

/// Execute the `drover db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DroverConfig::resolve(cli_db_url, None)?;

    println!("Initializing drover database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("drover db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            planner_url,
            force,
        } => cmd_init(&db_url, &planner_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Serve {
            bind,
            port,
            max_parallel,
            planner_url,
        } => {
            let resolved =
                DroverConfig::resolve(cli.database_url.as_deref(), planner_url.as_deref())?;
            serve_cmd::run_serve(resolved, &bind, port, max_parallel).await
        }
    }
}
