use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use eyeglass_provision::{
    conf::{AppConfig, DEFAULT_CONFIG_FILE},
    provision::Provisioner,
    schema::{AdminPrincipal, Schema},
    utils::{db::connect, enums::ExistingPolicy, o11y::build_subscriber},
    verify::verify,
};

#[derive(Parser)]
#[command(about = "Provision the eyeglass recommendation MongoDB database")]
struct Cli {
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE, help = "Path to the configuration file")]
    config: String,

    #[arg(long, value_enum, help = "Override provision.on_existing from the config file")]
    on_existing: Option<ExistingPolicy>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Create the admin user, collections and indexes (default)
    Apply,
    /// Compare the live database with the declared schema
    Verify,
    /// Print the declared schema without connecting
    Plan,
}

async fn apply(config: &AppConfig, schema: &Schema, policy: ExistingPolicy) -> anyhow::Result<()> {
    schema.validate().context("declared schema is invalid")?;
    let admin = AdminPrincipal::from_config(config, schema)
        .context("failed to resolve the admin password")?;
    let client = connect(&config.database, &config.retry).await?;

    let summary = Provisioner::new(&client, schema, &admin, policy)
        .run()
        .await
        .context("provisioning failed")?;
    info!(summary = %serde_json::to_string(&summary)?, "done");
    Ok(())
}

async fn check(config: &AppConfig, schema: &Schema) -> anyhow::Result<()> {
    let client = connect(&config.database, &config.retry).await?;
    let report = verify(
        &client,
        schema,
        &config.admin.username,
        &config.database.auth_database,
    )
    .await?;

    if report.is_ok() {
        info!(database = %schema.database, "database matches the declared schema");
        return Ok(());
    }
    for finding in report.findings() {
        warn!("{}", finding);
    }
    bail!("database {} has drifted from the declared schema", schema.database)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = build_subscriber().context("failed to build subscriber")?;
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Cli::parse();
    let command = args.command.unwrap_or(Command::Apply);

    let config = AppConfig::from_path(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;
    let policy = args.on_existing.unwrap_or(config.provision.on_existing);
    let schema = Schema::for_database(&config.database.name);

    match command {
        Command::Apply => apply(&config, &schema, policy).await,
        Command::Verify => check(&config, &schema).await,
        Command::Plan => {
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}
