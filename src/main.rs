//! mailforge CLI: turn a leads CSV into reviewed outreach email drafts.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use mailforge::campaign::{self, CampaignOptions, RecipientMode};
use mailforge::config::Config;
use mailforge::knowledge;
use mailforge::llm::{LlmGateway, LlmPolicy, VariantMode};
use mailforge::profile::load_parent_profile;
use mailforge::store::Store;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mailforge", about = "Campaign generation engine for outreach emails", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage parent company profiles
    Parent {
        #[command(subcommand)]
        command: ParentCommand,
    },
    /// Manage RAG knowledge
    Knowledge {
        #[command(subcommand)]
        command: KnowledgeCommand,
    },
    /// Run and manage campaigns
    Campaign {
        #[command(subcommand)]
        command: CampaignCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ParentCommand {
    /// Register or update a parent profile from a TOML file
    Register {
        /// Parent slug
        #[arg(long)]
        slug: String,
        /// TOML profile path
        #[arg(long)]
        profile: PathBuf,
    },
    /// List registered parent profiles
    List,
}

#[derive(Subcommand, Debug)]
enum KnowledgeCommand {
    /// Ingest a knowledge file (Markdown or plain text)
    Ingest {
        /// Parent slug
        #[arg(long)]
        slug: String,
        /// Path to the knowledge file
        #[arg(long)]
        file: PathBuf,
        /// Knowledge kind
        #[arg(long, default_value = "marketing")]
        kind: String,
    },
    /// List ingested knowledge documents
    List {
        /// Parent slug
        #[arg(long)]
        slug: String,
    },
}

#[derive(Subcommand, Debug)]
enum CampaignCommand {
    /// Run a campaign from a leads CSV
    Run(RunArgs),
    /// Show a campaign's summary and record counts
    Status {
        /// Campaign id
        #[arg(long)]
        campaign_id: String,
    },
    /// Export a persisted campaign's rows to CSV
    Export {
        /// Campaign id
        #[arg(long)]
        campaign_id: String,
        /// Output path
        #[arg(long)]
        out: PathBuf,
        /// Export schema: auto, ab, abc
        #[arg(long, default_value = "auto")]
        output_schema: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Parent slug
    #[arg(long)]
    slug: String,
    /// Leads CSV path
    #[arg(long)]
    leads: PathBuf,
    /// Output directory
    #[arg(long, default_value = "reports/campaigns")]
    out_dir: PathBuf,
    /// Recipient granularity: company or row
    #[arg(long, default_value = "company")]
    recipient_mode: String,
    /// Generated variant set: ab or abc
    #[arg(long, default_value = "ab")]
    variant_mode: String,
    /// Output schema used for the export: ab or abc
    #[arg(long, default_value = "ab")]
    output_schema: String,
    /// LLM error policy: strict or fallback
    #[arg(long, default_value = "strict")]
    llm_policy: String,
    /// Enrichment intensity: auto, minimal or web
    #[arg(long, default_value = "auto")]
    enrichment_mode: String,
    /// Max concurrent workers
    #[arg(long, default_value_t = 5)]
    max_concurrency: usize,
    /// Retries for transient LLM errors
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    /// Exponential backoff base in seconds
    #[arg(long, default_value_t = 1.0)]
    backoff_base_seconds: f64,
    /// Pre-run cost cap in EUR
    #[arg(long, default_value_t = 50.0)]
    cost_cap_eur: f64,
    /// Run even when the estimated cost exceeds the cap
    #[arg(long)]
    force_cost_override: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MAILFORGE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load();
    let store = Arc::new(Store::open(&config.data_dir)?);
    let gateway = Arc::new(LlmGateway::from_config(&config));

    match cli.command {
        Command::Parent { command } => match command {
            ParentCommand::Register { slug, profile } => {
                let parent = load_parent_profile(&profile, Some(&slug))?;
                store.upsert_parent_profile(&parent)?;
                println!("Parent profile upserted: {}", parent.slug);
            }
            ParentCommand::List => {
                let profiles = store.list_parent_profiles()?;
                if profiles.is_empty() {
                    println!("No parent profiles registered.");
                }
                for profile in profiles {
                    println!("{} -> {}", profile.slug, profile.company_name);
                }
            }
        },
        Command::Knowledge { command } => match command {
            KnowledgeCommand::Ingest { slug, file, kind } => {
                if store.get_parent_profile(&slug)?.is_none() {
                    anyhow::bail!("parent slug not found: {slug}");
                }
                let result =
                    knowledge::ingest_knowledge_file(&store, &gateway, &slug, &file, &kind).await?;
                println!(
                    "Knowledge ingested for {}: {} | chunks={} | embeddings={}",
                    result.parent_slug, result.source_path, result.chunks_total,
                    result.embeddings_used
                );
            }
            KnowledgeCommand::List { slug } => {
                let documents = store.list_knowledge_documents(&slug)?;
                if documents.is_empty() {
                    println!("No documents found.");
                }
                for document in documents {
                    println!(
                        "{} | {} | {} | {}",
                        document.id, document.kind, document.source_path, document.created_at
                    );
                }
            }
        },
        Command::Campaign { command } => match command {
            CampaignCommand::Run(args) => {
                let options = CampaignOptions {
                    parent_slug: args.slug,
                    leads_csv_path: args.leads,
                    out_dir: args.out_dir,
                    recipient_mode: RecipientMode::from_str(&args.recipient_mode)?,
                    variant_mode: VariantMode::from_str(&args.variant_mode)?,
                    output_schema: args.output_schema,
                    llm_policy: LlmPolicy::from_str(&args.llm_policy)?,
                    enrichment_mode: args.enrichment_mode,
                    max_concurrency: args.max_concurrency,
                    max_retries: args.max_retries,
                    backoff_base_seconds: args.backoff_base_seconds,
                    cost_cap_eur: args.cost_cap_eur,
                    force_cost_override: args.force_cost_override,
                };
                let (summary, export_path, _) =
                    campaign::run_campaign(&config, store, gateway, &options).await?;

                println!("Campaign completed: {}", summary.campaign_id);
                println!(
                    "Companies: {} | generated: {} | warnings: {}",
                    summary.companies_total, summary.generated_total, summary.warnings_total
                );
                println!("Local export: {}", export_path.display());
                println!(
                    "Rows: total={} valid={} skipped={} ok={} failed={}",
                    summary.rows_total,
                    summary.rows_valid,
                    summary.rows_skipped,
                    summary.rows_generated_ok,
                    summary.rows_failed
                );
                println!(
                    "Costs: estimated={:.2} EUR actual={:.2} EUR",
                    summary.estimated_cost_eur, summary.actual_cost_eur
                );
            }
            CampaignCommand::Status { campaign_id } => {
                match campaign::campaign_status(&store, &campaign_id)? {
                    Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                    None => {
                        println!("Campaign not found");
                        std::process::exit(1);
                    }
                }
            }
            CampaignCommand::Export { campaign_id, out, output_schema } => {
                let path =
                    campaign::export_campaign(&store, &campaign_id, &out, &output_schema)?;
                println!("Campaign exported: {}", path.display());
            }
        },
    }

    Ok(())
}
