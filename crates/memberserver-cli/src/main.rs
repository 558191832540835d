// ============================================================================
// memberserver - member server daemon and store administration tool
// ============================================================================
// Usage:
//   memberserver serve                                  Run scheduler and sync
//   memberserver stats                                  Show store statistics
//   memberserver list-members | list-resources          Tabular listings
//   memberserver add-member --name N --email E          Add a member
//   memberserver assign-rfid --email E --rfid R         Assign an RFID fob
//   memberserver add-resource --name N --address URL    Register a door
//   memberserver grant|revoke --email E --resource N    Change access
//   memberserver acl --resource N                       Print ACL and hash
//   memberserver events [--limit 20]                    Recent access events
// ============================================================================

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use memberserver_core::resources::{acl_hash, canonical_acl};
use memberserver_core::{
    Config, MemberDb, MemberServer, MemberTier, MembershipEvaluator, Resource, Store,
};
use std::sync::Arc;
use tracing::{error, info};

/// Member server
#[derive(Parser)]
#[command(name = "memberserver", version, about = "Membership tiers and door access list sync")]
struct Cli {
    /// Path to the database file (default: ~/.memberserver/members.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and device sync until Ctrl-C
    Serve,

    /// Show store statistics (members per tier, resources, events)
    Stats,

    /// List all members
    ListMembers,

    /// List all resources
    ListResources,

    /// Add a member and grant the default resources
    AddMember {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// inactive, standard, classic, premium or credited
        #[arg(long, default_value = "standard")]
        tier: String,
        #[arg(long)]
        subscription_id: Option<String>,
    },

    /// Assign an RFID fob to a member
    AssignRfid {
        #[arg(long)]
        email: String,
        #[arg(long)]
        rfid: String,
    },

    /// Register a door controller
    AddResource {
        #[arg(long)]
        name: String,
        /// Base URL of the device HTTP API
        #[arg(long)]
        address: String,
        /// Grant to newly added members
        #[arg(long)]
        default: bool,
    },

    /// Grant a member access to a resource
    Grant {
        #[arg(long)]
        email: String,
        #[arg(long)]
        resource: String,
    },

    /// Revoke a member's access to a resource
    Revoke {
        #[arg(long)]
        email: String,
        #[arg(long)]
        resource: String,
    },

    /// Print a resource's canonical access list and its hash
    Acl {
        #[arg(long)]
        resource: String,
    },

    /// Show the most recent access events
    Events {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn parse_tier(s: &str) -> Result<MemberTier> {
    MemberTier::from_str(s).ok_or_else(|| {
        anyhow!(
            "Unknown tier '{}'. Valid values: inactive, standard, classic, premium, credited",
            s
        )
    })
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("memberserver_core=debug".parse()?)
                .add_directive("memberserver=debug".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if cli.db_path.is_some() {
        config.db_path = cli.db_path.clone();
    }

    let open = || -> Result<Arc<MemberDb>> { Ok(Arc::new(MemberDb::open(config.db_path.as_deref())?)) };

    match cli.command {
        Commands::Serve => {
            init_logging()?;
            cmd_serve(&config).await
        }
        Commands::Stats => cmd_stats(open()?.as_ref()),
        Commands::ListMembers => cmd_list_members(open()?.as_ref()),
        Commands::ListResources => cmd_list_resources(open()?.as_ref()),
        Commands::AddMember {
            name,
            email,
            tier,
            subscription_id,
        } => cmd_add_member(open()?, &name, &email, &tier, subscription_id).await,
        Commands::AssignRfid { email, rfid } => cmd_assign_rfid(open()?.as_ref(), &email, &rfid),
        Commands::AddResource {
            name,
            address,
            default,
        } => cmd_add_resource(open()?.as_ref(), &name, &address, default),
        Commands::Grant { email, resource } => cmd_grant(open()?.as_ref(), &email, &resource),
        Commands::Revoke { email, resource } => cmd_revoke(open()?.as_ref(), &email, &resource),
        Commands::Acl { resource } => cmd_acl(open()?.as_ref(), &resource),
        Commands::Events { limit } => cmd_events(open()?.as_ref(), limit),
    }
}

async fn cmd_serve(config: &Config) -> Result<()> {
    info!("Starting member server");
    let server = MemberServer::from_config(config)?;
    server.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }

    server.shutdown().await;
    Ok(())
}

fn cmd_stats(db: &MemberDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Member Server Database Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Members:   {} total", stats.total_members);
    for (tier, count) in &stats.members_by_tier {
        println!("  {:12} {}", tier, count);
    }
    println!("Resources: {}", stats.total_resources);
    println!("Grants:    {}", stats.total_grants);
    println!("Events:    {}", stats.total_access_events);

    Ok(())
}

fn cmd_list_members(db: &dyn Store) -> Result<()> {
    let members = db.list_members()?;

    if members.is_empty() {
        println!("No members found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:<32}  {:<10}  {:<12}  {}",
        "NAME", "EMAIL", "TIER", "RFID", "SUBSCRIPTION"
    );
    println!("{}", "-".repeat(100));

    for member in &members {
        println!(
            "{:<24}  {:<32}  {:<10}  {:<12}  {}",
            member.name.chars().take(24).collect::<String>(),
            member.email,
            member.tier.as_str(),
            member.rfid.as_deref().unwrap_or("-"),
            member.billing_subscription().unwrap_or("-")
        );
    }

    println!("\nTotal: {} members", members.len());
    Ok(())
}

fn cmd_list_resources(db: &dyn Store) -> Result<()> {
    let resources = db.list_resources()?;

    if resources.is_empty() {
        println!("No resources found.");
        return Ok(());
    }

    println!(
        "{:<20}  {:<36}  {:<8}  {}",
        "NAME", "ADDRESS", "DEFAULT", "LAST HEARTBEAT"
    );
    println!("{}", "-".repeat(90));

    for resource in &resources {
        println!(
            "{:<20}  {:<36}  {:<8}  {}",
            resource.name,
            resource.address,
            if resource.is_default { "yes" } else { "no" },
            resource
                .last_heartbeat
                .map(format_timestamp)
                .unwrap_or_else(|| "never".to_string())
        );
    }

    println!("\nTotal: {} resources", resources.len());
    Ok(())
}

async fn cmd_add_member(
    db: Arc<MemberDb>,
    name: &str,
    email: &str,
    tier: &str,
    subscription_id: Option<String>,
) -> Result<()> {
    let tier = parse_tier(tier)?;
    let evaluator = MembershipEvaluator::new(db, None, Default::default());
    let member = evaluator.add_member(name, email, tier, subscription_id).await?;
    println!("Added {} <{}> as {} (id {})", member.name, member.email, member.tier, member.id);
    Ok(())
}

fn cmd_assign_rfid(db: &dyn Store, email: &str, rfid: &str) -> Result<()> {
    let member = db.assign_rfid(email, rfid)?;
    println!("Assigned RFID {} to {}", rfid, member.email);
    Ok(())
}

fn cmd_add_resource(db: &dyn Store, name: &str, address: &str, is_default: bool) -> Result<()> {
    if db.get_resource_by_name(name)?.is_some() {
        anyhow::bail!("Resource '{}' already exists", name);
    }
    let mut resource = Resource::new(name, address);
    resource.is_default = is_default;
    db.upsert_resource(&resource)?;
    println!("Added resource {} at {} (id {})", resource.name, resource.address, resource.id);
    Ok(())
}

fn lookup(db: &dyn Store, email: &str, resource: &str) -> Result<(String, String)> {
    let member = db
        .get_member_by_email(email)?
        .ok_or_else(|| anyhow!("No member with email {}", email))?;
    let resource = db
        .get_resource_by_name(resource)?
        .ok_or_else(|| anyhow!("No resource named {}", resource))?;
    Ok((member.id, resource.id))
}

fn cmd_grant(db: &dyn Store, email: &str, resource: &str) -> Result<()> {
    let (member_id, resource_id) = lookup(db, email, resource)?;
    db.grant(&member_id, &resource_id)?;
    println!("Granted {} access to {}", email, resource);
    Ok(())
}

fn cmd_revoke(db: &dyn Store, email: &str, resource: &str) -> Result<()> {
    let (member_id, resource_id) = lookup(db, email, resource)?;
    if db.revoke(&member_id, &resource_id)? {
        println!("Revoked {} access to {}", email, resource);
    } else {
        println!("{} had no access to {}", email, resource);
    }
    Ok(())
}

fn cmd_acl(db: &dyn Store, name: &str) -> Result<()> {
    let resource = db
        .get_resource_by_name(name)?
        .ok_or_else(|| anyhow!("No resource named {}", name))?;
    let acl = canonical_acl(db.resource_acl(&resource.id)?);

    println!("Resource: {} ({})", resource.name, resource.address);
    println!("Hash:     {}", acl_hash(&acl));
    println!("Entries:  {}", acl.len());
    for rfid in &acl {
        println!("  {}", rfid);
    }
    Ok(())
}

fn cmd_events(db: &dyn Store, limit: usize) -> Result<()> {
    let events = db.list_access_events(limit)?;

    if events.is_empty() {
        println!("No access events found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:<16}  {:<12}  {:<24}  {}",
        "TIME", "RESOURCE", "RFID", "USERNAME", "KNOWN"
    );
    println!("{}", "-".repeat(90));

    for event in &events {
        println!(
            "{:<24}  {:<16}  {:<12}  {:<24}  {}",
            format_timestamp(event.timestamp),
            event.resource,
            event.rfid,
            event.username.chars().take(24).collect::<String>(),
            if event.is_known { "yes" } else { "no" }
        );
    }
    Ok(())
}
