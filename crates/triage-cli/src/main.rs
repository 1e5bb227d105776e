use anyhow::{Context, Result, anyhow, bail};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use triage_core::assist::DEFAULT_CATEGORIES;
use triage_core::registry::{self, PricingTier};
use triage_core::store::ConversationStore;
use triage_core::types::{AgentStatus, ConversationStatus, MessageDirection};
use triage_core::{
    Actor, AgentInstaller, AgentResponder, AgentUpdate, AssistTarget, Assistant, Category,
    ChatMessage, CompletionOptions, InstallOptions, MetricRecorder, ProviderGateway, ProviderKind,
    RephraseStyle, Router, Stores,
};
use triage_store::SqliteStore;

mod config;

use config::TriageConfig;

#[derive(Parser)]
#[command(name = "triage")]
#[command(version)]
#[command(about = "triage: route customer conversations to the best-fit agent")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Account to act on (defaults to the configured account)
    #[arg(long, global = true)]
    account: Option<i64>,

    /// Operator name recorded on manual assignment changes
    #[arg(long = "as", global = true, default_value = "operator")]
    operator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration (keys masked)
    Config,

    /// Add a customer message, creating the conversation if needed
    Ingest {
        /// Message text
        text: String,
        /// Append to this conversation instead of opening a new one
        #[arg(long)]
        conversation: Option<i64>,
        /// Record as an outgoing (agent) message
        #[arg(long)]
        outgoing: bool,
        /// Auto-route the conversation after ingesting
        #[arg(long)]
        route: bool,
    },

    /// Analyze a conversation and show the routing decision without assigning
    Analyze { conversation: i64 },

    /// Route a conversation to its best-fit agent
    Route {
        conversation: i64,
        /// Bypass the auto-route gate
        #[arg(long)]
        force: bool,
    },

    /// Route several conversations; all open ones when none are given
    BulkRoute {
        conversations: Vec<i64>,
        /// Bypass the auto-route gate
        #[arg(long)]
        force: bool,
    },

    /// Assign a conversation to an agent
    Assign { conversation: i64, agent: i64 },

    /// Move a conversation to another agent
    Reassign {
        conversation: i64,
        agent: i64,
        #[arg(long, default_value = "Manual reassignment")]
        reason: String,
    },

    /// Remove the active assignment of a conversation
    Unassign {
        conversation: i64,
        #[arg(long, default_value = "Manual unassignment")]
        reason: String,
    },

    /// Assignment history of a conversation
    History { conversation: i64 },

    /// Routing analytics for the account
    Analytics {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },

    /// Conversations that need a human look
    Attention,

    /// Agent templates available for installation
    Catalog {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// free or premium
        #[arg(long)]
        pricing: Option<String>,
        /// Recommend templates for a customer message
        #[arg(long = "for")]
        for_text: Option<String>,
    },

    /// Manage installed agents
    #[command(subcommand)]
    Agents(AgentCommands),

    /// Generate and post an agent reply to the latest customer message
    Respond { agent: i64, conversation: i64 },

    /// Suggest an agent reply without posting it
    Suggest { agent: i64, conversation: i64 },

    /// How well an agent's capabilities fit a conversation
    Fit { agent: i64, conversation: i64 },

    /// Rate an agent turn
    Feedback {
        turn: String,
        #[arg(long, conflicts_with = "unhelpful")]
        helpful: bool,
        #[arg(long)]
        unhelpful: bool,
        #[arg(long)]
        note: Option<String>,
    },

    /// Show provider configuration status
    Providers,

    /// Store an API key (and optionally a model) for a provider
    ConfigureProvider {
        provider: String,
        api_key: String,
        #[arg(long)]
        model: Option<String>,
        /// Also make this the default provider
        #[arg(long = "default")]
        make_default: bool,
    },

    /// Send a minimal request to check a provider's credentials
    TestProvider { provider: String },

    /// One-off completion through the gateway
    Chat {
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        stream: bool,
    },

    /// Operator helpers backed by the gateway
    #[command(subcommand)]
    Assist(AssistCommands),
}

#[derive(Subcommand)]
enum AgentCommands {
    /// List agents installed for the account
    List,

    /// Install an agent from a template
    Install {
        template: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        auto_respond: bool,
    },

    /// Change an installed agent
    Configure {
        agent: i64,
        #[arg(long)]
        name: Option<String>,
        /// "active" or "inactive"
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Empty string restores the template prompt
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        auto_respond: Option<bool>,
    },

    /// Remove an agent with its assignments, turns and metrics
    Uninstall { agent: i64 },

    /// Recent turns of an agent
    Turns {
        agent: i64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// One day of an agent's metrics
    Stats {
        agent: i64,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(clap::Args)]
struct TargetArgs {
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

impl From<TargetArgs> for AssistTarget {
    fn from(args: TargetArgs) -> Self {
        AssistTarget {
            provider: args.provider,
            model: args.model,
        }
    }
}

#[derive(Subcommand)]
enum AssistCommands {
    /// Rewrite text in another style
    Rephrase {
        text: String,
        /// professional, friendly, formal, casual, concise or detailed
        #[arg(long, default_value = "professional")]
        style: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Summarize a conversation
    Summarize {
        conversation: i64,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Suggest a reply for a conversation
    Reply {
        conversation: i64,
        #[arg(long)]
        context: Option<String>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Classify the sentiment of a text
    Sentiment {
        text: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Pick a category for a conversation
    Categorize {
        conversation: i64,
        #[arg(long = "category")]
        categories: Vec<String>,
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Everything a command needs, wired from the config file
struct App {
    cfg: TriageConfig,
    store: Arc<SqliteStore>,
    stores: Stores,
    gateway: Arc<ProviderGateway>,
    router: Router,
    account_id: i64,
    actor: Actor,
}

impl App {
    fn open(cli: &Cli) -> Result<Self> {
        let cfg = TriageConfig::load(&cli.config)?;

        let db_path = config::shellexpand(&cfg.store.db_path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = Arc::new(SqliteStore::open(&db_path)?);
        cfg.seed_settings(store.as_ref())?;

        let stores = Stores::from_shared(store.clone());
        let gateway = Arc::new(
            ProviderGateway::new(stores.config.clone(), cfg.routing.gateway.clone())
                .context("Failed to build provider gateway")?,
        );
        let router = Router::new(stores.clone(), &cfg.routing);
        let account_id = cli.account.unwrap_or(cfg.account.id);
        debug!("Using account {} with database {}", account_id, db_path.display());

        Ok(Self {
            cfg,
            store,
            stores,
            gateway,
            router,
            account_id,
            actor: Actor::operator(cli.operator.clone()),
        })
    }

    fn installer(&self) -> AgentInstaller {
        AgentInstaller::new(self.stores.clone(), self.gateway.clone())
    }

    fn responder(&self) -> AgentResponder {
        AgentResponder::new(self.stores.clone(), self.gateway.clone())
    }

    fn assistant(&self) -> Assistant {
        Assistant::new(self.stores.clone(), self.gateway.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over the flag
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Init => return cmd_init().await,
        Commands::Config => {
            let cfg = TriageConfig::load(&cli.config)?;
            println!("{:#?}", cfg);
            return Ok(());
        }
        _ => {}
    }

    let app = App::open(&cli)?;
    run(app, cli.command).await
}

async fn run(app: App, command: Commands) -> Result<()> {
    match command {
        Commands::Init | Commands::Config => Ok(()),
        Commands::Ingest {
            text,
            conversation,
            outgoing,
            route,
        } => cmd_ingest(&app, &text, conversation, outgoing, route).await,
        Commands::Analyze { conversation } => {
            print_json(&app.router.analyze_and_route(conversation).await?)
        }
        Commands::Route {
            conversation,
            force,
        } => {
            let result = app.router.route(conversation, force).await?;
            match (&result.agent, &result.skipped) {
                (Some(agent), _) => info!(
                    "Conversation {} routed to {} ({:.0}% confidence)",
                    conversation,
                    agent.name,
                    result.confidence.unwrap_or_default()
                ),
                (None, Some(reason)) => info!("Conversation {} not routed: {}", conversation, reason),
                (None, None) => warn!("No agent cleared the threshold for conversation {}", conversation),
            }
            print_json(&result)
        }
        Commands::BulkRoute {
            conversations,
            force,
        } => {
            let ids = if conversations.is_empty() {
                app.stores
                    .conversations
                    .conversations_by_status(
                        app.account_id,
                        &[ConversationStatus::Open],
                        app.router.policy().attention_scan_limit,
                    )
                    .await?
                    .into_iter()
                    .map(|c| c.id)
                    .collect()
            } else {
                conversations
            };
            print_json(&app.router.bulk_route(&ids, force).await)
        }
        Commands::Assign {
            conversation,
            agent,
        } => print_json(&app.router.assign(conversation, agent, app.actor.clone()).await?),
        Commands::Reassign {
            conversation,
            agent,
            reason,
        } => print_json(
            &app.router
                .reassign(conversation, agent, &reason, app.actor.clone())
                .await?,
        ),
        Commands::Unassign {
            conversation,
            reason,
        } => {
            app.router
                .unassign(conversation, &reason, app.actor.clone())
                .await?;
            println!("Conversation {} unassigned", conversation);
            Ok(())
        }
        Commands::History { conversation } => {
            let manager = app.router.assignments();
            let now = Utc::now();
            let mut summaries = Vec::new();
            for assignment in manager.history(conversation).await? {
                summaries.push(manager.summarize(assignment, now).await?);
            }
            print_json(&summaries)
        }
        Commands::Analytics { days } => {
            if days <= 0 {
                bail!("--days must be positive");
            }
            print_json(
                &app.router
                    .routing_analytics(app.account_id, Duration::days(days))
                    .await?,
            )
        }
        Commands::Attention => print_json(&app.router.needs_attention(app.account_id).await?),
        Commands::Catalog {
            category,
            search,
            pricing,
            for_text,
        } => cmd_catalog(category, search, pricing, for_text),
        Commands::Agents(command) => cmd_agents(&app, command).await,
        Commands::Respond {
            agent,
            conversation,
        } => {
            let reply = app.responder().process_message(agent, conversation).await?;
            if !reply.success {
                warn!(
                    "Agent {} failed to answer; fallback message posted",
                    agent
                );
            }
            print_json(&reply)
        }
        Commands::Suggest {
            agent,
            conversation,
        } => {
            println!(
                "{}",
                app.responder().suggest_response(agent, conversation).await?
            );
            Ok(())
        }
        Commands::Fit {
            agent,
            conversation,
        } => print_json(&app.responder().analyze_fit(agent, conversation).await?),
        Commands::Feedback {
            turn,
            helpful,
            unhelpful,
            note,
        } => {
            if helpful == unhelpful {
                bail!("Pass exactly one of --helpful or --unhelpful");
            }
            print_json(
                &app.responder()
                    .record_feedback(&turn, helpful, note.as_deref())
                    .await?,
            )
        }
        Commands::Providers => cmd_providers(&app),
        Commands::ConfigureProvider {
            provider,
            api_key,
            model,
            make_default,
        } => {
            let kind = parse_provider(&provider)?;
            app.gateway
                .configure_provider(kind, &api_key, model.as_deref())?;
            if make_default {
                app.gateway.set_default_provider(kind)?;
            }
            println!(
                "Configured {} (key {})",
                kind,
                config::mask_secret(api_key.trim())
            );
            Ok(())
        }
        Commands::TestProvider { provider } => {
            let result = app.gateway.test_connection(parse_provider(&provider)?).await;
            print_json(&result)?;
            if !result.success {
                bail!("Connection test failed for {}", result.provider);
            }
            Ok(())
        }
        Commands::Chat {
            prompt,
            system,
            provider,
            model,
            stream,
        } => cmd_chat(&app, prompt, system, provider, model, stream).await,
        Commands::Assist(command) => cmd_assist(&app, command).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("triage initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure your API keys and routing.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_ingest(
    app: &App,
    text: &str,
    conversation: Option<i64>,
    outgoing: bool,
    route: bool,
) -> Result<()> {
    let conversation = match conversation {
        Some(id) => app
            .stores
            .conversations
            .conversation(id)
            .await?
            .ok_or_else(|| anyhow!("Conversation {} not found", id))?,
        None => {
            app.store
                .create_conversation(app.account_id, ConversationStatus::Open)
                .await?
        }
    };
    let direction = if outgoing {
        MessageDirection::Outgoing
    } else {
        MessageDirection::Incoming
    };
    let message = app
        .store
        .append_message(conversation.id, direction, text)
        .await?;
    info!(
        "Added {} message {} to conversation {}",
        direction, message.id, conversation.id
    );
    println!("{}", conversation.id);

    if route && !outgoing {
        let result = app.router.route(conversation.id, false).await?;
        print_json(&result)?;
    }
    Ok(())
}

fn cmd_catalog(
    category: Option<String>,
    search: Option<String>,
    pricing: Option<String>,
    for_text: Option<String>,
) -> Result<()> {
    if let Some(text) = for_text {
        let ids = registry::recommend_for_text(&text);
        if ids.is_empty() {
            println!("No specific recommendation; technical_support covers most requests");
        }
        for id in ids {
            if let Some(t) = registry::get(id) {
                println!("{} {:<22} {}", t.icon, t.id, t.description);
            }
        }
        return Ok(());
    }

    let mut templates: Vec<_> = match category {
        Some(name) => {
            let category = Category::from_str(&name)
                .ok_or_else(|| anyhow!("Unknown category '{}'", name))?;
            registry::by_category(category)
        }
        None => registry::all().iter().collect(),
    };
    if let Some(tier) = pricing {
        let tier = match tier.as_str() {
            "free" => PricingTier::Free,
            "premium" => PricingTier::Premium,
            other => bail!("Unknown pricing tier '{}' (use free or premium)", other),
        };
        let priced: Vec<&str> = registry::by_pricing(tier).iter().map(|t| t.id).collect();
        templates.retain(|t| priced.contains(&t.id));
    }
    if let Some(query) = search {
        let found: Vec<&str> = registry::search(&query).iter().map(|t| t.id).collect();
        templates.retain(|t| found.contains(&t.id));
    }

    for t in templates {
        println!(
            "{} {:<22} {:<13} {:<8} {}",
            t.icon, t.id, t.category, t.pricing, t.name
        );
        println!("    {}", t.description);
        println!("    capabilities: {}", t.capabilities.join(", "));
    }
    Ok(())
}

async fn cmd_agents(app: &App, command: AgentCommands) -> Result<()> {
    let installer = app.installer();
    match command {
        AgentCommands::List => {
            let agents = installer.installed(app.account_id).await?;
            if agents.is_empty() {
                println!("No agents installed. See `triage catalog`.");
            }
            for agent in agents {
                println!(
                    "{:>4} {} {:<24} {:<13} {:<8} {}{}",
                    agent.id,
                    agent.icon(),
                    agent.name,
                    agent.category,
                    agent.status,
                    agent.provider,
                    agent
                        .model
                        .as_deref()
                        .map(|m| format!(" ({})", m))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        AgentCommands::Install {
            template,
            name,
            provider,
            model,
            temperature,
            max_tokens,
            prompt,
            auto_respond,
        } => {
            let options = InstallOptions {
                name,
                provider: provider.as_deref().map(parse_provider).transpose()?,
                model,
                temperature,
                max_tokens,
                custom_prompt: prompt,
                auto_respond,
            };
            let agent = installer.install(app.account_id, &template, options).await?;
            info!("Installed {} as agent {}", agent.template_id, agent.id);
            print_json(&agent)
        }
        AgentCommands::Configure {
            agent,
            name,
            status,
            provider,
            model,
            temperature,
            max_tokens,
            prompt,
            auto_respond,
        } => {
            let status = match status.as_deref() {
                Some("active") => Some(AgentStatus::Active),
                Some("inactive") => Some(AgentStatus::Inactive),
                Some(other) => bail!("Unknown status '{}' (use active or inactive)", other),
                None => None,
            };
            let update = AgentUpdate {
                name,
                status,
                provider: provider.as_deref().map(parse_provider).transpose()?,
                model,
                temperature,
                max_tokens,
                custom_prompt: prompt,
                auto_respond,
                trigger_conditions: None,
            };
            print_json(&installer.configure(agent, update).await?)
        }
        AgentCommands::Uninstall { agent } => {
            let removed = installer.uninstall(agent).await?;
            println!("Uninstalled {} ({})", removed.name, removed.id);
            Ok(())
        }
        AgentCommands::Turns { agent, limit } => {
            print_json(&app.responder().turns(agent, limit).await?)
        }
        AgentCommands::Stats { agent, date } => {
            let recorder = MetricRecorder::new(app.stores.metrics.clone());
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            print_json(&recorder.daily_summary(agent, date).await?)
        }
    }
}

fn cmd_providers(app: &App) -> Result<()> {
    let default = app.gateway.default_provider();
    for (kind, status) in app.gateway.provider_status() {
        println!(
            "{:<7} {:<14} model={}{}",
            kind,
            if status.configured {
                if status.api_key_present {
                    "configured"
                } else {
                    "configured(env)"
                }
            } else {
                "not configured"
            },
            status.model,
            if default == Some(kind) { "  [default]" } else { "" }
        );
    }
    if let Some(name) = app.cfg.providers.default.as_deref() {
        debug!("Config file default provider: {}", name);
    }
    Ok(())
}

async fn cmd_chat(
    app: &App,
    prompt: String,
    system: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    stream: bool,
) -> Result<()> {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));
    let options = CompletionOptions::default();

    let result = if stream {
        let mut sink = |chunk: &str| {
            print!("{}", chunk);
            let _ = std::io::stdout().flush();
        };
        let result = app
            .gateway
            .stream_chat_completion(
                &messages,
                provider.as_deref(),
                model.as_deref(),
                &options,
                &mut sink,
            )
            .await?;
        println!();
        result
    } else {
        let result = app
            .gateway
            .chat_completion(&messages, provider.as_deref(), model.as_deref(), &options)
            .await?;
        println!("{}", result.content);
        result
    };

    match result.usage {
        Some(usage) => info!(
            "{} ({}): {} tokens",
            result.provider, result.model, usage.total_tokens
        ),
        None => info!("{} ({})", result.provider, result.model),
    }
    Ok(())
}

async fn cmd_assist(app: &App, command: AssistCommands) -> Result<()> {
    let assistant = app.assistant();
    match command {
        AssistCommands::Rephrase {
            text,
            style,
            target,
        } => {
            let style = RephraseStyle::from_str(&style)
                .ok_or_else(|| anyhow!("Unknown style '{}'", style))?;
            println!("{}", assistant.rephrase(&text, style, &target.into()).await?);
        }
        AssistCommands::Summarize {
            conversation,
            target,
        } => println!("{}", assistant.summarize(conversation, &target.into()).await?),
        AssistCommands::Reply {
            conversation,
            context,
            target,
        } => println!(
            "{}",
            assistant
                .suggest_reply(conversation, context.as_deref(), &target.into())
                .await?
        ),
        AssistCommands::Sentiment { text, target } => {
            println!("{}", assistant.extract_sentiment(&text, &target.into()).await?)
        }
        AssistCommands::Categorize {
            conversation,
            categories,
            target,
        } => {
            match assistant
                .categorize(conversation, Some(categories.as_slice()), &target.into())
                .await?
            {
                Some(category) => println!("{}", category),
                None => {
                    let known = if categories.is_empty() {
                        DEFAULT_CATEGORIES.join(", ")
                    } else {
                        categories.join(", ")
                    };
                    warn!("Model answer matched none of: {}", known);
                    println!("uncategorized");
                }
            }
        }
    }
    Ok(())
}

fn parse_provider(name: &str) -> Result<ProviderKind> {
    ProviderKind::from_str(name).ok_or_else(|| {
        anyhow!(
            "Unknown provider '{}' (expected openai, claude or gemini)",
            name
        )
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
