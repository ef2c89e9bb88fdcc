use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use fmail_data::output;
use fmail_data::utils::{find_project_root, mailbox_root};
use fmail_data::{
    FileProvider, HybridProvider, MessageFilter, Provider, ProviderConfig, SearchQuery,
    SendRequest, SubscriptionFilter,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fmail-data")]
#[command(about = "Query and watch an fmail mailbox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Mailbox root (defaults to <project>/.fmail)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List topics with message counts
    Topics,
    /// Show messages of a topic
    Log {
        topic: String,
        /// RFC3339 time or relative age (30m, 2h, 1d)
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Keep only the N most recent messages
        #[arg(short = 'n', long, default_value_t = 0)]
        limit: usize,
    },
    /// Show the direct conversation with a peer
    Dm {
        peer: String,
        /// Viewing agent (defaults to FMAIL_AGENT)
        #[arg(long = "as")]
        viewer: Option<String>,
        #[arg(short = 'n', long, default_value_t = 0)]
        limit: usize,
    },
    /// List direct-message conversations of an agent
    Conversations {
        #[arg(long = "as")]
        viewer: Option<String>,
    },
    /// List registered agents
    Agents,
    /// Search message bodies and attributes
    Search {
        text: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        /// Restrict to one topic or @agent
        #[arg(long = "in")]
        in_target: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Only messages that received a reply
        #[arg(long)]
        has_reply: bool,
    },
    /// Send a message to a topic or @agent
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        from: Option<String>,
        /// Body text; parsed as JSON when --json is set
        body: String,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Stream new messages as they arrive
    Watch {
        /// `*`, a topic, or @agent
        #[arg(default_value = "*")]
        target: String,
        #[arg(long = "as")]
        viewer: Option<String>,
        /// Resume after this message ID
        #[arg(long)]
        since_id: Option<String>,
        /// Poll files only, never connect to the daemon
        #[arg(long)]
        file_only: bool,
        /// Exit after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(root: Option<PathBuf>, viewer: Option<&str>) -> Result<ProviderConfig> {
    let mut config = ProviderConfig::load();
    if let Some(root) = root {
        config.root = Some(root);
    }
    if config.root.is_none() {
        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        let project = find_project_root(&cwd)?;
        config.root = Some(mailbox_root(&project));
    }
    if let Some(viewer) = viewer {
        config.self_agent = Some(viewer.to_string());
    }
    Ok(config.normalized())
}

/// RFC3339 timestamp, or an age like `90s`, `30m`, `2h`, `1d` before now
fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Ok(time.with_timezone(&Utc));
    }
    let Some(unit) = raw.chars().last() else {
        bail!("empty time value");
    };
    let amount: i64 = raw[..raw.len() - unit.len_utf8()]
        .parse()
        .with_context(|| format!("Invalid time '{}'", raw))?;
    let age = match unit {
        's' => ChronoDuration::seconds(amount),
        'm' => ChronoDuration::minutes(amount),
        'h' => ChronoDuration::hours(amount),
        'd' => ChronoDuration::days(amount),
        _ => bail!("Invalid time '{}': expected RFC3339 or <n>[s|m|h|d]", raw),
    };
    Ok(Utc::now() - age)
}

fn parse_opt_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_time).transpose()
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let color = !cli.no_color;
    let mut out = output::stdout(color);

    match cli.command {
        Commands::Topics => {
            let provider = FileProvider::new(resolve_config(cli.root, None)?)?;
            let topics = provider.topics().context("Failed to list topics")?;
            output::write_topics(&mut out, &topics)?;
        }
        Commands::Log {
            topic,
            since,
            until,
            from,
            priority,
            tags,
            limit,
        } => {
            let provider = FileProvider::new(resolve_config(cli.root, None)?)?;
            let filter = MessageFilter {
                since: parse_opt_time(since.as_deref())?,
                until: parse_opt_time(until.as_deref())?,
                from,
                to: None,
                priority,
                tags,
                limit,
            };
            let messages = provider
                .messages(&topic, &filter)
                .with_context(|| format!("Failed to read topic '{}'", topic))?;
            output::write_messages(&mut out, &messages)?;
        }
        Commands::Dm { peer, viewer, limit } => {
            let provider = FileProvider::new(resolve_config(cli.root, viewer.as_deref())?)?;
            let filter = MessageFilter {
                limit,
                ..Default::default()
            };
            let messages = provider
                .dms(&peer, &filter)
                .with_context(|| format!("Failed to read conversation with '{}'", peer))?;
            output::write_messages(&mut out, &messages)?;
        }
        Commands::Conversations { viewer } => {
            let config = resolve_config(cli.root, viewer.as_deref())?;
            let Some(agent) = config.self_agent.clone() else {
                bail!("No viewing agent: pass --as or set FMAIL_AGENT");
            };
            let provider = FileProvider::new(config)?;
            let conversations = provider
                .dm_conversations(&agent)
                .context("Failed to list conversations")?;
            output::write_conversations(&mut out, &conversations)?;
        }
        Commands::Agents => {
            let provider = FileProvider::new(resolve_config(cli.root, None)?)?;
            let agents = provider.agents().context("Failed to list agents")?;
            output::write_agents(&mut out, &agents)?;
        }
        Commands::Search {
            text,
            from,
            to,
            in_target,
            since,
            until,
            priority,
            tags,
            has_reply,
        } => {
            let provider = FileProvider::new(resolve_config(cli.root, None)?)?;
            let query = SearchQuery {
                text,
                from,
                to,
                in_target,
                since: parse_opt_time(since.as_deref())?,
                until: parse_opt_time(until.as_deref())?,
                priority,
                tags,
                has_reply,
            };
            let results = provider.search(&query).context("Search failed")?;
            output::write_search_results(&mut out, &results)?;
        }
        Commands::Send {
            to,
            from,
            body,
            json,
            priority,
            tags,
            reply_to,
        } => {
            let provider = FileProvider::new(resolve_config(cli.root, None)?)?;
            let body = if json {
                serde_json::from_str(&body).context("Body is not valid JSON")?
            } else {
                Value::String(body)
            };
            let request = SendRequest {
                from,
                to,
                body,
                reply_to,
                priority,
                tags,
                host: None,
            };
            let stored = provider.send(&request).context("Failed to send message")?;
            writeln!(out, "{}", stored.id)?;
        }
        Commands::Watch {
            target,
            viewer,
            since_id,
            file_only,
            count,
        } => {
            let config = resolve_config(cli.root, viewer.as_deref())?;
            let filter = SubscriptionFilter {
                topic: target,
                agent: config.self_agent.clone(),
                since_id,
                ..Default::default()
            };
            let provider: Box<dyn Provider> = if file_only {
                Box::new(FileProvider::new(config)?)
            } else {
                Box::new(HybridProvider::new(config)?)
            };
            let subscription = provider.subscribe(filter);
            let limit = count.unwrap_or(usize::MAX);
            for message in subscription.iter().take(limit) {
                output::write_message(&mut out, &message)?;
                out.flush()?;
            }
        }
    }

    Ok(())
}
