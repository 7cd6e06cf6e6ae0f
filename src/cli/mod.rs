//! CLI commands for ChatRelay using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::config::load_settings;
use crate::core::{ConversationStore, Dispatcher, MessageData, Queue, QueueRecord};
use crate::workspace;

/// ChatRelay - Message-routing daemon bridging chat channels to AI agents.
#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(version = "0.1.0")]
#[command(about = "ChatRelay - route chat messages to AI agents", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the dispatch daemon
    Daemon,

    /// Enqueue a message (acts as a minimal local channel connector)
    Send {
        /// Message to send
        message: String,

        /// Target agent (otherwise @prefix routing / default agent applies)
        #[arg(long)]
        agent: Option<String>,

        /// Channel name recorded on the message
        #[arg(long, default_value = "cli")]
        channel: String,

        /// Sender name recorded on the message
        #[arg(long, default_value = "local")]
        sender: String,

        /// Clear the agent's conversation window first
        #[arg(long)]
        reset: bool,
    },

    /// Outbound records ready for delivery
    Outbox {
        #[command(subcommand)]
        action: OutboxCommand,
    },

    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },

    /// Manage agents
    #[command(subcommand, alias = "a")]
    Agent(AgentCommand),

    /// Show daemon configuration and queue status
    Status,
}

#[derive(Subcommand)]
pub enum OutboxCommand {
    /// List undelivered responses
    List,

    /// Print responses and delete them (marks them delivered)
    Drain,
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Show queue statistics
    Stats,

    /// List failed items with their error detail
    Failed,

    /// Requeue items stranded in processing
    Recover,
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// List configured agents
    List,

    /// Initialize an agent's workspace
    Init {
        /// Agent ID from settings
        id: String,
    },
}

impl Commands {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Daemon => run_daemon().await,
            Command::Send {
                message,
                agent,
                channel,
                sender,
                reset,
            } => cmd_send(message, agent, channel, sender, reset),
            Command::Outbox { action } => match action {
                OutboxCommand::List => cmd_outbox(false),
                OutboxCommand::Drain => cmd_outbox(true),
            },
            Command::Queue { action } => match action {
                QueueCommand::Stats => cmd_queue_stats(),
                QueueCommand::Failed => cmd_queue_failed(),
                QueueCommand::Recover => cmd_queue_recover(),
            },
            Command::Agent(action) => match action {
                AgentCommand::List => cmd_agent_list(),
                AgentCommand::Init { id } => cmd_agent_init(&id),
            },
            Command::Status => cmd_status(),
        }
    }
}

fn open_queue() -> Result<(crate::config::Settings, Queue)> {
    let settings = load_settings()?;
    let queue = Queue::new(settings.queue_root()?);
    queue.ensure_dirs()?;
    Ok((settings, queue))
}

async fn run_daemon() -> Result<()> {
    let (settings, queue) = open_queue()?;
    let files_root = settings.files_root()?;
    std::fs::create_dir_all(&files_root)?;

    tracing::info!("Starting ChatRelay daemon with {} agent(s)", settings.agents.len());
    for (id, agent) in &settings.agents {
        tracing::info!(
            "  {}: {} [{}/{}]",
            id,
            agent.name.as_deref().unwrap_or(id),
            agent.provider.as_deref().unwrap_or("openrouter"),
            agent.model.as_deref().unwrap_or("default")
        );
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(queue),
        Arc::new(ConversationStore::new()),
        Arc::new(settings),
        files_root,
    ));

    dispatcher.run().await?;
    Ok(())
}

fn cmd_send(
    message: String,
    agent: Option<String>,
    channel: String,
    sender: String,
    reset: bool,
) -> Result<()> {
    let (_settings, queue) = open_queue()?;

    let data = MessageData::new(&channel, &sender, &sender, &message).with_reset(reset);
    let record = QueueRecord::new(data).with_agent(agent);

    let id = queue.enqueue(record)?;
    println!("Enqueued {}", id);
    Ok(())
}

fn cmd_outbox(drain: bool) -> Result<()> {
    let (_settings, queue) = open_queue()?;

    let records = queue.list_outgoing()?;
    if records.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }

    for record in records {
        println!(
            "[{}] @{} -> {} ({}) at {}",
            record.id,
            record.agent_id,
            record.data.sender,
            record.data.channel,
            format_ts(record.completed_at)
        );
        println!("{}", record.response);
        for file in &record.files {
            println!("  file: {}", file);
        }
        println!();

        if drain {
            queue.remove_outgoing(&record.id)?;
        }
    }

    Ok(())
}

fn format_ts(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn cmd_queue_stats() -> Result<()> {
    let (_settings, queue) = open_queue()?;
    println!("{}", queue.stats()?);
    Ok(())
}

fn cmd_queue_failed() -> Result<()> {
    let (_settings, queue) = open_queue()?;

    let failed = queue.list_failed()?;
    if failed.is_empty() {
        println!("No failed items.");
        return Ok(());
    }

    for record in failed {
        println!(
            "[{}] agent:{} channel:{} at {}",
            record.id,
            record.agent_id.as_deref().unwrap_or("?"),
            record.data.channel,
            format_ts(record.failed_at)
        );
        println!("  message: {}", record.data.body);
        println!("  error:   {}", record.error);
    }

    Ok(())
}

fn cmd_queue_recover() -> Result<()> {
    let (_settings, queue) = open_queue()?;
    let recovered = queue.recover_orphaned()?;
    println!("Requeued {} stranded item(s).", recovered);
    Ok(())
}

fn cmd_agent_list() -> Result<()> {
    let settings = load_settings()?;

    let mut ids: Vec<&String> = settings.agents.keys().collect();
    ids.sort();

    for id in ids {
        let agent = &settings.agents[id];
        println!(
            "{}: {} [{}/{}]",
            id,
            agent.name.as_deref().unwrap_or(id),
            agent.provider.as_deref().unwrap_or("openrouter"),
            agent.model.as_deref().unwrap_or("default")
        );
    }

    Ok(())
}

fn cmd_agent_init(id: &str) -> Result<()> {
    let settings = load_settings()?;

    if !settings.agents.contains_key(id) {
        anyhow::bail!("Agent '{}' not found in settings", id);
    }

    let agent_dir = settings.agent_dir(id)?;
    workspace::ensure_agent_workspace(&agent_dir, id)?;
    workspace::update_teammates(&agent_dir, id, &settings.agents, &settings.teams)?;

    println!("Initialized workspace at {}", agent_dir.display());
    Ok(())
}

fn cmd_status() -> Result<()> {
    let (settings, queue) = open_queue()?;

    println!("Agents: {}", settings.agents.len());
    println!("Teams:  {}", settings.teams.len());
    println!("Queue root: {}", queue.root().display());
    println!();
    println!("{}", queue.stats()?);
    Ok(())
}
