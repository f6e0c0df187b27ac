use anyhow::{bail, Context};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::client::{ChatClient, Conversation, PullMonitor, StreamState, TurnSnapshot};
use crate::core::{Config, PullProgress, Role};
use crate::timeline::{self, TimelineEntry, ToolStatus};
use crate::Result;

async fn connect(config: &Config) -> Result<ChatClient> {
    let client = ChatClient::from_config(config)?;
    if !client.is_server_running().await {
        bail!(
            "Agent service is not reachable at {}. Start it or pass --server <url>.",
            client.base_url()
        );
    }
    Ok(client)
}

/// Print streamed partial content as it grows.
fn spawn_partial_printer(updates: watch::Receiver<TurnSnapshot>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut printed = 0usize;
        let mut updates = WatchStream::from_changes(updates);
        while let Some(snapshot) = updates.next().await {
            if !snapshot.in_progress || snapshot.partial.len() < printed {
                printed = 0;
                continue;
            }
            if let Some(delta) = snapshot.partial.get(printed..) {
                print!("{}", delta);
                let _ = std::io::stdout().flush();
                printed = snapshot.partial.len();
            }
        }
    })
}

fn render_entry(entry: &TimelineEntry) -> String {
    match entry {
        TimelineEntry::Message { message, .. } => {
            let stamp = message.created_at.as_deref().unwrap_or("");
            let who = match message.role {
                Role::User => "you",
                Role::Assistant => "agent",
                Role::System => "system",
                Role::Tool => "tool",
            };
            format!("[{}] {}: {}", stamp, who, message.content)
        }
        TimelineEntry::Tool { display, .. } => {
            let marker = match display.status {
                ToolStatus::Ok => "✅",
                ToolStatus::Warning => "⚠️ ",
                ToolStatus::Error => "❌",
            };
            let stamp = display.invocation.created_at.as_deref().unwrap_or("");
            let mut out = format!("[{}] {} {}", stamp, marker, display.label);
            if !display.subtitle.is_empty() {
                out.push_str(&format!("\n    {}", display.subtitle.replace('\n', "\n    ")));
            }
            if let (Some(lang), Some(code)) = (display.code_language, display.code()) {
                out.push_str(&format!("\n    ```{}\n    {}\n    ```", lang.as_str(), code.replace('\n', "\n    ")));
            }
            for hit in &display.memories {
                out.push_str(&format!(
                    "\n    • {}/{} ({}) {}",
                    hit.namespace, hit.area, hit.score, hit.content
                ));
            }
            if display.delegation.is_none() && display.memories.is_empty() {
                if let Some(result) = display.invocation.result.as_deref() {
                    let first_line = result.lines().next().unwrap_or("");
                    if !first_line.is_empty() {
                        out.push_str(&format!("\n    {}", first_line));
                    }
                }
            }
            out
        }
    }
}

fn print_outcome(conversation: &Conversation) {
    println!();
    if let Some(last) = conversation.timeline().last() {
        println!("{}", render_entry(last));
    }
}

pub async fn send(config: Config, text: String, session: Option<String>) -> Result<()> {
    let client = connect(&config).await?;
    let mut conversation = Conversation::new(client, &config);
    if let Some(id) = session {
        conversation.select_session(&id).await;
    }

    let printer = spawn_partial_printer(conversation.turn_updates());
    let outcome = conversation.submit(&text).await?;
    printer.abort();

    print_outcome(&conversation);
    if let Some(id) = conversation.context().session_id.as_deref() {
        println!("💡 Session ID: {}", id);
    }
    if outcome.state == StreamState::Failed {
        bail!("Turn failed: {}", outcome.message.content);
    }
    Ok(())
}

pub async fn chat(config: Config, session: Option<String>) -> Result<()> {
    let client = connect(&config).await?;
    let mut conversation = Conversation::new(client, &config);
    if let Err(e) = conversation.refresh_sessions().await {
        tracing::warn!("Could not load session list: {}", e);
    }
    if let Some(id) = session {
        conversation.select_session(&id).await;
        for entry in conversation.timeline() {
            println!("{}", render_entry(entry));
        }
    }

    let printer = spawn_partial_printer(conversation.turn_updates());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("💬 Type a message, or /new, /load <id>, /sessions, /quit");
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) | ("/exit", _) => break,
            ("/new", _) => {
                conversation.new_session().await;
                println!("🆕 New conversation");
            }
            ("/load", id) if !id.trim().is_empty() => {
                conversation.select_session(id.trim()).await;
                for entry in conversation.timeline() {
                    println!("{}", render_entry(entry));
                }
            }
            ("/sessions", query) => {
                if let Err(e) = conversation.refresh_sessions().await {
                    println!("❌ Failed to list sessions: {}", e);
                }
                for session in conversation.filter_sessions(query) {
                    let marker = if conversation.active_session() == Some(session.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{} {}  {}", marker, session.id, session.display_title());
                }
            }
            _ if line.is_empty() => {}
            _ => match conversation.submit(line).await {
                Ok(_) => print_outcome(&conversation),
                Err(e) => println!("❌ {}", e),
            },
        }
    }

    printer.abort();
    Ok(())
}

pub async fn list_sessions(config: Config, filter: Option<String>) -> Result<()> {
    let client = connect(&config).await?;
    let sessions = client.list_sessions().await?;
    let matching = crate::client::filter_sessions(&sessions, filter.as_deref().unwrap_or(""));

    if matching.is_empty() {
        println!("   No sessions found");
        return Ok(());
    }

    println!("📋 Sessions:");
    for session in matching {
        let running = if session.is_running { " (running)" } else { "" };
        println!(
            "   • {}  {}  [{} messages, updated {}]{}",
            session.id,
            session.display_title(),
            session.message_count.unwrap_or(0),
            session.updated_at.as_deref().unwrap_or("-"),
            running
        );
    }
    Ok(())
}

pub async fn show_history(config: Config, session_id: String) -> Result<()> {
    let client = connect(&config).await?;
    let history = client
        .history(&session_id)
        .await
        .with_context(|| format!("Failed to load history for {}", session_id))?;

    if let Some(title) = history.title.as_deref() {
        println!("📋 {}", title);
    }
    for entry in timeline::build(&history.history, &history.tool_calls) {
        println!("{}", render_entry(&entry));
    }
    Ok(())
}

pub async fn rename_session(config: Config, session_id: String, title: String) -> Result<()> {
    let client = connect(&config).await?;
    let mut conversation = Conversation::new(client, &config);
    conversation.rename_session(&session_id, &title).await?;
    println!("✅ Renamed {} to '{}'", session_id, title.trim());
    Ok(())
}

async fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

pub async fn delete_session(config: Config, session_id: String, yes: bool) -> Result<()> {
    let client = connect(&config).await?;
    let confirmed = yes || confirm(&format!("Delete session {}?", session_id)).await?;
    if !confirmed {
        println!("Cancelled");
        return Ok(());
    }

    let mut conversation = Conversation::new(client, &config);
    conversation.delete_session(&session_id, confirmed).await?;
    println!("✅ Deleted session {}", session_id);
    Ok(())
}

pub async fn list_models(config: Config) -> Result<()> {
    let client = connect(&config).await?;
    let models = client.list_models().await?;

    if models.is_empty() {
        println!("   No models installed");
        println!("💡 Pull one with: agent-chat pull <name>");
        return Ok(());
    }

    println!("🧠 Models:");
    for model in models {
        println!(
            "   • {} ({:.1} GB, modified {})",
            model.name,
            model.size as f64 / 1_000_000_000.0,
            model.modified_at
        );
    }
    Ok(())
}

fn describe_progress(progress: &PullProgress) -> String {
    match progress.percent() {
        Some(percent) => format!("{} {:.1}%", progress.status, percent),
        None => progress.status.clone(),
    }
}

pub async fn pull_model(config: Config, name: String) -> Result<()> {
    let client = connect(&config).await?;
    let monitor = PullMonitor::new(client, &config.pull);

    let mut updates = WatchStream::from_changes(monitor.subscribe());
    let printer = tokio::spawn(async move {
        while let Some(update) = updates.next().await {
            if let Some(progress) = update {
                println!("   {}", describe_progress(&progress));
            }
        }
    });

    let result = monitor.run(&name).await;
    printer.abort();

    let progress = result?;
    if progress.is_error() {
        bail!(
            "Pull of {} failed: {}",
            name,
            progress.error.as_deref().unwrap_or(&progress.status)
        );
    }
    println!("✅ Model {} is ready", name);
    Ok(())
}

pub fn show_config(config: Config, save: bool) -> Result<()> {
    print!("{}", toml::to_string_pretty(&config)?);
    if save {
        config.save()?;
        match Config::config_file() {
            Some(path) => println!("✅ Saved to {}", path.display()),
            None => println!("⚠️  No config directory available, nothing saved"),
        }
    }
    Ok(())
}
