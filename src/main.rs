use std::{
    fs,
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::{DateTime, Local, NaiveDate, TimeZone as _};
use clap::{Parser, Subcommand};

use mirra::{
    config::Config,
    grouping::{self, ListGroupsOptions},
    index::{RecordingIndex, is_recording_file_name},
    router::Provider,
};

#[derive(Debug, Parser)]
#[command(name = "mirra")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy server.
    Start {
        /// Path to config TOML.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured log level.
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Rebuild the recording index from the JSONL files on disk.
    Reindex {
        /// Path to recordings directory.
        #[arg(long, default_value = "./recordings")]
        recordings: PathBuf,
    },
    /// Delete all recordings, the index, and group data.
    Clear {
        /// Path to recordings directory.
        #[arg(long, default_value = "./recordings")]
        recordings: PathBuf,
        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
    /// Inspect session groups.
    Groups {
        #[command(subcommand)]
        command: GroupsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum GroupsCommand {
    /// List session groups.
    Sessions {
        /// Number of groups to display.
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Path to recordings directory.
        #[arg(long, default_value = "./recordings")]
        recordings: PathBuf,
        /// Filter by provider (claude|openai|gemini).
        #[arg(long)]
        provider: Option<Provider>,
        /// Filter from date (YYYY-MM-DD).
        #[arg(long)]
        from: Option<String>,
        /// Filter to date (YYYY-MM-DD).
        #[arg(long)]
        to: Option<String>,
        /// Show only groups with errors.
        #[arg(long)]
        errors: bool,
    },
    /// Show one session group by trace id.
    Session {
        trace_id: String,
        /// Path to recordings directory.
        #[arg(long, default_value = "./recordings")]
        recordings: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            mirra::logging::init(&config, log_level.as_deref())?;
            let server = mirra::server::serve(&config).await?;
            eprintln!("listening on {}", server.listen_addr);
            tokio::signal::ctrl_c().await?;
            server.shutdown().await?;
        }
        Command::Reindex { recordings } => reindex(&recordings)?,
        Command::Clear { recordings, force } => clear(&recordings, force)?,
        Command::Groups { command } => match command {
            GroupsCommand::Sessions {
                limit,
                recordings,
                provider,
                from,
                to,
                errors,
            } => list_sessions(&recordings, limit, provider, from, to, errors)?,
            GroupsCommand::Session {
                trace_id,
                recordings,
            } => show_session(&recordings, &trace_id)?,
        },
    }

    Ok(())
}

fn reindex(recordings: &Path) -> anyhow::Result<()> {
    println!(
        "Rebuilding index for recordings in {}...",
        recordings.display()
    );

    let index = RecordingIndex::new(recordings);
    index.rebuild().context("rebuild index")?;
    index.save().context("save index")?;

    println!("Index rebuilt successfully!");
    println!("  Total recordings indexed: {}", index.len());
    Ok(())
}

fn clear(recordings: &Path, force: bool) -> anyhow::Result<()> {
    if !recordings.exists() {
        println!(
            "Recordings directory does not exist: {}",
            recordings.display()
        );
        return Ok(());
    }

    if !force {
        print!(
            "This will delete all recordings in {}\nAre you sure you want to continue? (y/N): ",
            recordings.display()
        );
        std::io::stdout().flush().ok();
        let mut response = String::new();
        std::io::stdin()
            .read_line(&mut response)
            .context("read confirmation")?;
        if !matches!(response.trim(), "y" | "Y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    println!("Clearing recordings in {}...", recordings.display());

    let mut removed = 0usize;
    for entry in fs::read_dir(recordings)
        .with_context(|| format!("read recordings directory {}", recordings.display()))?
    {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_recording_file_name(&name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) => tracing::warn!(file = %name, "failed to remove recording file: {err}"),
        }
    }

    let index_path = recordings.join(mirra::index::INDEX_FILE_NAME);
    if index_path.exists() {
        match fs::remove_file(&index_path) {
            Ok(()) => println!("Removed index"),
            Err(err) => tracing::warn!("failed to remove index: {err}"),
        }
    }

    let groups_path = recordings.join(grouping::GROUPS_DIR_NAME);
    if groups_path.exists() {
        match fs::remove_dir_all(&groups_path) {
            Ok(()) => println!("Removed groups data"),
            Err(err) => tracing::warn!("failed to remove groups directory: {err}"),
        }
    }

    println!("Cleared successfully!");
    println!("  Removed {removed} recording files");
    Ok(())
}

fn list_sessions(
    recordings: &Path,
    limit: usize,
    provider: Option<Provider>,
    from: Option<String>,
    to: Option<String>,
    errors: bool,
) -> anyhow::Result<()> {
    let manager = grouping::Manager::new(recordings);

    let opts = ListGroupsOptions {
        page: 1,
        limit,
        from_date: parse_date_arg(from.as_deref(), "from")?,
        to_date: parse_date_arg(to.as_deref(), "to")?,
        provider,
        has_errors: errors.then_some(true),
    };

    let (groups, total) = manager.list_session_groups(&opts);
    if groups.is_empty() {
        println!("No session groups found.");
        return Ok(());
    }

    println!("Found {} session groups (showing {}):\n", total, groups.len());

    for (position, group) in groups.iter().enumerate() {
        let group_id = if group.trace_id.is_empty() {
            &group.session_id
        } else {
            &group.trace_id
        };

        println!("{}. Session: {group_id}", position + 1);
        if !group.session_id.is_empty() && !group.trace_id.is_empty() {
            println!("   Session ID: {}", group.session_id);
        }
        println!("   Recordings: {}", group.request_count);
        println!(
            "   Providers: {}",
            group
                .providers
                .iter()
                .map(|provider| provider.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!("   First: {}", group.first_timestamp.format("%Y-%m-%d %H:%M:%S"));
        println!("   Last:  {}", group.last_timestamp.format("%Y-%m-%d %H:%M:%S"));
        if group.has_errors {
            println!("   Has Errors");
        }
        println!();
    }

    if total > groups.len() {
        println!(
            "Showing {} of {} groups. Use --limit to see more.",
            groups.len(),
            total
        );
    }

    Ok(())
}

fn show_session(recordings: &Path, trace_id: &str) -> anyhow::Result<()> {
    let manager = grouping::Manager::new(recordings);

    let group = manager
        .get_session_group(trace_id)
        .with_context(|| format!("session group not found: {trace_id}"))?;

    println!("Session: {}", group.trace_id);
    if !group.session_id.is_empty() {
        println!("Session ID: {}", group.session_id);
    }
    println!("Recordings: {}", group.request_count);
    println!(
        "Providers: {}",
        group
            .providers
            .iter()
            .map(|provider| provider.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("First: {}", group.first_timestamp.format("%Y-%m-%d %H:%M:%S"));
    println!("Last:  {}", group.last_timestamp.format("%Y-%m-%d %H:%M:%S"));
    if group.has_errors {
        println!("Has Errors: Yes");
    }

    println!("\nRecordings:");
    for (position, id) in group.recording_ids.iter().enumerate() {
        println!("  {}. {id}", position + 1);
    }

    Ok(())
}

fn parse_date_arg(raw: Option<&str>, name: &str) -> anyhow::Result<Option<DateTime<Local>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid {name} date: {raw}"))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .and_then(|datetime| Local.from_local_datetime(&datetime).earliest()))
}
