use bugsync::config::Config;
use bugsync::db::{schema, LocalStore};
use bugsync::model::{AttachmentKey, Fields, Rendering, TimelineItem};
use bugsync::session::Session;
use bugsync::tracker::HttpTransport;
use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "bugsync")]
#[command(about = "Offline-first command line client for Bugzilla")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/bugsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a bug and print its fields
  Bug {
    id: u64,
    /// Also fetch comments, history and attachment metadata
    #[arg(long)]
    details: bool,
  },
  /// Print a bug's comments, attachments and changes in order
  Timeline { id: u64 },
  /// Print a text attachment or write a binary one to a file
  Attachment {
    id: u64,
    /// Bug the attachment belongs to, if known
    #[arg(long)]
    bug: Option<u64>,
    /// Write the payload here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
  },
  /// Fetch a user profile
  User { login: String },
  /// List, read or write a preference
  Pref {
    name: Option<String>,
    /// JSON value (plain strings are accepted too)
    value: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _guard = init_logging(&data_dir)?;

  let session = sign_in(&config, &data_dir)?;
  let result = run(&session, args.command).await;
  session.sign_out();
  result
}

/// Log to a daily file under the data dir so stdout only carries output.
fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &log_dir,
    "bugsync.log",
  ));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bugsync=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;

  Ok(guard)
}

fn sign_in(config: &Config, data_dir: &Path) -> Result<Session> {
  let account = config.account()?;
  let db_path = account.database_path(data_dir);
  if let Some(parent) = db_path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory {}: {}", parent.display(), e))?;
  }

  let store = LocalStore::open(&db_path, schema::VERSION)?;
  let transport = HttpTransport::new(&config.tracker.url, Config::get_api_key()?)?;
  Ok(Session::sign_in(
    account,
    store,
    Arc::new(transport),
    config.decoder.queue,
  )?)
}

async fn run(session: &Session, command: Command) -> Result<()> {
  match command {
    Command::Bug { id, details } => {
      let bug = session.bugs.get(id).fetch().await?;
      if details {
        bug.fetch_details().await?;
      }
      print_bug_fields(&bug.remote_fields());
      bug.mark_visited(Utc::now())?;
    }

    Command::Timeline { id } => {
      let bug = session.bugs.get(id);
      if !bug.is_loaded() {
        bug.fetch().await?;
      }
      bug.fetch_details().await?;
      let timeline = bug.timeline();
      for entry in timeline.entries() {
        let marker = match entry.rendering {
          Rendering::Full => ' ',
          Rendering::Collapsed => '-',
        };
        println!("{} {}", marker, entry.time.to_rfc3339());
        for item in entry.items() {
          println!("    {}", describe(&item));
        }
      }
      bug.mark_visited(Utc::now())?;
    }

    Command::Attachment { id, bug, out } => {
      if let Some(bug_id) = bug {
        let bug = session.bugs.get(bug_id);
        if !bug.is_loaded() {
          bug.fetch().await?;
        }
      }
      let key = AttachmentKey::Id(id);
      let attachment = session
        .attachments
        .get_many(&[key.clone()])?
        .remove(&key)
        .ok_or_else(|| eyre!("Attachment {} not registered", id))?;
      if !attachment.is_loaded() {
        attachment.fetch().await?;
      }

      let content = attachment.get_data().await?;
      match (out, content.text) {
        (Some(path), _) => {
          std::fs::write(&path, &content.binary)
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
          println!("Wrote {} bytes to {}", content.blob.len(), path.display());
        }
        (None, Some(text)) => print!("{}", text),
        (None, None) => {
          return Err(eyre!(
            "Attachment {} is binary ({}); use --out to save it",
            id,
            content.blob.content_type
          ))
        }
      }
    }

    Command::User { login } => {
      let user = session.users.get(login).fetch().await?;
      println!("{:<12} {}", "name", user.name());
      println!("{:<12} {}", "display", user.display_name());
      if let Some(id) = user.id() {
        println!("{:<12} {}", "id", id);
      }
      println!("{:<12} {}", "avatar", user.avatar_url(64));
    }

    Command::Pref { name: None, .. } => {
      for (name, value) in session.prefs.all()? {
        println!("{} = {}", name, value);
      }
    }
    Command::Pref {
      name: Some(name),
      value: None,
    } => match session.prefs.get(&name)? {
      Some(value) => println!("{}", value),
      None => return Err(eyre!("Preference {} is not set", name)),
    },
    Command::Pref {
      name: Some(name),
      value: Some(raw),
    } => {
      let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
      session.prefs.set(&name, value)?;
    }
  }
  Ok(())
}

fn print_bug_fields(record: &bugsync::model::Record) {
  for (name, value) in record {
    if matches!(name.as_str(), "comments" | "history" | "attachments") {
      let count = value.as_array().map_or(0, Vec::len);
      println!("{:<20} [{} items]", name, count);
      continue;
    }
    match value {
      Value::String(s) => println!("{:<20} {}", name, s),
      other => println!("{:<20} {}", name, other),
    }
  }
}

fn describe(item: &TimelineItem<'_>) -> String {
  match item {
    TimelineItem::Comment(c) => {
      let first_line = c.text.lines().next().unwrap_or("");
      format!(
        "comment {} by {}: {}",
        c.count.map_or_else(|| "?".to_string(), |n| n.to_string()),
        c.creator.as_deref().unwrap_or("unknown"),
        first_line
      )
    }
    TimelineItem::Attachment(a) => format!(
      "attachment {} {} ({})",
      a.id.map_or_else(|| "local".to_string(), |id| id.to_string()),
      a.file_name,
      a.content_type
    ),
    TimelineItem::History(h) => {
      let changes: Vec<String> = h
        .changes
        .iter()
        .map(|c| format!("{}: {} -> {}", c.field_name, c.removed, c.added))
        .collect();
      format!("{} changed {}", h.who, changes.join(", "))
    }
  }
}
