use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

// `#[zbus::proxy]` generates `MonitorProxy` (async) and `MonitorProxyBlocking`.
#[zbus::proxy(
    interface = "org.facewatch.Monitor1",
    default_service = "org.facewatch.Monitor1",
    default_path = "/org/facewatch/Monitor1"
)]
trait Monitor {
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self, all: bool) -> zbus::Result<String>;
    async fn list_important(&self) -> zbus::Result<String>;
    async fn set_important(&self, id: i64, important: bool) -> zbus::Result<bool>;
    async fn delete_identity(&self, id: i64) -> zbus::Result<bool>;
    async fn purge_temporary(&self) -> zbus::Result<u32>;
    async fn reset_notifications(&self) -> zbus::Result<u32>;
    async fn dismiss(&self, label: &str) -> zbus::Result<bool>;
    async fn sweep(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "facewatch", about = "Inspect and manage identities held by facewatchd")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List identities (confirmed only unless --all)
    List {
        /// Include temporary placeholder identities
        #[arg(long)]
        all: bool,
    },
    /// List identities flagged as important
    Important,
    /// Flag an identity as important
    Mark {
        /// Identity ID
        id: i64,
        /// Clear the flag instead of setting it
        #[arg(long)]
        clear: bool,
    },
    /// Delete an identity with its embeddings and snapshots
    Delete {
        /// Identity ID
        id: i64,
    },
    /// Delete every temporary identity
    PurgeTemporary,
    /// Forget all notification state
    ResetNotifications,
    /// Close the notification for a label
    Dismiss {
        label: String,
    },
    /// Delete expired temporary identities now
    Sweep,
}

impl Commands {
    /// D-Bus method this command calls.
    fn method(&self) -> &'static str {
        match self {
            Self::Status => "Status",
            Self::List { .. } => "ListIdentities",
            Self::Important => "ListImportant",
            Self::Mark { .. } => "SetImportant",
            Self::Delete { .. } => "DeleteIdentity",
            Self::PurgeTemporary => "PurgeTemporary",
            Self::ResetNotifications => "ResetNotifications",
            Self::Dismiss { .. } => "Dismiss",
            Self::Sweep => "Sweep",
        }
    }
}

/// Re-indent a JSON reply; fall back to the raw text.
fn pretty(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = MonitorProxy::new(&conn)
        .await
        .context("failed to reach facewatchd")?;

    let method = cli.command.method();
    tracing::debug!(method, "calling facewatchd");
    if let Err(e) = run(&proxy, cli.command).await {
        tracing::error!(method, error = %e, "facewatchd call failed");
        return Err(e);
    }
    Ok(())
}

async fn run(proxy: &MonitorProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Status => println!("{}", pretty(&proxy.status().await?)),
        Commands::List { all } => println!("{}", pretty(&proxy.list_identities(all).await?)),
        Commands::Important => println!("{}", pretty(&proxy.list_important().await?)),
        Commands::Mark { id, clear } => {
            if proxy.set_important(id, !clear).await? {
                let state = if clear { "cleared" } else { "set" };
                println!("Important flag {state} on identity {id}");
            } else {
                println!("No identity with ID {id}");
            }
        }
        Commands::Delete { id } => {
            if proxy.delete_identity(id).await? {
                println!("Deleted identity {id}");
            } else {
                println!("No identity with ID {id}");
            }
        }
        Commands::PurgeTemporary => {
            let n = proxy.purge_temporary().await?;
            println!("Removed {n} temporary identities");
        }
        Commands::ResetNotifications => {
            let n = proxy.reset_notifications().await?;
            println!("Cleared notification state for {n} labels");
        }
        Commands::Dismiss { label } => {
            if proxy.dismiss(&label).await? {
                println!("Dismissed {label}");
            } else {
                println!("No open notification for {label}");
            }
        }
        Commands::Sweep => {
            let n = proxy.sweep().await?;
            println!("Removed {n} expired temporary identities");
        }
    }

    Ok(())
}
