use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "aeroface", about = "AeroFace venue attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register or replace a face (1 to 5 jpg/png images)
    Enroll {
        /// Identity UUID or email address
        user: String,
        /// Name shown when access is granted
        #[arg(short, long)]
        name: Option<String>,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Run verification over a sequence of captured frames
    Verify {
        /// Venue identifier
        #[arg(short, long)]
        venue: String,
        /// Frames per capture window
        #[arg(short, long, default_value_t = 3)]
        window: usize,
        /// Delay between windows in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Show the attendance log
    Sessions {
        /// Only this venue
        #[arg(short, long)]
        venue: Option<String>,
    },
    /// List enrolled identities
    List,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.aeroface.Attendance1",
    default_service = "org.aeroface.Attendance1",
    default_path = "/org/aeroface/Attendance1"
)]
trait Attendance {
    async fn enroll(
        &self,
        user_key: &str,
        display_name: &str,
        images: Vec<(String, Vec<u8>)>,
    ) -> zbus::Result<String>;
    async fn verify(&self, venue: &str, frames: Vec<Vec<u8>>) -> zbus::Result<String>;
    async fn sessions(&self, venue: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn).await?;

    match cli.command {
        Commands::Enroll { user, name, images } => {
            let mut payload = Vec::with_capacity(images.len());
            for path in &images {
                payload.push((file_name(path), read_file(path)?));
            }
            let reply = call(proxy.enroll(&user, name.as_deref().unwrap_or(""), payload).await)?;
            if cli.json {
                println!("{reply}");
            } else {
                println!(
                    "Face registered for {user}: identity {}, {} faces, liveness {}",
                    reply["identity_id"].as_str().unwrap_or("?"),
                    reply["faces_detected"],
                    reply["liveness_score"]
                );
            }
        }
        Commands::Verify {
            venue,
            window,
            interval_ms,
            frames,
        } => {
            let window = window.max(1).min(frames.len());
            let mut loaded = Vec::with_capacity(frames.len());
            for path in &frames {
                loaded.push(read_file(path)?);
            }
            for (i, chunk) in loaded.windows(window).enumerate() {
                if i > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
                let reply = call(proxy.verify(&venue, chunk.to_vec()).await)?;
                if cli.json {
                    println!("{reply}");
                } else {
                    println!("{}", overlay(&reply));
                }
            }
        }
        Commands::Sessions { venue } => {
            let reply = call(proxy.sessions(venue.as_deref().unwrap_or("")).await)?;
            if cli.json {
                println!("{reply}");
            } else {
                print_sessions(&reply);
            }
        }
        Commands::List => {
            let reply = call(proxy.list_identities().await)?;
            if cli.json {
                println!("{reply}");
            } else {
                print_identities(&reply);
            }
        }
        Commands::Status => {
            let reply = call(proxy.status().await)?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }

    Ok(())
}

/// Parse a daemon reply, turning a structured rejection into its reason.
fn call(reply: zbus::Result<String>) -> Result<Value> {
    match reply {
        Ok(body) => serde_json::from_str(&body).context("daemon returned invalid JSON"),
        Err(zbus::Error::MethodError(name, Some(message), _)) => {
            let reason = serde_json::from_str::<Value>(&message)
                .ok()
                .and_then(|v| {
                    let status = v["status"].as_u64()?;
                    let reason = v["reason"].as_str()?;
                    Some(format!("{reason} (status {status})"))
                })
                .unwrap_or(message);
            bail!("{}: {reason}", name.as_str())
        }
        Err(e) => Err(e.into()),
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// One-line accept/deny overlay for a verification report.
fn overlay(report: &Value) -> String {
    let cached = if report["fresh"].as_bool() == Some(false) {
        " (cached)"
    } else {
        ""
    };
    match report["decision"].as_str() {
        Some("granted") => {
            let event = match report["attendance"]["event"].as_str() {
                Some("checked_in") => " - checked in",
                Some("checked_out") => " - checked out",
                _ => "",
            };
            format!(
                "ACCESS GRANTED: {} (similarity {:.3}){event}{cached}",
                report["label"].as_str().unwrap_or("?"),
                report["similarity"].as_f64().unwrap_or_default()
            )
        }
        Some("denied") => format!(
            "ACCESS DENIED (similarity {:.3}){cached}",
            report["similarity"].as_f64().unwrap_or_default()
        ),
        _ => format!(
            "REJECTED: {}{cached}",
            report["reason"].as_str().unwrap_or("unknown reason")
        ),
    }
}

fn print_sessions(reply: &Value) {
    let sessions = reply.as_array().map(Vec::as_slice).unwrap_or_default();
    if sessions.is_empty() {
        println!("No attendance recorded");
        return;
    }
    for s in sessions {
        println!(
            "{}  {}  visit {}  in {}  out {}",
            s["venue"].as_str().unwrap_or("?"),
            s["identity_id"].as_str().unwrap_or("?"),
            s["visit"],
            s["checkin_time"].as_str().unwrap_or("?"),
            s["checkout_time"].as_str().unwrap_or("-")
        );
    }
}

fn print_identities(reply: &Value) {
    let records = reply.as_array().map(Vec::as_slice).unwrap_or_default();
    if records.is_empty() {
        println!("No identities enrolled");
        return;
    }
    for r in records {
        let name = r["display_name"]
            .as_str()
            .or_else(|| r["email"].as_str())
            .unwrap_or("-");
        let dim = r["embedding_dim"]
            .as_u64()
            .map_or_else(|| "no face".to_string(), |d| format!("{d}-dim"));
        println!("{}  {name}  {dim}", r["id"].as_str().unwrap_or("?"));
    }
}
