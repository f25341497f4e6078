use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, identity_id: &str, name: &str, course_id: i64, images: &[Vec<u8>]) -> zbus::Result<String>;
    async fn approve(&self, identity_id: &str) -> zbus::Result<()>;
    async fn reject(&self, identity_id: &str) -> zbus::Result<()>;
    async fn check_in(&self, image: &[u8]) -> zbus::Result<String>;
    async fn check_out(&self, session_id: &str, image: &[u8]) -> zbus::Result<String>;
    async fn active_sessions(&self) -> zbus::Result<String>;
    async fn history(&self, identity_id: &str) -> zbus::Result<String>;
    async fn end_course_sessions(&self, course_id: i64) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from one or more photos
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        course: i64,
        /// Photo files (JPEG or PNG)
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Approve a pending identity so it can be recognized
    Approve { id: String },
    /// Reject a pending identity
    Reject { id: String },
    /// Recognize a captured photo and record attendance
    Checkin { photo: PathBuf },
    /// End a session after verifying the holder's face
    Checkout { session: String, photo: PathBuf },
    /// List active sessions
    Sessions,
    /// Show the session history of an identity
    History { id: String },
    /// End every active session of a course now
    EndCourse { course: i64 },
    /// Show daemon status
    Status,
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Re-indent a JSON reply for the terminal. Non-JSON replies pass through.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn).await?;
    tracing::debug!(system = cli.system, "connected to rollcalld");

    match cli.command {
        Commands::Enroll { id, name, course, photos } => {
            let images = photos.iter().map(|p| read_photo(p)).collect::<Result<Vec<_>>>()?;
            println!("{}", pretty(&proxy.enroll(&id, &name, course, &images).await?));
        }
        Commands::Approve { id } => {
            proxy.approve(&id).await?;
            println!("{id}: approved");
        }
        Commands::Reject { id } => {
            proxy.reject(&id).await?;
            println!("{id}: rejected");
        }
        Commands::Checkin { photo } => {
            let image = read_photo(&photo)?;
            println!("{}", pretty(&proxy.check_in(&image).await?));
        }
        Commands::Checkout { session, photo } => {
            let image = read_photo(&photo)?;
            println!("{}", pretty(&proxy.check_out(&session, &image).await?));
        }
        Commands::Sessions => println!("{}", pretty(&proxy.active_sessions().await?)),
        Commands::History { id } => println!("{}", pretty(&proxy.history(&id).await?)),
        Commands::EndCourse { course } => {
            let ended = proxy.end_course_sessions(course).await?;
            println!("course {course}: {ended} session(s) ended");
        }
        Commands::Status => println!("{}", pretty(&proxy.status().await?)),
    }

    Ok(())
}
