use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::EmbeddingOracle;
use facegate_oracle::{HttpOracle, OracleConfig, DEFAULT_BASE_URL};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face enrollment and verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face template (front, left, right, smile)
    Enroll {
        #[arg(short, long)]
        user: String,
    },
    /// Verify a fresh capture against the stored template
    Verify {
        #[arg(short, long)]
        user: String,
        /// Clock-in action id; reuse it across retries of the same action
        #[arg(short, long, default_value = "")]
        action: String,
        /// Require a left/right head-turn liveness challenge
        #[arg(long)]
        challenge: bool,
    },
    /// Cancel the session running for a user
    Cancel {
        #[arg(short, long)]
        user: String,
    },
    /// Remove a user's stored template
    Remove {
        #[arg(short, long)]
        user: String,
    },
    /// List stored templates
    List,
    /// Show daemon status and sessions in progress
    Status,
    /// Send one image straight to the embedding service (bypasses the daemon)
    Probe {
        image: PathBuf,
        #[arg(long, env = "FACEGATE_ORACLE_URL", default_value = DEFAULT_BASE_URL)]
        oracle: String,
    },
    /// Check the embedding service health and model (bypasses the daemon)
    Health {
        #[arg(long, env = "FACEGATE_ORACLE_URL", default_value = DEFAULT_BASE_URL)]
        oracle: String,
    },
}

// `#[zbus::proxy]` generates both `FacegateProxy` (async) and `FacegateProxyBlocking`.
#[zbus::proxy(
    interface = "org.facegate.Facegate1",
    default_service = "org.facegate.Facegate1",
    default_path = "/org/facegate/Facegate1"
)]
trait Facegate {
    async fn enroll(&self, user: &str) -> zbus::Result<String>;
    async fn verify(&self, user: &str, action_id: &str, challenge: bool) -> zbus::Result<String>;
    async fn cancel(&self, user: &str) -> zbus::Result<bool>;
    async fn remove_template(&self, user: &str) -> zbus::Result<bool>;
    async fn list_templates(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { user } => {
            println!("Enrolling {user}. Follow the pose prompts: front, left, right, smile.");
            let reply = connect(cli.system).await?.enroll(&user).await.map_err(daemon_error)?;
            print_json(&reply);
        }
        Commands::Verify {
            user,
            action,
            challenge,
        } => {
            let reply = connect(cli.system)
                .await?
                .verify(&user, &action, challenge)
                .await
                .map_err(daemon_error)?;
            print_json(&reply);
            let decision: serde_json::Value = serde_json::from_str(&reply)?;
            if decision["decision"] != "matched" {
                std::process::exit(1);
            }
        }
        Commands::Cancel { user } => {
            if connect(cli.system).await?.cancel(&user).await? {
                println!("Cancelled session for {user}");
            } else {
                println!("No session running for {user}");
            }
        }
        Commands::Remove { user } => {
            let removed = connect(cli.system)
                .await?
                .remove_template(&user)
                .await
                .map_err(daemon_error)?;
            if !removed {
                bail!("no template stored for {user}");
            }
            println!("Removed template for {user}");
        }
        Commands::List => {
            let reply = connect(cli.system)
                .await?
                .list_templates()
                .await
                .map_err(daemon_error)?;
            let records: Vec<serde_json::Value> = serde_json::from_str(&reply)?;
            if records.is_empty() {
                println!("No templates enrolled");
            }
            for r in records {
                println!(
                    "{}\t{}\tdim={}\tupdated {}",
                    r["identity"].as_str().unwrap_or("?"),
                    r["template_id"].as_str().unwrap_or("?"),
                    r["dimension"],
                    r["updated_at"].as_str().unwrap_or("?"),
                );
            }
        }
        Commands::Status => {
            let reply = connect(cli.system).await?.status().await.map_err(daemon_error)?;
            print_json(&reply);
        }
        Commands::Probe { image, oracle } => probe(image, oracle).await?,
        Commands::Health { oracle } => health(oracle).await?,
    }

    Ok(())
}

async fn connect(system: bool) -> Result<FacegateProxy<'static>> {
    tracing::debug!(system, "connecting to facegated");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    FacegateProxy::new(&conn)
        .await
        .context("facegated is not reachable")
}

/// Unwrap the `{"kind", "message"}` payload the daemon puts in its errors.
fn daemon_error(err: zbus::Error) -> anyhow::Error {
    if let zbus::Error::MethodError(_, Some(msg), _) = &err {
        if let Ok(payload) = serde_json::from_str::<serde_json::Value>(msg) {
            if let (Some(kind), Some(message)) = (payload["kind"].as_str(), payload["message"].as_str()) {
                return anyhow::anyhow!("{message} ({kind})");
            }
        }
    }
    err.into()
}

fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_else(|_| reply.to_string())),
        Err(_) => println!("{reply}"),
    }
}

fn oracle_client(base_url: String) -> Result<HttpOracle> {
    Ok(HttpOracle::new(OracleConfig {
        base_url,
        timeout: Duration::from_secs(10),
    })?)
}

async fn probe(image: PathBuf, oracle: String) -> Result<()> {
    let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
    let result = tokio::task::spawn_blocking(move || {
        let mut client = oracle_client(oracle)?;
        Ok::<_, anyhow::Error>(client.process(&bytes, false)?)
    })
    .await??;

    if !result.detected {
        println!("No face detected");
        std::process::exit(1);
    }
    println!("Face detected");
    println!("  quality:    {:.3}", result.quality);
    println!("  dimension:  {}", result.embedding.dim());
    match result.horizontal_offset {
        Some(dx) => println!("  offset dx:  {dx:+.3}"),
        None => println!("  offset dx:  (not reported; liveness challenge unavailable)"),
    }
    Ok(())
}

async fn health(oracle: String) -> Result<()> {
    let (report, info) = tokio::task::spawn_blocking(move || {
        let client = oracle_client(oracle)?;
        let report = client.health()?;
        let info = client.model_info().ok();
        Ok::<_, anyhow::Error>((report, info))
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(info) = info {
        println!("{}", serde_json::to_string_pretty(&info)?);
    }
    if !report.is_ready() {
        bail!("embedding service is not ready");
    }
    Ok(())
}
