//! consentgate: inspect and change a user's privacy consent from the terminal.
//!
//! Consent, banner prompt history and the audit trail are kept as JSON files
//! in a directory (`.consentgate` by default), so successive invocations act
//! on the same user. Third-party services are simulated: each one plants
//! cookies in an in-process jar when it loads and clears them on teardown.
//!
//! # Usage
//! ```bash
//! consentgate status
//! consentgate accept-all --banner
//! consentgate customize --analytics --preferences
//! consentgate withdraw --reason "no longer interested"
//! consentgate history --export
//! RUST_LOG=consentgate_core=debug consentgate demo
//! ```

mod logging;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use consentgate_core::gate::{
    GateApiDefaultStack,
    api::{ConsentEvent, GateRequest, GateResponse},
    config::GateConfig,
    core::{
        record::{ConsentCategory, ConsentChoice, ConsentSource},
        registry::ServiceRegistry,
    },
    infrastructure::{
        integration::{CookieJar, Integration, IntegrationSet, NamespacedIntegration},
        storage::{FileStorage, MemoryStorage, StorageBackend},
    },
    init_gate,
    services::audit::RequestMetadata,
};
use logging::init_tracing;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tower::{
    ServiceBuilder, ServiceExt,
    timeout::{Timeout, TimeoutLayer},
};
use tracing::{info, warn};

/// Simulated script latency of every third-party service.
const LOAD_LATENCY: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(
    name = "consentgate",
    about = "Inspect and change a user's privacy consent",
    long_about = "Keeps a versioned, expiring consent record with an audit trail, and loads or tears down third-party services to match it."
)]
struct Args {
    /// Directory holding consent, prompt history and the audit trail
    #[arg(long, global = true, default_value = ".consentgate")]
    dir: PathBuf,

    /// JSON configuration file; missing fields keep their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity recorded in the audit trail (anonymous if omitted)
    #[arg(long, global = true)]
    subject: Option<String>,

    /// Policy version stamped into new decisions
    #[arg(long, global = true)]
    policy_version: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the decision for every category
    Status,
    /// Grant every category
    AcceptAll {
        /// The decision was made on the consent banner
        #[arg(long)]
        banner: bool,
    },
    /// Decline every optional category
    DeclineAll {
        /// The decision was made on the consent banner
        #[arg(long)]
        banner: bool,
    },
    /// Grant exactly the listed optional categories
    Customize {
        #[arg(long)]
        analytics: bool,
        #[arg(long)]
        marketing: bool,
        #[arg(long)]
        preferences: bool,
    },
    /// Withdraw consent for every optional category
    Withdraw {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show the audit trail, newest first
    History {
        /// Print the trail as JSON
        #[arg(long)]
        export: bool,
    },
    /// Whether the consent banner should be shown now
    Banner {
        /// Record that the banner was just shown
        #[arg(long)]
        shown: bool,
    },
    /// Runtime state of every third-party service
    Services {
        /// Print the state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Grant, narrow and withdraw consent in memory, printing every event
    Demo,
}

type Gate = Timeout<GateApiDefaultStack>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.subject.as_deref());

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<GateConfig>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => GateConfig::default(),
    };
    if let Some(policy_version) = &args.policy_version {
        config = config.with_policy_version(policy_version);
    }

    if matches!(args.command, Command::Demo) {
        return run_demo(&config, args.subject.as_deref()).await;
    }
    let (gate, _) = build_gate(&config, args.subject.as_deref(), Arc::new(FileStorage::new(&args.dir)))?;

    match args.command {
        Command::Status => print_status(&gate).await,
        Command::AcceptAll { banner } => update(&gate, ConsentChoice::accept_all(), banner).await,
        Command::DeclineAll { banner } => update(&gate, ConsentChoice::decline_all(), banner).await,
        Command::Customize { analytics, marketing, preferences } => {
            update(&gate, ConsentChoice::custom(analytics, marketing, preferences), false).await
        }
        Command::Withdraw { reason } => withdraw(&gate, reason).await,
        Command::History { export } => print_history(&gate, args.subject, export).await,
        Command::Banner { shown } => {
            if shown {
                call(&gate, GateRequest::RecordBannerShown).await?;
            }
            match call(&gate, GateRequest::ShouldShowBanner).await? {
                GateResponse::ShowBanner(show) => println!("show banner: {show}"),
                other => bail!("unexpected response: {other:?}"),
            }
            Ok(())
        }
        Command::Services { json } => print_services(&gate, json).await,
        Command::Demo => Ok(()),
    }
}

fn build_gate(
    config: &GateConfig,
    subject: Option<&str>,
    storage: Arc<dyn StorageBackend>,
) -> Result<(Gate, CookieJar)> {
    let registry = ServiceRegistry::default_catalog().context("building service catalog")?;
    let jar = CookieJar::new();
    let integrations: IntegrationSet = registry
        .iter()
        .map(|descriptor| {
            let integration: Arc<dyn Integration> = Arc::new(NamespacedIntegration::simulated(
                &descriptor.id,
                jar.clone(),
                LOAD_LATENCY,
                0,
            ));
            (descriptor.id.clone(), integration)
        })
        .collect();
    let gate = init_gate(config, registry, integrations, storage);
    let gate = match subject {
        Some(subject) => gate.with_subject(subject),
        None => gate,
    };
    let gate = ServiceBuilder::new().layer(TimeoutLayer::new(Duration::from_secs(60))).service(gate);
    Ok((gate, jar))
}

async fn call(gate: &Gate, request: GateRequest) -> Result<GateResponse> {
    gate.clone().oneshot(request).await.map_err(|error| anyhow!(error))
}

async fn update(gate: &Gate, choice: ConsentChoice, banner: bool) -> Result<()> {
    let source = if banner { ConsentSource::Banner } else { ConsentSource::Settings };
    let request = GateRequest::UpdateConsent { choice, source, metadata: RequestMetadata::default() };
    match call(gate, request).await? {
        GateResponse::Updated(outcome) => {
            if let Some(error) = &outcome.store_error {
                warn!("decision applied but not saved: {}", error);
            }
            println!("recorded {} ({:?})", outcome.record.version(), outcome.record.flags());
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}

async fn withdraw(gate: &Gate, reason: Option<String>) -> Result<()> {
    match call(gate, GateRequest::WithdrawConsent { reason, metadata: RequestMetadata::default() }).await? {
        GateResponse::Updated(outcome) => {
            println!("withdrawn, recorded {}", outcome.record.version());
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}

async fn print_status(gate: &Gate) -> Result<()> {
    match call(gate, GateRequest::GetConsent).await? {
        GateResponse::Consent(Some(record)) => println!(
            "version {} (expires {})",
            record.version(),
            record.expires_at().map_or_else(|| "never".to_string(), |at| at.to_rfc3339())
        ),
        GateResponse::Consent(None) => println!("no decision recorded"),
        other => bail!("unexpected response: {other:?}"),
    }
    for category in ConsentCategory::ALL {
        match call(gate, GateRequest::GetConsentStatus(category)).await? {
            GateResponse::Status(granted) => {
                println!("  {:<12} {}", category, if granted { "granted" } else { "denied" })
            }
            other => bail!("unexpected response: {other:?}"),
        }
    }
    Ok(())
}

async fn print_history(gate: &Gate, subject: Option<String>, export: bool) -> Result<()> {
    if export {
        match call(gate, GateRequest::ExportConsentHistory(subject)).await? {
            GateResponse::Export(json) => println!("{json}"),
            other => bail!("unexpected response: {other:?}"),
        }
        return Ok(());
    }
    match call(gate, GateRequest::GetConsentHistory(subject)).await? {
        GateResponse::History(entries) if entries.is_empty() => println!("no history"),
        GateResponse::History(entries) => {
            for entry in entries {
                println!(
                    "#{:<4} {} {:<9} {} analytics={} marketing={} preferences={}",
                    entry.sequence,
                    entry.timestamp.to_rfc3339(),
                    format!("{:?}", entry.action),
                    entry.version,
                    entry.consent.analytics,
                    entry.consent.marketing,
                    entry.consent.preferences,
                );
            }
        }
        other => bail!("unexpected response: {other:?}"),
    }
    Ok(())
}

async fn print_services(gate: &Gate, json: bool) -> Result<()> {
    call(gate, GateRequest::Initialize).await?;
    let GateResponse::ServiceStatus(status) = call(gate, GateRequest::GetServiceStatus).await? else {
        bail!("unexpected response to GetServiceStatus");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    for (id, state) in status {
        println!(
            "  {:<18} {:<9} retries={} load={}",
            id,
            format!("{:?}", state.status),
            state.retry_count,
            state.load_time_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms}ms")),
        );
        if let Some(error) = state.last_error {
            println!("  {:<18} last error: {}", "", error);
        }
    }
    Ok(())
}

async fn run_demo(config: &GateConfig, subject: Option<&str>) -> Result<()> {
    info!("=== consentgate demo ===");
    let (gate, jar) = build_gate(config, subject, Arc::new(MemoryStorage::new()))?;

    let GateResponse::Events(events) = call(&gate, GateRequest::Subscribe).await? else {
        bail!("unexpected response to Subscribe");
    };
    let printer = tokio::spawn(async move {
        let mut events = BroadcastStream::new(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(ConsentEvent::Changed { record, source }) => {
                    println!("event: consent changed via {source}: {:?}", record.flags())
                }
                Ok(ConsentEvent::Withdrawn { reason, at }) => {
                    println!("event: consent withdrawn at {} ({})", at.to_rfc3339(), reason.unwrap_or_default())
                }
                Err(error) => println!("event: {error}"),
            }
        }
    });

    println!("\n[1] fresh visitor");
    print_status(&gate).await?;

    println!("\n[2] accept all from the banner");
    update(&gate, ConsentChoice::accept_all(), true).await?;
    print_services(&gate, false).await?;
    println!("  cookies set: {}", jar.len());

    println!("\n[3] turn analytics off");
    update(&gate, ConsentChoice::custom(false, true, true), false).await?;
    print_services(&gate, false).await?;
    println!("  cookies set: {}", jar.len());

    println!("\n[4] withdraw everything");
    withdraw(&gate, Some("demo finished".to_string())).await?;
    print_services(&gate, false).await?;
    println!("  cookies set: {}", jar.len());

    println!("\n[5] audit trail");
    print_history(&gate, subject.map(str::to_string), false).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    printer.abort();
    Ok(())
}
