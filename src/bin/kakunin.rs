//! kakunin CLI: operator interface to the execution engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use uuid::Uuid;

use kakunin::adapters::speech::{FsAudioStore, HttpSpeechAdapter};
use kakunin::adapters::vision::{HttpTranscriptionAdapter, HttpVerificationAdapter};
use kakunin::adapters::{AudioData, Evidence, ImageData};
use kakunin::audit::AuditLedger;
use kakunin::config::Config;
use kakunin::model::session::{CheckId, SessionId, SessionStatus};
use kakunin::model::template::{Hazard, SopTemplate, TemplateId};
use kakunin::orchestrator::{Adapters, CheckOrchestrator, SessionLocks};
use kakunin::store::pg::PgStore;
use kakunin::store::{SessionFilter, SessionStore, TemplateStore};
use kakunin::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "kakunin", about = "Work-session execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Template operations
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    /// Work session lifecycle
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Run a safety check against the current step
    Check {
        session_id: Uuid,
        step_id: Uuid,
        /// Path to the evidence image (required)
        #[arg(long)]
        image: PathBuf,
        /// Path to spoken confirmation audio
        #[arg(long)]
        audio: Option<PathBuf>,
        /// Pre-transcribed confirmation text (used when no audio given)
        #[arg(long)]
        transcript: Option<String>,
    },
    /// Supervisor review
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Load a template from a JSON file
    Load { file: PathBuf },
    /// Show a template's flattened step sequence
    Show { id: Uuid },
    /// List templates
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a session for a worker
    Start { template_id: Uuid, worker_id: Uuid },
    /// Show a session and its checks
    Show { id: Uuid },
    /// List sessions
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    Pause { id: Uuid, worker_id: Uuid },
    Resume { id: Uuid, worker_id: Uuid },
    Abort {
        id: Uuid,
        worker_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// List sessions awaiting review (default: completed)
    List {
        #[arg(long, default_value = "completed")]
        status: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show the full audit trail for a session
    Show { session_id: Uuid },
    Approve { session_id: Uuid, supervisor_id: Uuid },
    Reject {
        session_id: Uuid,
        supervisor_id: Uuid,
        reason: String,
    },
    /// Override a failed check
    Override {
        check_id: Uuid,
        supervisor_id: Uuid,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Template file format
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct TemplateFile {
    title: String,
    created_by: Uuid,
    tasks: Vec<TaskFile>,
}

#[derive(serde::Deserialize)]
struct TaskFile {
    title: String,
    #[serde(default)]
    description: Option<String>,
    steps: Vec<StepFile>,
}

#[derive(serde::Deserialize)]
struct StepFile {
    description: String,
    #[serde(default)]
    expected_action: Option<String>,
    #[serde(default)]
    expected_result: Option<String>,
    #[serde(default)]
    hazards: Vec<Hazard>,
}

impl TemplateFile {
    fn into_template(self) -> SopTemplate {
        let mut template = SopTemplate::new(self.title, self.created_by);
        for task_file in self.tasks {
            let task = template.add_task(task_file.title);
            task.description = task_file.description;
            for step_file in task_file.steps {
                let step = task.add_step(step_file.description);
                step.expected_action = step_file.expected_action;
                step.expected_result = step_file.expected_result;
                step.hazards = step_file.hazards;
            }
        }
        template
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

struct App {
    store: Arc<PgStore>,
    orchestrator: CheckOrchestrator,
    ledger: AuditLedger,
}

async fn build_app(config: &Config) -> anyhow::Result<App> {
    let store = Arc::new(PgStore::connect(config.database_url.expose_secret()).await?);
    store.migrate().await?;

    let sessions: Arc<dyn SessionStore> = store.clone();
    let templates: Arc<dyn TemplateStore> = store.clone();
    let locks = Arc::new(SessionLocks::new());

    let adapters = Adapters {
        verifier: Arc::new(HttpVerificationAdapter::new(
            &config.vision_endpoint,
            &config.vision_model,
            config.vision_api_key.clone(),
        )),
        transcriber: Arc::new(HttpTranscriptionAdapter::new(
            &config.whisper_endpoint,
            &config.whisper_model,
            config.vision_api_key.clone(),
        )),
        speech: Arc::new(HttpSpeechAdapter::new(
            &config.tts_endpoint,
            config.tts_voice.clone(),
            config.tts_api_key.clone(),
        )),
        audio: Arc::new(FsAudioStore::new(&config.audio_dir)),
    };

    let orchestrator = CheckOrchestrator::new(
        sessions.clone(),
        templates.clone(),
        adapters,
        locks.clone(),
        config.orchestrator(),
    );
    let ledger = AuditLedger::new(sessions, templates, locks);

    Ok(App {
        store,
        orchestrator,
        ledger,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "kakunin".to_string(),
    })?;

    let app = build_app(&config).await?;

    match cli.command {
        Command::Template { action } => cmd_template(&app, action).await,
        Command::Session { action } => cmd_session(&app, action).await,
        Command::Check {
            session_id,
            step_id,
            image,
            audio,
            transcript,
        } => cmd_check(&app, session_id, step_id, image, audio, transcript).await,
        Command::Audit { action } => cmd_audit(&app, action).await,
    }
}

async fn cmd_template(app: &App, action: TemplateAction) -> anyhow::Result<()> {
    match action {
        TemplateAction::Load { file } => {
            let raw = tokio::fs::read_to_string(&file).await?;
            let parsed: TemplateFile = serde_json::from_str(&raw)?;
            let template = parsed.into_template();
            template.validate()?;
            TemplateStore::insert(app.store.as_ref(), &template).await?;
            println!(
                "Loaded template {} ({} steps): {}",
                template.id.0,
                template.step_count(),
                template.title
            );
        }
        TemplateAction::Show { id } => {
            let template = TemplateStore::get(app.store.as_ref(), TemplateId(id)).await?;
            println!("Template:  {}", template.title);
            println!("ID:        {}", template.id.0);
            println!("Steps:     {}", template.step_count());
            for step in kakunin::sequencer::flatten(&template) {
                let (t, s) = kakunin::sequencer::position_of(&template, step.id)?;
                println!("  {t}.{s}  {}  {}", step.id.0, step.description);
            }
        }
        TemplateAction::List { limit } => {
            let templates = TemplateStore::list(app.store.as_ref(), limit).await?;
            for t in &templates {
                println!("{}  {:<40}  {} steps", t.id.0, t.title, t.step_count());
            }
            println!("\n{} template(s)", templates.len());
        }
    }
    Ok(())
}

async fn cmd_session(app: &App, action: SessionAction) -> anyhow::Result<()> {
    match action {
        SessionAction::Start {
            template_id,
            worker_id,
        } => {
            let session = app
                .orchestrator
                .start_session(TemplateId(template_id), worker_id)
                .await?;
            println!("Started session {}", session.id.0);
            println!(
                "First step: {}",
                session
                    .current_step_id
                    .map(|s| s.0.to_string())
                    .unwrap_or_default()
            );
        }
        SessionAction::Show { id } => {
            let session = SessionStore::get(app.store.as_ref(), SessionId(id)).await?;
            print_session(&session);
        }
        SessionAction::List { status, limit } => {
            let filter = SessionFilter {
                status: status.map(|s| s.parse()).transpose()?,
                worker_id: None,
                limit: Some(limit),
            };
            let sessions = SessionStore::list(app.store.as_ref(), &filter).await?;
            println!(
                "{:<36}  {:<12}  {:<6}  STARTED",
                "SESSION", "STATUS", "CHECKS"
            );
            for s in &sessions {
                println!(
                    "{:<36}  {:<12}  {:<6}  {}",
                    s.id.0,
                    s.status.to_string(),
                    s.checks.len(),
                    s.started_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} session(s)", sessions.len());
        }
        SessionAction::Pause { id, worker_id } => {
            let s = app
                .orchestrator
                .pause_session(SessionId(id), worker_id)
                .await?;
            println!("Session {} is now {}", s.id.0, s.status);
        }
        SessionAction::Resume { id, worker_id } => {
            let s = app
                .orchestrator
                .resume_session(SessionId(id), worker_id)
                .await?;
            println!("Session {} is now {}", s.id.0, s.status);
        }
        SessionAction::Abort {
            id,
            worker_id,
            reason,
        } => {
            let s = app
                .orchestrator
                .abort_session(SessionId(id), worker_id, reason)
                .await?;
            println!("Session {} is now {}", s.id.0, s.status);
        }
    }
    Ok(())
}

async fn cmd_check(
    app: &App,
    session_id: Uuid,
    step_id: Uuid,
    image: PathBuf,
    audio: Option<PathBuf>,
    transcript: Option<String>,
) -> anyhow::Result<()> {
    let image_bytes = tokio::fs::read(&image).await?;
    let image = ImageData {
        media_type: media_type_of(&image, "image/jpeg"),
        bytes: image_bytes,
    };

    let audio = match audio {
        Some(path) => Some(AudioData {
            media_type: media_type_of(&path, "audio/webm"),
            bytes: tokio::fs::read(&path).await?,
        }),
        None => None,
    };

    let outcome = app
        .orchestrator
        .execute_check(
            SessionId(session_id),
            kakunin::model::template::StepId(step_id),
            Evidence {
                image,
                audio,
                transcript,
            },
        )
        .await?;

    println!("Result:      {}", outcome.result);
    if let Some(c) = outcome.confidence {
        println!("Confidence:  {c:.2}");
    }
    println!("Feedback:    {}", outcome.feedback_text);
    if let Some(audio_ref) = &outcome.audio_ref {
        println!("Audio:       {audio_ref}");
    }
    if outcome.needs_review {
        println!("Flagged for supervisor review");
    }
    println!("Session:     {}", outcome.session_status);
    match &outcome.next_step {
        Some(next) => println!(
            "Next step:   {}.{}  {}",
            next.position.0, next.position.1, next.description
        ),
        None if outcome.session_status == SessionStatus::Completed => {
            println!("All steps done, awaiting supervisor approval")
        }
        None => println!("Retry the same step"),
    }
    Ok(())
}

async fn cmd_audit(app: &App, action: AuditAction) -> anyhow::Result<()> {
    match action {
        AuditAction::List { status, limit } => {
            let filter = SessionFilter {
                status: Some(status.parse()?),
                worker_id: None,
                limit: Some(limit),
            };
            let summaries = app.ledger.list_sessions(&filter).await?;
            println!(
                "{:<36}  {:<30}  {:<6}  {:<6}  COMPLETED",
                "SESSION", "TEMPLATE", "CHECKS", "FAILED"
            );
            for s in &summaries {
                println!(
                    "{:<36}  {:<30}  {:<6}  {:<6}  {}",
                    s.session_id.0,
                    s.template_title,
                    s.check_count,
                    s.failed_check_count,
                    s.completed_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            println!("\n{} session(s)", summaries.len());
        }
        AuditAction::Show { session_id } => {
            let trail = app.ledger.audit_trail(SessionId(session_id)).await?;
            println!("Template:   {}", trail.template_title);
            print_session(&trail.session);
        }
        AuditAction::Approve {
            session_id,
            supervisor_id,
        } => {
            let s = app
                .ledger
                .approve(SessionId(session_id), supervisor_id)
                .await?;
            println!("Session {} approved and locked", s.id.0);
        }
        AuditAction::Reject {
            session_id,
            supervisor_id,
            reason,
        } => {
            let s = app
                .ledger
                .reject(SessionId(session_id), supervisor_id, reason)
                .await?;
            println!("Session {} rejected", s.id.0);
        }
        AuditAction::Override {
            check_id,
            supervisor_id,
            reason,
        } => {
            let outcome = app
                .ledger
                .override_check(CheckId(check_id), supervisor_id, reason)
                .await?;
            println!("Check {} overridden", outcome.check_id.0);
            if outcome.advanced {
                match &outcome.next_step {
                    Some(next) => println!(
                        "Session advanced to {}.{}  {}",
                        next.position.0, next.position.1, next.description
                    ),
                    None => println!("Session completed"),
                }
            }
        }
    }
    Ok(())
}

fn print_session(session: &kakunin::model::session::WorkSession) {
    println!("Session:    {}", session.id.0);
    println!("Worker:     {}", session.worker_id);
    println!("Status:     {}", session.status);
    println!("Locked:     {}", session.locked);
    println!(
        "Step:       {}",
        session
            .current_step_id
            .map(|s| s.0.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Started:    {}", session.started_at);
    if let Some(t) = session.completed_at {
        println!("Completed:  {t}");
    }
    if let Some(t) = session.approved_at {
        println!("Approved:   {t}");
    }
    if let Some(by) = session.resolved_by {
        println!("Resolved by: {by}");
    }
    if let Some(reason) = &session.rejection_reason {
        println!("Rejected:   {reason}");
    }
    if let Some(reason) = &session.abort_reason {
        println!("Abort reason: {reason}");
    }
    println!("Checks ({}):", session.checks.len());
    for c in &session.checks {
        println!(
            "  {}  step {}  {:<8}  review={}  {}",
            c.checked_at.format("%H:%M:%S"),
            c.step_id.0,
            c.result.to_string(),
            c.needs_review,
            c.feedback_text
        );
        if let Some(reason) = &c.override_reason {
            println!("           overridden: {reason}");
        }
    }
}

fn media_type_of(path: &std::path::Path, default: &str) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg".to_string(),
        Some("png") => "image/png".to_string(),
        Some("webp") => "image/webp".to_string(),
        Some("mp3") => "audio/mpeg".to_string(),
        Some("wav") => "audio/wav".to_string(),
        Some("webm") => "audio/webm".to_string(),
        _ => default.to_string(),
    }
}
