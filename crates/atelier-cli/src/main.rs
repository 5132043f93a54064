use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use atelier_contracts::chat::ExplicitMode;
use atelier_contracts::sessions::SessionStore;
use atelier_engine::{CreativeEngine, Request};
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Atelier creative orchestrator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one request through the orchestrator and print the result.
    Ask(AskArgs),
    /// Re-run the most recent user request in the session.
    Regenerate(SessionArgs),
    /// Print the stored conversation.
    History(SessionArgs),
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    text: String,
    #[arg(long, default_value = "atelier-data")]
    out: PathBuf,
    #[arg(long)]
    session: Option<PathBuf>,
    /// Path to an uploaded image to transform or composite.
    #[arg(long)]
    image: Option<PathBuf>,
    /// Explicit mode hint: "image" or "video".
    #[arg(long)]
    mode: Option<String>,
    /// Location of a prior artifact to refine.
    #[arg(long)]
    refine: Option<String>,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long, default_value = "atelier-data")]
    out: PathBuf,
    #[arg(long)]
    session: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("atelier error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Ask(args) => run_ask(args),
        Command::Regenerate(args) => run_regenerate(args),
        Command::History(args) => run_history(args),
    }
}

fn parse_mode(raw: &str) -> Result<ExplicitMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "image" => Ok(ExplicitMode::Image),
        "video" => Ok(ExplicitMode::Video),
        other => bail!("unknown mode '{other}' (expected 'image' or 'video')"),
    }
}

fn open_engine_and_session(
    out: &PathBuf,
    session: Option<PathBuf>,
) -> Result<(CreativeEngine, SessionStore)> {
    let engine = CreativeEngine::new(out.join("media"), out.join("events.jsonl"))?;
    let session_path = session.unwrap_or_else(|| out.join("session.json"));
    Ok((engine, SessionStore::open(session_path)))
}

fn run_ask(args: AskArgs) -> Result<()> {
    let (engine, mut session) = open_engine_and_session(&args.out, args.session)?;

    let attached_image = match &args.image {
        Some(path) => Some(
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?,
        ),
        None => None,
    };
    let explicit_mode = args.mode.as_deref().map(parse_mode).transpose()?;

    let request = Request {
        text: args.text,
        attached_image,
        explicit_mode,
        refinement_target: args.refine,
    };
    let result = engine.orchestrate(&mut session, &request)?;
    println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    Ok(())
}

fn run_regenerate(args: SessionArgs) -> Result<()> {
    let (engine, mut session) = open_engine_and_session(&args.out, args.session)?;

    let Some(text) = session.last_user_text() else {
        bail!("no user message to regenerate from");
    };
    let result = engine.orchestrate(&mut session, &Request::from_text(text))?;
    println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    Ok(())
}

fn run_history(args: SessionArgs) -> Result<()> {
    let (_, session) = open_engine_and_session(&args.out, args.session)?;

    let messages: Vec<_> = session
        .messages()
        .iter()
        .map(|message| {
            json!({
                "role": message.role,
                "content": message.content,
                "intent": message.intent,
                "artifacts": message.artifacts,
                "created_at": message.created_at,
            })
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "session_id": session.session_id,
            "title": session.title,
            "messages": messages,
        }))?
    );
    Ok(())
}
