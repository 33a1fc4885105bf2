use std::env;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use framelens_contracts::analysis::{
    export_file_name, write_export, AnalysisResult, ExportDocument, MediaKind,
};
use framelens_contracts::chat::{parse_chat_command, ChatCommand, CHAT_HELP_COMMANDS};
use framelens_contracts::events::{EventKind, EventLog};
use framelens_contracts::session::Session;
use framelens_contracts::taxonomy::Taxonomy;
use framelens_engine::{
    asset_fingerprint, send_follow_up, send_follow_up_streaming, Analyzer, EngineError,
    GeminiClient, DEFAULT_FRAME_COUNT,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "framelens", version, about = "Documentary media analysis CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze an image or video and write the export document.
    Analyze(AnalyzeArgs),
    /// Analyze, then ask follow-up questions in an interactive session.
    Chat(ChatArgs),
    /// Print the embedded media taxonomy as an outline.
    Taxonomy,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    /// Image or video file to analyze.
    #[arg(long)]
    media: PathBuf,
    /// Number of frames to sample from a video.
    #[arg(long, default_value_t = DEFAULT_FRAME_COUNT)]
    frames: usize,
    /// Directory for the export document and event log.
    #[arg(long, default_value = ".")]
    out: PathBuf,
    /// Event log path; defaults to <out>/events.jsonl.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Override the analysis model for both media kinds.
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    analyze: AnalyzeArgs,
    /// Print complete replies instead of streaming fragments.
    #[arg(long)]
    no_stream: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("framelens error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Chat(args) => run_chat(args),
        Command::Taxonomy => {
            println!("{}", Taxonomy::embedded().render_outline());
            Ok(0)
        }
    }
}

/// The credential lives with the caller: resolved here once and handed to
/// the engine, which never reads the environment itself.
fn resolve_api_key() -> Result<String> {
    for name in ["GEMINI_API_KEY", "GOOGLE_API_KEY"] {
        if let Ok(value) = env::var(name) {
            if !value.trim().is_empty() {
                return Ok(value);
            }
        }
    }
    bail!("no API key found; set GEMINI_API_KEY (or GOOGLE_API_KEY)")
}

struct AnalysisRun {
    kind: MediaKind,
    result: AnalysisResult,
    session: Session,
    events: EventLog,
    export_path: PathBuf,
}

fn perform_analysis(args: &AnalyzeArgs) -> Result<AnalysisRun> {
    let kind = MediaKind::from_path(&args.media).with_context(|| {
        format!(
            "unsupported media type: {} (expected an image or video extension)",
            args.media.display()
        )
    })?;
    let media_bytes = std::fs::read(&args.media)
        .with_context(|| format!("failed reading {}", args.media.display()))?;
    let run_id = asset_fingerprint(&media_bytes);

    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventLog::create(events_path, run_id)?;

    let client = GeminiClient::new(resolve_api_key()?)?;
    let mut analyzer = Analyzer::new(client);
    analyzer.set_model(args.model.clone());

    events.log(
        EventKind::AnalysisStarted,
        payload(json!({
            "media": args.media.to_string_lossy(),
            "kind": kind.label(),
        })),
    )?;

    let outcome = match kind {
        MediaKind::Image => analyzer.analyze_image(&args.media),
        MediaKind::Video => analyzer
            .analyze_video(&args.media, args.frames)
            .map(|(result, session, frames)| {
                let logged = events.log(
                    EventKind::FramesSampled,
                    payload(json!({
                        "count": frames.len(),
                        "timestamps": frames
                            .iter()
                            .map(|frame| frame.timestamp)
                            .collect::<Vec<_>>(),
                    })),
                );
                if let Err(err) = logged {
                    eprintln!("event log write failed: {err:#}");
                }
                (result, session)
            }),
    };

    let (result, session) = match outcome {
        Ok(value) => value,
        Err(err) => {
            events.log(
                EventKind::AnalysisFailed,
                payload(json!({ "error": err.to_string() })),
            )?;
            return Err(annotate_engine_error(err));
        }
    };

    events.log(
        EventKind::AnalysisCompleted,
        payload(json!({
            "model": session.model,
            "events": result.events.len(),
            "key_people": result.key_people.len(),
        })),
    )?;

    let export_path = args.out.join(export_file_name(kind, &args.media));
    write_export(&export_path, &ExportDocument::from(&result))?;
    events.log(
        EventKind::ExportWritten,
        payload(json!({ "path": export_path.to_string_lossy() })),
    )?;

    Ok(AnalysisRun {
        kind,
        result,
        session,
        events,
        export_path,
    })
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let run = perform_analysis(&args)?;
    print_analysis(&run.result);
    println!("\nExport written to {}", run.export_path.display());
    Ok(0)
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let mut streaming = !args.no_stream;
    let AnalysisRun {
        kind: _,
        result,
        mut session,
        events,
        export_path,
    } = perform_analysis(&args.analyze)?;

    print_analysis(&result);
    println!("\nExport written to {}", export_path.display());
    println!("\nChat session started. Type /help for commands.");

    let mut client = GeminiClient::new(resolve_api_key()?)?;
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        match parse_chat_command(&line) {
            ChatCommand::Noop => continue,
            ChatCommand::Help => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join("  "));
            }
            ChatCommand::Quit => break,
            ChatCommand::Stream { enabled } => {
                streaming = enabled;
                println!("Streaming {}", if streaming { "on" } else { "off" });
            }
            ChatCommand::Export { path } => {
                let target = path
                    .map(PathBuf::from)
                    .unwrap_or_else(|| export_path.clone());
                write_export(&target, &ExportDocument::from(&result))?;
                events.log(
                    EventKind::ExportWritten,
                    payload(json!({ "path": target.to_string_lossy() })),
                )?;
                println!("Export written to {}", target.display());
            }
            ChatCommand::Unknown { command } => {
                println!("Unknown command /{command}; type /help for commands");
            }
            ChatCommand::Message(message) => {
                match send_chat_turn(&client, &mut session, &message, streaming) {
                    Ok(reply_chars) => {
                        events.log(
                            EventKind::ChatTurn,
                            payload(json!({
                                "session": session.id,
                                "streamed": streaming,
                                "reply_chars": reply_chars,
                            })),
                        )?;
                    }
                    Err(EngineError::MissingCredential) => {
                        println!("The backend rejected the API key. The session is still live.");
                        print!("New API key (blank to cancel): ");
                        io::stdout().flush()?;
                        match reenter_api_key(&mut stdin.lock())? {
                            Some(replacement) => {
                                client = replacement;
                                println!("Key updated; ask your question again.");
                            }
                            None => {
                                println!("Keeping the current key; the turn was not sent.");
                            }
                        }
                    }
                    Err(err) => {
                        // nothing was recorded; the same question can be re-asked
                        println!("Turn failed: {err}");
                    }
                }
            }
        }
    }

    Ok(0)
}

/// Reads a replacement key after the backend rejects the current one. A
/// running process cannot observe a changed shell export, so the key is
/// taken from the terminal; a blank line cancels.
fn reenter_api_key(input: &mut impl BufRead) -> Result<Option<GeminiClient>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let entered = line.trim();
    if entered.is_empty() {
        return Ok(None);
    }
    Ok(Some(GeminiClient::new(entered)?))
}

/// Sends one follow-up turn, printing the reply as it arrives when
/// streaming. Returns the reply length in characters.
fn send_chat_turn(
    client: &GeminiClient,
    session: &mut Session,
    message: &str,
    streaming: bool,
) -> Result<usize, EngineError> {
    if !streaming {
        let reply = send_follow_up(client, session, message)?;
        println!("{reply}");
        return Ok(reply.chars().count());
    }

    let mut reply = send_follow_up_streaming(client, session, message)?;
    let mut printed = 0usize;
    let mut failure = None;
    for fragment in &mut reply {
        match fragment {
            Ok(text) => {
                print!("{text}");
                let _ = io::stdout().flush();
                printed += text.chars().count();
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    println!();
    match failure {
        Some(err) => Err(err),
        None => Ok(printed),
    }
}

fn print_analysis(result: &AnalysisResult) {
    if let Some(title) = &result.suggested_title {
        println!("# {title}\n");
    }
    if let Some(synopsis) = &result.synopsis {
        println!("{synopsis}\n");
    }
    println!("{}", result.analysis);

    if let Some(classification) = &result.taxonomy_classification {
        println!("\nClassification: {}", classification.path);
    }
    if !result.events.is_empty() {
        println!("\nKey moments:");
        for event in &result.events {
            println!("  [{}] {}", event.time_string, event.description);
        }
    }
    if !result.key_people.is_empty() {
        println!("\nKey people:");
        for person in &result.key_people {
            println!("  [{}] {}: {}", person.time_string, person.name, person.description);
        }
    }
}

fn annotate_engine_error(err: EngineError) -> anyhow::Error {
    match &err {
        EngineError::MissingCredential => anyhow::Error::new(err)
            .context("set GEMINI_API_KEY (or GOOGLE_API_KEY) to a valid key"),
        _ => err.into(),
    }
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
