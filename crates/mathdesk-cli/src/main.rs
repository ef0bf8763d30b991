use std::fs;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mathdesk_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use mathdesk_engine::{
    new_session_dir, render_submit_result, AppConfig, ConfigOverrides, SubmitOutcome,
    TurnController, TurnPhase, TurnRenderer, TurnResult,
};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mathdesk", version, about = "Math homework helper chat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session: `/upload <path>` attaches an image, plain lines are questions.
    Chat(ChatArgs),
    /// Single question, optionally about one image.
    Ask(AskArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Session directory; a fresh one under `--root` when omitted.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "sessions")]
    root: PathBuf,
    /// TOML file with `[completion]`, `[store]` and `[aws]` sections.
    #[arg(long)]
    secrets: Option<PathBuf>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// s3, gateway, inline or local.
    #[arg(long)]
    store: Option<String>,
    #[arg(long)]
    bucket: Option<String>,
    #[arg(long)]
    store_dir: Option<PathBuf>,
    #[arg(long)]
    key_scheme: Option<String>,
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long, default_value = "")]
    question: String,
}

impl SessionArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            provider: self.provider.clone(),
            api_key: None,
            model: self.model.clone(),
            store: self.store.clone(),
            bucket: self.bucket.clone(),
            store_dir: self.store_dir.clone(),
            key_scheme: self.key_scheme.clone(),
            timeout_secs: self.timeout_secs,
        }
    }

    fn open(&self) -> Result<(TurnController, PathBuf)> {
        let config = AppConfig::load(self.secrets.as_deref(), &self.overrides())?;
        let session_dir = self
            .out
            .clone()
            .unwrap_or_else(|| new_session_dir(&self.root));
        let controller = TurnController::from_config(&config, &session_dir)?;
        debug!(
            session_id = controller.session_id(),
            model = controller.model(),
            "session opened"
        );
        Ok((controller, session_dir))
    }
}

/// Writes rendered turns to a terminal (or any writer).
struct TerminalRenderer<W: Write> {
    out: W,
}

impl<W: Write> TurnRenderer for TerminalRenderer<W> {
    fn render_assistant_message(&mut self, markdown: &str) {
        let _ = writeln!(self.out, "**Assistant:**\n{markdown}");
    }

    fn render_error(&mut self, message: &str) {
        let _ = writeln!(self.out, "Error: {message}");
    }

    fn render_warning(&mut self, message: &str) {
        let _ = writeln!(self.out, "Warning: {message}");
    }

    fn render_pending(&mut self, _sequence: u64) {
        let _ = writeln!(self.out, "Thinking…");
    }
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mathdesk error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("MATHDESK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Ask(args) => run_ask(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let (mut controller, session_dir) = args.session.open()?;
    println!("Math helper started. Upload a problem with /upload <path>, type 'exit' to stop.");

    let stdin = io::stdin();
    let stdout = io::stdout();
    run_chat_session(&mut controller, stdin.lock(), stdout.lock())?;

    let summary = controller.finish(&session_dir.join("session.json"))?;
    println!(
        "Session {} finished after {} turn(s).",
        summary.session_id, summary.turns_submitted
    );
    Ok(0)
}

fn run_chat_session<R: BufRead, W: Write>(
    controller: &mut TurnController,
    mut input: R,
    out: W,
) -> Result<()> {
    let mut renderer = TerminalRenderer { out };
    let mut line = String::new();

    loop {
        write!(
            renderer.out,
            "[{}]> ",
            controller.state().submission_sequence() + 1
        )?;
        renderer.out.flush()?;

        line.clear();
        let read = match input.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let text = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(text);
        match intent.action.as_str() {
            "help" => {
                writeln!(renderer.out, "Commands: {}", CHAT_HELP_COMMANDS.join("  "))?;
            }
            "status" => {
                let state = controller.state();
                let attachment = state
                    .attached_image()
                    .map(|reference| reference.display_label())
                    .unwrap_or_else(|| "none".to_string());
                writeln!(
                    renderer.out,
                    "Model: {} | turns: {} | image: {attachment}",
                    controller.model(),
                    state.submission_sequence()
                )?;
            }
            "set_model" => {
                let requested = value_as_non_empty_string(intent.command_args.get("model"));
                match controller.select_model(requested.as_deref()) {
                    Ok(selection) => {
                        writeln!(renderer.out, "Model set to {}", selection.model.name)?;
                        if let Some(reason) = selection.fallback_reason {
                            writeln!(renderer.out, "({reason})")?;
                        }
                    }
                    Err(err) => renderer.render_error(&err.to_string()),
                }
            }
            "upload" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    writeln!(renderer.out, "/upload requires a path")?;
                    continue;
                };
                upload_path(controller, Path::new(&path), &mut renderer);
            }
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                writeln!(renderer.out, "Unknown command /{command}. Try /help.")?;
            }
            _ => {
                let prompt = intent.prompt.unwrap_or_default();
                if controller.on_submit_clicked(&prompt, &mut renderer) == TurnPhase::Terminated {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn upload_path<W: Write>(
    controller: &mut TurnController,
    path: &Path,
    renderer: &mut TerminalRenderer<W>,
) -> Option<()> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            renderer.render_warning(&format!("Failed to read {}: {err}", path.display()));
            return None;
        }
    };
    let file_name = upload_file_name(path);
    let reference = controller.on_image_uploaded(&bytes, &file_name, renderer)?;
    let _ = writeln!(
        renderer.out,
        "Attached {file_name} ({})",
        reference.display_label()
    );
    Some(())
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let (mut controller, session_dir) = args.session.open()?;
    let image = match args.image.as_deref() {
        Some(path) => {
            let bytes =
                fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
            Some((bytes, upload_file_name(path)))
        }
        None => None,
    };

    let stdout = io::stdout();
    let mut renderer = TerminalRenderer { out: stdout.lock() };
    let code = ask_once(
        &mut controller,
        image.as_ref().map(|(bytes, name)| (bytes.as_slice(), name.as_str())),
        &args.question,
        &mut renderer,
    );
    controller.finish(&session_dir.join("session.json"))?;
    Ok(code)
}

/// One question, optionally about one image. Returns the process exit code.
fn ask_once(
    controller: &mut TurnController,
    image: Option<(&[u8], &str)>,
    question: &str,
    renderer: &mut dyn TurnRenderer,
) -> i32 {
    if let Some((bytes, file_name)) = image {
        if controller
            .on_image_uploaded(bytes, file_name, renderer)
            .is_none()
        {
            return 1;
        }
    }

    let result = controller.handle_submit(question);
    if matches!(result, Ok(SubmitOutcome::Rejected)) {
        renderer.render_error("nothing to ask: pass --question and/or --image");
    }
    render_submit_result(&result, renderer);
    ask_exit_code(&result)
}

fn ask_exit_code(result: &TurnResult<SubmitOutcome>) -> i32 {
    match result {
        Ok(SubmitOutcome::Answered { .. } | SubmitOutcome::Terminated) => 0,
        Ok(SubmitOutcome::Rejected) => 2,
        Err(_) => 1,
    }
}

fn upload_file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("upload.png")
        .to_string()
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}
