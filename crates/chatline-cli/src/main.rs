use anyhow::{Context, Result};
use chatline_core::{Message, Notification, Role, Settings};
use chatline_sync::api::DEFAULT_API_URL;
use chatline_sync::config::DEFAULT_WS_URL;
use chatline_sync::{
    ApiClient, ConnectionManager, ConnectionState, EngineEvent, StoreEvent, SyncConfig, SyncEngine,
};
use clap::Parser;
use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

#[derive(Clone, Debug)]
struct Config {
    sync: SyncConfig,
    api_url: String,
    conversation: Option<String>,
    model: Option<String>,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "chatline", about = "Terminal chat client with live streamed replies")]
struct Args {
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long, default_value = "")]
    api_url: String,
    /// Conversation to open; a fresh one is started when empty.
    #[arg(long, default_value = "")]
    conversation: String,
    #[arg(long, default_value_t = 10)]
    stall_timeout: u64,
    #[arg(long, default_value_t = 10)]
    backoff_max: u64,
    #[arg(long, default_value = "")]
    model: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Text(String),
    Select(bool),
    New,
    List,
    Quit,
    Unknown(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config);

    let api = ApiClient::new(&config.api_url).context("invalid api url")?;
    let mut settings = match api.get_settings().await {
        Ok(settings) => settings,
        Err(err) => {
            warn!("settings_fetch_error: {err}");
            Settings::default()
        }
    };
    if let Some(model) = &config.model {
        settings.current_model = Some(model.clone());
    }

    let engine = Arc::new(SyncEngine::new(&config.sync));
    match api.list_conversations().await {
        Ok(conversations) => {
            info!("seed_loaded: conversations={}", conversations.len());
            engine.seed(conversations);
        }
        Err(err) => warn!("seed_fetch_error: {err}"),
    }

    let mut conversation_id = match &config.conversation {
        Some(id) => {
            match api.get_conversation(id).await {
                Ok(Some(conversation)) => {
                    print_history(&conversation.messages);
                    engine.open_conversation(conversation);
                }
                Ok(None) => info!("conversation_not_found: id={id}"),
                Err(err) => warn!("conversation_fetch_error: id={id} {err}"),
            }
            id.clone()
        }
        None => new_conversation_id(),
    };

    let renderer = Arc::new(Renderer::default());
    let store_renderer = renderer.clone();
    let _store_subscription = engine.subscribe_store(move |event| store_renderer.on_store(event));
    let engine_renderer = renderer.clone();
    let _engine_subscription = engine.subscribe(move |event| engine_renderer.on_engine(event));

    let manager = ConnectionManager::new(config.sync.clone(), engine.clone());
    let notify_task = tokio::spawn(print_notifications(engine.notifications().subscribe()));
    let state_task = tokio::spawn(print_states(manager.watch_state()));
    let lease = manager.subscribe();
    info!(
        "chatline_start: ws={} api={} conversation={conversation_id}",
        config.sync.ws_url, config.api_url
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Select(selecting) => {
                engine.gate().set_selecting(selecting);
                if !selecting {
                    let flushed = engine.flush_pending();
                    if flushed > 0 {
                        info!("gate_flush: fragments={flushed}");
                    }
                }
            }
            Input::New => {
                conversation_id = new_conversation_id();
                println!("[new conversation {conversation_id}]");
            }
            Input::List => engine.with_store(|store| {
                for conversation in store.conversation_list() {
                    let marker = if store.current_id() == Some(conversation.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {} {} ({} messages)",
                        conversation.id,
                        conversation.title.as_deref().unwrap_or("untitled"),
                        conversation.messages.len()
                    );
                }
            }),
            Input::Unknown(command) => {
                println!("unknown command: {command} (try /select on|off, /new, /list, /quit)")
            }
            Input::Text(text) => {
                engine.set_current_message(text.clone());
                let message = Message::user_text(&conversation_id, text, settings.outbound_meta());
                if let Err(err) = manager.send(message) {
                    warn!("send_rejected: {err}");
                }
            }
        }
    }

    lease.release();
    notify_task.abort();
    state_task.abort();
    Ok(())
}

fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    if !trimmed.starts_with('/') {
        return Input::Text(trimmed.to_string());
    }
    let mut parts = trimmed.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("/quit"), None) => Input::Quit,
        (Some("/new"), None) => Input::New,
        (Some("/list"), None) => Input::List,
        (Some("/select"), Some("on")) => Input::Select(true),
        (Some("/select"), Some("off")) => Input::Select(false),
        _ => Input::Unknown(trimmed.to_string()),
    }
}

fn new_conversation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn print_history(messages: &[Message]) {
    for message in messages {
        println!("{}: {}", message.role, message.text());
    }
}

#[derive(Default)]
struct RenderState {
    open_line: Option<String>,
    printed: HashMap<String, usize>,
}

/// Prints assistant text as it streams in, one line per message.
#[derive(Default)]
struct Renderer {
    state: Mutex<RenderState>,
}

impl Renderer {
    fn on_store(&self, event: &StoreEvent) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out = io::stdout().lock();
        match event {
            StoreEvent::MessageAppended { message, .. } | StoreEvent::MessageMerged { message, .. } => {
                if message.role == Role::User {
                    return;
                }
                if state.open_line.as_deref() != Some(message.id.as_str()) {
                    if state.open_line.is_some() {
                        let _ = writeln!(out);
                    }
                    let _ = write!(out, "{}: ", message.role);
                    state.open_line = Some(message.id.clone());
                }
                let text = message.text();
                let printed = state.printed.get(&message.id).copied().unwrap_or(0);
                let _ = write!(out, "{}", unprinted(&text, printed));
                state.printed.insert(message.id.clone(), text.len().max(printed));
            }
            StoreEvent::CurrentChanged { conversation_id } => {
                if state.open_line.take().is_some() {
                    let _ = writeln!(out);
                }
                let _ = writeln!(out, "[conversation {conversation_id}]");
            }
            _ => {}
        }
        let _ = out.flush();
    }

    fn on_engine(&self, event: &EngineEvent) {
        if let EngineEvent::MessageIncoming(false) = event {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.open_line.take().is_some() {
                println!();
            }
        }
    }
}

/// Suffix of `text` not yet written. Empty when the stored text was replaced by
/// something that no longer extends what was printed.
fn unprinted(text: &str, printed: usize) -> &str {
    if printed >= text.len() || !text.is_char_boundary(printed) {
        return "";
    }
    &text[printed..]
}

async fn print_notifications(mut rx: watch::Receiver<Notification>) {
    while rx.changed().await.is_ok() {
        let notification = rx.borrow_and_update().clone();
        if notification.is_empty() {
            continue;
        }
        let kind = notification.kind.map(|kind| kind.as_str()).unwrap_or("info");
        eprintln!("[{kind}] {}", notification.message);
    }
}

async fn print_states(mut rx: watch::Receiver<ConnectionState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        eprintln!("[{state}]");
    }
}

fn load_config() -> Result<Config> {
    let args = Args::parse();
    let ws_url = resolve_ws_url(&args.ws_url);
    let ws_url = Url::parse(&ws_url).with_context(|| format!("invalid websocket url: {ws_url}"))?;
    let mut sync = SyncConfig::new(ws_url);
    sync.stall_timeout = Duration::from_secs(args.stall_timeout.max(1));
    sync.backoff_max = Duration::from_secs(args.backoff_max.max(1));
    Ok(Config {
        sync,
        api_url: resolve_api_url(&args.api_url),
        conversation: non_empty(&args.conversation),
        model: non_empty(&args.model),
        debug: args.debug || env_true("CHATLINE_DEBUG"),
        log_dir: resolve_log_dir(&args.log_dir),
    })
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CHATLINE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let mirror = env_true("CHATLINE_LOG_STDOUT");
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), mirror));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Log sink. Stdout carries the conversation, so the optional mirror goes to
/// stderr.
struct MultiWriter {
    stderr: Option<io::Stderr>,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>, mirror: bool) -> Self {
        Self {
            stderr: mirror.then(io::stderr),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("chatline-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_flag_or_env(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_ws_url(ws_url_flag: &str) -> String {
    resolve_flag_or_env(ws_url_flag, "CHATLINE_WS_URL", DEFAULT_WS_URL)
}

fn resolve_api_url(api_url_flag: &str) -> String {
    resolve_flag_or_env(api_url_flag, "CHATLINE_API_URL", DEFAULT_API_URL)
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    resolve_flag_or_env(log_dir_flag, "CHATLINE_LOG_DIR", ".chatline/logs")
}
