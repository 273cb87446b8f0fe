#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use astryx::accumulator::{spawn_accumulator, ChatStore};
use astryx::api::{ApiClient, CreateTaskRequest, NotificationSettings, SessionProvider, StaticSession, SupportEmail};
use astryx::config::*;
use astryx::constants::*;
use astryx::panel::{PanelTab, SidePanel};
use astryx::session::ChatController;
use astryx::settings::{JsonFileStore, KeyValueStore, Persisted, SavedChats, ThemeSettings, TtsSettings};
use astryx::streaming::{HttpTransport, StreamOutcome};
use astryx::view::{drive_view, ExtractMode, MessageView, ViewOptions, ViewUpdate};
use astryx::*;

use clap::Parser;
use colored::*;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = match astryx::logging::init_tracing(&args.log_dir, args.verbose) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    astryx::logging::setup_panic_hook();

    if let Err(e) = run(args).await {
        tracing::error!("{}", e);
        eprintln!("{} {}", "error:".red().bold(), e.inner);
        std::process::exit(1);
    }
}

struct App {
    args: Args,
    session: Arc<dyn SessionProvider>,
    api: ApiClient,
    store: Arc<dyn KeyValueStore>,
}

async fn run(args: Args) -> Result<()> {
    let session: Arc<dyn SessionProvider> =
        Arc::new(StaticSession::new(args.access_token.clone()));
    let api = ApiClient::new(
        args.api_base_url.clone(),
        args.request_timeout(),
        args.connect_timeout(),
        session.clone(),
    )?;
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&args.data_dir)?);
    let app = App {
        args,
        session,
        api,
        store,
    };

    match &app.args.command {
        Command::Ask {
            query,
            chat_id,
            extract,
        } => ask(&app, query, chat_id.clone(), (*extract).into()).await,
        Command::Replay { chat_id, remote } => replay(&app, chat_id.clone(), *remote).await,
        Command::Chats { action } => chats(&app, action).await,
        Command::Tasks { action } => tasks(&app, action).await,
        Command::Support {
            username,
            email,
            issue,
        } => {
            app.api
                .send_support_email(&SupportEmail {
                    username: username.clone(),
                    useremail: email.clone(),
                    issue: issue.clone(),
                })
                .await?;
            println!("{}", "Support request sent.".green());
            Ok(())
        }
        Command::Health => {
            let health = app.api.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Command::Theme { action } => theme(&app, action),
        Command::Tts { action } => tts(&app, action),
        Command::Saved { action } => saved(&app, action),
    }
}

// --- ASK ---

async fn ask(app: &App, query: &str, chat_id: Option<String>, mode: ExtractMode) -> Result<()> {
    let chat_store = ChatStore::load(app.store.as_ref())?;
    let (accumulator, acc_task) = spawn_accumulator(chat_store, Some(app.store.clone()));

    let chat_id = match chat_id {
        Some(id) => ChatId::from(id),
        None => {
            let chat = app.api.create_chat(query).await?;
            println!("{} {}", "New chat:".dimmed(), chat.title.bold());
            accumulator.set_current_chat(Some(chat.id.clone()), Some(chat.title))?;
            chat.id
        }
    };

    let stream_client = reqwest::Client::builder()
        .connect_timeout(app.args.connect_timeout())
        .build()?;
    let transport = Arc::new(HttpTransport::new(
        stream_client,
        app.args.stream_url(),
        app.session.clone(),
    ));
    tracing::info!("Streaming from {}", transport.endpoint());

    let mut controller = ChatController::new(
        transport,
        accumulator.clone(),
        UserId::from(app.args.user_id.clone()),
    );

    let events = accumulator.subscribe();
    let ticket = controller.submit_prompt(&chat_id, query)?;
    println!("{} {}\n", "you:".blue().bold(), query.trim());
    print!("{} ", "assistant:".magenta().bold());
    flush();

    let options = ViewOptions {
        animate: !app.args.no_animation,
        mode,
    };
    let view = MessageView::streaming(chat_id.clone(), ticket.message_id.clone(), options);
    let mut renderer = LiveRenderer::default();
    let mut panel = SidePanel::new();
    panel.switch_chat(&chat_id);
    let view_cancel = CancellationToken::new();

    let view = {
        let drive = drive_view(
            view,
            &accumulator,
            events,
            app.args.reveal_interval(),
            &view_cancel,
            |view, update| {
                renderer.on_update(view);
                apply_panel(&mut panel, update);
            },
        );
        tokio::pin!(drive);

        tokio::select! {
            v = &mut drive => v?,
            _ = tokio::signal::ctrl_c() => {
                if controller.abort(&chat_id) {
                    eprintln!("\n{}", "(stopped)".yellow());
                }
                drive.await?
            }
        }
    };

    renderer.finish(&view);
    print_panel(&panel);

    let outcome = controller.wait(&chat_id).await;
    let message = accumulator.message(&chat_id, &ticket.message_id).await?;
    if let Some(rt) = message.as_ref().and_then(|m| m.response_time) {
        println!("{}", format!("answered in {}", rt).dimmed());
    }

    if outcome == Some(StreamOutcome::Completed) {
        if let Some(m) = &message {
            sync_to_backend(app, &chat_id, query, &m.content).await;
        }
    }

    drop(controller);
    drop(accumulator);
    if let Err(e) = acc_task.await {
        tracing::error!("Accumulator task failed: {}", e);
    }

    match outcome {
        Some(StreamOutcome::Failed(reason)) => Err(AstryxError::Protocol(reason).into()),
        _ => Ok(()),
    }
}

async fn sync_to_backend(app: &App, chat_id: &ChatId, query: &str, answer: &str) {
    for (content, is_ai) in [(query, false), (answer, true)] {
        match app.api.add_message(chat_id, content, is_ai).await {
            Ok((_, rt)) => tracing::debug!("Stored message (is_ai={}) in {}", is_ai, rt),
            Err(e) => tracing::warn!("Could not store message in backend: {}", e.inner),
        }
    }
}

/// Prints the markdown of a streaming message as it grows. Structured blocks
/// are listed once the message settles.
#[derive(Default)]
struct LiveRenderer {
    printed: String,
}

impl LiveRenderer {
    fn on_update(&mut self, view: &MessageView) {
        let text = markdown_only(view.segments());
        if let Some(rest) = text.strip_prefix(self.printed.as_str()) {
            if !rest.is_empty() {
                print!("{}", rest);
                flush();
                self.printed = text;
            }
        }
    }

    fn finish(&mut self, view: &MessageView) {
        let text = markdown_only(view.segments());
        match text.strip_prefix(self.printed.as_str()) {
            Some(rest) => print!("{}", rest),
            None => print!("\n{}", text),
        }
        println!("\n");
        for segment in view.segments().iter().filter(|s| s.is_structured()) {
            print_segment(segment);
        }
        for failure in &view.extraction().failures {
            tracing::warn!("Chart block could not be rendered: {}", failure.reason);
        }
    }
}

fn markdown_only(segments: &[ContentSegment]) -> String {
    let parts: Vec<&str> = segments
        .iter()
        .filter_map(|s| match s {
            ContentSegment::Markdown { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    parts.join("\n\n")
}

fn print_segment(segment: &ContentSegment) {
    match segment {
        ContentSegment::Markdown { text } => println!("{}", text),
        ContentSegment::Chart { payload } => {
            println!(
                "{} {} {}",
                "[chart]".cyan().bold(),
                payload.display_title().bold(),
                format!("({}, {} points)", payload.family(), payload.data.len()).dimmed()
            );
            for warning in astryx::extract::validate_chart(payload) {
                println!("  {}", warning.yellow());
            }
        }
        ContentSegment::Code { text, language } => {
            let label = match language {
                Some(l) => l.as_str(),
                None => "code",
            };
            println!("{}", format!("[{}]", label).cyan().bold());
            println!("{}", text.yellow());
        }
    }
}

fn apply_panel(panel: &mut SidePanel, update: &ViewUpdate) {
    if let Some(patch) = &update.panel_patch {
        panel.apply(patch.clone());
    }
}

fn print_panel(panel: &SidePanel) {
    if !panel.is_open() {
        return;
    }
    let tab = match panel.active_tab() {
        PanelTab::Chart => "charts",
        PanelTab::Code => "code",
    };
    let position = match panel.position() {
        Some((i, n)) => format!("{} / {}", i, n),
        None => "empty".to_string(),
    };
    println!(
        "{}",
        format!(
            "panel: {} {} ({} charts, {} code blocks)",
            tab,
            position,
            panel.charts().len(),
            panel.code_blocks().len()
        )
        .dimmed()
    );
}

fn flush() {
    let _ = std::io::stdout().flush();
}

// --- REPLAY ---

async fn replay(app: &App, chat_id: Option<String>, remote: bool) -> Result<()> {
    let mut chat_store = ChatStore::load(app.store.as_ref())?;
    let chat_id = match chat_id.map(ChatId::from) {
        Some(id) => id,
        None => match chat_store.current_chat_id() {
            Some(id) => id.clone(),
            None => {
                return Err(AstryxError::Protocol("no chat selected; pass --chat-id".to_string()).into())
            }
        },
    };

    if remote {
        let history = app.api.chat_messages(&chat_id).await?;
        chat_store.set_history_newest_first(&chat_id, history);
        chat_store.save(app.store.as_ref())?;
    }

    let mut panel = SidePanel::new();
    panel.switch_chat(&chat_id);
    let options = ViewOptions {
        animate: false,
        mode: ExtractMode::DisplayText,
    };

    for message in chat_store.messages(&chat_id) {
        if !message.is_ai {
            println!("{} {}\n", "you:".blue().bold(), message.content.trim());
            continue;
        }
        let (view, update) = MessageView::settled(chat_id.clone(), message, options);
        println!("{}", "assistant:".magenta().bold());
        for segment in view.segments() {
            print_segment(segment);
        }
        if let Some(rt) = message.response_time {
            println!("{}", format!("answered in {}", rt).dimmed());
        }
        println!();
        apply_panel(&mut panel, &update);
    }
    print_panel(&panel);
    Ok(())
}

// --- CHATS / TASKS ---

async fn chats(app: &App, action: &ChatsAction) -> Result<()> {
    match action {
        ChatsAction::List => {
            for chat in app.api.list_chats().await? {
                let created = match chat.created_at {
                    Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
                    None => String::new(),
                };
                println!("{}  {}  {}", chat.id.to_string().dimmed(), chat.title, created.dimmed());
            }
        }
        ChatsAction::Delete { chat_id } => {
            let chat_id = ChatId::from(chat_id.as_str());
            app.api.delete_chat(&chat_id).await?;

            let mut chat_store = ChatStore::load(app.store.as_ref())?;
            if chat_store.remove_chat(&chat_id) {
                chat_store.save(app.store.as_ref())?;
            }
            let mut saved = Persisted::<SavedChats>::load(app.store.clone(), SAVED_CHATS_KEY)?;
            saved.update(|s| s.remove(&chat_id))?;
            println!("{} {}", "Deleted chat".green(), chat_id);
        }
    }
    Ok(())
}

async fn tasks(app: &App, action: &TasksAction) -> Result<()> {
    match action {
        TasksAction::List { page, limit } => {
            for task in app.api.list_tasks(*page, *limit).await? {
                let state = if task.active { "active".green() } else { "inactive".dimmed() };
                let query = match &task.task_query {
                    Some(q) => q.as_str(),
                    None => task.query.as_deref().unwrap_or(""),
                };
                println!("{}  {}  {}  {}", task.id.dimmed(), state, task.cron.as_deref().unwrap_or("-"), query);
            }
        }
        TasksAction::Show { task_id } => {
            let task = app.api.get_task(task_id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TasksAction::Delete { task_id } => {
            app.api.delete_task(task_id).await?;
            println!("{} {}", "Deactivated task".green(), task_id);
        }
        TasksAction::Create {
            title,
            description,
            cron,
            event,
        } => {
            let task = app
                .api
                .create_task(&CreateTaskRequest {
                    title: title.clone(),
                    description: description.clone(),
                    cron_expression: cron.clone(),
                    event_type: (*event).into(),
                    notification_settings: NotificationSettings::default(),
                })
                .await?;
            println!("{} {}", "Created task".green(), task.id);
        }
    }
    Ok(())
}

// --- LOCAL SETTINGS ---

fn theme(app: &App, action: &ThemeAction) -> Result<()> {
    let mut theme = Persisted::<ThemeSettings>::load(app.store.clone(), THEME_STORE_KEY)?;
    match action {
        ThemeAction::Show => println!("{}", theme.get().theme),
        ThemeAction::Toggle => {
            let now = theme.update(|t| t.toggle())?;
            println!("Theme set to {}", now.to_string().bold());
        }
    }
    Ok(())
}

fn tts(app: &App, action: &TtsAction) -> Result<()> {
    let mut tts = Persisted::<TtsSettings>::load(app.store.clone(), TTS_STORE_KEY)?;
    match action {
        TtsAction::Show => {}
        TtsAction::Set {
            voice,
            rate,
            pitch,
            volume,
        } => {
            tts.update(|t| {
                if voice.is_some() {
                    t.set_voice(voice.clone());
                }
                if let Some(r) = rate {
                    t.set_rate(*r);
                }
                if let Some(p) = pitch {
                    t.set_pitch(*p);
                }
                if let Some(v) = volume {
                    t.set_volume(*v);
                }
            })?;
        }
        TtsAction::Reset => tts.update(|t| t.reset())?,
    }
    let t = tts.get();
    println!(
        "voice={} rate={:.1} pitch={:.1} volume={:.1}",
        t.voice_name.as_deref().unwrap_or("(system)"),
        t.rate,
        t.pitch,
        t.volume
    );
    Ok(())
}

fn saved(app: &App, action: &SavedAction) -> Result<()> {
    let mut saved = Persisted::<SavedChats>::load(app.store.clone(), SAVED_CHATS_KEY)?;
    let user_id = app.args.user_id.as_str();
    match action {
        SavedAction::List => {
            for chat in saved.get().for_user(user_id) {
                println!(
                    "{}  {}  {}",
                    chat.chat_id.to_string().dimmed(),
                    chat.title,
                    chat.saved_at.format("%Y-%m-%d").to_string().dimmed()
                );
            }
        }
        SavedAction::Add { chat_id, title } => {
            let chat_id = ChatId::from(chat_id.as_str());
            let title = match title {
                Some(t) => t.clone(),
                None => chat_id.to_string(),
            };
            if saved.update(|s| s.save(&chat_id, &title, user_id))? {
                println!("{} {}", "Saved".green(), title);
            } else {
                println!("{}", "Already saved.".dimmed());
            }
        }
        SavedAction::Remove { chat_id } => {
            let chat_id = ChatId::from(chat_id.as_str());
            if saved.update(|s| s.remove(&chat_id))? {
                println!("{} {}", "Removed".green(), chat_id);
            }
        }
    }
    Ok(())
}
