use dotenvy::dotenv;
use filegate::bot::{self, handlers::get_user_id_safe, Command, TelegramRelay};
use filegate::config::{Settings, TokenPolicy};
use filegate::delivery::{ChatRelay, DeletionScheduler, Delivery, DeliveryOptions};
use filegate::gate::AccessGate;
use filegate::shortener::{HttpShortener, Shortener};
use filegate::storage::{self, FileRegistry, VerificationStore};
use filegate::subscription::ForceSubscription;
use filegate::verification::{spawn_cleanup_task, TokenVerifier};
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    token1: Regex,
    token2: Regex,
    token3: Regex,
    shortener_api: Regex,
    r2_1: Regex,
    r2_2: Regex,
    r2_3: Regex,
    r2_4: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token1: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token2: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token3: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            shortener_api: Regex::new(r"([?&]api=)[^\s&]+")?,
            r2_1: Regex::new(r"R2_ACCESS_KEY_ID=[^\s&]+")?,
            r2_2: Regex::new(r"R2_SECRET_ACCESS_KEY=[^\s&]+")?,
            r2_3: Regex::new(r"'aws_access_key_id': '[^']*'")?,
            r2_4: Regex::new(r"'aws_secret_access_key': '[^']*'")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token1
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token2
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token3
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .shortener_api
            .replace_all(&output, "${1}[MASKED]")
            .to_string();
        output = self
            .r2_1
            .replace_all(&output, "R2_ACCESS_KEY_ID=[MASKED]")
            .to_string();
        output = self
            .r2_2
            .replace_all(&output, "R2_SECRET_ACCESS_KEY=[MASKED]")
            .to_string();
        output = self
            .r2_3
            .replace_all(&output, "'aws_access_key_id': '[MASKED]'")
            .to_string();
        output = self
            .r2_4
            .replace_all(&output, "'aws_secret_access_key': '[MASKED]'")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length even though the redacted one differs
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

/// Storage backend shared by the verification store and the file registry
struct Backends {
    records: Arc<dyn VerificationStore>,
    files: Arc<dyn FileRegistry>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Redaction must exist before the first log line
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting file store bot...");

    let settings = init_settings();
    let backends = init_storage(&settings).await;

    let shortener: Arc<dyn Shortener> = Arc::new(HttpShortener::new(
        settings.shortener_url.as_deref(),
        settings.shortener_api_token.clone(),
    ));
    let policy = Arc::new(TokenPolicy::new(settings.token_settings()));
    info!(
        "Token system {} (validity {}h)",
        if policy.snapshot().enabled {
            "enabled"
        } else {
            "disabled"
        },
        policy.snapshot().validity_hours
    );

    let verifier = Arc::new(TokenVerifier::new(
        backends.records,
        shortener.clone(),
        policy,
        settings.bot_username.clone(),
    ));
    let bot = Bot::new(settings.telegram_token.clone());
    let telegram = Arc::new(TelegramRelay::new(bot.clone()));

    let subscription = ForceSubscription::from_settings(telegram.clone(), &settings);
    if subscription.is_active() {
        info!(
            "File requests require joining {} channel(s)",
            subscription.channels().len()
        );
    }
    let gate = Arc::new(
        AccessGate::new(verifier.clone(), settings.how_to_verify_link.clone())
            .with_subscription(subscription),
    );

    let relay: Arc<dyn ChatRelay> = telegram;
    let scheduler = Arc::new(DeletionScheduler::new(relay.clone()));
    let delivery = Arc::new(Delivery::new(
        relay,
        backends.files,
        scheduler.clone(),
        DeliveryOptions {
            source_channel: ChatId(settings.db_channel_id),
            protect_content: settings.privacy_mode,
            auto_delete_minutes: settings.auto_delete_time,
        },
    ));

    let shutdown = CancellationToken::new();
    let cleanup = spawn_cleanup_task(
        verifier,
        Duration::from_secs(settings.cleanup_interval_secs.max(1)),
        shutdown.clone(),
    );

    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![gate, delivery, settings, shortener])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Shutting down...");
    shutdown.cancel();
    scheduler.shutdown().await;
    if let Err(e) = cleanup.await {
        error!("Cleanup task ended abnormally: {}", e);
    }

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_storage(settings: &Settings) -> Backends {
    match settings.storage_backend.to_lowercase().as_str() {
        "memory" => {
            info!("Using in-memory storage; records are lost on restart.");
            let storage = Arc::new(storage::MemoryStorage::new());
            Backends {
                records: storage.clone(),
                files: storage,
            }
        }
        "r2" => match storage::R2Storage::new(settings).await {
            Ok(s) => {
                info!("R2 Storage initialized.");
                if s.check_connection().await.is_err() {
                    error!("R2 Storage connection check returned error.");
                }
                let storage = Arc::new(s);
                Backends {
                    records: storage.clone(),
                    files: storage,
                }
            }
            Err(e) => {
                error!("Failed to initialize R2 Storage: {}", e);
                std::process::exit(1);
            }
        },
        other => {
            error!("Unknown STORAGE_BACKEND '{}', expected 'r2' or 'memory'", other);
            std::process::exit(1);
        }
    }
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(
            Update::filter_callback_query()
                .filter(|q: CallbackQuery| {
                    q.data
                        .as_deref()
                        .is_some_and(|d| d.starts_with(bot::views::DELIVER_CALLBACK_PREFIX))
                })
                .endpoint(handle_deliver_callback),
        )
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    gate: Arc<AccessGate>,
    delivery: Arc<Delivery>,
    settings: Arc<Settings>,
    shortener: Arc<dyn Shortener>,
) -> Result<(), teloxide::RequestError> {
    let user_id = get_user_id_safe(&msg);
    let chat_id = msg.chat.id;

    let res = match cmd {
        Command::Start(payload) => {
            bot::handlers::start(bot.clone(), msg, payload, gate, delivery, settings).await
        }
        cmd if cmd.is_admin_only() && !settings.admin_ids().contains(&user_id) => {
            debug!("Ignoring admin command from non-admin {}", user_id);
            Ok(())
        }
        cmd => bot::admin::run(bot.clone(), msg, cmd, gate, shortener).await,
    };

    if let Err(e) = res {
        error!("Command error for user {}: {}", user_id, e);
        if let Err(e) = bot
            .send_message(chat_id, bot::views::GENERIC_ERROR)
            .await
        {
            error!("Failed to send error message to {}: {}", user_id, e);
        }
    }
    respond(())
}

async fn handle_deliver_callback(
    bot: Bot,
    q: CallbackQuery,
    gate: Arc<AccessGate>,
    delivery: Arc<Delivery>,
) -> Result<(), teloxide::RequestError> {
    let user_id = q.from.id;
    if let Err(e) = bot::handlers::deliver_callback(bot.clone(), q, gate, delivery).await {
        error!("Deliver callback error for user {}: {}", user_id, e);
        if let Err(e) = bot
            .send_message(ChatId::from(user_id), bot::views::GENERIC_ERROR)
            .await
        {
            error!("Failed to send error message to {}: {}", user_id, e);
        }
    }
    respond(())
}
