use crate::{
    backend::MediaProvider,
    config::Config,
    error::{AppError, ExtractError},
    formats::{human_duration, select_formats, FormatChoice},
    i18n::{describe_error, describe_extract_error, render, text, Lang, Text},
    messenger::ReplyTarget,
    normalize::{
        extract_first_url, is_supported, is_tiktok_photo, is_tiktok_short_link, stable_key,
        strip_query, Platform,
    },
    pipeline::DeliveryPipeline,
    store::UserStore,
    tokens::{
        build_download_callback, build_language_callback, parse_callback, CallbackAction,
        DeliveryKind, ResolvedRequest, SelectionToken,
    },
};
use std::{fmt::Display, sync::Arc};
use teloxide::{
    dispatching::DpHandlerDescription,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode, User},
    utils::command::BotCommands,
    ApiError, RequestError,
};
use tracing::{debug, info, instrument, warn, Instrument};

const MENU_TITLE_CHARS: usize = 200;
const STATUS_JOB_LINES: usize = 10;

#[derive(Clone)]
pub struct AppServices {
    config: Arc<Config>,
    pipeline: Arc<DeliveryPipeline>,
    media: Arc<dyn MediaProvider>,
    users: Arc<dyn UserStore>,
    http: reqwest::Client,
}

impl AppServices {
    pub fn new(
        config: Arc<Config>,
        pipeline: Arc<DeliveryPipeline>,
        media: Arc<dyn MediaProvider>,
        users: Arc<dyn UserStore>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            pipeline,
            media,
            users,
            http,
        }
    }

    async fn lang_of(&self, user: Option<&User>) -> Lang {
        match user {
            Some(user) => self.users.get_language(user.id.0).await,
            None => Lang::default(),
        }
    }

    async fn touch(&self, user: Option<&User>) {
        if let Some(user) = user {
            if let Err(err) = self.users.touch_user(user.id.0).await {
                warn!(event = "touch_user_failed", user_id = user.id.0, error = %err);
            }
        }
    }
}

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Commands:")]
pub enum Command {
    #[command(description = "greeting and language choice")]
    Start,
    #[command(description = "show your user id")]
    Id,
    #[command(description = "admin: drop every cached delivery")]
    CacheClear,
    #[command(description = "admin: trim caches to their capacity")]
    CachePrune,
    #[command(description = "admin: send a text to every user")]
    Broadcast(String),
    #[command(description = "admin: copy the replied-to post to every user")]
    BroadcastPost,
    #[command(description = "admin: running jobs and cache sizes")]
    Status,
}

pub fn build_handler() -> Handler<'static, DependencyMap, Result<(), AppError>, DpHandlerDescription> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(Update::filter_message().filter_map(extract_link).endpoint(handle_link))
        .branch(Update::filter_callback_query().endpoint(handle_callback))
}

fn extract_link(msg: Message) -> Option<(Message, String)> {
    let body = msg.text().or_else(|| msg.caption())?;
    let url = extract_first_url(body)?;
    Some((msg, url))
}

fn language_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("🇺🇿 O‘zbekcha", build_language_callback(Lang::Uz)),
        InlineKeyboardButton::callback("🇷🇺 Русский", build_language_callback(Lang::Ru)),
    ]])
}

#[instrument(skip(bot, services, msg), fields(chat_id = msg.chat.id.0))]
async fn handle_command(bot: Bot, services: AppServices, msg: Message, cmd: Command) -> Result<(), AppError> {
    let user = msg.from();
    let user_id = user.map(|u| u.id.0);
    let lang = services.lang_of(user).await;
    let is_admin = user_id.map(|id| services.config.is_admin(id)).unwrap_or(false);

    match cmd {
        Command::Start => {
            services.touch(user).await;
            bot.send_message(msg.chat.id, text(lang, Text::Start))
                .parse_mode(ParseMode::Html)
                .disable_web_page_preview(true)
                .reply_markup(language_keyboard())
                .await?;
        }
        Command::Id => {
            let shown = user_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into());
            bot.send_message(msg.chat.id, format!("ID: {shown}")).await?;
        }
        _ if !is_admin => {
            bot.send_message(msg.chat.id, text(lang, Text::NotAdmin)).await?;
        }
        Command::CacheClear => {
            let removed: usize = services.pipeline.caches().iter().map(|c| c.clear()).sum();
            info!(event = "cache_cleared", removed);
            bot.send_message(
                msg.chat.id,
                render(lang, Text::CacheCleared, &[("n", removed.to_string())]),
            )
            .await?;
        }
        Command::CachePrune => {
            let removed: usize = services
                .pipeline
                .caches()
                .iter()
                .map(|c| c.prune(c.capacity()))
                .sum();
            bot.send_message(
                msg.chat.id,
                render(lang, Text::CachePruned, &[("n", removed.to_string())]),
            )
            .await?;
        }
        Command::Broadcast(body) => {
            let body = body.trim();
            if body.is_empty() {
                bot.send_message(msg.chat.id, text(lang, Text::UsageBroadcast)).await?;
                return Ok(());
            }
            broadcast(&bot, &services, msg.chat.id, lang, Broadcast::Text(body)).await?;
        }
        Command::BroadcastPost => {
            let Some(post) = msg.reply_to_message() else {
                bot.send_message(msg.chat.id, text(lang, Text::UsageBroadcastPost)).await?;
                return Ok(());
            };
            let payload = Broadcast::Copy { from: post.chat.id, message: post.id };
            broadcast(&bot, &services, msg.chat.id, lang, payload).await?;
        }
        Command::Status => {
            bot.send_message(msg.chat.id, status_report(&services.pipeline)).await?;
        }
    }
    Ok(())
}

/// What an admin fan-out delivers to each user.
#[derive(Clone, Copy, Debug)]
enum Broadcast<'a> {
    Text(&'a str),
    /// A copy of an existing post, keeping its media and formatting.
    Copy { from: ChatId, message: MessageId },
}

async fn broadcast(
    bot: &Bot,
    services: &AppServices,
    reply_chat: ChatId,
    lang: Lang,
    payload: Broadcast<'_>,
) -> Result<(), AppError> {
    let users = services.users.list_users().await;
    bot.send_message(
        reply_chat,
        render(lang, Text::BroadcastStarted, &[("n", users.len().to_string())]),
    )
    .await?;

    let (mut sent, mut failed) = (0usize, 0usize);
    for user_id in users {
        let target = ChatId(user_id as i64);
        let outcome = match payload {
            Broadcast::Text(body) => bot.send_message(target, body).await.map(|_| ()),
            Broadcast::Copy { from, message } => bot.copy_message(target, from, message).await.map(|_| ()),
        };
        match outcome {
            Ok(()) => sent += 1,
            Err(err) => {
                debug!(event = "broadcast_send_failed", user_id, error = %err);
                failed += 1;
            }
        }
    }
    info!(event = "broadcast_done", sent, failed);
    bot.send_message(
        reply_chat,
        render(
            lang,
            Text::BroadcastDone,
            &[("sent", sent.to_string()), ("failed", failed.to_string())],
        ),
    )
    .await?;
    Ok(())
}

fn status_report(pipeline: &DeliveryPipeline) -> String {
    let mut lines = Vec::new();
    let jobs = pipeline.jobs().counts_by_state();
    if jobs.is_empty() {
        lines.push("jobs: none".to_string());
    } else {
        for (state, count) in jobs {
            lines.push(format!("jobs {state}: {count}"));
        }
    }
    for (id, job) in pipeline.jobs().snapshot().into_iter().take(STATUS_JOB_LINES) {
        lines.push(format!(
            "  {} {} {} {}s {}",
            id.as_str(),
            job.kind.as_str(),
            job.state.as_str(),
            job.started_at.elapsed().as_secs(),
            job.url
        ));
    }
    let scheduler = pipeline.scheduler();
    lines.push(format!(
        "downloads: {}/{}",
        scheduler.in_flight(),
        scheduler.permits()
    ));
    for cache in pipeline.caches() {
        lines.push(format!("cache {}: {}/{}", cache.name(), cache.len(), cache.capacity()));
    }
    lines.push(format!("selection tokens: {}", pipeline.tokens().len()));
    lines.join("\n")
}

#[instrument(skip(bot, services, msg_and_url), fields(chat_id = msg_and_url.0.chat.id.0))]
async fn handle_link(bot: Bot, services: AppServices, msg_and_url: (Message, String)) -> Result<(), AppError> {
    let (msg, url) = msg_and_url;
    let user = msg.from();
    services.touch(user).await;
    let lang = services.lang_of(user).await;
    let origin = ReplyTarget::new(msg.chat.id.0, Some(msg.id.0));

    let platform = Platform::detect(&url);
    let url = match platform {
        Some(Platform::TikTok) => strip_query(&expand_tiktok_link(&services.http, &url).await),
        _ => url,
    };
    if !is_supported(&url) {
        bot.send_message(msg.chat.id, text(lang, Text::UnsupportedUrl))
            .reply_to_message_id(msg.id)
            .await?;
        return Ok(());
    }
    info!(event = "link_received", url = %url, platform = ?platform);

    if platform.map(Platform::offers_format_choice).unwrap_or(false) {
        let placeholder = bot
            .send_message(msg.chat.id, text(lang, Text::Fetching))
            .reply_to_message_id(msg.id)
            .await?;
        tokio::spawn(
            async move {
                if let Err(err) = show_format_menu(&bot, &services, &placeholder, &url, origin, lang).await {
                    warn!(event = "format_menu_failed", error = %err);
                }
            }
            .in_current_span(),
        );
        return Ok(());
    }

    let tokens = services.pipeline.tokens();
    let put = |kind: DeliveryKind| tokens.put(ResolvedRequest::new(url.clone(), kind, origin, lang));
    let (prompt, rows) = if is_tiktok_photo(&url) {
        (
            Text::TikTokPhoto,
            vec![
                vec![download_button(text(lang, Text::BtnPhotoZip), &put(DeliveryKind::PhotoBundle))],
                vec![download_button(text(lang, Text::BtnMp3), &put(DeliveryKind::PhotoAudio))],
            ],
        )
    } else {
        (
            Text::Choose,
            vec![
                vec![download_button(text(lang, Text::BtnVideo), &put(DeliveryKind::Video))],
                vec![download_button(text(lang, Text::BtnAudio), &put(DeliveryKind::Audio))],
            ],
        )
    };
    bot.send_message(msg.chat.id, text(lang, prompt))
        .reply_to_message_id(msg.id)
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

/// Short TikTok links hide whether the post is a photo post; follow their redirects.
async fn expand_tiktok_link(http: &reqwest::Client, url: &str) -> String {
    if !is_tiktok_short_link(url) {
        return url.to_string();
    }
    match http.get(url).send().await {
        Ok(response) => {
            let expanded = response.url().to_string();
            debug!(event = "short_link_expanded", from = %url, to = %expanded);
            expanded
        }
        Err(err) => {
            warn!(event = "short_link_expand_failed", url = %url, error = %err);
            url.to_string()
        }
    }
}

fn download_button(label: impl Into<String>, token: &SelectionToken) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(label, build_download_callback(token))
}

fn two_columns(buttons: Vec<InlineKeyboardButton>) -> Vec<Vec<InlineKeyboardButton>> {
    buttons.chunks(2).map(<[_]>::to_vec).collect()
}

#[instrument(skip(bot, services, placeholder, origin, lang))]
async fn show_format_menu(
    bot: &Bot,
    services: &AppServices,
    placeholder: &Message,
    url: &str,
    origin: ReplyTarget,
    lang: Lang,
) -> Result<(), AppError> {
    let info = match services.media.resolve_metadata(url).await {
        Ok(info) => info,
        Err(err) => {
            warn!(
                event = "fetch_formats_failed",
                error = %err,
                transient = err.is_transient(),
                needs_verification = err.needs_verification()
            );
            let message = match err {
                ExtractError::Failed(_) => {
                    render(lang, Text::FormatsError, &[("err", err.to_string())])
                }
                classified => describe_extract_error(&classified, lang),
            };
            return report_user_error(bot, placeholder.chat.id, placeholder.id, &message).await;
        }
    };

    let choices = select_formats(&info);
    let video_id = info.id.clone().unwrap_or_default();
    let tokens = services.pipeline.tokens();
    let buttons: Vec<InlineKeyboardButton> = choices
        .iter()
        .map(|choice| {
            let token = tokens.put(choice_request(url, choice, &video_id, info.title.clone(), origin, lang));
            download_button(choice.label(), &token)
        })
        .collect();
    let mut rows = two_columns(buttons);
    let audio = tokens.put(ResolvedRequest::new(url, DeliveryKind::Audio, origin, lang));
    rows.push(vec![download_button(text(lang, Text::BtnMp3), &audio)]);
    let keyboard = InlineKeyboardMarkup::new(rows);
    info!(
        event = "format_menu_ready",
        choices = choices.len(),
        real_heights = ?info.real_heights()
    );

    if let Err(err) = bot.delete_message(placeholder.chat.id, placeholder.id).await {
        debug!(event = "placeholder_delete_failed", error = %err);
    }

    let caption = render(
        lang,
        Text::YtCaption,
        &[
            ("title", escape_html(&menu_title(info.title.as_deref()))),
            ("duration", human_duration(info.duration)),
        ],
    );
    let chat_id = ChatId(origin.chat_id);
    let reply_to = MessageId(origin.message_id.unwrap_or(placeholder.id.0));

    if let Some(thumb) = info.best_thumbnail().and_then(|t| url::Url::parse(t).ok()) {
        let sent = bot
            .send_photo(chat_id, InputFile::url(thumb))
            .caption(caption.clone())
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard.clone())
            .reply_to_message_id(reply_to)
            .allow_sending_without_reply(true)
            .await;
        match sent {
            Ok(_) => return Ok(()),
            Err(err) => warn!(event = "thumbnail_send_failed", error = %err, "falling back to text"),
        }
    }
    bot.send_message(chat_id, caption)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .reply_to_message_id(reply_to)
        .allow_sending_without_reply(true)
        .await?;
    Ok(())
}

fn choice_request(
    url: &str,
    choice: &FormatChoice,
    video_id: &str,
    title: Option<String>,
    origin: ReplyTarget,
    lang: Lang,
) -> ResolvedRequest {
    let mut request = ResolvedRequest::new(url, DeliveryKind::Video, origin, lang);
    request.format_id = Some(choice.stream.format_id.clone());
    request.has_audio = Some(choice.stream.has_audio());
    request.total_bytes = (choice.total_size > 0).then_some(choice.total_size);
    request.stable_key = stable_key(video_id, choice.height);
    request.title = title;
    request
}

fn menu_title(title: Option<&str>) -> String {
    let title = title.map(str::trim).filter(|t| !t.is_empty()).unwrap_or("YouTube");
    if title.chars().count() > MENU_TITLE_CHARS {
        let mut cut: String = title.chars().take(MENU_TITLE_CHARS - 3).collect();
        cut.push_str("...");
        cut
    } else {
        title.to_string()
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

#[instrument(skip(bot, services, q), fields(user_id = q.from.id.0))]
async fn handle_callback(bot: Bot, services: AppServices, q: CallbackQuery) -> Result<(), AppError> {
    let Some(action) = q.data.as_deref().and_then(parse_callback) else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };

    match action {
        CallbackAction::Language(lang) => {
            services.users.set_language(q.from.id.0, lang).await?;
            bot.answer_callback_query(q.id)
                .text(text(lang, Text::LangSaved))
                .await?;
            if let Some(message) = &q.message {
                let edited = bot
                    .edit_message_text(message.chat.id, message.id, text(lang, Text::Start))
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true)
                    .reply_markup(language_keyboard())
                    .await;
                if let Err(err) = edited {
                    if !is_message_not_modified(&err) {
                        warn!(event = "start_edit_failed", error = %err);
                    }
                }
            }
        }
        CallbackAction::Download(token) => {
            let lang = services.lang_of(Some(&q.from)).await;
            let request = match services.pipeline.resolve(&token) {
                Ok(request) => request,
                Err(err) => {
                    bot.answer_callback_query(q.id)
                        .text(describe_error(&err, lang))
                        .show_alert(true)
                        .await?;
                    return Ok(());
                }
            };
            if let Err(err) = services.pipeline.precheck(&request) {
                bot.answer_callback_query(q.id)
                    .text(describe_error(&err, request.lang))
                    .show_alert(true)
                    .await?;
                return Ok(());
            }
            bot.answer_callback_query(q.id)
                .text(text(request.lang, Text::DownloadingAnswer))
                .await?;

            let origin = match &q.message {
                Some(message) => {
                    if let Err(err) = bot.delete_message(message.chat.id, message.id).await {
                        debug!(event = "menu_delete_failed", error = %err);
                    }
                    ReplyTarget::new(message.chat.id.0, None)
                }
                None => ReplyTarget::new(q.from.id.0 as i64, None),
            };

            let pipeline = services.pipeline.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = pipeline.run(&token, origin, lang).await {
                        debug!(event = "pipeline_run_failed", error = %err);
                    }
                }
                .in_current_span(),
            );
        }
    }
    Ok(())
}

fn is_message_not_modified(err: &RequestError) -> bool {
    matches!(err, RequestError::Api(ApiError::MessageNotModified))
}

async fn report_user_error(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    err: impl Display,
) -> Result<(), AppError> {
    let text = err.to_string();
    if bot.edit_message_text(chat_id, message_id, text.clone()).await.is_err() {
        let _ = bot.send_message(chat_id, text).await;
    }
    Ok(())
}
