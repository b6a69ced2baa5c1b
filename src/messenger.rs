use crate::{error::SendError, tokens::DeliveryKind};
use async_trait::async_trait;
use std::path::PathBuf;
use teloxide::{
    prelude::*,
    types::{InputFile, MessageId},
};
use tracing::{debug, instrument};

/// Where a reply goes: a chat, and optionally the message being answered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ReplyTarget {
    pub chat_id: i64,
    pub message_id: Option<i32>,
}

impl ReplyTarget {
    pub fn new(chat_id: i64, message_id: Option<i32>) -> Self {
        Self { chat_id, message_id }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MediaSource {
    File(PathBuf),
    /// A platform-side reference to media that was delivered before.
    Reference(String),
}

/// Opaque identifier of delivered media; can be re-sent without re-uploading.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeliveryRef(pub String);

impl DeliveryRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends media and returns the reference of what was delivered, if the
    /// channel reported one.
    async fn send_media(
        &self,
        target: ReplyTarget,
        kind: DeliveryKind,
        source: &MediaSource,
        caption: &str,
    ) -> Result<Option<DeliveryRef>, SendError>;

    /// Returns the id of the posted message.
    async fn send_text(&self, target: ReplyTarget, text: &str) -> Result<i32, SendError>;

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<(), SendError>;
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn input_file(source: &MediaSource) -> InputFile {
    match source {
        MediaSource::File(path) => InputFile::file(path.clone()),
        MediaSource::Reference(file_id) => InputFile::file_id(file_id.clone()),
    }
}

fn delivered_ref(message: &Message) -> Option<DeliveryRef> {
    message
        .video()
        .map(|v| v.file.id.clone())
        .or_else(|| message.audio().map(|a| a.file.id.clone()))
        .or_else(|| message.document().map(|d| d.file.id.clone()))
        .map(DeliveryRef)
}

#[async_trait]
impl Messenger for TelegramMessenger {
    #[instrument(skip(self, source, caption), fields(chat_id = target.chat_id, kind = kind.as_str()))]
    async fn send_media(
        &self,
        target: ReplyTarget,
        kind: DeliveryKind,
        source: &MediaSource,
        caption: &str,
    ) -> Result<Option<DeliveryRef>, SendError> {
        let chat_id = ChatId(target.chat_id);
        let file = input_file(source);
        let reply_to = target.message_id.map(MessageId);

        let message = match kind {
            DeliveryKind::Video => {
                let mut req = self
                    .bot
                    .send_video(chat_id, file)
                    .caption(caption)
                    .supports_streaming(true);
                if let Some(id) = reply_to {
                    req = req.reply_to_message_id(id).allow_sending_without_reply(true);
                }
                req.await?
            }
            DeliveryKind::Audio | DeliveryKind::PhotoAudio => {
                let mut req = self.bot.send_audio(chat_id, file).caption(caption);
                if let Some(id) = reply_to {
                    req = req.reply_to_message_id(id).allow_sending_without_reply(true);
                }
                req.await?
            }
            DeliveryKind::PhotoBundle => {
                let mut req = self.bot.send_document(chat_id, file).caption(caption);
                if let Some(id) = reply_to {
                    req = req.reply_to_message_id(id).allow_sending_without_reply(true);
                }
                req.await?
            }
        };

        let delivered = delivered_ref(&message);
        debug!(event = "media_sent", has_ref = delivered.is_some());
        Ok(delivered)
    }

    async fn send_text(&self, target: ReplyTarget, text: &str) -> Result<i32, SendError> {
        let mut req = self.bot.send_message(ChatId(target.chat_id), text);
        if let Some(id) = target.message_id {
            req = req
                .reply_to_message_id(MessageId(id))
                .allow_sending_without_reply(true);
        }
        let message = req.await?;
        Ok(message.id.0)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<(), SendError> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await?;
        Ok(())
    }
}
