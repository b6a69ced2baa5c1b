use crate::error::{truncate_diagnostic, ExtractError, PipelineError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    #[default]
    Uz,
    Ru,
}

impl Lang {
    pub fn code(self) -> &'static str {
        match self {
            Self::Uz => "uz",
            Self::Ru => "ru",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "uz" => Some(Self::Uz),
            "ru" => Some(Self::Ru),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Text {
    Start,
    LangSaved,
    Fetching,
    Choose,
    YtCaption,
    BtnVideo,
    BtnAudio,
    BtnMp3,
    BtnPhotoZip,
    TikTokPhoto,
    ButtonExpired,
    UnsupportedUrl,
    DownloadingAnswer,
    DownloadingWait,
    FormatsError,
    TooBig,
    UploadTooBig,
    FilenameTooLong,
    NeedsVerification,
    Forbidden,
    RateLimited,
    TimedOut,
    FormatUnavailable,
    Generic,
    NotAdmin,
    UsageBroadcast,
    UsageBroadcastPost,
    BroadcastStarted,
    BroadcastDone,
    CacheCleared,
    CachePruned,
    CaptionSuffix,
}

/// Raw template; `{name}` placeholders are filled by [`render`].
pub fn text(lang: Lang, key: Text) -> &'static str {
    use Text::*;
    match (key, lang) {
        (Start, Lang::Uz) => "👋🏻 <b>Salom!</b>\nYouTube, TikTok, Instagram, Facebook va OK.ru dan video va audiolarni yuklab olish uchun havolani yuboring.\n\n✨ YouTube videolari uchun sifatni tanlash mumkin.\n📁 Bir marta yuklangan fayllar keyingi safar darhol yuboriladi.\n\n🔗 <b>BOSHLASH UCHUN VIDEO HAVOLASINI YUBORING</b> ⤵️",
        (Start, Lang::Ru) => "👋🏻 <b>Привет!</b>\nОтправьте ссылку, чтобы скачать видео или аудио из YouTube, TikTok, Instagram, Facebook и OK.ru.\n\n✨ Для YouTube можно выбрать качество.\n📁 Уже скачанные файлы отправляются мгновенно.\n\n🔗 <b>ДЛЯ НАЧАЛА ОТПРАВЬТЕ ССЫЛКУ НА ВИДЕО</b> ⤵️",
        (LangSaved, Lang::Uz) => "✅ Til saqlandi.",
        (LangSaved, Lang::Ru) => "✅ Язык сохранён.",
        (Fetching, Lang::Uz) => "🔎 Formatlar olinmoqda...",
        (Fetching, Lang::Ru) => "🔎 Получаю форматы...",
        (Choose, Lang::Uz) => "Tanlang:",
        (Choose, Lang::Ru) => "Выберите:",
        (YtCaption, Lang::Uz) => "📹 <b>{title}</b>\n⏱ {duration}\n\n<b>Formatni tanlang:</b>",
        (YtCaption, Lang::Ru) => "📹 <b>{title}</b>\n⏱ {duration}\n\n<b>Выберите формат:</b>",
        (BtnVideo, Lang::Uz) => "📹 Video yuklab olish",
        (BtnVideo, Lang::Ru) => "📹 Скачать видео",
        (BtnAudio, Lang::Uz) => "🎵 Audio",
        (BtnAudio, Lang::Ru) => "🎵 Аудио",
        (BtnMp3, _) => "🎵 MP3",
        (BtnPhotoZip, Lang::Uz) => "🖼 Foto post (ZIP)",
        (BtnPhotoZip, Lang::Ru) => "🖼 Фото-пост (ZIP)",
        (TikTokPhoto, Lang::Uz) => "Bu TikTok foto-post. Rasmlarni ZIP ko‘rinishida yoki audiosini MP3 qilib yuklab oling:",
        (TikTokPhoto, Lang::Ru) => "Это TikTok фото-пост. Скачайте картинки в ZIP или звук в MP3:",
        (ButtonExpired, Lang::Uz) => "❌ Bu tugma eskirib qolgan. Iltimos, havolani qayta yuboring.",
        (ButtonExpired, Lang::Ru) => "❌ Эта кнопка устарела. Пожалуйста, отправьте ссылку ещё раз.",
        (UnsupportedUrl, Lang::Uz) => "❌ Bu havola qo‘llab-quvvatlanmaydi. Faqat YouTube, TikTok, Instagram, Facebook va OK.ru havolalarini yuboring.",
        (UnsupportedUrl, Lang::Ru) => "❌ Эта ссылка не поддерживается. Отправляйте только ссылки YouTube, TikTok, Instagram, Facebook и OK.ru.",
        (DownloadingAnswer, Lang::Uz) => "⏳ Yuklab olinmoqda...",
        (DownloadingAnswer, Lang::Ru) => "⏳ Скачиваю...",
        (DownloadingWait, Lang::Uz) => "⏳ Yuklab olinmoqda, iltimos kuting...",
        (DownloadingWait, Lang::Ru) => "⏳ Скачиваю, пожалуйста подождите...",
        (FormatsError, Lang::Uz) => "❌ Formatlarni olishda xatolik: {err}",
        (FormatsError, Lang::Ru) => "❌ Ошибка при получении форматов: {err}",
        (TooBig, Lang::Uz) => "⚠️ Bu format juda katta: {size}MB. Maksimal ruxsat etilgan: {max}MB. Iltimos, boshqa format tanlang.",
        (TooBig, Lang::Ru) => "⚠️ Этот формат слишком большой: {size}MB. Максимально разрешено: {max}MB. Пожалуйста, выберите другой формат.",
        (UploadTooBig, Lang::Uz) => "⚠️ Fayl Telegram chegarasidan katta: {size}MB (limit {max}MB).",
        (UploadTooBig, Lang::Ru) => "⚠️ Файл больше лимита Telegram: {size}MB (лимит {max}MB).",
        (FilenameTooLong, Lang::Uz) => "❌ Fayl nomi juda uzun bo‘lib ketdi. Boshqa variantni tanlang yoki havolani qayta yuboring.",
        (FilenameTooLong, Lang::Ru) => "❌ Слишком длинное имя файла. Выберите другой вариант или отправьте ссылку заново.",
        (NeedsVerification, Lang::Uz) => "❌ YouTube «men robot emasman» tekshiruvini so‘radi. cookies.txt faylini yangilang yoki rezident IP li proxy ishlating.",
        (NeedsVerification, Lang::Ru) => "❌ YouTube требует подтверждение «я не бот». Обновите cookies.txt или используйте proxy с резидентным IP.",
        (Forbidden, Lang::Uz) => "❌ 403 Forbidden. Odatda bu server IP bloki yoki eskirgan cookies sababli bo‘ladi.",
        (Forbidden, Lang::Ru) => "❌ 403 Forbidden. Обычно это блокировка IP сервера или устаревшие cookies.",
        (RateLimited, Lang::Uz) => "⚠️ Juda ko‘p so‘rov yuborildi (429). Biroz kutib qayta urinib ko‘ring.",
        (RateLimited, Lang::Ru) => "⚠️ Слишком много запросов (429). Подождите и попробуйте снова.",
        (TimedOut, Lang::Uz) => "⚠️ Manba javob bermadi (vaqt tugadi). Biroz kutib qayta urinib ko‘ring.",
        (TimedOut, Lang::Ru) => "⚠️ Источник не ответил вовремя. Подождите и попробуйте снова.",
        (FormatUnavailable, Lang::Uz) => "⚠️ Tanlangan format mavjud emas. Havolani qayta yuborib, formatni qaytadan tanlang.",
        (FormatUnavailable, Lang::Ru) => "⚠️ Выбранный формат недоступен. Отправьте ссылку заново и выберите формат ещё раз.",
        (Generic, Lang::Uz) => "❌ Xatolik: {err}",
        (Generic, Lang::Ru) => "❌ Ошибка: {err}",
        (NotAdmin, Lang::Uz) => "❌ Siz admin emassiz.",
        (NotAdmin, Lang::Ru) => "❌ Вы не админ.",
        (UsageBroadcast, Lang::Uz) => "Ishlatish: /broadcast xabar_matni",
        (UsageBroadcast, Lang::Ru) => "Использование: /broadcast текст_сообщения",
        (UsageBroadcastPost, Lang::Uz) => "Ishlatish: tarqatiladigan postga javoban /broadcastpost yuboring",
        (UsageBroadcastPost, Lang::Ru) => "Использование: ответьте командой /broadcastpost на пост для рассылки",
        (BroadcastStarted, Lang::Uz) => "📣 Broadcast boshlandi. Users: {n}",
        (BroadcastStarted, Lang::Ru) => "📣 Рассылка началась. Пользователей: {n}",
        (BroadcastDone, Lang::Uz) => "✅ Yakunlandi. Yuborildi: {sent}, Xato: {failed}",
        (BroadcastDone, Lang::Ru) => "✅ Готово. Отправлено: {sent}, Ошибок: {failed}",
        (CacheCleared, Lang::Uz) => "🧹 Kesh tozalandi: {n}",
        (CacheCleared, Lang::Ru) => "🧹 Кэш очищен: {n}",
        (CachePruned, Lang::Uz) => "🧹 Kesh qisqartirildi: {n}",
        (CachePruned, Lang::Ru) => "🧹 Кэш сокращён: {n}",
        (CaptionSuffix, Lang::Uz) => "Bot orqali yuklab olindi",
        (CaptionSuffix, Lang::Ru) => "Скачано через бота",
    }
}

/// Fills `{name}` placeholders. Unknown placeholders are left untouched.
pub fn render(lang: Lang, key: Text, args: &[(&str, String)]) -> String {
    let mut out = text(lang, key).to_string();
    for (name, value) in args {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

/// One localized, length-bounded notice for a failed delivery.
pub fn describe_error(err: &PipelineError, lang: Lang) -> String {
    let message = match err {
        PipelineError::ExpiredSelection => text(lang, Text::ButtonExpired).to_string(),
        PipelineError::TooLarge { size_mb, max_mb } => {
            render(
                lang,
                Text::TooBig,
                &[("size", size_mb.to_string()), ("max", max_mb.to_string())],
            )
        }
        PipelineError::UploadLimit { size_mb, max_mb } => {
            render(
                lang,
                Text::UploadTooBig,
                &[("size", format!("{size_mb:.1}")), ("max", max_mb.to_string())],
            )
        }
        PipelineError::Extract(extract) => describe_extract_error(extract, lang),
        other => render(lang, Text::Generic, &[("err", other.to_string())]),
    };
    truncate_diagnostic(&message)
}

pub fn describe_extract_error(err: &ExtractError, lang: Lang) -> String {
    let message = match err {
        ExtractError::RateLimited => text(lang, Text::RateLimited).to_string(),
        ExtractError::VerificationRequired => text(lang, Text::NeedsVerification).to_string(),
        ExtractError::Forbidden => text(lang, Text::Forbidden).to_string(),
        ExtractError::FormatUnavailable => text(lang, Text::FormatUnavailable).to_string(),
        ExtractError::FilenameTooLong => text(lang, Text::FilenameTooLong).to_string(),
        ExtractError::Unsupported(_) => text(lang, Text::UnsupportedUrl).to_string(),
        ExtractError::Timeout => text(lang, Text::TimedOut).to_string(),
        ExtractError::Failed(_) => {
            render(lang, Text::Generic, &[("err", err.to_string())])
        }
    };
    truncate_diagnostic(&message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SendError, MAX_DIAGNOSTIC_CHARS};

    #[test]
    fn lang_codes_roundtrip() {
        assert_eq!(Lang::from_code(" RU "), Some(Lang::Ru));
        assert_eq!(Lang::from_code(Lang::Uz.code()), Some(Lang::Uz));
        assert_eq!(Lang::from_code("en"), None);
        assert_eq!(Lang::default(), Lang::Uz);
    }

    #[test]
    fn render_fills_placeholders() {
        let out = render(
            Lang::Ru,
            Text::BroadcastDone,
            &[("sent", "3".to_string()), ("failed", "1".to_string())],
        );
        assert_eq!(out, "✅ Готово. Отправлено: 3, Ошибок: 1");
    }

    #[test]
    fn too_large_mentions_both_sizes() {
        let err = PipelineError::TooLarge { size_mb: 300, max_mb: 130 };
        let text = describe_error(&err, Lang::Uz);
        assert!(text.contains("300MB") && text.contains("130MB"));
    }

    #[test]
    fn generic_errors_are_bounded() {
        let err = PipelineError::Send(SendError::Other("z".repeat(1000)));
        let text = describe_error(&err, Lang::Ru);
        assert!(text.chars().count() <= MAX_DIAGNOSTIC_CHARS);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn extract_errors_map_to_friendly_text() {
        assert_eq!(
            describe_error(&PipelineError::Extract(ExtractError::RateLimited), Lang::Ru),
            text(Lang::Ru, Text::RateLimited)
        );
        assert_eq!(
            describe_extract_error(&ExtractError::VerificationRequired, Lang::Uz),
            text(Lang::Uz, Text::NeedsVerification)
        );
    }

    #[test]
    fn timeouts_suggest_waiting() {
        let ru = describe_error(&PipelineError::Extract(ExtractError::Timeout), Lang::Ru);
        assert_eq!(ru, text(Lang::Ru, Text::TimedOut));
        assert!(ru.contains("Подождите и попробуйте снова"));
        assert!(ExtractError::Timeout.is_transient());
        assert!(describe_extract_error(&ExtractError::Timeout, Lang::Uz).contains("qayta urinib"));
    }
}
