use crate::{error::AppError, i18n::Lang};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};
use tokio::{fs, sync::Mutex};
use tracing::{info, warn};

/// Known users and their language preference.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn touch_user(&self, user_id: u64) -> Result<(), AppError>;
    async fn get_language(&self, user_id: u64) -> Lang;
    async fn set_language(&self, user_id: u64, lang: Lang) -> Result<(), AppError>;
    async fn list_users(&self) -> Vec<u64>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: BTreeSet<u64>,
    #[serde(default)]
    languages: BTreeMap<u64, Lang>,
}

/// Reads the current document, or the bare id array older deployments wrote.
fn parse_users_file(raw: &[u8]) -> Result<UsersFile, serde_json::Error> {
    serde_json::from_slice::<UsersFile>(raw).or_else(|err| {
        serde_json::from_slice::<Vec<u64>>(raw)
            .map(|ids| UsersFile {
                users: ids.into_iter().collect(),
                ..UsersFile::default()
            })
            .map_err(|_| err)
    })
}

/// Keeps everything in memory and rewrites `users.json` on every change.
pub struct JsonUserStore {
    path: PathBuf,
    state: Mutex<UsersFile>,
}

impl JsonUserStore {
    pub async fn open(data_dir: PathBuf) -> Result<Self, AppError> {
        fs::create_dir_all(&data_dir).await?;
        let path = data_dir.join("users.json");
        let state = match fs::read(&path).await {
            Ok(raw) => parse_users_file(&raw).unwrap_or_else(|err| {
                warn!(event = "users_file_unreadable", path = %path.display(), error = %err);
                UsersFile::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => UsersFile::default(),
            Err(err) => return Err(err.into()),
        };
        info!(event = "user_store_opened", path = %path.display(), users = state.users.len());
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn save(&self, state: &UsersFile) -> Result<(), AppError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for JsonUserStore {
    async fn touch_user(&self, user_id: u64) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.users.insert(user_id) {
            self.save(&state).await?;
        }
        Ok(())
    }

    async fn get_language(&self, user_id: u64) -> Lang {
        self.state
            .lock()
            .await
            .languages
            .get(&user_id)
            .copied()
            .unwrap_or_default()
    }

    async fn set_language(&self, user_id: u64, lang: Lang) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.users.insert(user_id);
        state.languages.insert(user_id, lang);
        self.save(&state).await
    }

    async fn list_users(&self) -> Vec<u64> {
        self.state.lock().await.users.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_users_and_languages() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonUserStore::open(dir.path().to_path_buf()).await.unwrap();
        store.touch_user(42).await.unwrap();
        store.touch_user(7).await.unwrap();
        store.set_language(42, Lang::Ru).await.unwrap();

        let reopened = JsonUserStore::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.list_users().await, vec![7, 42]);
        assert_eq!(reopened.get_language(42).await, Lang::Ru);
        assert_eq!(reopened.get_language(7).await, Lang::Uz);
    }

    #[test]
    fn language_map_survives_a_reload() {
        let mut doc = UsersFile::default();
        doc.users.insert(42);
        doc.languages.insert(42, Lang::Ru);
        let raw = serde_json::to_vec_pretty(&doc).unwrap();

        let parsed = parse_users_file(&raw).unwrap();
        assert_eq!(parsed.users.into_iter().collect::<Vec<_>>(), vec![42]);
        assert_eq!(parsed.languages.get(&42), Some(&Lang::Ru));
    }

    #[tokio::test]
    async fn reads_legacy_id_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.json"), b"[3, 1, 2]").unwrap();
        let store = JsonUserStore::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(store.list_users().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.json"), b"{not json").unwrap();
        let store = JsonUserStore::open(dir.path().to_path_buf()).await.unwrap();
        assert!(store.list_users().await.is_empty());
    }
}
