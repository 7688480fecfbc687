// External interfaces the core talks to. Concrete implementations
// (sqlite-backed, in-memory test doubles, a real catalog service) plug in
// behind them; the core never depends on a concrete type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::errors::SessionResult;

/// A library entity, flattened into a tagged variant instead of deep
/// inheritance. `kind` carries the facets the dispatcher and playback
/// state machine need (`IItemByName`, `Folder`, `Episode`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseItem {
    pub id: String,
    pub name: String,
    pub sort_name: String,
    pub media_type: Option<String>,
    pub run_time_ticks: Option<i64>,
    pub supports_played_status: bool,
    pub is_virtual_item: bool,
    pub media_source_ids: Vec<String>,
    pub kind: ItemKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ItemKind {
    /// A plain playable leaf (movie, audio track, standalone video).
    Leaf,
    /// A container. `children` lists non-folder, non-virtual descendants.
    Folder { children: Vec<String> },
    /// `IItemByName` — person, genre, studio. `tagged` lists non-folder,
    /// non-virtual items carrying this tag.
    ByName { tagged: Vec<String> },
    /// An episode, with enough series context to drive next-episode
    /// auto-play.
    Episode {
        series_id: String,
        season_index: i32,
        episode_index: i32,
    },
    /// A series — the ordered id list is what `get_episodes` returns.
    Series,
}

impl BaseItem {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, ItemKind::Folder { .. })
    }

    pub fn is_by_name(&self) -> bool {
        matches!(self.kind, ItemKind::ByName { .. })
    }

    pub fn as_episode(&self) -> Option<(&str, i32, i32)> {
        match &self.kind {
            ItemKind::Episode {
                series_id,
                season_index,
                episode_index,
            } => Some((series_id.as_str(), *season_index, *episode_index)),
            _ => None,
        }
    }

    pub fn has_media_sources(&self) -> bool {
        !self.media_source_ids.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSourceInfo {
    pub id: String,
    pub run_time_ticks: Option<i64>,
}

/// Result of `LibraryManager::check_play_access`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayAccess {
    Full,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Capabilities {
    pub playable_media_types: Vec<String>,
    pub supported_commands: Vec<String>,
    pub supports_media_control: bool,
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub last_activity_date: Option<DateTime<Utc>>,
    pub enable_next_episode_auto_play: bool,
    pub remember_audio_selections: bool,
    pub remember_subtitle_selections: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserItemData {
    pub playback_position_ticks: i64,
    pub play_count: i32,
    pub played: bool,
    pub last_played_date: Option<DateTime<Utc>>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
}

/// Reason passed to `UserDataManager::save_user_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    PlaybackStart,
    PlaybackProgress,
    PlaybackFinished,
}

#[async_trait]
pub trait UserManager: Send + Sync {
    async fn get_user_by_id(&self, id: &str) -> Option<User>;
    async fn get_user_by_name(&self, name: &str) -> Option<User>;
    /// Returns `None` on bad credentials.
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
        remote_end_point: &str,
    ) -> Option<User>;
    async fn update_last_activity(&self, user_id: &str, date: DateTime<Utc>) -> SessionResult<()>;
    /// Parental schedule check — `false` means outside the allowed window.
    async fn is_within_parental_schedule(&self, user_id: &str) -> bool;
    async fn can_access_device(&self, user_id: &str, device_id: &str) -> bool;
}

#[async_trait]
pub trait UserDataManager: Send + Sync {
    async fn get_user_data(&self, user_id: &str, item_id: &str) -> UserItemData;
    /// Returns `playedToCompletion`.
    async fn update_play_state(
        &self,
        item: &BaseItem,
        data: &mut UserItemData,
        position_ticks: i64,
    ) -> bool;
    async fn save_user_data(
        &self,
        user_id: &str,
        item_id: &str,
        data: UserItemData,
        reason: SaveReason,
    ) -> SessionResult<()>;
}

#[async_trait]
pub trait LibraryManager: Send + Sync {
    async fn get_item_by_id(&self, id: &str) -> Option<BaseItem>;
    async fn check_play_access(&self, item: &BaseItem, user_id: &str) -> PlayAccess;
    /// Episodes of the series, in broadcast order, used for next-episode
    /// auto-play expansion.
    async fn get_episodes(&self, series_id: &str) -> Vec<BaseItem>;
}

#[async_trait]
pub trait MusicManager: Send + Sync {
    async fn get_instant_mix_from_item(&self, item: &BaseItem, user_id: &str) -> Vec<BaseItem>;
}

#[async_trait]
pub trait MediaSourceManager: Send + Sync {
    async fn get_media_source(
        &self,
        item: &BaseItem,
        media_source_id: Option<&str>,
        live_stream_id: Option<&str>,
    ) -> Option<MediaSourceInfo>;
    async fn close_live_stream(&self, live_stream_id: &str) -> SessionResult<()>;
}

#[async_trait]
pub trait DeviceManager: Send + Sync {
    async fn register_device(&self, id: &str, name: &str, app: &str, version: &str, user_id: Option<&str>);
    async fn get_custom_name(&self, device_id: &str) -> Option<String>;
    async fn can_access_device(&self, user_id: &str, device_id: &str) -> bool;
    async fn get_capabilities(&self, device_id: &str) -> Option<Capabilities>;
    async fn save_capabilities(&self, device_id: &str, caps: Capabilities);
}

#[derive(Debug, Clone)]
pub struct AuthTokenQuery {
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub is_active: Option<bool>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AuthTokenInfo {
    pub access_token: String,
    pub user_id: String,
    pub device_id: String,
    pub is_active: bool,
    pub date_created: DateTime<Utc>,
}

#[async_trait]
pub trait AuthenticationRepository: Send + Sync {
    async fn get(&self, query: AuthTokenQuery) -> SessionResult<Vec<AuthTokenInfo>>;
    async fn create(&self, info: AuthTokenInfo) -> SessionResult<()>;
    async fn update(&self, info: AuthTokenInfo) -> SessionResult<()>;
}

/// Bundle of collaborators a `SessionManager` is constructed with.
pub struct Collaborators {
    pub users: std::sync::Arc<dyn UserManager>,
    pub user_data: std::sync::Arc<dyn UserDataManager>,
    pub library: std::sync::Arc<dyn LibraryManager>,
    pub music: std::sync::Arc<dyn MusicManager>,
    pub media_sources: std::sync::Arc<dyn MediaSourceManager>,
    pub devices: std::sync::Arc<dyn DeviceManager>,
    pub auth_repo: std::sync::Arc<dyn AuthenticationRepository>,
}

/// In-memory fakes for every collaborator, used by the seed tests in spec
/// and as the crate's standalone default collaborator set until a
/// real catalog service implements these traits.
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeUsers {
        pub users: Mutex<HashMap<String, User>>,
        pub passwords: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl UserManager for FakeUsers {
        async fn get_user_by_id(&self, id: &str) -> Option<User> {
            self.users.lock().unwrap().get(id).cloned()
        }

        async fn get_user_by_name(&self, name: &str) -> Option<User> {
            self.users
                .lock()
                .unwrap()
                .values()
                .find(|u| u.name.eq_ignore_ascii_case(name))
                .cloned()
        }

        async fn authenticate_user(
            &self,
            username: &str,
            password: &str,
            _remote_end_point: &str,
        ) -> Option<User> {
            let user = self.get_user_by_name(username).await?;
            let expected = self.passwords.lock().unwrap().get(&user.id).cloned();
            if expected.as_deref() == Some(password) {
                Some(user)
            } else {
                None
            }
        }

        async fn update_last_activity(
            &self,
            user_id: &str,
            date: DateTime<Utc>,
        ) -> SessionResult<()> {
            if let Some(u) = self.users.lock().unwrap().get_mut(user_id) {
                u.last_activity_date = Some(date);
            }
            Ok(())
        }

        async fn is_within_parental_schedule(&self, _user_id: &str) -> bool {
            true
        }

        async fn can_access_device(&self, _user_id: &str, _device_id: &str) -> bool {
            true
        }
    }

    #[derive(Default)]
    pub struct FakeUserData {
        pub data: Mutex<HashMap<(String, String), UserItemData>>,
    }

    #[async_trait]
    impl UserDataManager for FakeUserData {
        async fn get_user_data(&self, user_id: &str, item_id: &str) -> UserItemData {
            self.data
                .lock()
                .unwrap()
                .get(&(user_id.to_string(), item_id.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        async fn update_play_state(
            &self,
            item: &BaseItem,
            data: &mut UserItemData,
            position_ticks: i64,
        ) -> bool {
            data.playback_position_ticks = position_ticks;
            match item.run_time_ticks {
                Some(runtime) if runtime > 0 => position_ticks >= (runtime * 90 / 100),
                _ => false,
            }
        }

        async fn save_user_data(
            &self,
            user_id: &str,
            item_id: &str,
            data: UserItemData,
            _reason: SaveReason,
        ) -> SessionResult<()> {
            self.data
                .lock()
                .unwrap()
                .insert((user_id.to_string(), item_id.to_string()), data);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeLibrary {
        pub items: Mutex<HashMap<String, BaseItem>>,
    }

    #[async_trait]
    impl LibraryManager for FakeLibrary {
        async fn get_item_by_id(&self, id: &str) -> Option<BaseItem> {
            self.items.lock().unwrap().get(id).cloned()
        }

        async fn check_play_access(&self, _item: &BaseItem, _user_id: &str) -> PlayAccess {
            PlayAccess::Full
        }

        async fn get_episodes(&self, series_id: &str) -> Vec<BaseItem> {
            let mut episodes: Vec<BaseItem> = self
                .items
                .lock()
                .unwrap()
                .values()
                .filter(|i| matches!(&i.kind, ItemKind::Episode { series_id: sid, .. } if sid == series_id))
                .cloned()
                .collect();
            episodes.sort_by_key(|e| match e.kind {
                ItemKind::Episode {
                    season_index,
                    episode_index,
                    ..
                } => (season_index, episode_index),
                _ => (0, 0),
            });
            episodes
        }
    }

    #[derive(Default)]
    pub struct FakeMusic;

    #[async_trait]
    impl MusicManager for FakeMusic {
        async fn get_instant_mix_from_item(&self, item: &BaseItem, _user_id: &str) -> Vec<BaseItem> {
            vec![item.clone()]
        }
    }

    #[derive(Default)]
    pub struct FakeMediaSources;

    #[async_trait]
    impl MediaSourceManager for FakeMediaSources {
        async fn get_media_source(
            &self,
            item: &BaseItem,
            media_source_id: Option<&str>,
            _live_stream_id: Option<&str>,
        ) -> Option<MediaSourceInfo> {
            let id = media_source_id
                .map(|s| s.to_string())
                .or_else(|| item.media_source_ids.first().cloned())?;
            Some(MediaSourceInfo {
                id,
                run_time_ticks: item.run_time_ticks,
            })
        }

        async fn close_live_stream(&self, _live_stream_id: &str) -> SessionResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeDevices {
        pub custom_names: Mutex<HashMap<String, String>>,
        pub capabilities: Mutex<HashMap<String, Capabilities>>,
    }

    #[async_trait]
    impl DeviceManager for FakeDevices {
        async fn register_device(
            &self,
            _id: &str,
            _name: &str,
            _app: &str,
            _version: &str,
            _user_id: Option<&str>,
        ) {
        }

        async fn get_custom_name(&self, device_id: &str) -> Option<String> {
            self.custom_names.lock().unwrap().get(device_id).cloned()
        }

        async fn can_access_device(&self, _user_id: &str, _device_id: &str) -> bool {
            true
        }

        async fn get_capabilities(&self, device_id: &str) -> Option<Capabilities> {
            self.capabilities.lock().unwrap().get(device_id).cloned()
        }

        async fn save_capabilities(&self, device_id: &str, caps: Capabilities) {
            self.capabilities
                .lock()
                .unwrap()
                .insert(device_id.to_string(), caps);
        }
    }

    #[derive(Default)]
    pub struct FakeAuthRepository {
        pub tokens: Mutex<Vec<AuthTokenInfo>>,
    }

    #[async_trait]
    impl AuthenticationRepository for FakeAuthRepository {
        async fn get(&self, query: AuthTokenQuery) -> SessionResult<Vec<AuthTokenInfo>> {
            let mut rows: Vec<AuthTokenInfo> = self
                .tokens
                .lock()
                .unwrap()
                .iter()
                .filter(|t| {
                    query
                        .device_id
                        .as_ref()
                        .map(|d| d.eq_ignore_ascii_case(&t.device_id))
                        .unwrap_or(true)
                        && query.user_id.as_ref().map(|u| u == &t.user_id).unwrap_or(true)
                        && query
                            .access_token
                            .as_ref()
                            .map(|a| a == &t.access_token)
                            .unwrap_or(true)
                        && query.is_active.map(|a| a == t.is_active).unwrap_or(true)
                })
                .cloned()
                .collect();
            if let Some(limit) = query.limit {
                rows.truncate(limit as usize);
            }
            Ok(rows)
        }

        async fn create(&self, info: AuthTokenInfo) -> SessionResult<()> {
            self.tokens.lock().unwrap().push(info);
            Ok(())
        }

        async fn update(&self, info: AuthTokenInfo) -> SessionResult<()> {
            let mut tokens = self.tokens.lock().unwrap();
            if let Some(existing) = tokens
                .iter_mut()
                .find(|t| t.access_token == info.access_token)
            {
                *existing = info;
            }
            Ok(())
        }
    }

    pub fn fake_collaborators() -> Collaborators {
        Collaborators {
            users: std::sync::Arc::new(FakeUsers::default()),
            user_data: std::sync::Arc::new(FakeUserData::default()),
            library: std::sync::Arc::new(FakeLibrary::default()),
            music: std::sync::Arc::new(FakeMusic),
            media_sources: std::sync::Arc::new(FakeMediaSources),
            devices: std::sync::Arc::new(FakeDevices::default()),
            auth_repo: std::sync::Arc::new(FakeAuthRepository::default()),
        }
    }
}
