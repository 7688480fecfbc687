use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::core::collaborators::{
    AuthTokenInfo, AuthTokenQuery, AuthenticationRepository, Capabilities, DeviceManager, User,
    UserDataManager, UserItemData, UserManager,
};
use crate::core::{SessionError, SessionResult};

/// Configure SQLite for optimal performance. Call once per pool.
pub async fn configure_connection(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA cache_size = -32000")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA mmap_size = 67108864")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(pool)
        .await?;

    tracing::info!("SQLite configured: WAL mode, 32MB cache, 64MB mmap");
    Ok(())
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_admin INTEGER NOT NULL DEFAULT 0,
            enable_next_episode_auto_play INTEGER NOT NULL DEFAULT 1,
            remember_audio_selections INTEGER NOT NULL DEFAULT 1,
            remember_subtitle_selections INTEGER NOT NULL DEFAULT 1,
            last_activity_date TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS auth_tokens (
            access_token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            device_id TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            date_created TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS device_capabilities (
            device_id TEXT PRIMARY KEY,
            custom_name TEXT,
            playable_media_types TEXT NOT NULL DEFAULT '',
            supported_commands TEXT NOT NULL DEFAULT '',
            supports_media_control INTEGER NOT NULL DEFAULT 0,
            icon_url TEXT
        );

        CREATE TABLE IF NOT EXISTS user_item_data (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            item_id TEXT NOT NULL,
            playback_position_ticks INTEGER NOT NULL DEFAULT 0,
            play_count INTEGER NOT NULL DEFAULT 0,
            played INTEGER NOT NULL DEFAULT 0,
            last_played_date TEXT,
            audio_stream_index INTEGER,
            subtitle_stream_index INTEGER,
            PRIMARY KEY (user_id, item_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_auth_tokens_device ON auth_tokens(device_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Release unused memory back to the OS.
pub async fn shrink_memory(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA shrink_memory").execute(pool).await?;
    tracing::debug!("SQLite memory shrunk");
    Ok(())
}

fn join_csv(values: &[String]) -> String {
    values.join(",")
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn to_internal(e: sqlx::Error) -> SessionError {
    SessionError::Internal(e.to_string())
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    name: String,
    enable_next_episode_auto_play: bool,
    remember_audio_selections: bool,
    remember_subtitle_selections: bool,
    last_activity_date: Option<DateTime<Utc>>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            last_activity_date: row.last_activity_date,
            enable_next_episode_auto_play: row.enable_next_episode_auto_play,
            remember_audio_selections: row.remember_audio_selections,
            remember_subtitle_selections: row.remember_subtitle_selections,
        }
    }
}

/// `UserManager` backed by the `users` table, reusing `services::auth`'s
/// Argon2 hashing for credential checks.
pub struct SqliteUsers {
    pool: SqlitePool,
}

impl SqliteUsers {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserManager for SqliteUsers {
    async fn get_user_by_id(&self, id: &str) -> Option<User> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, name, enable_next_episode_auto_play, remember_audio_selections, \
             remember_subtitle_selections, last_activity_date FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .map(Into::into)
    }

    async fn get_user_by_name(&self, name: &str) -> Option<User> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, name, enable_next_episode_auto_play, remember_audio_selections, \
             remember_subtitle_selections, last_activity_date FROM users WHERE name = ? COLLATE NOCASE",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .map(Into::into)
    }

    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
        _remote_end_point: &str,
    ) -> Option<User> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT id, password_hash FROM users WHERE name = ? COLLATE NOCASE")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
                .ok()?;
        let (id, hash) = row?;
        if crate::services::auth::verify_password(password, &hash).unwrap_or(false) {
            self.get_user_by_id(&id).await
        } else {
            None
        }
    }

    async fn update_last_activity(&self, user_id: &str, date: DateTime<Utc>) -> SessionResult<()> {
        sqlx::query("UPDATE users SET last_activity_date = ? WHERE id = ?")
            .bind(date)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(to_internal)?;
        Ok(())
    }

    async fn is_within_parental_schedule(&self, _user_id: &str) -> bool {
        true
    }

    async fn can_access_device(&self, _user_id: &str, _device_id: &str) -> bool {
        true
    }
}

/// `UserDataManager` backed by the `user_item_data` table.
pub struct SqliteUserData {
    pool: SqlitePool,
}

impl SqliteUserData {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDataManager for SqliteUserData {
    async fn get_user_data(&self, user_id: &str, item_id: &str) -> UserItemData {
        let row: Option<(i64, i32, bool, Option<DateTime<Utc>>, Option<i32>, Option<i32>)> = sqlx::query_as(
            "SELECT playback_position_ticks, play_count, played, last_played_date, \
             audio_stream_index, subtitle_stream_index FROM user_item_data WHERE user_id = ? AND item_id = ?",
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        match row {
            Some((playback_position_ticks, play_count, played, last_played_date, audio, subtitle)) => {
                UserItemData {
                    playback_position_ticks,
                    play_count,
                    played,
                    last_played_date,
                    audio_stream_index: audio,
                    subtitle_stream_index: subtitle,
                }
            }
            None => UserItemData::default(),
        }
    }

    async fn update_play_state(
        &self,
        item: &crate::core::collaborators::BaseItem,
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
        _reason: crate::core::collaborators::SaveReason,
    ) -> SessionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_item_data
                (user_id, item_id, playback_position_ticks, play_count, played, last_played_date, audio_stream_index, subtitle_stream_index)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, item_id) DO UPDATE SET
                playback_position_ticks = excluded.playback_position_ticks,
                play_count = excluded.play_count,
                played = excluded.played,
                last_played_date = excluded.last_played_date,
                audio_stream_index = excluded.audio_stream_index,
                subtitle_stream_index = excluded.subtitle_stream_index
            "#,
        )
        .bind(user_id)
        .bind(item_id)
        .bind(data.playback_position_ticks)
        .bind(data.play_count)
        .bind(data.played)
        .bind(data.last_played_date)
        .bind(data.audio_stream_index)
        .bind(data.subtitle_stream_index)
        .execute(&self.pool)
        .await
        .map_err(to_internal)?;
        Ok(())
    }
}

/// The `DeviceManager` capability-storage half, backed by `device_capabilities`.
/// Device registration itself is a no-op: nothing else in this crate reads
/// a separate device-registry row, only the capability snapshot.
pub struct SqliteDevices {
    pool: SqlitePool,
}

impl SqliteDevices {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceManager for SqliteDevices {
    async fn register_device(
        &self,
        id: &str,
        _name: &str,
        _app: &str,
        _version: &str,
        _user_id: Option<&str>,
    ) {
        let _ = sqlx::query(
            "INSERT INTO device_capabilities (device_id) VALUES (?) ON CONFLICT(device_id) DO NOTHING",
        )
        .bind(id)
        .execute(&self.pool)
        .await;
    }

    async fn get_custom_name(&self, device_id: &str) -> Option<String> {
        sqlx::query_as::<_, (Option<String>,)>(
            "SELECT custom_name FROM device_capabilities WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .and_then(|(name,)| name)
    }

    async fn can_access_device(&self, _user_id: &str, _device_id: &str) -> bool {
        true
    }

    async fn get_capabilities(&self, device_id: &str) -> Option<Capabilities> {
        let row: Option<(String, String, bool, Option<String>)> = sqlx::query_as(
            "SELECT playable_media_types, supported_commands, supports_media_control, icon_url \
             FROM device_capabilities WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        row.map(|(types, commands, control, icon)| Capabilities {
            playable_media_types: split_csv(&types),
            supported_commands: split_csv(&commands),
            supports_media_control: control,
            icon_url: icon,
        })
    }

    async fn save_capabilities(&self, device_id: &str, caps: Capabilities) {
        let _ = sqlx::query(
            r#"
            INSERT INTO device_capabilities
                (device_id, playable_media_types, supported_commands, supports_media_control, icon_url)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                playable_media_types = excluded.playable_media_types,
                supported_commands = excluded.supported_commands,
                supports_media_control = excluded.supports_media_control,
                icon_url = excluded.icon_url
            "#,
        )
        .bind(device_id)
        .bind(join_csv(&caps.playable_media_types))
        .bind(join_csv(&caps.supported_commands))
        .bind(caps.supports_media_control)
        .bind(caps.icon_url)
        .execute(&self.pool)
        .await;
    }
}

/// `AuthenticationRepository` backed by `auth_tokens`.
pub struct SqliteAuthRepository {
    pool: SqlitePool,
}

impl SqliteAuthRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthenticationRepository for SqliteAuthRepository {
    async fn get(&self, query: AuthTokenQuery) -> SessionResult<Vec<AuthTokenInfo>> {
        let mut sql = String::from(
            "SELECT access_token, user_id, device_id, is_active, date_created FROM auth_tokens WHERE 1=1",
        );
        if query.device_id.is_some() {
            sql.push_str(" AND device_id = ? COLLATE NOCASE");
        }
        if query.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if query.access_token.is_some() {
            sql.push_str(" AND access_token = ?");
        }
        if query.is_active.is_some() {
            sql.push_str(" AND is_active = ?");
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut q = sqlx::query_as::<_, (String, String, String, bool, DateTime<Utc>)>(&sql);
        if let Some(d) = &query.device_id {
            q = q.bind(d.clone());
        }
        if let Some(u) = &query.user_id {
            q = q.bind(u.clone());
        }
        if let Some(a) = &query.access_token {
            q = q.bind(a.clone());
        }
        if let Some(active) = query.is_active {
            q = q.bind(active);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(to_internal)?;
        Ok(rows
            .into_iter()
            .map(
                |(access_token, user_id, device_id, is_active, date_created)| AuthTokenInfo {
                    access_token,
                    user_id,
                    device_id,
                    is_active,
                    date_created,
                },
            )
            .collect())
    }

    async fn create(&self, info: AuthTokenInfo) -> SessionResult<()> {
        sqlx::query(
            "INSERT INTO auth_tokens (access_token, user_id, device_id, is_active, date_created) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&info.access_token)
        .bind(&info.user_id)
        .bind(&info.device_id)
        .bind(info.is_active)
        .bind(info.date_created)
        .execute(&self.pool)
        .await
        .map_err(to_internal)?;
        Ok(())
    }

    async fn update(&self, info: AuthTokenInfo) -> SessionResult<()> {
        sqlx::query("UPDATE auth_tokens SET is_active = ? WHERE access_token = ?")
            .bind(info.is_active)
            .bind(&info.access_token)
            .execute(&self.pool)
            .await
            .map_err(to_internal)?;
        Ok(())
    }
}

/// Convenience: does a user with this name already exist?
pub async fn user_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM users WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Wraps `services::auth::create_user`, surfacing a descriptive error if the
/// name is already taken.
pub async fn create_user(
    pool: &SqlitePool,
    name: &str,
    password: &str,
    is_admin: bool,
) -> Result<()> {
    if user_exists(pool, name).await? {
        return Err(anyhow!("user '{}' already exists", name));
    }
    crate::services::auth::create_user(pool, name, password, is_admin).await?;
    Ok(())
}
