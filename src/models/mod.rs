use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row shape of the `users` table. The session-manager-facing `User` type
/// collaborators hand to the core lives in `core::collaborators`; this is
/// the on-disk shape `services::auth` and `db` deal in.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub enable_next_episode_auto_play: bool,
    pub remember_audio_selections: bool,
    pub remember_subtitle_selections: bool,
    pub last_activity_date: Option<DateTime<Utc>>,
    pub created_at: String,
}
