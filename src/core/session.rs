// Session entity & PlayState.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;

use super::collaborators::Capabilities;
use super::controller::SessionController;

/// Case-insensitive registry key: `client ‖ deviceId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(client: &str, device_id: &str) -> Self {
        Self(format!(
            "{}\u{1}{}",
            client.to_lowercase(),
            device_id.to_lowercase()
        ))
    }
}

/// Deterministic, stable `session.id` from `(client, deviceId)`. A
/// non-cryptographic digest is sufficient — collisions only need to be
/// astronomically unlikely, not infeasible to forge.
pub fn derive_session_id(client: &str, device_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    client.hash(&mut hasher);
    0u8.hash(&mut hasher);
    device_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayMethod {
    DirectPlay,
    DirectStream,
    Transcode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepeatMode {
    RepeatNone,
    RepeatOne,
    RepeatAll,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayState {
    pub is_paused: bool,
    pub position_ticks: i64,
    pub media_source_id: Option<String>,
    pub can_seek: bool,
    pub is_muted: bool,
    pub volume_level: i32,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub play_method: PlayMethod,
    pub repeat_mode: RepeatMode,
}

impl Default for PlayState {
    fn default() -> Self {
        Self {
            is_paused: false,
            position_ticks: 0,
            media_source_id: None,
            can_seek: false,
            is_muted: false,
            volume_level: 100,
            audio_stream_index: None,
            subtitle_stream_index: None,
            play_method: PlayMethod::DirectPlay,
            repeat_mode: RepeatMode::RepeatNone,
        }
    }
}

/// DTO snapshot of the item currently playing.
#[derive(Debug, Clone, Serialize)]
pub struct NowPlayingItem {
    pub id: String,
    pub name: String,
    pub run_time_ticks: Option<i64>,
    pub media_type: Option<String>,
}

/// All of a session's mutable state, behind one lock so point-in-time
/// snapshots are consistent and field writes never race each other.
struct SessionState {
    application_version: String,
    device_name: String,
    user_id: Option<String>,
    user_name: Option<String>,
    additional_users: Vec<(String, String)>,
    remote_end_point: String,
    app_icon_url: Option<String>,
    last_activity_date: DateTime<Utc>,
    last_playback_check_in: DateTime<Utc>,
    now_playing_item: Option<NowPlayingItem>,
    play_state: PlayState,
    // nowPlayingItem == null implies transcodingInfo == null.
    transcoding_info: Option<serde_json::Value>,
    capabilities: Capabilities,
    controller: Option<Arc<dyn SessionController>>,
}

pub struct Session {
    pub id: String,
    pub device_id: String,
    pub client: String,
    state: Mutex<SessionState>,
    auto_progress: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        client: &str,
        device_id: &str,
        device_name: &str,
        application_version: &str,
        remote_end_point: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: derive_session_id(client, device_id),
            device_id: device_id.to_string(),
            client: client.to_string(),
            state: Mutex::new(SessionState {
                application_version: application_version.to_string(),
                device_name: device_name.to_string(),
                user_id: None,
                user_name: None,
                additional_users: Vec::new(),
                remote_end_point: remote_end_point.to_string(),
                app_icon_url: None,
                last_activity_date: now,
                last_playback_check_in: now,
                now_playing_item: None,
                play_state: PlayState::default(),
                transcoding_info: None,
                capabilities: Capabilities::default(),
                controller: None,
            }),
            auto_progress: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.lock().unwrap().user_id.clone()
    }

    pub fn user_name(&self) -> Option<String> {
        self.state.lock().unwrap().user_name.clone()
    }

    pub fn additional_users(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().additional_users.clone()
    }

    pub fn device_name(&self) -> String {
        self.state.lock().unwrap().device_name.clone()
    }

    pub fn application_version(&self) -> String {
        self.state.lock().unwrap().application_version.clone()
    }

    pub fn remote_end_point(&self) -> String {
        self.state.lock().unwrap().remote_end_point.clone()
    }

    /// All users associated with this session: primary first, then
    /// additional users.
    pub fn all_user_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state.user_id.iter().cloned().collect();
        ids.extend(state.additional_users.iter().map(|(id, _)| id.clone()));
        ids
    }

    pub fn last_activity_date(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().last_activity_date
    }

    pub fn last_playback_check_in(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().last_playback_check_in
    }

    pub fn now_playing_item(&self) -> Option<NowPlayingItem> {
        self.state.lock().unwrap().now_playing_item.clone()
    }

    pub fn play_state(&self) -> PlayState {
        self.state.lock().unwrap().play_state.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.state.lock().unwrap().capabilities.clone()
    }

    pub fn controller(&self) -> Option<Arc<dyn SessionController>> {
        self.state.lock().unwrap().controller.clone()
    }

    pub fn set_controller(&self, controller: Arc<dyn SessionController>) {
        self.state.lock().unwrap().controller = Some(controller);
    }

    /// `isActive` is derived: a controller is bound and reports live.
    pub fn is_active(&self) -> bool {
        match self.controller() {
            Some(controller) => controller.is_alive(),
            None => false,
        }
    }

    /// Refresh identity/contact fields on every activity report,
    /// independent of whether the session was just created.
    pub fn refresh_identity(
        &self,
        device_name: &str,
        custom_device_name: Option<&str>,
        user_id: Option<&str>,
        user_name: Option<&str>,
        remote_end_point: &str,
        application_version: &str,
    ) {
        let mut state = self.state.lock().unwrap();
        state.device_name = custom_device_name
            .unwrap_or(device_name)
            .to_string();
        state.user_id = user_id.map(|s| s.to_string());
        state.user_name = user_name.map(|s| s.to_string());
        state.remote_end_point = remote_end_point.to_string();
        state.application_version = application_version.to_string();
    }

    /// Listener hook for `DeviceManager`'s device-rename event.
    pub fn rename_device(&self, new_name: &str) {
        self.state.lock().unwrap().device_name = new_name.to_string();
    }

    pub fn apply_capabilities(&self, caps: Capabilities) {
        let mut state = self.state.lock().unwrap();
        state.app_icon_url = caps.icon_url.clone();
        state.capabilities = caps;
    }

    /// Monotonic update: never move `lastActivityDate` backward under
    /// racing reporters.
    pub fn bump_activity(&self, date: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().unwrap();
        if date > state.last_activity_date {
            state.last_activity_date = date;
            true
        } else {
            false
        }
    }

    /// Only real client progress reports advance the idle-detection
    /// clock — automatic progress ticks must leave it untouched.
    pub fn set_playback_check_in(&self, date: DateTime<Utc>) {
        self.state.lock().unwrap().last_playback_check_in = date;
    }

    pub fn set_now_playing(&self, item: Option<NowPlayingItem>) {
        let mut state = self.state.lock().unwrap();
        if item.is_none() {
            state.transcoding_info = None;
        }
        state.now_playing_item = item;
    }

    pub fn update_play_state<F>(&self, f: F)
    where
        F: FnOnce(&mut PlayState),
    {
        let mut state = self.state.lock().unwrap();
        f(&mut state.play_state);
    }

    pub fn clear_transcoding_info(&self) {
        self.state.lock().unwrap().transcoding_info = None;
    }

    pub fn set_transcoding_info(&self, info: Option<serde_json::Value>) {
        self.state.lock().unwrap().transcoding_info = info;
    }

    pub fn reset_playback(&self) {
        let mut state = self.state.lock().unwrap();
        state.now_playing_item = None;
        state.play_state = PlayState::default();
        state.transcoding_info = None;
    }

    /// Reuse the currently-playing item's snapshot verbatim if the same
    /// item id is already playing.
    pub fn now_playing_matches(&self, item_id: &str) -> Option<NowPlayingItem> {
        let state = self.state.lock().unwrap();
        match &state.now_playing_item {
            Some(item) if item.id == item_id => Some(item.clone()),
            _ => None,
        }
    }

    /// Start the auto-progress timer. Only one timer may be active at a
    /// time: starting a new one cancels the previous.
    pub fn start_automatic_progress<F>(self: &Arc<Self>, interval: Duration, tick: F)
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.stop_automatic_progress();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                tick().await;
            }
        });
        *self.auto_progress.lock().unwrap() = Some(handle);
    }

    pub fn stop_automatic_progress(&self) {
        if let Some(handle) = self.auto_progress.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Dispose: cancel the timer and dispose the controller, if any.
    pub async fn dispose(&self) {
        self.stop_automatic_progress();
        if let Some(controller) = self.controller() {
            controller.dispose().await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_deterministic() {
        let a = derive_session_id("Web", "devA");
        let b = derive_session_id("Web", "devA");
        assert_eq!(a, b);
    }

    #[test]
    fn session_id_differs_across_concat_boundary() {
        // "ab"+"c" and "a"+"bc" must not collide despite equal concatenation.
        let a = derive_session_id("ab", "c");
        let b = derive_session_id("a", "bc");
        assert_ne!(a, b);
    }

    #[test]
    fn session_key_is_case_insensitive() {
        assert_eq!(SessionKey::new("Web", "DevA"), SessionKey::new("web", "deva"));
    }

    #[test]
    fn activity_date_is_monotonic() {
        let now = Utc::now();
        let session = Session::new("Web", "devA", "Chrome", "1.0", "1.1.1.1", now);
        assert!(session.bump_activity(now + chrono::Duration::seconds(5)));
        assert!(!session.bump_activity(now)); // older timestamp rejected
        assert_eq!(
            session.last_activity_date(),
            now + chrono::Duration::seconds(5)
        );
    }
}
