// Component E: playback state machine, built on top of activity tracking
// in `manager.rs`. Mirrors the shape of the old `on_playback_start` /
// `on_playback_progress` / `on_playback_stopped` HTTP handlers, but drives
// the collaborator traits instead of hand-written SQL upserts.

use chrono::Utc;
use std::sync::Arc;

use super::collaborators::SaveReason;
use super::errors::{SessionError, SessionResult};
use super::events::{Event, EventBus};
use super::manager::SessionManager;
use super::session::{NowPlayingItem, PlayMethod, RepeatMode, Session};

#[derive(Debug, Clone)]
pub struct PlaybackStartInfo {
    pub session_id: String,
    pub item_id: Option<String>,
    pub media_source_id: Option<String>,
    pub position_ticks: Option<i64>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub play_method: PlayMethod,
    pub can_seek: bool,
}

#[derive(Debug, Clone)]
pub struct PlaybackProgressInfo {
    pub session_id: String,
    pub item_id: Option<String>,
    pub media_source_id: Option<String>,
    pub position_ticks: Option<i64>,
    pub is_paused: bool,
    pub is_muted: bool,
    pub volume_level: i32,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub play_method: PlayMethod,
    pub repeat_mode: RepeatMode,
}

#[derive(Debug, Clone)]
pub struct PlaybackStopInfo {
    pub session_id: String,
    pub item_id: Option<String>,
    pub media_source_id: Option<String>,
    pub position_ticks: Option<i64>,
    pub live_stream_id: Option<String>,
}

/// Falls back to `itemId` when the caller omits `mediaSourceId` — the
/// common single-source case.
fn normalize_media_source_id(
    media_source_id: Option<String>,
    item_id: Option<&str>,
) -> Option<String> {
    media_source_id
        .filter(|s| !s.is_empty())
        .or_else(|| item_id.map(|s| s.to_string()))
}

impl SessionManager {
    /// Resolve the library item for `itemId` and rebuild the `nowPlayingItem`
    /// snapshot, reusing the existing one verbatim if the same item is
    /// already playing.
    async fn update_now_playing_item(
        &self,
        session: &Session,
        item_id: Option<&str>,
        media_source_id: Option<&str>,
    ) -> (Option<crate::core::collaborators::BaseItem>, Option<NowPlayingItem>) {
        let Some(item_id) = item_id else {
            return (None, None);
        };
        let Some(item) = self.collaborators.library.get_item_by_id(item_id).await else {
            return (None, None);
        };

        if let Some(existing) = session.now_playing_matches(item_id) {
            return (Some(item), Some(existing));
        }

        let media_source = if item.has_media_sources() {
            self.collaborators
                .media_sources
                .get_media_source(&item, media_source_id, None)
                .await
        } else {
            None
        };

        let run_time_ticks = media_source
            .as_ref()
            .and_then(|m| m.run_time_ticks)
            .or(item.run_time_ticks);

        let now_playing = NowPlayingItem {
            id: item.id.clone(),
            name: item.name.clone(),
            run_time_ticks,
            media_type: item.media_type.clone(),
        };

        (Some(item), Some(now_playing))
    }

    /// Starts (or restarts) the per-session auto-progress timer, which
    /// re-enters `on_playback_progress` with `is_automated = true` on every
    /// tick so clients that stop sending heartbeats still decay correctly.
    fn start_auto_progress(self: &Arc<Self>, session: &Arc<Session>) {
        let manager = Arc::downgrade(self);
        let session_id = session.id.clone();
        let interval = self.config.auto_progress_interval;
        session.start_automatic_progress(interval, move || {
            let manager = manager.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let Some(session) = manager.registry.get_by_id(&session_id) else {
                    return;
                };
                let play_state = session.play_state();
                let info = PlaybackProgressInfo {
                    session_id: session_id.clone(),
                    item_id: session.now_playing_item().map(|i| i.id),
                    media_source_id: play_state.media_source_id.clone(),
                    position_ticks: Some(play_state.position_ticks),
                    is_paused: play_state.is_paused,
                    is_muted: play_state.is_muted,
                    volume_level: play_state.volume_level,
                    audio_stream_index: play_state.audio_stream_index,
                    subtitle_stream_index: play_state.subtitle_stream_index,
                    play_method: play_state.play_method,
                    repeat_mode: play_state.repeat_mode,
                };
                if let Err(e) = manager.on_playback_progress(info, true).await {
                    tracing::warn!(
                        "automatic progress tick failed for session {}: {}",
                        session_id,
                        e
                    );
                }
            })
        });
    }

    pub async fn on_playback_start(
        self: &Arc<Self>,
        info: PlaybackStartInfo,
    ) -> SessionResult<()> {
        self.check_disposed()?;
        let session = self
            .registry
            .get_by_id(&info.session_id)
            .ok_or_else(|| SessionError::not_found(format!("session {}", info.session_id)))?;

        let media_source_id =
            normalize_media_source_id(info.media_source_id.clone(), info.item_id.as_deref());
        let (item, now_playing) = self
            .update_now_playing_item(&session, info.item_id.as_deref(), media_source_id.as_deref())
            .await;
        session.set_now_playing(now_playing);

        if info.play_method != PlayMethod::Transcode {
            session.clear_transcoding_info();
        }

        session.update_play_state(|ps| {
            ps.media_source_id = media_source_id.clone();
            ps.position_ticks = info.position_ticks.unwrap_or(0);
            ps.play_method = info.play_method;
            ps.can_seek = info.can_seek;
            ps.audio_stream_index = info.audio_stream_index;
            ps.subtitle_stream_index = info.subtitle_stream_index;
        });
        session.set_playback_check_in(Utc::now());

        self.start_auto_progress(&session);
        self.arm_idle_timer().await;

        if let Some(item) = &item {
            let now = Utc::now();
            let is_video = item.media_type.as_deref() == Some("Video");
            for user_id in session.all_user_ids() {
                let mut data = self.collaborators.user_data.get_user_data(&user_id, &item.id).await;
                data.play_count += 1;
                data.last_played_date = Some(now);
                if item.supports_played_status && !is_video {
                    data.played = true;
                }
                if let Err(e) = self
                    .collaborators
                    .user_data
                    .save_user_data(&user_id, &item.id, data, SaveReason::PlaybackStart)
                    .await
                {
                    tracing::warn!("failed to save playback-start user data for {}: {}", user_id, e);
                }
            }
        }

        tracing::info!("session {} started playback of {:?}", session.id, info.item_id);
        self.events.publish(Event::PlaybackStart {
            session_id: session.id.clone(),
            item_id: info.item_id.clone().unwrap_or_default(),
        });

        let dto = serde_json::json!({ "SessionId": session.id, "ItemId": info.item_id });
        let sessions = self.registry.snapshot();
        EventBus::fan_out(&sessions, move |target| {
            let dto = dto.clone();
            Box::pin(async move {
                match target.controller() {
                    Some(controller) => controller.send_playback_start_notification(dto).await,
                    None => Ok(()),
                }
            })
        })
        .await;

        Ok(())
    }

    pub async fn on_playback_progress(
        self: &Arc<Self>,
        info: PlaybackProgressInfo,
        is_automated: bool,
    ) -> SessionResult<()> {
        self.check_disposed()?;
        let session = self
            .registry
            .get_by_id(&info.session_id)
            .ok_or_else(|| SessionError::not_found(format!("session {}", info.session_id)))?;

        let media_source_id =
            normalize_media_source_id(info.media_source_id.clone(), info.item_id.as_deref());
        let (item, now_playing) = self
            .update_now_playing_item(&session, info.item_id.as_deref(), media_source_id.as_deref())
            .await;
        if now_playing.is_some() {
            session.set_now_playing(now_playing);
        }

        session.update_play_state(|ps| {
            ps.media_source_id = media_source_id.clone();
            if let Some(pos) = info.position_ticks {
                ps.position_ticks = pos;
            }
            ps.is_paused = info.is_paused;
            ps.is_muted = info.is_muted;
            ps.volume_level = info.volume_level;
            ps.audio_stream_index = info.audio_stream_index;
            ps.subtitle_stream_index = info.subtitle_stream_index;
            ps.play_method = info.play_method;
            ps.repeat_mode = info.repeat_mode;
        });

        // Only a real client heartbeat resets the idle-detection clock —
        // the synthetic ticks from our own auto-progress timer must not.
        if !is_automated {
            session.set_playback_check_in(Utc::now());
        }

        if let (Some(item), Some(position_ticks)) = (&item, info.position_ticks) {
            for user_id in session.all_user_ids() {
                let mut data = self.collaborators.user_data.get_user_data(&user_id, &item.id).await;
                self.collaborators
                    .user_data
                    .update_play_state(item, &mut data, position_ticks)
                    .await;
                if let Some(user) = self.collaborators.users.get_user_by_id(&user_id).await {
                    data.audio_stream_index = user
                        .remember_audio_selections
                        .then_some(info.audio_stream_index)
                        .flatten();
                    data.subtitle_stream_index = user
                        .remember_subtitle_selections
                        .then_some(info.subtitle_stream_index)
                        .flatten();
                }
                if let Err(e) = self
                    .collaborators
                    .user_data
                    .save_user_data(&user_id, &item.id, data, SaveReason::PlaybackProgress)
                    .await
                {
                    tracing::warn!("failed to save playback-progress user data for {}: {}", user_id, e);
                }
            }
        }

        self.events.publish(Event::PlaybackProgress {
            session_id: session.id.clone(),
            item_id: info.item_id.clone().unwrap_or_default(),
            is_automated,
        });

        if !is_automated {
            self.start_auto_progress(&session);
        }
        self.arm_idle_timer().await;

        Ok(())
    }

    pub async fn on_playback_stopped(
        self: &Arc<Self>,
        info: PlaybackStopInfo,
    ) -> SessionResult<()> {
        self.check_disposed()?;
        if let Some(position_ticks) = info.position_ticks {
            if position_ticks < 0 {
                return Err(SessionError::invalid("positionTicks must not be negative"));
            }
        }

        let session = self
            .registry
            .get_by_id(&info.session_id)
            .ok_or_else(|| SessionError::not_found(format!("session {}", info.session_id)))?;
        session.stop_automatic_progress();

        let media_source_id =
            normalize_media_source_id(info.media_source_id.clone(), info.item_id.as_deref());
        let item = match info.item_id.as_deref() {
            Some(id) => self.collaborators.library.get_item_by_id(id).await,
            None => None,
        };

        let position_ms = info
            .position_ticks
            .map(|ticks| (ticks / 10_000).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!(
            "session {} stopped playback of {:?} at {}ms",
            session.id,
            info.item_id,
            position_ms
        );

        if let Some(item) = &item {
            for user_id in session.all_user_ids() {
                let mut data = self.collaborators.user_data.get_user_data(&user_id, &item.id).await;
                match info.position_ticks {
                    Some(position_ticks) => {
                        self.collaborators
                            .user_data
                            .update_play_state(item, &mut data, position_ticks)
                            .await;
                    }
                    None => {
                        data.playback_position_ticks = 0;
                        data.play_count += 1;
                        data.played = item.supports_played_status;
                    }
                }
                if let Err(e) = self
                    .collaborators
                    .user_data
                    .save_user_data(&user_id, &item.id, data, SaveReason::PlaybackFinished)
                    .await
                {
                    tracing::warn!("failed to save playback-finished user data for {}: {}", user_id, e);
                }
            }
        }

        session.reset_playback();

        if let Some(live_stream_id) = &info.live_stream_id {
            if let Err(e) = self.collaborators.media_sources.close_live_stream(live_stream_id).await {
                tracing::warn!("failed to close live stream {}: {}", live_stream_id, e);
            }
        }

        self.events.publish(Event::PlaybackStopped {
            session_id: session.id.clone(),
            item_id: info.item_id.clone().unwrap_or_default(),
        });

        let dto = serde_json::json!({
            "SessionId": session.id,
            "ItemId": info.item_id,
            "MediaSourceId": media_source_id,
        });
        let sessions = self.registry.snapshot();
        EventBus::fan_out(&sessions, move |target| {
            let dto = dto.clone();
            Box::pin(async move {
                match target.controller() {
                    Some(controller) => controller.send_playback_stopped_notification(dto).await,
                    None => Ok(()),
                }
            })
        })
        .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::test_support::{
        fake_collaborators, FakeLibrary,
    };
    use crate::core::collaborators::{BaseItem, Collaborators, ItemKind};
    use crate::core::controller::test_support::RecordingControllerFactory;
    use crate::core::controller::ControllerFactoryChain;
    use crate::core::manager::SessionManagerConfig;
    use std::sync::Arc as StdArc;

    fn movie(id: &str, runtime: i64) -> BaseItem {
        BaseItem {
            id: id.to_string(),
            name: "Interstellar".to_string(),
            sort_name: "interstellar".to_string(),
            media_type: Some("Video".to_string()),
            run_time_ticks: Some(runtime),
            supports_played_status: true,
            is_virtual_item: false,
            media_source_ids: vec!["ms1".to_string()],
            kind: ItemKind::Leaf,
        }
    }

    /// Builds a collaborator bundle sharing the other fakes but swapping in
    /// a `FakeLibrary` pre-seeded with `item`, keeping a concrete handle
    /// around for assertions that need it.
    fn collaborators_with_item(item: BaseItem) -> Collaborators {
        let Collaborators {
            users,
            user_data,
            music,
            media_sources,
            devices,
            auth_repo,
            ..
        } = fake_collaborators();
        let library = FakeLibrary::default();
        library.items.lock().unwrap().insert(item.id.clone(), item);
        Collaborators {
            users,
            user_data,
            library: StdArc::new(library),
            music,
            media_sources,
            devices,
            auth_repo,
        }
    }

    #[tokio::test]
    async fn playback_start_sets_now_playing_and_marks_transcoding_cleared() {
        let item = movie("item1", 10_000_000_0);
        let collaborators = collaborators_with_item(item);

        let manager = SessionManager::new(
            collaborators,
            ControllerFactoryChain::new(vec![StdArc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );

        let session = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", None)
            .await
            .unwrap();

        manager
            .on_playback_start(PlaybackStartInfo {
                session_id: session.id.clone(),
                item_id: Some("item1".to_string()),
                media_source_id: None,
                position_ticks: Some(0),
                audio_stream_index: None,
                subtitle_stream_index: None,
                play_method: PlayMethod::DirectPlay,
                can_seek: true,
            })
            .await
            .unwrap();

        assert_eq!(session.now_playing_item().unwrap().id, "item1");
        assert_eq!(session.play_state().media_source_id.as_deref(), Some("item1"));
    }

    #[tokio::test]
    async fn playback_stopped_rejects_negative_position() {
        let manager = SessionManager::new(
            fake_collaborators(),
            ControllerFactoryChain::new(vec![StdArc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );
        let session = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", None)
            .await
            .unwrap();

        let result = manager
            .on_playback_stopped(PlaybackStopInfo {
                session_id: session.id.clone(),
                item_id: None,
                media_source_id: None,
                position_ticks: Some(-1),
                live_stream_id: None,
            })
            .await;

        assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn playback_stopped_resets_now_playing_and_play_state() {
        let manager = SessionManager::new(
            fake_collaborators(),
            ControllerFactoryChain::new(vec![StdArc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );
        let session = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", None)
            .await
            .unwrap();

        manager
            .on_playback_start(PlaybackStartInfo {
                session_id: session.id.clone(),
                item_id: None,
                media_source_id: None,
                position_ticks: Some(0),
                audio_stream_index: None,
                subtitle_stream_index: None,
                play_method: PlayMethod::DirectPlay,
                can_seek: true,
            })
            .await
            .unwrap();

        manager
            .on_playback_stopped(PlaybackStopInfo {
                session_id: session.id.clone(),
                item_id: None,
                media_source_id: None,
                position_ticks: Some(500),
                live_stream_id: None,
            })
            .await
            .unwrap();

        assert!(session.now_playing_item().is_none());
        assert_eq!(session.play_state().position_ticks, 0);
    }
}
