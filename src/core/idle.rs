// Component F: the process-wide idle sweeper. Armed lazily by the first
// playback start/progress and disarmed again once nothing is playing,
// rather than always running — most deployments spend most of their time
// with zero active sessions.

use std::sync::{Arc, Weak};
use std::time::Duration;

use super::manager::SessionManager;
use super::playback::PlaybackStopInfo;
use super::session::Session;

impl SessionManager {
    /// Starts the sweeper loop if it isn't already running. Cheap to call
    /// on every playback tick: the lock only ever gates the one-time spawn.
    pub(crate) async fn arm_idle_timer(self: &Arc<Self>) {
        let mut guard = self.idle_timer.lock().await;
        if guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.idle_sweep_interval;
        *guard = Some(tokio::spawn(sweep_loop(weak, interval)));
    }
}

async fn sweep_loop(manager: Weak<SessionManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate first tick

    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            return;
        };

        sweep_once(&manager).await;

        if !any_session_playing(&manager) {
            // Re-check under the lock: a playback start racing in between
            // the check above and taking the lock must not be lost — if one
            // landed, keep the loop running instead of disarming under it.
            let mut guard = manager.idle_timer.lock().await;
            if any_session_playing(&manager) {
                continue;
            }
            *guard = None;
            return;
        }
    }
}

fn any_session_playing(manager: &Arc<SessionManager>) -> bool {
    manager
        .registry
        .snapshot()
        .iter()
        .any(|s| s.now_playing_item().is_some())
}

/// Synthesizes a stop for any session whose last real progress check-in is
/// older than the stale threshold — the client vanished without calling
/// `Playing/Stopped`.
async fn sweep_once(manager: &Arc<SessionManager>) {
    let now = chrono::Utc::now();
    let threshold = manager.config.idle_stale_threshold;

    let stalled: Vec<Arc<Session>> = manager
        .registry
        .snapshot()
        .into_iter()
        .filter(|s| {
            s.now_playing_item().is_some() && (now - s.last_playback_check_in()) > threshold
        })
        .collect();

    for session in stalled {
        let Some(item) = session.now_playing_item() else {
            continue;
        };
        let play_state = session.play_state();
        let info = PlaybackStopInfo {
            session_id: session.id.clone(),
            item_id: Some(item.id),
            media_source_id: play_state.media_source_id,
            position_ticks: Some(play_state.position_ticks),
            live_stream_id: None,
        };
        if let Err(e) = manager.on_playback_stopped(info).await {
            tracing::warn!(
                "idle sweep: synthesized stop for session {} failed: {}",
                session.id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::test_support::{fake_collaborators, FakeLibrary};
    use crate::core::collaborators::{BaseItem, Collaborators, ItemKind};
    use crate::core::controller::test_support::RecordingControllerFactory;
    use crate::core::controller::ControllerFactoryChain;
    use crate::core::manager::SessionManagerConfig;
    use crate::core::session::PlayMethod;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn idle_sweep_stops_a_stalled_session() {
        let config = SessionManagerConfig {
            idle_sweep_interval: Duration::from_millis(20),
            idle_stale_threshold: chrono::Duration::milliseconds(30),
            ..SessionManagerConfig::default()
        };

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
        library.items.lock().unwrap().insert(
            "item1".to_string(),
            BaseItem {
                id: "item1".to_string(),
                name: "Interstellar".to_string(),
                sort_name: "interstellar".to_string(),
                media_type: Some("Video".to_string()),
                run_time_ticks: Some(10_000_000_0),
                supports_played_status: true,
                is_virtual_item: false,
                media_source_ids: vec![],
                kind: ItemKind::Leaf,
            },
        );
        let collaborators = Collaborators {
            users,
            user_data,
            library: StdArc::new(library),
            music,
            media_sources,
            devices,
            auth_repo,
        };

        let manager = SessionManager::new(
            collaborators,
            ControllerFactoryChain::new(vec![StdArc::new(RecordingControllerFactory)]),
            config,
        );

        let session = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", None)
            .await
            .unwrap();

        manager
            .on_playback_start(super::super::playback::PlaybackStartInfo {
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

        // Force the check-in clock far enough into the past that it reads
        // as stalled as soon as the sweeper's first tick fires.
        session.set_playback_check_in(chrono::Utc::now() - chrono::Duration::seconds(10));

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(session.now_playing_item().is_none());
    }
}
