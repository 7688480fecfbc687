// Component G: remote-control dispatcher. Resolves a target session,
// optionally stamps the controlling user's identity onto the payload, and
// forwards to the bound `SessionController`. `SendPlayCommand` additionally
// expands instant mixes, by-name/folder browsing, next-episode auto-play,
// and shuffle before forwarding.

use std::sync::Arc;

use super::collaborators::BaseItem;
use super::controller::{
    GeneralCommand, PlayCommand, PlayCommandPayload, PlaystateCommand, PlaystateCommandName,
};
use super::errors::{SessionError, SessionResult};
use super::manager::SessionManager;
use super::session::Session;

/// Injectable PRNG so shuffle order is deterministic under test.
pub trait RandomSource: Send + Sync {
    fn next_u64(&self) -> u64;
}

pub struct SystemRandom;

impl RandomSource for SystemRandom {
    fn next_u64(&self) -> u64 {
        rand::random()
    }
}

/// Assigns every item a fresh random key and sorts by it — a uniform
/// permutation regardless of the input order.
fn shuffle(items: Vec<BaseItem>, rng: &dyn RandomSource) -> Vec<BaseItem> {
    let mut keyed: Vec<(u64, BaseItem)> = items.into_iter().map(|item| (rng.next_u64(), item)).collect();
    keyed.sort_by_key(|(key, _)| *key);
    keyed.into_iter().map(|(_, item)| item).collect()
}

#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub item_ids: Vec<String>,
    pub play_command: PlayCommand,
    pub start_position_ticks: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct BrowseRequest {
    pub item_id: String,
    pub item_name: String,
    pub item_type: String,
}

#[derive(Debug, Clone)]
pub struct MessageRequest {
    pub header: String,
    pub text: String,
    pub timeout_ms: Option<u64>,
}

/// Groups candidates by media type (case-insensitive) and keeps only the
/// largest group, ties broken by first appearance; the survivors are then
/// sorted by `sortName`.
fn filter_to_dominant_media_type(items: Vec<BaseItem>) -> Vec<BaseItem> {
    let mut groups: Vec<(String, Vec<BaseItem>)> = Vec::new();
    for item in items {
        let key = item.media_type.clone().unwrap_or_default().to_lowercase();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, bucket)) => bucket.push(item),
            None => groups.push((key, vec![item])),
        }
    }

    let mut best_index = None;
    let mut best_len = 0;
    for (i, (_, bucket)) in groups.iter().enumerate() {
        if bucket.len() > best_len {
            best_len = bucket.len();
            best_index = Some(i);
        }
    }

    let Some(index) = best_index else {
        return Vec::new();
    };
    let mut dominant = groups.into_iter().nth(index).unwrap().1;
    dominant.sort_by(|a, b| a.sort_name.cmp(&b.sort_name));
    dominant
}

impl SessionManager {
    fn resolve_target(&self, session_id: &str) -> SessionResult<Arc<Session>> {
        self.registry
            .get_by_id(session_id)
            .ok_or_else(|| SessionError::not_found(format!("session {session_id}")))
    }

    /// Stamps `controllingUserId` if a controlling session id was given and
    /// resolves to a tracked session. The only authorization check the
    /// underlying system performs here is that the session exists.
    fn controlling_user_id(&self, controlling_session_id: Option<&str>) -> Option<String> {
        let id = controlling_session_id?;
        if id.is_empty() {
            return None;
        }
        self.registry.get_by_id(id).and_then(|s| s.user_id())
    }

    async fn translate_item_for_playback(&self, item_id: &str) -> Vec<BaseItem> {
        let Some(item) = self.collaborators.library.get_item_by_id(item_id).await else {
            return Vec::new();
        };

        let candidate_ids = match &item.kind {
            super::collaborators::ItemKind::ByName { tagged } => tagged.clone(),
            super::collaborators::ItemKind::Folder { children } => children.clone(),
            _ => return vec![item],
        };

        let mut candidates = Vec::new();
        for id in candidate_ids {
            if let Some(child) = self.collaborators.library.get_item_by_id(&id).await {
                if !child.is_folder() && !child.is_virtual_item {
                    candidates.push(child);
                }
            }
        }
        filter_to_dominant_media_type(candidates)
    }

    /// Replaces a single episode id with the suffix of its series starting
    /// at (and including) that episode, dropping virtual entries — only
    /// when the user has next-episode auto-play enabled.
    async fn expand_next_episode_autoplay(
        &self,
        item_ids: &[String],
        user_id: &str,
    ) -> Option<Vec<BaseItem>> {
        let [only_id] = item_ids else { return None };
        let user = self.collaborators.users.get_user_by_id(user_id).await?;
        if !user.enable_next_episode_auto_play {
            return None;
        }
        let item = self.collaborators.library.get_item_by_id(only_id).await?;
        let (series_id, ..) = item.as_episode()?;
        let episodes = self.collaborators.library.get_episodes(series_id).await;
        let position = episodes.iter().position(|e| e.id == item.id)?;
        Some(
            episodes[position..]
                .iter()
                .filter(|e| !e.is_virtual_item)
                .cloned()
                .collect(),
        )
    }

    pub async fn send_play_command(
        self: &Arc<Self>,
        controlling_session_id: Option<&str>,
        target_session_id: &str,
        request: PlayRequest,
    ) -> SessionResult<()> {
        self.check_disposed()?;
        let target = self.resolve_target(target_session_id)?;
        let controlling_user_id = self.controlling_user_id(controlling_session_id);

        let user_id = target
            .user_id()
            .ok_or_else(|| SessionError::invalid("target session has no associated user"))?;

        let (mut expanded, mut play_command) = if request.play_command == PlayCommand::PlayInstantMix {
            let mut items = Vec::new();
            for id in &request.item_ids {
                if let Some(item) = self.collaborators.library.get_item_by_id(id).await {
                    items.extend(
                        self.collaborators
                            .music
                            .get_instant_mix_from_item(&item, &user_id)
                            .await,
                    );
                }
            }
            (items, PlayCommand::PlayNow)
        } else {
            let mut items = Vec::new();
            for id in &request.item_ids {
                items.extend(self.translate_item_for_playback(id).await);
            }
            (items, request.play_command)
        };

        if play_command == PlayCommand::PlayShuffle {
            expanded = shuffle(expanded, self.rng.as_ref());
            play_command = PlayCommand::PlayNow;
        }

        for item in &expanded {
            if self.collaborators.library.check_play_access(item, &user_id).await
                != super::collaborators::PlayAccess::Full
            {
                return Err(SessionError::invalid("user is not allowed to play media"));
            }
        }

        let playable_media_types = target.capabilities().playable_media_types;
        for item in &expanded {
            let media_type = item.media_type.as_deref().unwrap_or_default();
            let allowed = playable_media_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(media_type));
            if !allowed {
                return Err(SessionError::invalid("unable to play the requested media type"));
            }
        }

        if let Some(suffix) = self
            .expand_next_episode_autoplay(&request.item_ids, &user_id)
            .await
        {
            expanded = suffix;
        }

        let payload = PlayCommandPayload {
            item_ids: expanded.into_iter().map(|item| item.id).collect(),
            play_command,
            start_position_ticks: request.start_position_ticks,
            controlling_user_id,
        };

        match target.controller() {
            Some(controller) => controller
                .send_play_command(payload)
                .await
                .map_err(|e| SessionError::Internal(e.to_string())),
            None => Ok(()),
        }
    }

    pub async fn send_playstate_command(
        self: &Arc<Self>,
        controlling_session_id: Option<&str>,
        target_session_id: &str,
        command: PlaystateCommandName,
        seek_position_ticks: Option<i64>,
    ) -> SessionResult<()> {
        self.check_disposed()?;
        let target = self.resolve_target(target_session_id)?;
        let controlling_user_id = self.controlling_user_id(controlling_session_id);

        let payload = PlaystateCommand {
            command,
            seek_position_ticks,
            controlling_user_id,
        };

        match target.controller() {
            Some(controller) => controller
                .send_playstate_command(payload)
                .await
                .map_err(|e| SessionError::Internal(e.to_string())),
            None => Ok(()),
        }
    }

    pub async fn send_general_command(
        self: &Arc<Self>,
        target_session_id: &str,
        command: GeneralCommand,
    ) -> SessionResult<()> {
        self.check_disposed()?;
        let target = self.resolve_target(target_session_id)?;
        match target.controller() {
            Some(controller) => controller
                .send_general_command(command)
                .await
                .map_err(|e| SessionError::Internal(e.to_string())),
            None => Ok(()),
        }
    }

    pub async fn send_message_command(
        self: &Arc<Self>,
        target_session_id: &str,
        request: MessageRequest,
    ) -> SessionResult<()> {
        let mut arguments = std::collections::HashMap::new();
        arguments.insert("Header".to_string(), request.header);
        arguments.insert("Text".to_string(), request.text);
        if let Some(timeout) = request.timeout_ms {
            arguments.insert("TimeoutMs".to_string(), timeout.to_string());
        }
        self.send_general_command(
            target_session_id,
            GeneralCommand {
                name: "DisplayMessage".to_string(),
                arguments,
            },
        )
        .await
    }

    pub async fn send_browse_command(
        self: &Arc<Self>,
        target_session_id: &str,
        request: BrowseRequest,
    ) -> SessionResult<()> {
        let mut arguments = std::collections::HashMap::new();
        arguments.insert("ItemId".to_string(), request.item_id);
        arguments.insert("ItemName".to_string(), request.item_name);
        arguments.insert("ItemType".to_string(), request.item_type);
        self.send_general_command(
            target_session_id,
            GeneralCommand {
                name: "DisplayContent".to_string(),
                arguments,
            },
        )
        .await
    }
}

/// Deterministic stand-ins for tests that need a fixed shuffle outcome.
pub mod test_support {
    use super::RandomSource;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub struct FixedSequenceRandom {
        keys: Mutex<VecDeque<u64>>,
    }

    impl FixedSequenceRandom {
        pub fn new(keys: impl IntoIterator<Item = u64>) -> Self {
            Self {
                keys: Mutex::new(keys.into_iter().collect()),
            }
        }
    }

    impl RandomSource for FixedSequenceRandom {
        fn next_u64(&self) -> u64 {
            self.keys.lock().unwrap().pop_front().unwrap_or(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FixedSequenceRandom;
    use super::*;
    use crate::core::collaborators::test_support::{fake_collaborators, FakeLibrary};
    use crate::core::collaborators::{Capabilities, Collaborators, ItemKind};
    use crate::core::controller::test_support::{RecordingController, RecordingControllerFactory};
    use crate::core::controller::ControllerFactoryChain;
    use crate::core::manager::SessionManagerConfig;

    fn leaf(id: &str, media_type: &str, sort_name: &str) -> BaseItem {
        BaseItem {
            id: id.to_string(),
            name: id.to_string(),
            sort_name: sort_name.to_string(),
            media_type: Some(media_type.to_string()),
            run_time_ticks: None,
            supports_played_status: true,
            is_virtual_item: false,
            media_source_ids: vec![],
            kind: ItemKind::Leaf,
        }
    }

    fn episode(id: &str, series_id: &str, season: i32, episode: i32, is_virtual: bool) -> BaseItem {
        BaseItem {
            id: id.to_string(),
            name: id.to_string(),
            sort_name: id.to_string(),
            media_type: Some("Video".to_string()),
            run_time_ticks: None,
            supports_played_status: true,
            is_virtual_item: is_virtual,
            media_source_ids: vec![],
            kind: ItemKind::Episode {
                series_id: series_id.to_string(),
                season_index: season,
                episode_index: episode,
            },
        }
    }

    #[tokio::test]
    async fn shuffle_with_fixed_keys_is_deterministic() {
        let rng = FixedSequenceRandom::new([40, 10, 30, 20]);
        let items = vec![leaf("a", "Video", "a"), leaf("b", "Video", "b"), leaf("c", "Video", "c"), leaf("d", "Video", "d")];
        let shuffled = shuffle(items, &rng);
        let ids: Vec<&str> = shuffled.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "c", "a"]);
    }

    #[tokio::test]
    async fn next_episode_autoplay_expands_to_series_suffix_skipping_virtual() {
        use crate::core::collaborators::test_support::FakeUsers;
        use crate::core::collaborators::User;

        let Collaborators {
            user_data,
            music,
            media_sources,
            devices,
            auth_repo,
            ..
        } = fake_collaborators();

        let library = FakeLibrary::default();
        for i in 1..=10 {
            let id = format!("s01e{i:02}");
            library
                .items
                .lock()
                .unwrap()
                .insert(id.clone(), episode(&id, "series1", 1, i, i == 7));
        }

        let users = FakeUsers::default();
        users.users.lock().unwrap().insert(
            "u1".to_string(),
            User {
                id: "u1".to_string(),
                name: "u1".to_string(),
                last_activity_date: None,
                enable_next_episode_auto_play: true,
                remember_audio_selections: false,
                remember_subtitle_selections: false,
            },
        );

        let collaborators = Collaborators {
            users: Arc::new(users),
            user_data,
            library: Arc::new(library),
            music,
            media_sources,
            devices,
            auth_repo,
        };

        let manager = SessionManager::new_with_rng(
            collaborators,
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
            Arc::new(SystemRandom),
        );

        let expanded = manager
            .expand_next_episode_autoplay(&["s01e03".to_string()], "u1")
            .await
            .expect("user has auto-play enabled and item is an episode");

        let ids: Vec<&str> = expanded.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["s01e03", "s01e04", "s01e05", "s01e06", "s01e08", "s01e09", "s01e10"]
        );
    }

    #[tokio::test]
    async fn send_play_command_rejects_media_type_not_in_capabilities() {
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
        library
            .items
            .lock()
            .unwrap()
            .insert("movie1".to_string(), leaf("movie1", "Video", "movie1"));
        let collaborators = Collaborators {
            users,
            user_data,
            library: Arc::new(library),
            music,
            media_sources,
            devices,
            auth_repo,
        };

        let manager = SessionManager::new(
            collaborators,
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );

        let target = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", Some("u1"))
            .await
            .unwrap();
        target.apply_capabilities(Capabilities {
            playable_media_types: vec!["Audio".to_string()],
            ..Capabilities::default()
        });

        let result = manager
            .send_play_command(
                None,
                &target.id,
                PlayRequest {
                    item_ids: vec!["movie1".to_string()],
                    play_command: PlayCommand::PlayNow,
                    start_position_ticks: None,
                },
            )
            .await;

        assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn send_play_command_rejects_when_no_capabilities_declared() {
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
        library
            .items
            .lock()
            .unwrap()
            .insert("movie1".to_string(), leaf("movie1", "Video", "movie1"));
        let collaborators = Collaborators {
            users,
            user_data,
            library: Arc::new(library),
            music,
            media_sources,
            devices,
            auth_repo,
        };

        let manager = SessionManager::new(
            collaborators,
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );

        let target = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", Some("u1"))
            .await
            .unwrap();
        // No `apply_capabilities` call — `playableMediaTypes` stays empty.

        let result = manager
            .send_play_command(
                None,
                &target.id,
                PlayRequest {
                    item_ids: vec!["movie1".to_string()],
                    play_command: PlayCommand::PlayNow,
                    start_position_ticks: None,
                },
            )
            .await;

        assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
    }
}
