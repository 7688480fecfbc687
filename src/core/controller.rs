// The `SessionController` trait and a factory chain that binds one to a
// new session. The core never downcasts a controller except to compare
// transport identity — that comparison lives on the concrete
// implementation, not here.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::session::Session;

#[derive(Debug, Clone)]
pub struct GeneralCommand {
    pub name: String,
    pub arguments: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaystateCommandName {
    Stop,
    Pause,
    Unpause,
    Seek,
    Rewind,
    FastForward,
    NextTrack,
    PreviousTrack,
}

#[derive(Debug, Clone)]
pub struct PlaystateCommand {
    pub command: PlaystateCommandName,
    pub seek_position_ticks: Option<i64>,
    pub controlling_user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayCommand {
    PlayNow,
    PlayNext,
    PlayLast,
    PlayInstantMix,
    PlayShuffle,
}

#[derive(Debug, Clone)]
pub struct PlayCommandPayload {
    pub item_ids: Vec<String>,
    pub play_command: PlayCommand,
    pub start_position_ticks: Option<i64>,
    pub controlling_user_id: Option<String>,
}

/// The transport adapter bound to a session. HTTP long-poll and WebSocket
/// are both concrete implementations of this trait; the core only ever
/// holds `Arc<dyn SessionController>`.
#[async_trait]
pub trait SessionController: Send + Sync {
    /// Whether this transport still reports a live connection — feeds
    /// `Session::is_active`.
    fn is_alive(&self) -> bool;

    async fn on_activity(&self);
    async fn send_general_command(&self, command: GeneralCommand) -> anyhow::Result<()>;
    async fn send_playstate_command(&self, command: PlaystateCommand) -> anyhow::Result<()>;
    async fn send_play_command(&self, command: PlayCommandPayload) -> anyhow::Result<()>;
    async fn send_message(&self, name: &str, data: Value) -> anyhow::Result<()>;
    async fn send_playback_start_notification(&self, dto: Value) -> anyhow::Result<()>;
    async fn send_playback_stopped_notification(&self, dto: Value) -> anyhow::Result<()>;
    async fn send_session_ended_notification(&self, dto: Value) -> anyhow::Result<()>;
    async fn send_server_shutdown_notification(&self) -> anyhow::Result<()>;
    async fn send_server_restart_notification(&self) -> anyhow::Result<()>;
    async fn send_restart_required_notification(&self) -> anyhow::Result<()>;
    async fn dispose(&self);
}

/// Selects a transport for a new session by walking an ordered chain and
/// taking the first non-nil result.
pub trait ControllerFactory: Send + Sync {
    fn get_session_controller(&self, session: &Session) -> Option<Arc<dyn SessionController>>;
}

pub struct ControllerFactoryChain {
    factories: Vec<Arc<dyn ControllerFactory>>,
}

impl ControllerFactoryChain {
    pub fn new(factories: Vec<Arc<dyn ControllerFactory>>) -> Self {
        Self { factories }
    }

    pub fn resolve(&self, session: &Session) -> Option<Arc<dyn SessionController>> {
        self.factories
            .iter()
            .find_map(|factory| factory.get_session_controller(session))
    }
}

/// Pushes notifications to a client-registered HTTP callback URL — an
/// HTTP long-poll transport. Two controllers are considered "the same
/// transport" if they post to the same callback URL; that equality check
/// is what a re-bind decides "is this already an HTTP controller for the
/// same callback URL" with.
pub struct HttpPushController {
    pub callback_url: String,
    client: reqwest::Client,
    alive: std::sync::atomic::AtomicBool,
}

impl HttpPushController {
    pub fn new(callback_url: String) -> Self {
        Self {
            callback_url,
            client: reqwest::Client::new(),
            alive: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn same_transport(&self, callback_url: &str) -> bool {
        self.callback_url == callback_url
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<()> {
        let url = format!("{}{}", self.callback_url, path);
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SessionController for HttpPushController {
    fn is_alive(&self) -> bool {
        self.alive.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn on_activity(&self) {
        let _ = self.post("/Activity", Value::Null).await;
    }

    async fn send_general_command(&self, command: GeneralCommand) -> anyhow::Result<()> {
        self.post("/GeneralCommand", serde_json::json!(command.arguments))
            .await
    }

    async fn send_playstate_command(&self, command: PlaystateCommand) -> anyhow::Result<()> {
        self.post(
            "/PlaystateCommand",
            serde_json::json!({ "seekPositionTicks": command.seek_position_ticks }),
        )
        .await
    }

    async fn send_play_command(&self, command: PlayCommandPayload) -> anyhow::Result<()> {
        self.post("/PlayCommand", serde_json::json!({ "itemIds": command.item_ids }))
            .await
    }

    async fn send_message(&self, name: &str, data: Value) -> anyhow::Result<()> {
        self.post(&format!("/Message/{name}"), data).await
    }

    async fn send_playback_start_notification(&self, dto: Value) -> anyhow::Result<()> {
        self.post("/Notify/PlaybackStart", dto).await
    }

    async fn send_playback_stopped_notification(&self, dto: Value) -> anyhow::Result<()> {
        self.post("/Notify/PlaybackStopped", dto).await
    }

    async fn send_session_ended_notification(&self, dto: Value) -> anyhow::Result<()> {
        self.post("/Notify/SessionEnded", dto).await
    }

    async fn send_server_shutdown_notification(&self) -> anyhow::Result<()> {
        self.post("/Notify/ServerShutdown", Value::Null).await
    }

    async fn send_server_restart_notification(&self) -> anyhow::Result<()> {
        self.post("/Notify/ServerRestarting", Value::Null).await
    }

    async fn send_restart_required_notification(&self) -> anyhow::Result<()> {
        self.post("/Notify/RestartRequired", Value::Null).await
    }

    async fn dispose(&self) {
        self.alive.store(false, std::sync::atomic::Ordering::Relaxed);
    }
}

/// In-memory controller used by tests and the default standalone binary —
/// records every call instead of performing network I/O.
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingController {
        pub alive: std::sync::atomic::AtomicBool,
        pub activity_count: std::sync::atomic::AtomicUsize,
        pub general_commands: Mutex<Vec<GeneralCommand>>,
        pub playstate_commands: Mutex<Vec<PlaystateCommand>>,
        pub play_commands: Mutex<Vec<PlayCommandPayload>>,
        pub messages: Mutex<Vec<(String, Value)>>,
        pub playback_start_notifications: Mutex<Vec<Value>>,
        pub playback_stopped_notifications: Mutex<Vec<Value>>,
        pub session_ended_notifications: Mutex<Vec<Value>>,
        pub server_shutdown_count: std::sync::atomic::AtomicUsize,
        pub server_restart_count: std::sync::atomic::AtomicUsize,
        pub restart_required_count: std::sync::atomic::AtomicUsize,
    }

    impl RecordingController {
        pub fn new() -> Arc<Self> {
            let ctrl = Self::default();
            ctrl.alive.store(true, std::sync::atomic::Ordering::Relaxed);
            Arc::new(ctrl)
        }
    }

    #[async_trait]
    impl SessionController for RecordingController {
        fn is_alive(&self) -> bool {
            self.alive.load(std::sync::atomic::Ordering::Relaxed)
        }

        async fn on_activity(&self) {
            self.activity_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        async fn send_general_command(&self, command: GeneralCommand) -> anyhow::Result<()> {
            self.general_commands.lock().unwrap().push(command);
            Ok(())
        }

        async fn send_playstate_command(&self, command: PlaystateCommand) -> anyhow::Result<()> {
            self.playstate_commands.lock().unwrap().push(command);
            Ok(())
        }

        async fn send_play_command(&self, command: PlayCommandPayload) -> anyhow::Result<()> {
            self.play_commands.lock().unwrap().push(command);
            Ok(())
        }

        async fn send_message(&self, name: &str, data: Value) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push((name.to_string(), data));
            Ok(())
        }

        async fn send_playback_start_notification(&self, dto: Value) -> anyhow::Result<()> {
            self.playback_start_notifications.lock().unwrap().push(dto);
            Ok(())
        }

        async fn send_playback_stopped_notification(&self, dto: Value) -> anyhow::Result<()> {
            self.playback_stopped_notifications.lock().unwrap().push(dto);
            Ok(())
        }

        async fn send_session_ended_notification(&self, dto: Value) -> anyhow::Result<()> {
            self.session_ended_notifications.lock().unwrap().push(dto);
            Ok(())
        }

        async fn send_server_shutdown_notification(&self) -> anyhow::Result<()> {
            self.server_shutdown_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }

        async fn send_server_restart_notification(&self) -> anyhow::Result<()> {
            self.server_restart_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }

        async fn send_restart_required_notification(&self) -> anyhow::Result<()> {
            self.restart_required_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }

        async fn dispose(&self) {
            self.alive.store(false, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Always binds a fresh `RecordingController` — stands in for the
    /// single factory in the chain during tests.
    pub struct RecordingControllerFactory;

    impl ControllerFactory for RecordingControllerFactory {
        fn get_session_controller(&self, _session: &Session) -> Option<Arc<dyn SessionController>> {
            Some(RecordingController::new())
        }
    }
}
