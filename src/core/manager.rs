// Activity & lifecycle driver, plus the `SessionManager` struct every
// other module in this crate adds methods to.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use super::collaborators::Collaborators;
use super::controller::ControllerFactoryChain;
use super::errors::{SessionError, SessionResult};
use super::events::{Event, EventBus};
use super::registry::SessionRegistry;
use super::remote::{RandomSource, SystemRandom};
use super::session::{Session, SessionKey};

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub idle_sweep_interval: std::time::Duration,
    pub idle_stale_threshold: ChronoDuration,
    pub auto_progress_interval: std::time::Duration,
    pub activity_throttle: ChronoDuration,
    pub user_activity_throttle: ChronoDuration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            idle_sweep_interval: std::time::Duration::from_secs(300),
            idle_stale_threshold: ChronoDuration::seconds(300),
            auto_progress_interval: std::time::Duration::from_secs(10),
            activity_throttle: ChronoDuration::seconds(10),
            user_activity_throttle: ChronoDuration::seconds(60),
        }
    }
}

/// The coordination core. Owns the registry and serializes the
/// create-or-update path of `log_session_activity`/`report_session_ended`
/// behind `primary_lock`; everything else — fan-out, persistence, library
/// lookups — runs after the lock is released.
pub struct SessionManager {
    pub(crate) registry: SessionRegistry,
    pub(crate) events: EventBus,
    pub(crate) collaborators: Collaborators,
    pub(crate) controller_factory: ControllerFactoryChain,
    pub(crate) config: SessionManagerConfig,
    pub(crate) primary_lock: AsyncMutex<()>,
    pub(crate) idle_timer: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    pub(crate) disposed: AtomicBool,
    pub(crate) rng: Arc<dyn RandomSource>,
}

impl SessionManager {
    pub fn new(
        collaborators: Collaborators,
        controller_factory: ControllerFactoryChain,
        config: SessionManagerConfig,
    ) -> Arc<Self> {
        Self::new_with_rng(collaborators, controller_factory, config, Arc::new(SystemRandom))
    }

    /// Same as [`Self::new`] but with an injectable random source, so
    /// `PlayShuffle` can be made deterministic under test.
    pub fn new_with_rng(
        collaborators: Collaborators,
        controller_factory: ControllerFactoryChain,
        config: SessionManagerConfig,
        rng: Arc<dyn RandomSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            events: EventBus::new(),
            collaborators,
            controller_factory,
            config,
            primary_lock: AsyncMutex::new(()),
            idle_timer: AsyncMutex::new(None),
            disposed: AtomicBool::new(false),
            rng,
        })
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn check_disposed(&self) -> SessionResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(SessionError::Disposed)
        } else {
            Ok(())
        }
    }

    /// `ReportNowViewingItem` is present in upstream API surfaces but
    /// disabled pending a product decision — kept here as a documented
    /// no-op rather than omitted outright.
    pub fn report_now_viewing_item(&self, _session_id: &str, _item_id: Option<&str>) {}

    /// Records a client's activity, creating the session on first contact.
    pub async fn log_session_activity(
        self: &Arc<Self>,
        app_name: &str,
        app_version: &str,
        device_id: &str,
        device_name: &str,
        remote_end_point: &str,
        user_id: Option<&str>,
    ) -> SessionResult<Arc<Session>> {
        self.check_disposed()?;

        if app_name.is_empty()
            || app_version.is_empty()
            || device_id.is_empty()
            || device_name.is_empty()
            || remote_end_point.is_empty()
        {
            return Err(SessionError::invalid(
                "appName, appVersion, deviceId, deviceName and remoteEndPoint must be non-empty",
            ));
        }

        let user = match user_id {
            Some(id) => self.collaborators.users.get_user_by_id(id).await,
            None => None,
        };
        let user_name = user.as_ref().map(|u| u.name.clone());

        let key = SessionKey::new(app_name, device_id);
        let now = Utc::now();

        let session = {
            let _guard = self.primary_lock.lock().await;

            let (session, is_new) = match self.registry.get(&key) {
                Some(existing) => (existing, false),
                None => {
                    let fresh = Arc::new(Session::new(
                        app_name,
                        device_id,
                        device_name,
                        app_version,
                        remote_end_point,
                        now,
                    ));
                    (fresh, true)
                }
            };

            if is_new {
                self.events.publish(Event::SessionStarted {
                    session_id: session.id.clone(),
                });
                if let Some(caps) = self.collaborators.devices.get_capabilities(device_id).await {
                    session.apply_capabilities(caps);
                }
                self.registry.insert(key, session.clone());
                self.collaborators
                    .devices
                    .register_device(device_id, device_name, app_name, app_version, user_id)
                    .await;
            }

            let custom_name = self.collaborators.devices.get_custom_name(device_id).await;
            session.refresh_identity(
                device_name,
                custom_name.as_deref(),
                user_id,
                user_name.as_deref(),
                remote_end_point,
                app_version,
            );

            if session.controller().is_none() {
                if let Some(controller) = self.controller_factory.resolve(&session) {
                    session.set_controller(controller);
                }
            }

            session
        };

        // Step 4: everything from here runs outside the critical section.
        let activity_date = Utc::now();
        let previous = session.last_activity_date();
        if session.bump_activity(activity_date)
            && (activity_date - previous) > self.config.activity_throttle
        {
            self.events.publish(Event::SessionActivity {
                session_id: session.id.clone(),
            });
        }

        if let Some(uid) = session.user_id() {
            if let Some(user) = self.collaborators.users.get_user_by_id(&uid).await {
                let stale = user
                    .last_activity_date
                    .map(|d| (activity_date - d) > self.config.user_activity_throttle)
                    .unwrap_or(true);
                if stale {
                    if let Err(e) = self
                        .collaborators
                        .users
                        .update_last_activity(&uid, activity_date)
                        .await
                    {
                        tracing::warn!("failed to refresh user activity for {}: {}", uid, e);
                    }
                }
            }
        }

        if let Some(controller) = session.controller() {
            controller.on_activity().await;
        }

        Ok(session)
    }

    /// Ends a session. Missing session ids are a silent no-op — removal is
    /// the authoritative step and there is nothing left to report once it
    /// has already happened.
    pub async fn report_session_ended(self: &Arc<Self>, session_id: &str) {
        if self.check_disposed().is_err() {
            return;
        }

        let session = {
            let _guard = self.primary_lock.lock().await;
            self.registry.remove_by_id(session_id)
        };

        let Some(session) = session else {
            return;
        };

        tracing::info!("session {} ended", session.id);
        self.events.publish(Event::SessionEnded {
            session_id: session.id.clone(),
        });

        let dto = serde_json::json!({ "Id": session.id, "DeviceId": session.device_id });
        let remaining = self.registry.snapshot();
        EventBus::fan_out(&remaining, move |target| {
            let dto = dto.clone();
            Box::pin(async move {
                if let Some(controller) = target.controller() {
                    controller.send_session_ended_notification(dto).await
                } else {
                    Ok(())
                }
            })
        })
        .await;

        session.dispose().await;
    }

    /// Listener for `DeviceManager`'s `DeviceOptionsUpdated` event: rename
    /// every session tied to the renamed device.
    pub fn handle_device_renamed(&self, device_id: &str, new_name: &str) {
        for session in self.registry.by_device(device_id) {
            session.rename_device(new_name);
        }
    }

    /// Shutdown barrier: dispose every tracked session so timers and
    /// controllers are released before the manager itself goes away.
    pub async fn dispose(self: &Arc<Self>) {
        self.disposed.store(true, Ordering::Release);
        if let Some(handle) = self.idle_timer.lock().await.take() {
            handle.abort();
        }
        let sessions = self.registry.snapshot();
        self.events.publish(Event::ServerShutdown);
        EventBus::fan_out(&sessions, |target| {
            Box::pin(async move {
                if let Some(controller) = target.controller() {
                    controller.send_server_shutdown_notification().await
                } else {
                    Ok(())
                }
            })
        })
        .await;
        for session in sessions {
            session.dispose().await;
        }
    }

    /// Tells every connected client a restart is imminent. Distinct from
    /// [`Self::dispose`]: the manager keeps running and sessions stay live.
    pub async fn notify_server_restarting(self: &Arc<Self>) -> SessionResult<()> {
        self.check_disposed()?;
        self.events.publish(Event::ServerRestart);
        let sessions = self.registry.snapshot();
        EventBus::fan_out(&sessions, |target| {
            Box::pin(async move {
                if let Some(controller) = target.controller() {
                    controller.send_server_restart_notification().await
                } else {
                    Ok(())
                }
            })
        })
        .await;
        Ok(())
    }

    /// Tells every connected client a pending update requires a restart to
    /// take effect, without restarting anything itself.
    pub async fn notify_restart_required(self: &Arc<Self>) -> SessionResult<()> {
        self.check_disposed()?;
        self.events.publish(Event::RestartRequired);
        let sessions = self.registry.snapshot();
        EventBus::fan_out(&sessions, |target| {
            Box::pin(async move {
                if let Some(controller) = target.controller() {
                    controller.send_restart_required_notification().await
                } else {
                    Ok(())
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
    use crate::core::collaborators::test_support::fake_collaborators;
    use crate::core::controller::test_support::{RecordingController, RecordingControllerFactory};
    use crate::core::controller::ControllerFactoryChain;

    #[tokio::test]
    async fn dispose_fans_out_server_shutdown_to_active_controllers() {
        let manager = SessionManager::new(
            fake_collaborators(),
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );
        let session = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", None)
            .await
            .unwrap();
        let controller = RecordingController::new();
        session.set_controller(controller.clone());

        manager.dispose().await;

        assert_eq!(controller.server_shutdown_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn notify_server_restarting_fans_out_to_active_controllers() {
        let manager = SessionManager::new(
            fake_collaborators(),
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );
        let session = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", None)
            .await
            .unwrap();
        let controller = RecordingController::new();
        session.set_controller(controller.clone());

        manager.notify_server_restarting().await.unwrap();

        assert_eq!(controller.server_restart_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn notify_restart_required_fans_out_to_active_controllers() {
        let manager = SessionManager::new(
            fake_collaborators(),
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );
        let session = manager
            .log_session_activity("Web", "1.0", "devA", "Chrome", "1.1.1.1", None)
            .await
            .unwrap();
        let controller = RecordingController::new();
        session.set_controller(controller.clone());

        manager.notify_restart_required().await.unwrap();

        assert_eq!(controller.restart_required_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn notify_server_restarting_rejects_after_dispose() {
        let manager = SessionManager::new(
            fake_collaborators(),
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );
        manager.dispose().await;

        let result = manager.notify_server_restarting().await;
        assert!(matches!(result, Err(SessionError::Disposed)));
    }
}
