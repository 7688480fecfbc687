// Component H: authentication and token lifecycle. Password verification
// itself belongs to `UserManager`; this module owns the token mint/reuse
// rule and the logout/revoke cascade back into `ReportSessionEnded`.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::collaborators::{AuthTokenInfo, AuthTokenQuery, User};
use super::errors::{SessionError, SessionResult};
use super::events::Event;
use super::manager::SessionManager;

#[derive(Debug, Clone)]
pub struct AuthenticationRequest {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub app_name: String,
    pub app_version: String,
    pub device_id: String,
    pub device_name: String,
    pub remote_end_point: String,
    pub enforce_password: bool,
}

#[derive(Debug, Clone)]
pub struct AuthenticationResult {
    pub user: User,
    pub session_id: String,
    pub access_token: String,
}

impl SessionManager {
    async fn resolve_candidate_user(&self, request: &AuthenticationRequest) -> Option<User> {
        if let Some(id) = &request.user_id {
            return self.collaborators.users.get_user_by_id(id).await;
        }
        let name = request.username.as_deref()?;
        self.collaborators.users.get_user_by_name(name).await
    }

    /// Returns the active token for `(device_id, user_id)` if one exists,
    /// else mints and persists a fresh opaque token.
    async fn mint_or_reuse_token(&self, user_id: &str, device_id: &str) -> SessionResult<String> {
        let existing = self
            .collaborators
            .auth_repo
            .get(AuthTokenQuery {
                device_id: Some(device_id.to_string()),
                user_id: Some(user_id.to_string()),
                access_token: None,
                is_active: Some(true),
                limit: Some(1),
            })
            .await?;

        if let Some(row) = existing.into_iter().next() {
            return Ok(row.access_token);
        }

        let access_token = Uuid::new_v4().simple().to_string();
        self.collaborators
            .auth_repo
            .create(AuthTokenInfo {
                access_token: access_token.clone(),
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                is_active: true,
                date_created: Utc::now(),
            })
            .await?;

        Ok(access_token)
    }

    /// `AuthenticateNewSession` (alias `CreateNewSession` with
    /// `enforce_password = false`).
    pub async fn authenticate_new_session(
        self: &Arc<Self>,
        request: AuthenticationRequest,
    ) -> SessionResult<AuthenticationResult> {
        self.check_disposed()?;

        let candidate = self.resolve_candidate_user(&request).await;

        if let Some(user) = &candidate {
            if !self.collaborators.users.is_within_parental_schedule(&user.id).await {
                return Err(SessionError::denied("outside allowed viewing schedule"));
            }
            if !self
                .collaborators
                .users
                .can_access_device(&user.id, &request.device_id)
                .await
            {
                return Err(SessionError::denied("device is not permitted for this user"));
            }
        }

        let user = if request.enforce_password {
            let username = request
                .username
                .as_deref()
                .or_else(|| candidate.as_ref().map(|u| u.name.as_str()))
                .ok_or_else(|| SessionError::invalid("username is required"))?;
            let password = request.password.as_deref().unwrap_or("");
            match self
                .collaborators
                .users
                .authenticate_user(username, password, &request.remote_end_point)
                .await
            {
                Some(user) => user,
                None => {
                    self.events.publish(Event::AuthenticationFailed {
                        username: username.to_string(),
                    });
                    return Err(SessionError::denied("invalid username or password"));
                }
            }
        } else {
            candidate.ok_or_else(|| SessionError::not_found("user"))?
        };

        let access_token = self.mint_or_reuse_token(&user.id, &request.device_id).await?;

        let session = self
            .log_session_activity(
                &request.app_name,
                &request.app_version,
                &request.device_id,
                &request.device_name,
                &request.remote_end_point,
                Some(&user.id),
            )
            .await?;

        self.events.publish(Event::AuthenticationSucceeded {
            user_id: user.id.clone(),
            session_id: session.id.clone(),
        });

        Ok(AuthenticationResult {
            user,
            session_id: session.id.clone(),
            access_token,
        })
    }

    /// Flips the token inactive and ends every session on its device.
    pub async fn logout(self: &Arc<Self>, access_token: &str) -> SessionResult<()> {
        self.check_disposed()?;

        let rows = self
            .collaborators
            .auth_repo
            .get(AuthTokenQuery {
                device_id: None,
                user_id: None,
                access_token: Some(access_token.to_string()),
                is_active: None,
                limit: Some(1),
            })
            .await?;
        let Some(mut token) = rows.into_iter().next() else {
            return Err(SessionError::not_found("access token"));
        };

        token.is_active = false;
        self.collaborators.auth_repo.update(token.clone()).await?;

        for session in self.registry.by_device(&token.device_id) {
            self.report_session_ended(&session.id).await;
        }

        Ok(())
    }

    /// Resolves an access token to its owning user — the check every HTTP
    /// handler needs before doing anything else.
    pub async fn user_for_access_token(self: &Arc<Self>, access_token: &str) -> SessionResult<User> {
        self.check_disposed()?;

        let rows = self
            .collaborators
            .auth_repo
            .get(AuthTokenQuery {
                device_id: None,
                user_id: None,
                access_token: Some(access_token.to_string()),
                is_active: Some(true),
                limit: Some(1),
            })
            .await?;
        let token = rows
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::not_found("access token"))?;

        self.collaborators
            .users
            .get_user_by_id(&token.user_id)
            .await
            .ok_or_else(|| SessionError::not_found("user"))
    }

    /// Logs out every other active token belonging to the user.
    pub async fn revoke_user_tokens(
        self: &Arc<Self>,
        user_id: &str,
        current_access_token: &str,
    ) -> SessionResult<()> {
        self.check_disposed()?;

        let rows = self
            .collaborators
            .auth_repo
            .get(AuthTokenQuery {
                device_id: None,
                user_id: Some(user_id.to_string()),
                access_token: None,
                is_active: Some(true),
                limit: None,
            })
            .await?;

        for token in rows {
            if token.access_token == current_access_token {
                continue;
            }
            self.logout(&token.access_token).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::test_support::{fake_collaborators, FakeUsers};
    use crate::core::collaborators::{Collaborators, User};
    use crate::core::controller::test_support::RecordingControllerFactory;
    use crate::core::controller::ControllerFactoryChain;
    use crate::core::manager::SessionManagerConfig;

    fn collaborators_with_user(id: &str, password: &str) -> Collaborators {
        let Collaborators {
            user_data,
            library,
            music,
            media_sources,
            devices,
            auth_repo,
            ..
        } = fake_collaborators();
        let users = FakeUsers::default();
        users.users.lock().unwrap().insert(
            id.to_string(),
            User {
                id: id.to_string(),
                name: id.to_string(),
                last_activity_date: None,
                enable_next_episode_auto_play: false,
                remember_audio_selections: false,
                remember_subtitle_selections: false,
            },
        );
        users
            .passwords
            .lock()
            .unwrap()
            .insert(id.to_string(), password.to_string());
        Collaborators {
            users: Arc::new(users),
            user_data,
            library,
            music,
            media_sources,
            devices,
            auth_repo,
        }
    }

    #[tokio::test]
    async fn repeated_authentication_reuses_the_same_token() {
        let manager = SessionManager::new(
            collaborators_with_user("u1", "hunter2"),
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );

        let request = || AuthenticationRequest {
            user_id: None,
            username: Some("u1".to_string()),
            password: Some("hunter2".to_string()),
            app_name: "Web".to_string(),
            app_version: "1.0".to_string(),
            device_id: "devA".to_string(),
            device_name: "Chrome".to_string(),
            remote_end_point: "1.1.1.1".to_string(),
            enforce_password: true,
        };

        let first = manager.authenticate_new_session(request()).await.unwrap();
        let second = manager.authenticate_new_session(request()).await.unwrap();

        assert_eq!(first.access_token, second.access_token);
    }

    #[tokio::test]
    async fn logout_ends_only_sessions_on_the_matching_device() {
        let manager = SessionManager::new(
            collaborators_with_user("u1", "hunter2"),
            ControllerFactoryChain::new(vec![Arc::new(RecordingControllerFactory)]),
            SessionManagerConfig::default(),
        );

        let d1 = manager
            .authenticate_new_session(AuthenticationRequest {
                user_id: None,
                username: Some("u1".to_string()),
                password: Some("hunter2".to_string()),
                app_name: "Web".to_string(),
                app_version: "1.0".to_string(),
                device_id: "d1".to_string(),
                device_name: "Chrome".to_string(),
                remote_end_point: "1.1.1.1".to_string(),
                enforce_password: true,
            })
            .await
            .unwrap();

        manager
            .authenticate_new_session(AuthenticationRequest {
                user_id: None,
                username: Some("u1".to_string()),
                password: Some("hunter2".to_string()),
                app_name: "Web".to_string(),
                app_version: "1.0".to_string(),
                device_id: "d2".to_string(),
                device_name: "Firefox".to_string(),
                remote_end_point: "1.1.1.2".to_string(),
                enforce_password: true,
            })
            .await
            .unwrap();

        assert_eq!(manager.registry().len(), 2);

        manager.logout(&d1.access_token).await.unwrap();

        assert_eq!(manager.registry().len(), 1);
        assert!(manager.registry().by_device("d1").is_empty());
        assert!(!manager.registry().by_device("d2").is_empty());
    }
}
