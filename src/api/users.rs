use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::core::auth::AuthenticationRequest;
use crate::core::collaborators::User;
use crate::core::SessionManager;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/AuthenticateByName", post(authenticate_by_name))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticateRequest {
    pub username: String,
    pub pw: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticationResultDto {
    pub user: UserDto,
    pub session_info: SessionInfoDto,
    pub access_token: String,
    pub server_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserDto {
    pub id: String,
    pub name: String,
    pub server_id: String,
    pub has_password: bool,
    pub has_configured_password: bool,
    pub enable_auto_login: bool,
    pub policy: UserPolicy,
    pub configuration: UserConfiguration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserPolicy {
    pub is_administrator: bool,
    pub is_hidden: bool,
    pub is_disabled: bool,
    pub enable_all_folders: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserConfiguration {
    pub enable_next_episode_auto_play: bool,
    pub remember_audio_selections: bool,
    pub remember_subtitle_selections: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfoDto {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub client: String,
    pub device_name: String,
    pub device_id: String,
}

const SERVER_ID: &str = "jellyfin-rust-server";

async fn is_admin(state: &AppState, user_id: &str) -> bool {
    sqlx::query_scalar::<_, bool>("SELECT is_admin FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&state.db)
        .await
        .unwrap_or(false)
}

fn user_dto(user: &User, is_admin: bool) -> UserDto {
    UserDto {
        id: user.id.clone(),
        name: user.name.clone(),
        server_id: SERVER_ID.to_string(),
        has_password: true,
        has_configured_password: true,
        enable_auto_login: false,
        policy: UserPolicy {
            is_administrator: is_admin,
            is_hidden: false,
            is_disabled: false,
            enable_all_folders: true,
        },
        configuration: UserConfiguration {
            enable_next_episode_auto_play: user.enable_next_episode_auto_play,
            remember_audio_selections: user.remember_audio_selections,
            remember_subtitle_selections: user.remember_subtitle_selections,
        },
    }
}

/// Parse the `X-Emby-Authorization`/`Authorization` header:
/// `MediaBrowser Client="...", Device="...", DeviceId="...", Version="...", Token="..."`.
pub fn parse_emby_auth_header(
    headers: &HeaderMap,
) -> Option<(String, String, String, Option<String>)> {
    let auth_header = headers
        .get("X-Emby-Authorization")
        .or_else(|| headers.get("Authorization"))?
        .to_str()
        .ok()?;

    let mut client = String::new();
    let mut device = String::new();
    let mut device_id = String::new();
    let mut token = None;

    let params = auth_header
        .strip_prefix("MediaBrowser ")
        .or_else(|| auth_header.strip_prefix("Emby "))
        .unwrap_or(auth_header);

    for part in params.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim_matches('"');
            match key.trim() {
                "Client" => client = value.to_string(),
                "Device" => device = value.to_string(),
                "DeviceId" => device_id = value.to_string(),
                "Token" => token = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Some((client, device, device_id, token))
}

/// Shared by every handler under `/Sessions` and `/Users`: resolve the
/// bearer token to the user it was minted for.
pub(crate) async fn require_auth(
    sessions: &Arc<SessionManager>,
    headers: &HeaderMap,
) -> Result<User, (StatusCode, String)> {
    let (_, _, _, token) = parse_emby_auth_header(headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing auth header".to_string()))?;
    let token = token.ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing token".to_string()))?;
    sessions
        .user_for_access_token(&token)
        .await
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))
}

async fn authenticate_by_name(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<AuthenticateRequest>,
) -> Result<Json<AuthenticationResultDto>, (StatusCode, String)> {
    let (client, device_name, device_id, _) = parse_emby_auth_header(&headers).unwrap_or_else(|| {
        (
            "Unknown".to_string(),
            "Unknown".to_string(),
            "unknown".to_string(),
            None,
        )
    });

    let result = state
        .sessions
        .authenticate_new_session(AuthenticationRequest {
            user_id: None,
            username: Some(req.username),
            password: Some(req.pw),
            app_name: client.clone(),
            app_version: "Unknown".to_string(),
            device_id: device_id.clone(),
            device_name: device_name.clone(),
            remote_end_point: addr.ip().to_string(),
            enforce_password: true,
        })
        .await
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))?;

    let admin = is_admin(&state, &result.user.id).await;

    let session_info = SessionInfoDto {
        id: result.session_id,
        user_id: result.user.id.clone(),
        user_name: result.user.name.clone(),
        client,
        device_name,
        device_id,
    };

    Ok(Json(AuthenticationResultDto {
        user: user_dto(&result.user, admin),
        session_info,
        access_token: result.access_token,
        server_id: SERVER_ID.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_mediabrowser_auth_header_with_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Emby-Authorization",
            HeaderValue::from_static(
                r#"MediaBrowser Client="Web", Device="Chrome", DeviceId="dev1", Version="1.0", Token="abc123""#,
            ),
        );
        let (client, device, device_id, token) = parse_emby_auth_header(&headers).unwrap();
        assert_eq!(client, "Web");
        assert_eq!(device, "Chrome");
        assert_eq!(device_id, "dev1");
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn parses_header_without_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Emby-Authorization",
            HeaderValue::from_static(r#"MediaBrowser Client="Web", Device="Chrome", DeviceId="dev1", Version="1.0""#),
        );
        let (.., token) = parse_emby_auth_header(&headers).unwrap();
        assert!(token.is_none());
    }

    #[test]
    fn missing_header_returns_none() {
        let headers = HeaderMap::new();
        assert!(parse_emby_auth_header(&headers).is_none());
    }
}
