// Playback reporting - start/progress/stopped and logout.

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::sessions::session_error_to_http;
use crate::api::users::{parse_emby_auth_header, require_auth};
use crate::core::session::{PlayMethod, RepeatMode};
use crate::core::{PlaybackProgressInfo, PlaybackStartInfo, PlaybackStopInfo};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/Playing", post(playback_start))
        .route("/Playing/Progress", post(playback_progress))
        .route("/Playing/Stopped", post(playback_stopped))
        .route("/Logout", post(logout))
        .route("/Logout/All", post(logout_all))
}

fn parse_play_method(s: Option<&str>) -> PlayMethod {
    match s {
        Some("DirectStream") => PlayMethod::DirectStream,
        Some("Transcode") => PlayMethod::Transcode,
        _ => PlayMethod::DirectPlay,
    }
}

fn parse_repeat_mode(s: Option<&str>) -> RepeatMode {
    match s {
        Some("RepeatOne") => RepeatMode::RepeatOne,
        Some("RepeatAll") => RepeatMode::RepeatAll,
        _ => RepeatMode::RepeatNone,
    }
}

/// Resolves the caller's own session via its device/client identity,
/// reusing the same get-or-create path activity reporting uses — playback
/// report bodies never carry a session id of their own.
async fn resolve_session(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> Result<String, (StatusCode, String)> {
    let user = require_auth(&state.sessions, headers).await?;
    let (client, device_name, device_id, _) = parse_emby_auth_header(headers).ok_or_else(|| {
        (StatusCode::BAD_REQUEST, "missing auth header".to_string())
    })?;

    let session = state
        .sessions
        .log_session_activity(
            &client,
            "Unknown",
            &device_id,
            &device_name,
            &addr.ip().to_string(),
            Some(&user.id),
        )
        .await
        .map_err(session_error_to_http)?;

    Ok(session.id.clone())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlaybackStartBody {
    pub item_id: Option<String>,
    pub media_source_id: Option<String>,
    pub position_ticks: Option<i64>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub play_method: Option<String>,
    pub can_seek: Option<bool>,
}

async fn playback_start(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PlaybackStartBody>,
) -> Result<StatusCode, (StatusCode, String)> {
    let session_id = resolve_session(&state, &headers, addr).await?;

    state
        .sessions
        .on_playback_start(PlaybackStartInfo {
            session_id,
            item_id: body.item_id,
            media_source_id: body.media_source_id,
            position_ticks: body.position_ticks,
            audio_stream_index: body.audio_stream_index,
            subtitle_stream_index: body.subtitle_stream_index,
            play_method: parse_play_method(body.play_method.as_deref()),
            can_seek: body.can_seek.unwrap_or(false),
        })
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlaybackProgressBody {
    pub item_id: Option<String>,
    pub media_source_id: Option<String>,
    pub position_ticks: Option<i64>,
    pub is_paused: Option<bool>,
    pub is_muted: Option<bool>,
    pub volume_level: Option<i32>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub play_method: Option<String>,
    pub repeat_mode: Option<String>,
}

async fn playback_progress(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PlaybackProgressBody>,
) -> Result<StatusCode, (StatusCode, String)> {
    let session_id = resolve_session(&state, &headers, addr).await?;

    state
        .sessions
        .on_playback_progress(
            PlaybackProgressInfo {
                session_id,
                item_id: body.item_id,
                media_source_id: body.media_source_id,
                position_ticks: body.position_ticks,
                is_paused: body.is_paused.unwrap_or(false),
                is_muted: body.is_muted.unwrap_or(false),
                volume_level: body.volume_level.unwrap_or(100),
                audio_stream_index: body.audio_stream_index,
                subtitle_stream_index: body.subtitle_stream_index,
                play_method: parse_play_method(body.play_method.as_deref()),
                repeat_mode: parse_repeat_mode(body.repeat_mode.as_deref()),
            },
            false,
        )
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlaybackStopBody {
    pub item_id: Option<String>,
    pub media_source_id: Option<String>,
    pub position_ticks: Option<i64>,
    pub live_stream_id: Option<String>,
}

async fn playback_stopped(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PlaybackStopBody>,
) -> Result<StatusCode, (StatusCode, String)> {
    let session_id = resolve_session(&state, &headers, addr).await?;

    state
        .sessions
        .on_playback_stopped(PlaybackStopInfo {
            session_id,
            item_id: body.item_id,
            media_source_id: body.media_source_id,
            position_ticks: body.position_ticks,
            live_stream_id: body.live_stream_id,
        })
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, String)> {
    let (_, _, _, token) = parse_emby_auth_header(&headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing auth header".to_string()))?;
    let token = token.ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing token".to_string()))?;

    state
        .sessions
        .logout(&token)
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn logout_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, String)> {
    let (_, _, _, token) = parse_emby_auth_header(&headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing auth header".to_string()))?;
    let token = token.ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing token".to_string()))?;
    let user = require_auth(&state.sessions, &headers).await?;

    state
        .sessions
        .revoke_user_tokens(&user.id, &token)
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_method_defaults_to_direct_play_on_unknown_or_missing() {
        assert_eq!(parse_play_method(None), PlayMethod::DirectPlay);
        assert_eq!(parse_play_method(Some("Bogus")), PlayMethod::DirectPlay);
        assert_eq!(parse_play_method(Some("Transcode")), PlayMethod::Transcode);
    }

    #[test]
    fn repeat_mode_defaults_to_none() {
        assert_eq!(parse_repeat_mode(None), RepeatMode::RepeatNone);
        assert_eq!(parse_repeat_mode(Some("RepeatOne")), RepeatMode::RepeatOne);
    }
}
