// Sessions API - remote control and session listing surface.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::users::{parse_emby_auth_header, require_auth};
use crate::core::controller::{GeneralCommand, PlayCommand, PlaystateCommandName};
use crate::core::errors::SessionError;
use crate::core::remote::{BrowseRequest, MessageRequest, PlayRequest};
use crate::core::session::{NowPlayingItem, PlayMethod, PlayState, RepeatMode, Session};
use crate::core::SessionManager;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_sessions))
        .route("/:session_id/Playing", post(play_command))
        .route("/:session_id/Playing/:command", post(playstate_command))
        .route("/:session_id/Message", post(send_message))
        .route("/:session_id/Command/:name", post(general_command))
        .route("/:session_id/Viewing", post(browse_command))
}

pub(crate) fn session_error_to_http(err: SessionError) -> (StatusCode, String) {
    let status = match &err {
        SessionError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::SecurityDenied(_) => StatusCode::FORBIDDEN,
        SessionError::Disposed => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Resolve the calling device's own session id, for stamping
/// `controllingUserId` on remote-control payloads.
pub(crate) fn controlling_session_id(
    sessions: &Arc<SessionManager>,
    headers: &HeaderMap,
) -> Option<String> {
    let (client, _device_name, device_id, _) = parse_emby_auth_header(headers)?;
    sessions
        .registry()
        .by_device_and_client(&device_id, &client)
        .map(|s| s.id.clone())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NowPlayingItemDto {
    pub id: String,
    pub name: String,
    pub run_time_ticks: Option<i64>,
    pub media_type: Option<String>,
}

impl From<NowPlayingItem> for NowPlayingItemDto {
    fn from(item: NowPlayingItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            run_time_ticks: item.run_time_ticks,
            media_type: item.media_type,
        }
    }
}

pub(crate) fn play_method_str(method: PlayMethod) -> &'static str {
    match method {
        PlayMethod::DirectPlay => "DirectPlay",
        PlayMethod::DirectStream => "DirectStream",
        PlayMethod::Transcode => "Transcode",
    }
}

pub(crate) fn repeat_mode_str(mode: RepeatMode) -> &'static str {
    match mode {
        RepeatMode::RepeatNone => "RepeatNone",
        RepeatMode::RepeatOne => "RepeatOne",
        RepeatMode::RepeatAll => "RepeatAll",
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayStateDto {
    pub is_paused: bool,
    pub position_ticks: i64,
    pub media_source_id: Option<String>,
    pub can_seek: bool,
    pub is_muted: bool,
    pub volume_level: i32,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub play_method: String,
    pub repeat_mode: String,
}

impl From<PlayState> for PlayStateDto {
    fn from(ps: PlayState) -> Self {
        Self {
            is_paused: ps.is_paused,
            position_ticks: ps.position_ticks,
            media_source_id: ps.media_source_id,
            can_seek: ps.can_seek,
            is_muted: ps.is_muted,
            volume_level: ps.volume_level,
            audio_stream_index: ps.audio_stream_index,
            subtitle_stream_index: ps.subtitle_stream_index,
            play_method: play_method_str(ps.play_method).to_string(),
            repeat_mode: repeat_mode_str(ps.repeat_mode).to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionDto {
    pub id: String,
    pub device_id: String,
    pub client: String,
    pub device_name: String,
    pub application_version: String,
    pub remote_end_point: String,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub last_activity_date: String,
    pub is_active: bool,
    pub now_playing_item: Option<NowPlayingItemDto>,
    pub play_state: PlayStateDto,
    pub supports_remote_control: bool,
}

fn session_dto(session: &Arc<Session>) -> SessionDto {
    SessionDto {
        id: session.id.clone(),
        device_id: session.device_id.clone(),
        client: session.client.clone(),
        device_name: session.device_name(),
        application_version: session.application_version(),
        remote_end_point: session.remote_end_point(),
        user_id: session.user_id(),
        user_name: session.user_name(),
        last_activity_date: session.last_activity_date().to_rfc3339(),
        is_active: session.is_active(),
        now_playing_item: session.now_playing_item().map(Into::into),
        play_state: session.play_state().into(),
        supports_remote_control: session.capabilities().supports_media_control,
    }
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionDto>>, (StatusCode, String)> {
    require_auth(&state.sessions, &headers).await?;
    let sessions = state.sessions.registry().snapshot();
    Ok(Json(sessions.iter().map(session_dto).collect()))
}

#[derive(Debug, Deserialize)]
pub struct PlayQuery {
    pub item_ids: String,
    pub play_command: Option<String>,
    pub start_position_ticks: Option<i64>,
}

fn parse_play_command(name: &str) -> Result<PlayCommand, (StatusCode, String)> {
    match name {
        "PlayNow" => Ok(PlayCommand::PlayNow),
        "PlayNext" => Ok(PlayCommand::PlayNext),
        "PlayLast" => Ok(PlayCommand::PlayLast),
        "PlayInstantMix" => Ok(PlayCommand::PlayInstantMix),
        "PlayShuffle" => Ok(PlayCommand::PlayShuffle),
        other => Err((
            StatusCode::BAD_REQUEST,
            format!("unknown play command: {other}"),
        )),
    }
}

async fn play_command(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<PlayQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_auth(&state.sessions, &headers).await?;

    let play_command = match query.play_command.as_deref() {
        Some(name) => parse_play_command(name)?,
        None => PlayCommand::PlayNow,
    };

    let request = PlayRequest {
        item_ids: query.item_ids.split(',').map(|s| s.to_string()).collect(),
        play_command,
        start_position_ticks: query.start_position_ticks,
    };

    let controlling = controlling_session_id(&state.sessions, &headers);
    state
        .sessions
        .send_play_command(controlling.as_deref(), &session_id, request)
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PlaystateQuery {
    pub seek_position_ticks: Option<i64>,
}

fn parse_playstate_command(name: &str) -> Result<PlaystateCommandName, (StatusCode, String)> {
    match name {
        "Stop" => Ok(PlaystateCommandName::Stop),
        "Pause" => Ok(PlaystateCommandName::Pause),
        "Unpause" => Ok(PlaystateCommandName::Unpause),
        "Seek" => Ok(PlaystateCommandName::Seek),
        "Rewind" => Ok(PlaystateCommandName::Rewind),
        "FastForward" => Ok(PlaystateCommandName::FastForward),
        "NextTrack" => Ok(PlaystateCommandName::NextTrack),
        "PreviousTrack" => Ok(PlaystateCommandName::PreviousTrack),
        other => Err((
            StatusCode::BAD_REQUEST,
            format!("unknown playstate command: {other}"),
        )),
    }
}

async fn playstate_command(
    State(state): State<Arc<AppState>>,
    Path((session_id, command)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<PlaystateQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_auth(&state.sessions, &headers).await?;
    let command = parse_playstate_command(&command)?;

    let controlling = controlling_session_id(&state.sessions, &headers);
    state
        .sessions
        .send_playstate_command(
            controlling.as_deref(),
            &session_id,
            command,
            query.seek_position_ticks,
        )
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub header: String,
    pub text: String,
    pub timeout_ms: Option<u64>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_auth(&state.sessions, &headers).await?;

    state
        .sessions
        .send_message_command(
            &session_id,
            MessageRequest {
                header: body.header,
                text: body.text,
                timeout_ms: body.timeout_ms,
            },
        )
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn general_command(
    State(state): State<Arc<AppState>>,
    Path((session_id, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<HashMap<String, String>>>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_auth(&state.sessions, &headers).await?;

    state
        .sessions
        .send_general_command(
            &session_id,
            GeneralCommand {
                name,
                arguments: body.map(|Json(args)| args).unwrap_or_default(),
            },
        )
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BrowseBody {
    pub item_id: String,
    pub item_name: Option<String>,
    pub item_type: Option<String>,
}

async fn browse_command(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BrowseBody>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_auth(&state.sessions, &headers).await?;

    state
        .sessions
        .send_browse_command(
            &session_id,
            BrowseRequest {
                item_id: body.item_id,
                item_name: body.item_name.unwrap_or_default(),
                item_type: body.item_type.unwrap_or_default(),
            },
        )
        .await
        .map_err(session_error_to_http)?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::SessionError;

    #[test]
    fn play_method_renders_wire_strings() {
        assert_eq!(play_method_str(PlayMethod::DirectPlay), "DirectPlay");
        assert_eq!(play_method_str(PlayMethod::Transcode), "Transcode");
    }

    #[test]
    fn repeat_mode_renders_wire_strings() {
        assert_eq!(repeat_mode_str(RepeatMode::RepeatAll), "RepeatAll");
    }

    #[test]
    fn unknown_playstate_command_is_bad_request() {
        let err = parse_playstate_command("Fling").unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn known_playstate_commands_parse() {
        assert_eq!(parse_playstate_command("Pause").unwrap(), PlaystateCommandName::Pause);
        assert_eq!(
            parse_playstate_command("PreviousTrack").unwrap(),
            PlaystateCommandName::PreviousTrack
        );
    }

    #[test]
    fn unknown_play_command_is_bad_request() {
        let err = parse_play_command("PlaySideways").unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn session_error_maps_to_expected_status_codes() {
        assert_eq!(
            session_error_to_http(SessionError::not_found("x")).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            session_error_to_http(SessionError::denied("x")).0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(session_error_to_http(SessionError::Disposed).0, StatusCode::SERVICE_UNAVAILABLE);
    }
}
