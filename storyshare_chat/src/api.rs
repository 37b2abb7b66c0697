use crate::audio::{self, AudioUpload};
use crate::auth::{self, AuthUser};
use crate::config::Config;
use crate::conversations;
use crate::db::{self, DbPool};
use crate::error::{ChatError, ChatResult};
use crate::extract::{Json, Path, Query};
use crate::files::{self, BlobStore};
use crate::housekeeping;
use crate::messages::{self, DEFAULT_PAGE_SIZE};
use crate::relay::Relay;
use crate::users;
use crate::ws::ws_handler;
use anyhow::Result;
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Extension, Multipart, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use bytes::Bytes;
use chat_api::{MessageBody, UserId, UserSummary};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::info;
use uuid::Uuid;

/// Headroom above the clip limit for multipart framing and the text fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub blobs: BlobStore,
    pub relay: Relay,
    pub config: Config,
    pub jwt_secret: Arc<Vec<u8>>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let pool = db::open_pool(config.db_file())?;
        let blobs = BlobStore::new(config.files_dir(), &config.public_base_url)?;
        let jwt_secret = auth::load_or_create_secret(&config.auth_file()).await?;
        let seed = config.seed_users.clone();
        let seeded = seed.len();
        db::run(&pool, move |conn| {
            for user in &seed {
                users::upsert_user(conn, user)?;
            }
            Ok(())
        })
        .await?;
        if seeded > 0 {
            info!(count = seeded, "seeded user directory");
        }
        Ok(Self {
            pool,
            blobs,
            relay: Relay::new(config.typing_debounce),
            config,
            jwt_secret: Arc::new(jwt_secret),
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.config.max_upload_bytes() as usize + MULTIPART_OVERHEAD;
    let audio = Router::new()
        .route("/api/messages/audio", post(create_audio_message))
        .layer(DefaultBodyLimit::max(upload_limit));
    let protected = Router::new()
        .route("/api/messages", post(create_text_message))
        .route("/api/messages/conversations", get(list_conversations))
        .route(
            "/api/messages/conversations/:user_id",
            get(get_conversation),
        )
        .route(
            "/api/messages/conversations/:user_id/read",
            put(mark_conversation_read),
        )
        .route("/api/messages/unread-count", get(unread_count))
        .route("/api/messages/:id/read", put(mark_as_read))
        .route("/api/messages/:id", delete(delete_message))
        .route("/api/users/me", put(update_me))
        .route("/api/users/:id/presence", get(presence))
        .route("/ws", get(ws_handler))
        .merge(audio)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/files/:id", get(download_file))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Bearer token from the Authorization header, or from a `token` query
/// parameter since browsers cannot set headers on websocket upgrades.
fn bearer_token<B>(req: &Request<B>) -> Option<String> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        return value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
    }
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, ChatError> {
    let token = bearer_token(&req).ok_or(ChatError::Unauthenticated)?;
    let claims =
        auth::verify_jwt(&state.jwt_secret, &token).map_err(|_| ChatError::Unauthenticated)?;
    let user = AuthUser::try_from(&claims).map_err(|_| ChatError::Unauthenticated)?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

#[derive(Deserialize)]
struct CreateMessageReq {
    receiver_id: Option<UserId>,
    content: Option<String>,
}

async fn create_text_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateMessageReq>,
) -> ChatResult<impl IntoResponse> {
    let receiver_id = req
        .receiver_id
        .ok_or_else(|| ChatError::Validation("receiver_id is required".into()))?;
    let content = req
        .content
        .ok_or_else(|| ChatError::Validation("content_required".into()))?;
    let msg = db::run(&state.pool, move |conn| {
        messages::create_message(conn, user.id, receiver_id, MessageBody::text(content))
    })
    .await?;
    state.relay.message_created(&msg);
    Ok((StatusCode::CREATED, Json(msg)))
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> ChatError {
    ChatError::Validation(format!("malformed upload: {e}"))
}

async fn create_audio_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> ChatResult<impl IntoResponse> {
    let mut receiver_id = None;
    let mut duration = None;
    let mut clip: Option<(Option<String>, Option<String>, Bytes)> = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("receiver_id") => {
                let raw = field.text().await.map_err(bad_multipart)?;
                let id = raw
                    .trim()
                    .parse::<UserId>()
                    .map_err(|_| ChatError::Validation("receiver_id must be a user id".into()))?;
                receiver_id = Some(id);
            }
            Some("duration") => {
                let raw = field.text().await.map_err(bad_multipart)?;
                duration = Some(audio::parse_duration(&raw)?);
            }
            Some("audio") => {
                let content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().map(str::to_string);
                let data = field.bytes().await.map_err(bad_multipart)?;
                clip = Some((content_type, file_name, data));
            }
            _ => {}
        }
    }
    let receiver_id =
        receiver_id.ok_or_else(|| ChatError::Validation("receiver_id is required".into()))?;
    let duration_seconds =
        duration.ok_or_else(|| ChatError::Validation("duration is required".into()))?;
    let (content_type, file_name, data) =
        clip.ok_or_else(|| ChatError::Validation("audio file is required".into()))?;
    let upload = AudioUpload {
        receiver_id,
        duration_seconds,
        content_type,
        file_name,
        data,
    };
    let msg = audio::create_audio_message(
        &state.pool,
        &state.blobs,
        &state.config.audio_policy(),
        user.id,
        upload,
    )
    .await?;
    state.relay.message_created(&msg);
    Ok((StatusCode::CREATED, Json(msg)))
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ChatResult<impl IntoResponse> {
    let list = db::run(&state.pool, move |conn| {
        conversations::list_conversations(conn, user.id)
    })
    .await?;
    Ok(Json(list))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

async fn get_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(other): Path<UserId>,
    Query(q): Query<PageQuery>,
) -> ChatResult<impl IntoResponse> {
    let page = q.page.unwrap_or(1);
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let page = db::run(&state.pool, move |conn| {
        users::require_user(conn, other)?;
        messages::get_conversation(conn, user.id, other, page, limit)
    })
    .await?;
    Ok(Json(page))
}

async fn mark_as_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    let (msg, changed) =
        db::run(&state.pool, move |conn| messages::mark_as_read(conn, &id, user.id)).await?;
    if changed {
        if let Some(read_at) = msg.read_at {
            state.relay.message_read(msg.sender.id, msg.id, read_at);
        }
    }
    Ok(Json(msg))
}

#[derive(Serialize)]
struct UpdatedResp {
    updated: usize,
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(other): Path<UserId>,
) -> ChatResult<impl IntoResponse> {
    let (ids, read_at) = db::run(&state.pool, move |conn| {
        messages::mark_conversation_read(conn, user.id, other)
    })
    .await?;
    for id in &ids {
        state.relay.message_read(other, *id, read_at);
    }
    Ok(Json(UpdatedResp { updated: ids.len() }))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    let msg = db::run(&state.pool, move |conn| {
        messages::delete_message(conn, &id, user.id)
    })
    .await?;
    state.relay.message_deleted(&msg);
    info!(message_id = %msg.id, "message deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct CountResp {
    count: u32,
}

async fn unread_count(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ChatResult<impl IntoResponse> {
    let count = db::run(&state.pool, move |conn| messages::unread_count(conn, user.id)).await?;
    Ok(Json(CountResp { count }))
}

#[derive(Deserialize)]
struct UpdateMeReq {
    username: String,
    name: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

async fn update_me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<UpdateMeReq>,
) -> ChatResult<impl IntoResponse> {
    let summary = UserSummary {
        id: user.id,
        username: req.username,
        name: req.name,
        avatar_url: req.avatar_url,
    };
    let stored = summary.clone();
    db::run(&state.pool, move |conn| users::upsert_user(conn, &stored)).await?;
    Ok(Json(summary))
}

#[derive(Serialize)]
struct PresenceResp {
    user_id: UserId,
    online: bool,
}

async fn presence(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ChatResult<impl IntoResponse> {
    db::run(&state.pool, move |conn| users::require_user(conn, user_id)).await?;
    Ok(Json(PresenceResp {
        user_id,
        online: state.relay.is_online(user_id),
    }))
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ChatResult<impl IntoResponse> {
    let not_found = || ChatError::NotFound(format!("file {id} not found"));
    let path = state.blobs.path(&id).ok_or_else(not_found)?;
    let lookup = id.clone();
    let meta = db::run(&state.pool, move |conn| files::blob_meta(conn, &lookup))
        .await?
        .ok_or_else(not_found)?;
    let file = tokio::fs::File::open(path).await.map_err(|_| not_found())?;
    let body = StreamBody::new(ReaderStream::new(file));
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mime)
            .map_err(|e| ChatError::Internal(format!("stored mime type: {e}")))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok((headers, body))
}

/// Run the HTTP server until interrupted.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    let sweeper = housekeeping::spawn_housekeeping(state.clone());
    info!(%addr, "storyshare chat listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    sweeper.abort();
    info!("server stopped");
    Ok(())
}

// HTTP behavior is covered by the integration tests in tests/
