//! Server side of voice messages: validate the upload, store the clip, then
//! create the message that points at it.

use crate::db::{self, now_millis, DbPool};
use crate::error::{ChatError, ChatResult};
use crate::files::{self, BlobStore};
use crate::messages;
use bytes::Bytes;
use chat_api::{Message, MessageBody, UserId};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

static MIME_ESSENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([a-z0-9.+-]+/[a-z0-9.+-]+)").expect("valid regex"));

/// Limits the upload layer enforces on voice clips.
#[derive(Clone, Debug)]
pub struct AudioPolicy {
    pub allowed_mime: Vec<String>,
    pub max_bytes: u64,
}

/// A voice clip received from a client.
#[derive(Debug, Clone)]
pub struct AudioUpload {
    pub receiver_id: UserId,
    pub duration_seconds: u32,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
    pub data: Bytes,
}

/// Parse the client's measured duration, rounding to whole seconds.
pub fn parse_duration(raw: &str) -> ChatResult<u32> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ChatError::Validation("duration must be a number of seconds".into()))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ChatError::Validation(
            "duration must be a non-negative number of seconds".into(),
        ));
    }
    Ok(secs.round().min(u32::MAX as f64) as u32)
}

/// Lowercased `type/subtype` with parameters stripped.
fn mime_essence(raw: &str) -> Option<String> {
    let lower = raw.to_ascii_lowercase();
    MIME_ESSENCE_RE
        .captures(&lower)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Resolve and check the clip's content type. The declared type (or one
/// guessed from the file name) must be allowed, and sniffed content must not
/// contradict it.
pub fn check_content_type(upload: &AudioUpload, policy: &AudioPolicy) -> ChatResult<String> {
    let declared = upload
        .content_type
        .as_deref()
        .and_then(mime_essence)
        .filter(|m| m != "application/octet-stream")
        .or_else(|| {
            upload
                .file_name
                .as_deref()
                .and_then(|name| mime_guess::from_path(name).first())
                .map(|m| m.essence_str().to_string())
        })
        .ok_or_else(|| ChatError::Validation("audio content type missing".into()))?;
    if !policy.allowed_mime.iter().any(|m| m == &declared) {
        return Err(ChatError::Validation(format!(
            "unsupported audio type {declared}"
        )));
    }
    if let Some(kind) = infer::get(&upload.data) {
        let sniffed = kind.mime_type();
        // webm and mp4 containers sniff as video even when they hold audio only
        let plausible = sniffed.starts_with("audio/")
            || sniffed == "application/ogg"
            || sniffed == "video/webm"
            || sniffed == "video/mp4"
            || sniffed == "video/quicktime";
        if !plausible {
            return Err(ChatError::Validation(format!(
                "uploaded data looks like {sniffed}, not audio"
            )));
        }
    }
    Ok(declared)
}

/// Store a voice clip and create the message referencing it.
///
/// The message row is written only after the clip is on disk and has a URL;
/// a storage failure leaves no message behind.
pub async fn create_audio_message(
    pool: &DbPool,
    blobs: &BlobStore,
    policy: &AudioPolicy,
    sender_id: UserId,
    upload: AudioUpload,
) -> ChatResult<Message> {
    if upload.data.is_empty() {
        return Err(ChatError::Validation("audio file is empty".into()));
    }
    if upload.data.len() as u64 > policy.max_bytes {
        return Err(ChatError::Validation(format!(
            "audio file exceeds {} bytes",
            policy.max_bytes
        )));
    }
    let mime = check_content_type(&upload, policy)?;
    let receiver_id = upload.receiver_id;
    db::run(pool, move |conn| {
        messages::check_participants(conn, sender_id, receiver_id)
    })
    .await?;

    // no sweep may delete the clip between writing it and recording its row
    let _hold = blobs.hold().await;
    let file_id = blobs.save(&upload.data).await.map_err(|e| {
        warn!(error = %e, "audio upload could not be stored");
        ChatError::Upload(e.to_string())
    })?;
    let url = blobs
        .url_for(&file_id)
        .map_err(|e| ChatError::Upload(e.to_string()))?;
    let size = upload.data.len() as i64;
    let duration = upload.duration_seconds;
    let msg = db::run(pool, move |conn| {
        files::record_blob(conn, &file_id, &mime, size, now_millis())?;
        messages::create_message_with_file(
            conn,
            sender_id,
            receiver_id,
            MessageBody::audio(url, duration),
            Some(&file_id),
        )
    })
    .await?;
    info!(message_id = %msg.id, duration, size, "audio message stored");
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::summary;
    use crate::users;

    const OGG: &[u8] = b"OggS\x00\x02\x00\x00\x00\x00\x00\x00\x00\x00\x01\x02\x03\x04\x00\x00\x00\x00";

    fn policy() -> AudioPolicy {
        AudioPolicy {
            allowed_mime: vec!["audio/ogg".into(), "audio/webm".into()],
            max_bytes: 1024,
        }
    }

    fn upload(data: &'static [u8], content_type: &str) -> AudioUpload {
        AudioUpload {
            receiver_id: 2,
            duration_seconds: 5,
            content_type: Some(content_type.into()),
            file_name: Some("clip.ogg".into()),
            data: Bytes::from_static(data),
        }
    }

    fn pool(dir: &std::path::Path) -> DbPool {
        let pool = db::open_pool(dir.join("chat.db")).unwrap();
        let conn = pool.get().unwrap();
        users::upsert_user(&conn, &summary(1)).unwrap();
        users::upsert_user(&conn, &summary(2)).unwrap();
        pool
    }

    fn message_count(pool: &DbPool) -> i64 {
        pool.get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("5").unwrap(), 5);
        assert_eq!(parse_duration("4.6").unwrap(), 5);
        assert_eq!(parse_duration(" 0 ").unwrap(), 0);
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("five").is_err());
        assert!(parse_duration("NaN").is_err());
    }

    #[test]
    fn content_type_checks() {
        let p = policy();
        assert_eq!(
            check_content_type(&upload(OGG, "audio/ogg; codecs=opus"), &p).unwrap(),
            "audio/ogg"
        );
        assert!(check_content_type(&upload(OGG, "image/png"), &p).is_err());
        let png: &'static [u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR";
        assert!(check_content_type(&upload(png, "audio/ogg"), &p).is_err());
        let mut guessed = upload(OGG, "application/octet-stream");
        guessed.content_type = None;
        assert_eq!(check_content_type(&guessed, &p).unwrap(), "audio/ogg");
    }

    #[tokio::test]
    async fn stores_clip_then_message() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        let blobs = BlobStore::new(tmp.path().join("files"), "http://localhost:8787").unwrap();
        let msg = create_audio_message(&pool, &blobs, &policy(), 1, upload(OGG, "audio/ogg"))
            .await
            .unwrap();
        let clip = msg.body.audio_clip().unwrap();
        assert_eq!(clip.duration_seconds, 5);
        assert!(clip.url.starts_with("http://localhost:8787/api/files/"));
        let id = clip.url.rsplit('/').next().unwrap();
        assert!(blobs.path(id).unwrap().exists());
        assert_eq!(message_count(&pool), 1);
    }

    #[tokio::test]
    async fn storage_failure_leaves_no_message() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        // a regular file where the blob directory should be
        let blocked = tmp.path().join("blocked");
        std::fs::write(&blocked, b"not a dir").unwrap();
        let blobs = BlobStore::new(&blocked, "http://localhost:8787").unwrap();
        let err = create_audio_message(&pool, &blobs, &policy(), 1, upload(OGG, "audio/ogg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Upload(_)));
        assert_eq!(message_count(&pool), 0);
    }

    #[tokio::test]
    async fn unknown_receiver_is_rejected_before_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        let blobs = BlobStore::new(tmp.path().join("files"), "http://localhost:8787").unwrap();
        let mut up = upload(OGG, "audio/ogg");
        up.receiver_id = 77;
        let err = create_audio_message(&pool, &blobs, &policy(), 1, up)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(!tmp.path().join("files").exists());
    }
}
