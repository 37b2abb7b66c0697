use crate::api::AppState;
use crate::db::{self, now_millis};
use crate::files;
use anyhow::Result;
use std::collections::HashSet;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

/// Blobs younger than this are never swept; their message may still be in
/// flight.
const GRACE: Duration = Duration::from_secs(600);

/// Periodically remove stored audio that no message references any more.
pub fn spawn_housekeeping(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(state.config.housekeeping_interval.max(Duration::from_secs(1)));
        loop {
            tick.tick().await;
            match sweep_once(&state, GRACE).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "swept orphaned audio files"),
                Err(e) => warn!(error = %e, "housekeeping sweep failed"),
            }
        }
    })
}

/// Drop unreferenced blob rows older than `grace`, then delete every file
/// on disk without a row. Returns the number of files removed.
pub async fn sweep_once(state: &AppState, grace: Duration) -> Result<usize> {
    let keep = prune_rows(state, grace).await?;
    remove_orphans(state, &keep, grace).await
}

/// Delete stale unreferenced rows and return the ids still recorded.
async fn prune_rows(state: &AppState, grace: Duration) -> Result<HashSet<String>> {
    let cutoff = now_millis() - grace.as_millis() as i64;
    let keep = db::run(&state.pool, move |conn| {
        files::prune_unreferenced(conn, cutoff)?;
        files::all_blob_ids(conn)
    })
    .await?;
    Ok(keep)
}

/// `keep` may be stale by now, so each file's row is looked up again right
/// before it is deleted.
async fn remove_orphans(state: &AppState, keep: &HashSet<String>, grace: Duration) -> Result<usize> {
    let pool = state.pool.clone();
    let is_live = move |id: &str| {
        pool.get()
            .ok()
            .and_then(|conn| files::blob_meta(&conn, id).ok())
            .map_or(true, |meta| meta.is_some())
    };
    state.blobs.cleanup_orphans(keep, grace, is_live).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{self, AudioUpload};
    use crate::config::Config;
    use crate::db::testing::summary;
    use crate::{messages, users};
    use bytes::Bytes;

    #[tokio::test]
    async fn deleted_audio_is_swept() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::new(Config::new("127.0.0.1:0", tmp.path()))
            .await
            .unwrap();
        {
            let conn = state.pool.get().unwrap();
            users::upsert_user(&conn, &summary(1)).unwrap();
            users::upsert_user(&conn, &summary(2)).unwrap();
        }
        let upload = |data: &'static [u8]| AudioUpload {
            receiver_id: 2,
            duration_seconds: 3,
            content_type: Some("audio/ogg".into()),
            file_name: None,
            data: Bytes::from_static(data),
        };
        let policy = state.config.audio_policy();
        let kept = audio::create_audio_message(&state.pool, &state.blobs, &policy, 1, upload(b"OggS-kept"))
            .await
            .unwrap();
        let gone = audio::create_audio_message(&state.pool, &state.blobs, &policy, 1, upload(b"OggS-gone"))
            .await
            .unwrap();
        let id_of = |m: &chat_api::Message| {
            m.body.audio_clip().unwrap().url.rsplit('/').next().unwrap().to_string()
        };
        {
            let conn = state.pool.get().unwrap();
            messages::delete_message(&conn, &gone.id, 1).unwrap();
        }

        // still inside the grace period
        assert_eq!(sweep_once(&state, GRACE).await.unwrap(), 0);
        assert!(state.blobs.path(&id_of(&gone)).unwrap().exists());

        assert_eq!(sweep_once(&state, Duration::ZERO).await.unwrap(), 1);
        assert!(state.blobs.path(&id_of(&kept)).unwrap().exists());
        assert!(!state.blobs.path(&id_of(&gone)).unwrap().exists());
    }

    #[tokio::test]
    async fn upload_between_prune_and_delete_survives() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::new(Config::new("127.0.0.1:0", tmp.path()))
            .await
            .unwrap();
        {
            let conn = state.pool.get().unwrap();
            users::upsert_user(&conn, &summary(1)).unwrap();
            users::upsert_user(&conn, &summary(2)).unwrap();
        }
        let upload = || AudioUpload {
            receiver_id: 2,
            duration_seconds: 2,
            content_type: Some("audio/ogg".into()),
            file_name: None,
            data: Bytes::from_static(b"OggS-again"),
        };
        let policy = state.config.audio_policy();
        let first = audio::create_audio_message(&state.pool, &state.blobs, &policy, 1, upload())
            .await
            .unwrap();
        let id = first.body.audio_clip().unwrap().url.rsplit('/').next().unwrap().to_string();
        let path = state.blobs.path(&id).unwrap();
        let backdate = || {
            std::fs::File::options()
                .append(true)
                .open(&path)
                .unwrap()
                .set_modified(std::time::SystemTime::now() - GRACE * 2)
                .unwrap();
        };
        {
            let conn = state.pool.get().unwrap();
            messages::delete_message(&conn, &first.id, 1).unwrap();
            conn.execute("UPDATE files SET created_at = 0", []).unwrap();
        }
        backdate();

        let keep = prune_rows(&state, GRACE).await.unwrap();
        assert!(!keep.contains(&id));

        // the same bytes are sent again before the files are swept
        let again = audio::create_audio_message(&state.pool, &state.blobs, &policy, 1, upload())
            .await
            .unwrap();
        assert_eq!(again.body.audio_clip().unwrap().url, first.body.audio_clip().unwrap().url);

        assert_eq!(remove_orphans(&state, &keep, GRACE).await.unwrap(), 0);
        assert!(path.exists());

        // an old mtime alone does not doom a file that has a row
        backdate();
        assert_eq!(remove_orphans(&state, &keep, GRACE).await.unwrap(), 0);
        assert!(path.exists());
        assert_eq!(sweep_once(&state, GRACE).await.unwrap(), 0);
        assert!(path.exists());
    }
}
