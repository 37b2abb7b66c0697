use crate::db::now_millis;
use crate::error::{ChatError, ChatResult};
use crate::users::require_user;
use chat_api::{ConversationPage, Message, MessageBody, UserId, UserSummary, MAX_CONTENT_CHARS};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Column list understood by [`row_to_message`]; `m`, `s` and `r` alias the
/// message, sender and receiver rows.
pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.sender_id, s.username, s.name, s.avatar_url, \
     m.receiver_id, r.username, r.name, r.avatar_url, \
     m.content, m.audio_url, m.audio_duration, m.read_at, m.created_at";

pub(crate) const MESSAGE_JOINS: &str =
    "JOIN users s ON s.id = m.sender_id JOIN users r ON r.id = m.receiver_id";

/// Number of leading columns consumed by [`row_to_message`].
pub(crate) const MESSAGE_COLUMN_COUNT: usize = 14;

pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let content: Option<String> = row.get(9)?;
    let audio_url: Option<String> = row.get(10)?;
    let audio_duration: Option<u32> = row.get(11)?;
    let body = match (content, audio_url, audio_duration) {
        (Some(content), None, _) => MessageBody::Text { content },
        (None, Some(url), Some(duration)) => MessageBody::audio(url, duration),
        _ => {
            return Err(rusqlite::Error::InvalidColumnType(
                9,
                "content".into(),
                Type::Null,
            ))
        }
    };
    let read_at: Option<i64> = row.get(12)?;
    Ok(Message {
        id,
        sender: UserSummary {
            id: row.get(1)?,
            username: row.get(2)?,
            name: row.get(3)?,
            avatar_url: row.get(4)?,
        },
        receiver: UserSummary {
            id: row.get(5)?,
            username: row.get(6)?,
            name: row.get(7)?,
            avatar_url: row.get(8)?,
        },
        body,
        is_read: read_at.is_some(),
        read_at,
        created_at: row.get(13)?,
    })
}

/// Check the body invariants enforced at creation.
pub fn validate_body(body: &MessageBody) -> ChatResult<()> {
    match body {
        MessageBody::Text { content } => {
            if content.trim().is_empty() {
                return Err(ChatError::Validation("content_required".into()));
            }
            if content.chars().count() > MAX_CONTENT_CHARS {
                return Err(ChatError::Validation(format!(
                    "content_too_long: at most {MAX_CONTENT_CHARS} characters"
                )));
            }
        }
        MessageBody::Audio { audio } => {
            if audio.url.trim().is_empty() {
                return Err(ChatError::Validation("audio_url_required".into()));
            }
        }
    }
    Ok(())
}

/// Create a new message from `sender_id` to `receiver_id`.
pub fn create_message(
    conn: &Connection,
    sender_id: UserId,
    receiver_id: UserId,
    body: MessageBody,
) -> ChatResult<Message> {
    create_message_with_file(conn, sender_id, receiver_id, body, None)
}

/// Create a message, linking it to the stored blob backing its audio.
pub fn create_message_with_file(
    conn: &Connection,
    sender_id: UserId,
    receiver_id: UserId,
    body: MessageBody,
    audio_file_id: Option<&str>,
) -> ChatResult<Message> {
    validate_body(&body)?;
    check_participants(conn, sender_id, receiver_id)?;
    let id = Uuid::new_v4();
    let now = now_millis();
    let (content, audio_url, audio_duration) = match &body {
        MessageBody::Text { content } => (Some(content.as_str()), None, None),
        MessageBody::Audio { audio } => (None, Some(audio.url.as_str()), Some(audio.duration_seconds)),
    };
    conn.execute(
        "INSERT INTO messages (id, sender_id, receiver_id, content, audio_url, audio_duration, audio_file_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id.to_string(),
            sender_id,
            receiver_id,
            content,
            audio_url,
            audio_duration,
            audio_file_id,
            now
        ],
    )?;
    get_message(conn, &id)
}

/// Reject self-addressed messages and unknown participants.
pub fn check_participants(conn: &Connection, sender_id: UserId, receiver_id: UserId) -> ChatResult<()> {
    if sender_id == receiver_id {
        return Err(ChatError::Validation("cannot_message_self".into()));
    }
    require_user(conn, sender_id)?;
    require_user(conn, receiver_id)?;
    Ok(())
}

pub fn find_message(conn: &Connection, id: &Uuid) -> ChatResult<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m {MESSAGE_JOINS} WHERE m.id = ?1");
    let msg = conn
        .query_row(&sql, [id.to_string()], row_to_message)
        .optional()?;
    Ok(msg)
}

pub fn get_message(conn: &Connection, id: &Uuid) -> ChatResult<Message> {
    find_message(conn, id)?.ok_or_else(|| ChatError::NotFound(format!("message {id} not found")))
}

/// Messages exchanged between two users in either direction.
///
/// Page 1 holds the most recent `limit` messages; each page is returned
/// oldest first.
pub fn get_conversation(
    conn: &Connection,
    user_a: UserId,
    user_b: UserId,
    page: u32,
    limit: u32,
) -> ChatResult<ConversationPage> {
    let page = page.max(1);
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let total: u64 = conn.query_row(
        "SELECT COUNT(*) FROM messages \
         WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)",
        params![user_a, user_b],
        |row| row.get(0),
    )?;
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m {MESSAGE_JOINS} \
         WHERE (m.sender_id = ?1 AND m.receiver_id = ?2) OR (m.sender_id = ?2 AND m.receiver_id = ?1) \
         ORDER BY m.created_at DESC, m.seq DESC LIMIT ?3 OFFSET ?4"
    );
    let offset = (page as i64 - 1) * limit as i64;
    let mut stmt = conn.prepare(&sql)?;
    let mut messages = stmt
        .query_map(params![user_a, user_b, limit, offset], row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    messages.reverse();
    Ok(ConversationPage {
        messages,
        total,
        page,
        limit,
    })
}

/// Mark a message as read by its receiver.
///
/// Returns the message and whether this call performed the transition; a
/// second call leaves `read_at` untouched.
pub fn mark_as_read(conn: &Connection, id: &Uuid, reader_id: UserId) -> ChatResult<(Message, bool)> {
    let msg = get_message(conn, id)?;
    if msg.receiver.id != reader_id {
        return Err(ChatError::Authorization(
            "only the receiver can mark a message as read".into(),
        ));
    }
    let changed = conn.execute(
        "UPDATE messages SET read_at = ?2 WHERE id = ?1 AND read_at IS NULL",
        params![id.to_string(), now_millis()],
    )?;
    if changed == 0 {
        return Ok((msg, false));
    }
    Ok((get_message(conn, id)?, true))
}

/// Mark every unread message from `counterpart_id` to `reader_id` as read.
/// Returns the ids that transitioned and the timestamp applied.
pub fn mark_conversation_read(
    conn: &Connection,
    reader_id: UserId,
    counterpart_id: UserId,
) -> ChatResult<(Vec<Uuid>, i64)> {
    require_user(conn, counterpart_id)?;
    let now = now_millis();
    let mut stmt = conn.prepare(
        "UPDATE messages SET read_at = ?3 \
         WHERE receiver_id = ?1 AND sender_id = ?2 AND read_at IS NULL RETURNING id",
    )?;
    let ids = stmt
        .query_map(params![reader_id, counterpart_id, now], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let ids = ids
        .iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();
    Ok((ids, now))
}

/// Permanently delete a message. Only its sender may do so.
pub fn delete_message(conn: &Connection, id: &Uuid, requester_id: UserId) -> ChatResult<Message> {
    let msg = get_message(conn, id)?;
    if msg.sender.id != requester_id {
        return Err(ChatError::Authorization(
            "only the sender can delete a message".into(),
        ));
    }
    conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
    Ok(msg)
}

/// Count unread messages addressed to `user_id`.
pub fn unread_count(conn: &Connection, user_id: UserId) -> ChatResult<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND read_at IS NULL",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}
