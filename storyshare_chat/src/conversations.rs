use crate::error::ChatResult;
use crate::messages::{row_to_message, MESSAGE_COLUMNS, MESSAGE_COLUMN_COUNT, MESSAGE_JOINS};
use chat_api::{Conversation, UserId};
use rusqlite::Connection;

/// Build the inbox for `user_id`: one row per counterpart holding the latest
/// message exchanged and the number of unread messages received from them,
/// most recent conversation first.
pub fn list_conversations(conn: &Connection, user_id: UserId) -> ChatResult<Vec<Conversation>> {
    let sql = format!(
        "WITH touching AS (
            SELECT seq, created_at, receiver_id, read_at,
                   CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS counterpart_id
            FROM messages
            WHERE sender_id = ?1 OR receiver_id = ?1
        ),
        ranked AS (
            SELECT seq,
                   ROW_NUMBER() OVER (
                       PARTITION BY counterpart_id ORDER BY created_at DESC, seq DESC
                   ) AS rn,
                   SUM(CASE WHEN receiver_id = ?1 AND read_at IS NULL THEN 1 ELSE 0 END)
                       OVER (PARTITION BY counterpart_id) AS unread
            FROM touching
        )
        SELECT {MESSAGE_COLUMNS}, ranked.unread
        FROM ranked
        JOIN messages m ON m.seq = ranked.seq
        {MESSAGE_JOINS}
        WHERE ranked.rn = 1
        ORDER BY m.created_at DESC, m.seq DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([user_id], |row| {
        let last_message = row_to_message(row)?;
        let unread_count: u32 = row.get(MESSAGE_COLUMN_COUNT)?;
        Ok((last_message, unread_count))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (last_message, unread_count) = row?;
        out.push(Conversation {
            counterpart: last_message.counterpart_of(user_id).clone(),
            last_message,
            unread_count,
        });
    }
    Ok(out)
}
