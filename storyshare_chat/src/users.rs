use crate::error::{ChatError, ChatResult};
use chat_api::{UserId, UserSummary};
use rusqlite::{params, Connection, OptionalExtension};

/// Insert or update a user's display summary.
pub fn upsert_user(conn: &Connection, user: &UserSummary) -> ChatResult<()> {
    if user.username.trim().is_empty() {
        return Err(ChatError::Validation("empty_username".into()));
    }
    let res = conn.execute(
        "INSERT INTO users (id, username, name, avatar_url) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(id) DO UPDATE SET username = excluded.username, name = excluded.name, avatar_url = excluded.avatar_url",
        params![user.id, user.username, user.name, user.avatar_url],
    );
    match res {
        Ok(_) => Ok(()),
        Err(e)
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) =>
        {
            Err(ChatError::Validation("duplicate_username".into()))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_user(conn: &Connection, id: UserId) -> ChatResult<Option<UserSummary>> {
    let mut stmt = conn.prepare("SELECT id, username, name, avatar_url FROM users WHERE id = ?1")?;
    let user = stmt
        .query_row([id], |row| {
            Ok(UserSummary {
                id: row.get(0)?,
                username: row.get(1)?,
                name: row.get(2)?,
                avatar_url: row.get(3)?,
            })
        })
        .optional()?;
    Ok(user)
}

/// Resolve a user or fail with NotFound.
pub fn require_user(conn: &Connection, id: UserId) -> ChatResult<UserSummary> {
    get_user(conn, id)?.ok_or_else(|| ChatError::NotFound(format!("user {id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, testing::summary};

    #[test]
    fn upsert_updates_existing() {
        let conn = db::init_db(":memory:").unwrap();
        upsert_user(&conn, &summary(1)).unwrap();
        let mut changed = summary(1);
        changed.avatar_url = Some("http://img/a.png".into());
        upsert_user(&conn, &changed).unwrap();
        assert_eq!(get_user(&conn, 1).unwrap(), Some(changed));
        assert!(matches!(
            require_user(&conn, 9),
            Err(ChatError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_username_rejected() {
        let conn = db::init_db(":memory:").unwrap();
        upsert_user(&conn, &summary(1)).unwrap();
        let mut other = summary(2);
        other.username = "user1".into();
        assert!(matches!(
            upsert_user(&conn, &other),
            Err(ChatError::Validation(_))
        ));
    }
}
