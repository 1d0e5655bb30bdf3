//! Single-statement data access. Every function runs exactly one SQL statement
//! against whatever executor it is handed (the pool, or a connection inside an
//! open transaction) and carries no business rules of its own.

use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;

use crate::db::timestamp;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Conversation, ConversationSummary, DirectPair, Message, Participant, User, UserSummary,
};

pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub role: &'a str,
}

pub struct NewMessage<'a> {
    pub conversation_id: i64,
    pub sender_id: i64,
    pub encrypted_content: &'a str,
    pub client_message_id: &'a str,
    pub sent_at: DateTime<Utc>,
}

// -- Users & sessions --

pub async fn create_user<'e>(
    db: impl SqliteExecutor<'e>,
    user: NewUser<'_>,
    now: DateTime<Utc>,
) -> StoreResult<User> {
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (username, email, password_hash, role, created_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id, username, email, password_hash, role, created_at
        "#,
    )
    .bind(user.username)
    .bind(user.email)
    .bind(user.password_hash)
    .bind(user.role)
    .bind(timestamp(now))
    .fetch_one(db)
    .await?;

    Ok(user)
}

pub async fn get_user_by_id<'e>(db: impl SqliteExecutor<'e>, user_id: i64) -> StoreResult<User> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, email, password_hash, role, created_at FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await?
    .ok_or(StoreError::NotFound("user"))
}

pub async fn get_user_by_username<'e>(
    db: impl SqliteExecutor<'e>,
    username: &str,
) -> StoreResult<User> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, email, password_hash, role, created_at FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(db)
    .await?
    .ok_or(StoreError::NotFound("user"))
}

pub async fn create_session<'e>(
    db: impl SqliteExecutor<'e>,
    user_id: i64,
    token: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query("INSERT INTO sessions (user_id, token, created_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(token)
        .bind(timestamp(now))
        .execute(db)
        .await?;

    Ok(())
}

pub async fn get_user_id_by_token<'e>(
    db: impl SqliteExecutor<'e>,
    token: &str,
) -> StoreResult<i64> {
    sqlx::query_scalar::<_, i64>("SELECT user_id FROM sessions WHERE token = ?")
        .bind(token)
        .fetch_optional(db)
        .await?
        .ok_or(StoreError::NotFound("session"))
}

/// Ends every session of the user. Returns how many were removed.
pub async fn delete_user_sessions<'e>(
    db: impl SqliteExecutor<'e>,
    user_id: i64,
) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(user_id)
        .execute(db)
        .await?;

    Ok(result.rows_affected())
}

/// Case-insensitive substring match on usernames. `%` and `_` in `term` are
/// matched literally.
pub async fn search_users<'e>(
    db: impl SqliteExecutor<'e>,
    term: &str,
    limit: i64,
) -> StoreResult<Vec<UserSummary>> {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");

    let users = sqlx::query_as::<_, UserSummary>(
        r#"
        SELECT id, username
        FROM users
        WHERE username LIKE ? ESCAPE '\'
        ORDER BY username
        LIMIT ?
        "#,
    )
    .bind(format!("%{escaped}%"))
    .bind(limit)
    .fetch_all(db)
    .await?;

    Ok(users)
}

// -- Conversations --

/// Inserts a conversation without participants.
pub async fn create_conversation<'e>(
    db: impl SqliteExecutor<'e>,
    direct_key: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<Conversation> {
    let now = timestamp(now);

    let conversation = sqlx::query_as::<_, Conversation>(
        r#"
        INSERT INTO conversations (direct_key, created_at, updated_at)
        VALUES (?, ?, ?)
        RETURNING id, direct_key, created_at, updated_at
        "#,
    )
    .bind(direct_key)
    .bind(&now)
    .bind(&now)
    .fetch_one(db)
    .await?;

    Ok(conversation)
}

pub async fn get_conversation<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
) -> StoreResult<Conversation> {
    sqlx::query_as::<_, Conversation>(
        "SELECT id, direct_key, created_at, updated_at FROM conversations WHERE id = ?",
    )
    .bind(conversation_id)
    .fetch_optional(db)
    .await?
    .ok_or(StoreError::NotFound("conversation"))
}

pub async fn add_participant<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> StoreResult<Participant> {
    let participant = sqlx::query_as::<_, Participant>(
        r#"
        INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
        VALUES (?, ?, ?)
        RETURNING id, conversation_id, user_id, joined_at, last_read_at
        "#,
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(timestamp(now))
    .fetch_one(db)
    .await?;

    Ok(participant)
}

/// Conversation whose participant set is exactly the two users of `pair`.
pub async fn find_direct_conversation<'e>(
    db: impl SqliteExecutor<'e>,
    pair: DirectPair,
) -> StoreResult<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT p1.conversation_id
        FROM conversation_participants p1
        JOIN conversation_participants p2 ON p2.conversation_id = p1.conversation_id
        WHERE p1.user_id = ? AND p2.user_id = ?
          AND (
            SELECT COUNT(*) FROM conversation_participants p3
            WHERE p3.conversation_id = p1.conversation_id
          ) = 2
        ORDER BY p1.conversation_id
        LIMIT 1
        "#,
    )
    .bind(pair.low())
    .bind(pair.high())
    .fetch_optional(db)
    .await?
    .ok_or(StoreError::NotFound("direct conversation"))
}

/// Moves the activity timestamp forward; an older `at` leaves it unchanged.
pub async fn touch_conversation<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    let result =
        sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?")
            .bind(timestamp(at))
            .bind(conversation_id)
            .execute(db)
            .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound("conversation"));
    }
    Ok(())
}

/// Takes the database write lock by rewriting the conversation row in place
/// and returns its current activity timestamp. Timestamps taken after this
/// call are ordered after every write that committed before it.
pub async fn lock_conversation<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
) -> StoreResult<DateTime<Utc>> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        "UPDATE conversations SET updated_at = updated_at WHERE id = ? RETURNING updated_at",
    )
    .bind(conversation_id)
    .fetch_optional(db)
    .await?
    .ok_or(StoreError::NotFound("conversation"))
}

pub async fn list_participants<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
) -> StoreResult<Vec<Participant>> {
    let participants = sqlx::query_as::<_, Participant>(
        r#"
        SELECT id, conversation_id, user_id, joined_at, last_read_at
        FROM conversation_participants
        WHERE conversation_id = ?
        ORDER BY id
        "#,
    )
    .bind(conversation_id)
    .fetch_all(db)
    .await?;

    Ok(participants)
}

pub async fn is_participant<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
    user_id: i64,
) -> StoreResult<bool> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?;

    Ok(found.is_some())
}

/// The user's conversations, most recently active first.
pub async fn list_user_conversations<'e>(
    db: impl SqliteExecutor<'e>,
    user_id: i64,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<ConversationSummary>> {
    let rows = sqlx::query_as::<_, ConversationSummary>(
        r#"
        SELECT
            c.id AS conversation_id,
            other.user_id AS other_user_id,
            u.username AS other_username,
            c.updated_at AS updated_at,
            (
                SELECT COUNT(*) FROM messages m
                WHERE m.conversation_id = c.id
                  AND m.sender_id != me.user_id
                  AND (me.last_read_at IS NULL OR m.sent_at > me.last_read_at)
            ) AS unread_count
        FROM conversation_participants me
        JOIN conversations c ON c.id = me.conversation_id
        JOIN conversation_participants other
            ON other.conversation_id = c.id AND other.user_id != me.user_id
        JOIN users u ON u.id = other.user_id
        WHERE me.user_id = ?
        ORDER BY c.updated_at DESC, c.id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await?;

    Ok(rows)
}

// -- Messages & read state --

pub async fn create_message<'e>(
    db: impl SqliteExecutor<'e>,
    message: NewMessage<'_>,
) -> StoreResult<Message> {
    let message = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages
            (conversation_id, sender_id, encrypted_content, client_message_id, sent_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id, conversation_id, sender_id, encrypted_content, client_message_id, sent_at
        "#,
    )
    .bind(message.conversation_id)
    .bind(message.sender_id)
    .bind(message.encrypted_content)
    .bind(message.client_message_id)
    .bind(timestamp(message.sent_at))
    .fetch_one(db)
    .await?;

    Ok(message)
}

pub async fn get_message_by_client_id<'e>(
    db: impl SqliteExecutor<'e>,
    client_message_id: &str,
) -> StoreResult<Message> {
    sqlx::query_as::<_, Message>(
        r#"
        SELECT id, conversation_id, sender_id, encrypted_content, client_message_id, sent_at
        FROM messages
        WHERE client_message_id = ?
        "#,
    )
    .bind(client_message_id)
    .fetch_optional(db)
    .await?
    .ok_or(StoreError::NotFound("message"))
}

/// Newest first.
pub async fn list_messages<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<Message>> {
    let messages = sqlx::query_as::<_, Message>(
        r#"
        SELECT id, conversation_id, sender_id, encrypted_content, client_message_id, sent_at
        FROM messages
        WHERE conversation_id = ?
        ORDER BY sent_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(conversation_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await?;

    Ok(messages)
}

/// Moves the participant's read marker forward; never backwards. Returns the
/// number of participant rows touched (0 when the pair does not exist).
pub async fn update_last_read_at<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
    user_id: i64,
    at: DateTime<Utc>,
) -> StoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE conversation_participants
        SET last_read_at = MAX(COALESCE(last_read_at, ''), ?)
        WHERE conversation_id = ? AND user_id = ?
        "#,
    )
    .bind(timestamp(at))
    .bind(conversation_id)
    .bind(user_id)
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}

/// Messages from other participants newer than the user's read marker.
pub async fn count_unread<'e>(
    db: impl SqliteExecutor<'e>,
    conversation_id: i64,
    user_id: i64,
) -> StoreResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*)
        FROM messages m
        JOIN conversation_participants p
            ON p.conversation_id = m.conversation_id AND p.user_id = ?
        WHERE m.conversation_id = ?
          AND m.sender_id != ?
          AND (p.last_read_at IS NULL OR m.sent_at > p.last_read_at)
        "#,
    )
    .bind(user_id)
    .bind(conversation_id)
    .bind(user_id)
    .fetch_one(db)
    .await?;

    Ok(count)
}
