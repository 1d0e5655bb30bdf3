//! Atomic conversation and message operations.
//!
//! Each operation checks out one connection from the pool, runs its Query
//! Layer calls inside a single transaction and commits only when every step
//! succeeded. A `sqlx::Transaction` that is dropped without `commit` rolls
//! back, so early returns, errors and cancelled request futures never leave a
//! partial write behind.
//!
//! SQLite runs every transaction serializably. A writer whose snapshot was
//! invalidated by a concurrent commit is refused with `SQLITE_BUSY*`, which
//! surfaces here as [`StoreError::Conflict`]. Nothing in this module retries;
//! that decision belongs to the caller.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::db::DbPool;
use crate::error::{StoreError, StoreResult};
use crate::models::{Conversation, DirectPair, Message, Participant, User};
use crate::queries::{self, NewMessage, NewUser};

#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

#[derive(Debug, Clone)]
pub struct CreateConversationTxResult {
    pub conversation: Conversation,
    pub participant1: Participant,
    pub participant2: Participant,
}

#[derive(Debug, Clone)]
pub struct DirectConversationTxResult {
    pub conversation: Conversation,
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SendMessageParams<'a> {
    pub conversation_id: i64,
    pub sender_id: i64,
    pub encrypted_content: &'a str,
    pub client_message_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct SendMessageTxResult {
    pub message: Message,
    pub conversation: Conversation,
}

/// Result of a send. A replayed idempotency key is not an error: the caller
/// gets back the message that was stored the first time.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent(SendMessageTxResult),
    Duplicate(Message),
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.pool.as_ref()
    }

    /// Creates a user together with its first session token.
    pub async fn create_account_tx(&self, user: NewUser<'_>, token: &str) -> StoreResult<User> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let user = queries::create_user(&mut *tx, user, now).await?;
        queries::create_session(&mut *tx, user.id, token, now).await?;

        tx.commit().await?;

        info!(user_id = user.id, username = %user.username, "Account created");
        Ok(user)
    }

    /// Creates a conversation with both participants. Does not look for an
    /// existing conversation between the two users.
    pub async fn create_conversation_tx(
        &self,
        user1_id: i64,
        user2_id: i64,
    ) -> StoreResult<CreateConversationTxResult> {
        let mut tx = self.pool.begin().await?;

        let result = insert_with_participants(&mut tx, None, user1_id, user2_id).await?;

        tx.commit().await?;

        info!(
            conversation_id = result.conversation.id,
            user1_id, user2_id, "Conversation created"
        );
        Ok(result)
    }

    /// Returns the single direct conversation between two users, creating it
    /// when it does not exist yet.
    pub async fn get_or_create_direct_conversation_tx(
        &self,
        user1_id: i64,
        user2_id: i64,
    ) -> StoreResult<DirectConversationTxResult> {
        let pair = DirectPair::new(user1_id, user2_id)?;

        let mut tx = self.pool.begin().await?;

        let existing = queries::find_direct_conversation(&mut *tx, pair).await;
        match existing {
            Ok(conversation_id) => {
                let conversation = queries::get_conversation(&mut *tx, conversation_id).await?;
                tx.commit().await?;

                debug!(conversation_id, key = %pair.key(), "Direct conversation exists");
                return Ok(DirectConversationTxResult {
                    conversation,
                    is_new: false,
                });
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let key = pair.key();
        let created = insert_with_participants(&mut tx, Some(&key), pair.low(), pair.high()).await;
        match created {
            Ok(created) => {
                tx.commit().await?;

                info!(
                    conversation_id = created.conversation.id,
                    %key,
                    "Direct conversation created"
                );
                Ok(DirectConversationTxResult {
                    conversation: created.conversation,
                    is_new: true,
                })
            }
            Err(err) if err.is_unique_violation() => {
                // Another transaction committed this pair first.
                tx.rollback().await?;
                warn!(%key, "Direct conversation created concurrently, re-fetching");
                self.refetch_direct(pair).await
            }
            Err(err) => Err(err),
        }
    }

    async fn refetch_direct(&self, pair: DirectPair) -> StoreResult<DirectConversationTxResult> {
        let conversation_id = match queries::find_direct_conversation(self.pool(), pair).await {
            Ok(id) => id,
            Err(StoreError::NotFound(_)) => {
                return Err(StoreError::Conflict(format!(
                    "direct conversation {} is not visible yet",
                    pair.key()
                )))
            }
            Err(err) => return Err(err),
        };

        let conversation = queries::get_conversation(self.pool(), conversation_id).await?;
        Ok(DirectConversationTxResult {
            conversation,
            is_new: false,
        })
    }

    /// Stores a message and bumps the conversation's activity timestamp.
    pub async fn send_message_tx(&self, params: SendMessageParams<'_>) -> StoreResult<SendOutcome> {
        if params.client_message_id.trim().is_empty() {
            return Err(StoreError::Validation(
                "client message id cannot be empty".to_string(),
            ));
        }
        if params.encrypted_content.is_empty() {
            return Err(StoreError::Validation(
                "message content cannot be empty".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        // Stamp only once the write lock is held, so a read marker committed
        // while this send was waiting can never be newer than the message.
        let last_activity = queries::lock_conversation(&mut *tx, params.conversation_id).await?;
        let sent_at = Utc::now().max(last_activity);

        let inserted = queries::create_message(
            &mut *tx,
            NewMessage {
                conversation_id: params.conversation_id,
                sender_id: params.sender_id,
                encrypted_content: params.encrypted_content,
                client_message_id: params.client_message_id,
                sent_at,
            },
        )
        .await;

        let message = match inserted {
            Ok(message) => message,
            Err(err) if err.is_unique_violation() => {
                tx.rollback().await?;
                return self.duplicate_submission(params.client_message_id).await;
            }
            Err(err) if err.is_foreign_key_violation() => {
                return Err(StoreError::NotFound("sender"));
            }
            Err(err) => return Err(err),
        };

        queries::touch_conversation(&mut *tx, message.conversation_id, message.sent_at).await?;
        let conversation = queries::get_conversation(&mut *tx, message.conversation_id).await?;

        tx.commit().await?;

        debug!(
            message_id = message.id,
            conversation_id = conversation.id,
            sender_id = message.sender_id,
            "Message stored"
        );
        Ok(SendOutcome::Sent(SendMessageTxResult {
            message,
            conversation,
        }))
    }

    async fn duplicate_submission(&self, client_message_id: &str) -> StoreResult<SendOutcome> {
        match queries::get_message_by_client_id(self.pool(), client_message_id).await {
            Ok(existing) => {
                info!(
                    message_id = existing.id,
                    client_message_id, "Duplicate submission ignored"
                );
                Ok(SendOutcome::Duplicate(existing))
            }
            Err(StoreError::NotFound(_)) => Err(StoreError::Conflict(format!(
                "message {client_message_id} is not visible yet"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Moves the user's read marker to now. Succeeds without effect when the
    /// user is not a participant of the conversation.
    pub async fn mark_messages_as_read_tx(
        &self,
        conversation_id: i64,
        user_id: i64,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let touched =
            queries::update_last_read_at(&mut *tx, conversation_id, user_id, Utc::now()).await?;

        tx.commit().await?;

        if touched == 0 {
            debug!(conversation_id, user_id, "No participant row to mark as read");
        }
        Ok(())
    }

    pub async fn unread_count(&self, conversation_id: i64, user_id: i64) -> StoreResult<i64> {
        queries::count_unread(self.pool(), conversation_id, user_id).await
    }
}

async fn insert_with_participants(
    conn: &mut SqliteConnection,
    direct_key: Option<&str>,
    user1_id: i64,
    user2_id: i64,
) -> StoreResult<CreateConversationTxResult> {
    let now = Utc::now();

    let conversation = queries::create_conversation(&mut *conn, direct_key, now).await?;
    let participant1 = queries::add_participant(&mut *conn, conversation.id, user1_id, now)
        .await
        .map_err(unknown_user)?;
    let participant2 = queries::add_participant(&mut *conn, conversation.id, user2_id, now)
        .await
        .map_err(unknown_user)?;

    Ok(CreateConversationTxResult {
        conversation,
        participant1,
        participant2,
    })
}

fn unknown_user(err: StoreError) -> StoreError {
    if err.is_foreign_key_violation() {
        StoreError::NotFound("user")
    } else {
        err
    }
}
