use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::StoreError;

pub const ROLE_CUSTOMER: &str = "customer";

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// Public view of another user.
#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Conversation {
    pub id: i64,
    pub direct_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last activity; bumped by every stored message.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Participant {
    pub id: i64,
    pub conversation_id: i64,
    pub user_id: i64,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub encrypted_content: String,
    pub client_message_id: String,
    pub sent_at: DateTime<Utc>,
}

/// One row of a user's inbox: the conversation, the other participant and how
/// much the user has not read yet.
#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct ConversationSummary {
    pub conversation_id: i64,
    pub other_user_id: i64,
    pub other_username: String,
    pub updated_at: DateTime<Utc>,
    pub unread_count: i64,
}

/// Unordered pair of distinct users, normalised so that (a, b) and (b, a)
/// are the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectPair {
    low: i64,
    high: i64,
}

impl DirectPair {
    pub fn new(user1_id: i64, user2_id: i64) -> Result<Self, StoreError> {
        if user1_id <= 0 || user2_id <= 0 {
            return Err(StoreError::Validation(format!(
                "malformed user id pair ({user1_id}, {user2_id})"
            )));
        }
        if user1_id == user2_id {
            return Err(StoreError::Validation(
                "cannot create a conversation with yourself".to_string(),
            ));
        }

        Ok(Self {
            low: user1_id.min(user2_id),
            high: user1_id.max(user2_id),
        })
    }

    pub fn low(&self) -> i64 {
        self.low
    }

    pub fn high(&self) -> i64 {
        self.high
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.low, self.high)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectConversationResponse {
    pub conversation_id: i64,
    pub is_new: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationDetailResponse {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchUsersRequest {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchUsersResponse {
    pub users: Vec<UserSummary>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub encrypted_content: String,
    /// Idempotency key; generated by the server when absent.
    #[serde(default)]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: i64,
    pub client_message_id: String,
    pub sent_at: DateTime<Utc>,
    pub conversation_updated_at: Option<DateTime<Utc>>,
    pub duplicate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub conversation_id: i64,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    pub const MAX_LIMIT: i64 = 100;

    /// Clamps to `1..=MAX_LIMIT` and a non-negative offset.
    pub fn resolve(&self, default_limit: i64) -> (i64, i64) {
        let limit = self.limit.unwrap_or(default_limit).clamp(1, Self::MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub retryable: bool,
}
