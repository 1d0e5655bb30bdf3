use crate::auth::{generate_token, hash_password, verify_password};
use crate::error::StoreError;
use crate::models::*;
use crate::queries::{self, NewUser};
use crate::store::{SendMessageParams, SendOutcome, Store};
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            retryable: false,
        }),
    )
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::Validation(message) => api_error(StatusCode::BAD_REQUEST, message),
        StoreError::NotFound(what) => api_error(StatusCode::NOT_FOUND, format!("{what} not found")),
        err @ StoreError::ConstraintViolation { .. } => {
            api_error(StatusCode::CONFLICT, err.to_string())
        }
        StoreError::Conflict(reason) => {
            tracing::warn!(%reason, "Transaction conflict reported to client");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "Concurrent update, please retry".to_string(),
                    retryable: true,
                }),
            )
        }
        StoreError::Database(err) => {
            tracing::error!(error = %err, "Database error");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}

async fn require_participant(
    store: &Store,
    conversation_id: i64,
    user_id: i64,
) -> Result<(), ApiError> {
    let is_participant = queries::is_participant(store.pool(), conversation_id, user_id)
        .await
        .map_err(store_error)?;

    if !is_participant {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "You are not a participant in this conversation",
        ));
    }
    Ok(())
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn create_account(
    State(store): State<Store>,
    Json(payload): Json<CreateAccountRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if payload.username.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Username cannot be empty"));
    }
    if !payload.email.contains('@') {
        return Err(api_error(StatusCode::BAD_REQUEST, "Email address is invalid"));
    }
    if payload.password.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Password cannot be empty"));
    }

    let password_hash = hash_password(&payload.password).map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Password hashing error: {}", e),
        )
    })?;

    let token = generate_token();
    let user = store
        .create_account_tx(
            NewUser {
                username: &payload.username,
                email: &payload.email,
                password_hash: &password_hash,
                role: ROLE_CUSTOMER,
            },
            &token,
        )
        .await
        .map_err(|err| {
            if err.is_unique_violation() {
                api_error(StatusCode::CONFLICT, "Username or email already exists")
            } else {
                store_error(err)
            }
        })?;

    Ok(Json(SessionResponse {
        token,
        user_id: user.id,
        username: user.username,
    }))
}

pub async fn login(
    State(store): State<Store>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let invalid = || api_error(StatusCode::UNAUTHORIZED, "Invalid username or password");

    let user = match queries::get_user_by_username(store.pool(), &payload.username).await {
        Ok(user) => user,
        Err(StoreError::NotFound(_)) => return Err(invalid()),
        Err(err) => return Err(store_error(err)),
    };

    let matches = verify_password(&payload.password, &user.password_hash).map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Password verification error: {}", e),
        )
    })?;
    if !matches {
        return Err(invalid());
    }

    let token = generate_token();
    queries::create_session(store.pool(), user.id, &token, Utc::now())
        .await
        .map_err(store_error)?;

    Ok(Json(SessionResponse {
        token,
        user_id: user.id,
        username: user.username,
    }))
}

pub async fn logout(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
) -> Result<StatusCode, ApiError> {
    let ended = queries::delete_user_sessions(store.pool(), user_id)
        .await
        .map_err(store_error)?;

    tracing::info!(user_id, sessions = ended, "User logged out");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_user(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
    Path(requested_id): Path<i64>,
) -> Result<Json<User>, ApiError> {
    if requested_id != user_id {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "Account does not belong to the authenticated user",
        ));
    }

    let user = queries::get_user_by_id(store.pool(), user_id)
        .await
        .map_err(store_error)?;

    Ok(Json(user))
}

const USER_SEARCH_LIMIT: i64 = 20;

pub async fn search_users(
    State(store): State<Store>,
    Json(payload): Json<SearchUsersRequest>,
) -> Result<Json<SearchUsersResponse>, ApiError> {
    let term = payload.username.trim();
    if term.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Search term cannot be empty"));
    }

    let users = queries::search_users(store.pool(), term, USER_SEARCH_LIMIT)
        .await
        .map_err(store_error)?;

    Ok(Json(SearchUsersResponse {
        count: users.len(),
        users,
    }))
}

pub async fn list_conversations(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let (limit, offset) = page.resolve(20);

    let conversations = queries::list_user_conversations(store.pool(), user_id, limit, offset)
        .await
        .map_err(store_error)?;

    Ok(Json(conversations))
}

pub async fn get_or_create_direct_conversation(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
    Path(other_user_id): Path<i64>,
) -> Result<(StatusCode, Json<DirectConversationResponse>), ApiError> {
    if other_user_id == user_id {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Cannot create conversation with yourself",
        ));
    }

    match queries::get_user_by_id(store.pool(), other_user_id).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => {
            return Err(api_error(StatusCode::NOT_FOUND, "Other user not found"))
        }
        Err(err) => return Err(store_error(err)),
    }

    let result = store
        .get_or_create_direct_conversation_tx(user_id, other_user_id)
        .await
        .map_err(store_error)?;

    let status = if result.is_new {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(DirectConversationResponse {
            conversation_id: result.conversation.id,
            is_new: result.is_new,
            updated_at: result.conversation.updated_at,
        }),
    ))
}

pub async fn get_conversation(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<ConversationDetailResponse>, ApiError> {
    let conversation = queries::get_conversation(store.pool(), conversation_id)
        .await
        .map_err(store_error)?;

    require_participant(&store, conversation_id, user_id).await?;

    let participants = queries::list_participants(store.pool(), conversation_id)
        .await
        .map_err(store_error)?;

    Ok(Json(ConversationDetailResponse {
        conversation,
        participants,
    }))
}

pub async fn get_messages(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
    Path(conversation_id): Path<i64>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<Message>>, ApiError> {
    require_participant(&store, conversation_id, user_id).await?;

    let (limit, offset) = page.resolve(50);
    let messages = queries::list_messages(store.pool(), conversation_id, limit, offset)
        .await
        .map_err(store_error)?;

    Ok(Json(messages))
}

pub async fn send_message(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
    Path(conversation_id): Path<i64>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ApiError> {
    if payload.encrypted_content.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Message content cannot be empty",
        ));
    }
    if STANDARD.decode(&payload.encrypted_content).is_err() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Message content must be base64 encoded",
        ));
    }

    require_participant(&store, conversation_id, user_id).await?;

    let client_message_id = payload
        .client_message_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let outcome = store
        .send_message_tx(SendMessageParams {
            conversation_id,
            sender_id: user_id,
            encrypted_content: &payload.encrypted_content,
            client_message_id: &client_message_id,
        })
        .await
        .map_err(store_error)?;

    match outcome {
        SendOutcome::Sent(result) => Ok((
            StatusCode::CREATED,
            Json(SendMessageResponse {
                message_id: result.message.id,
                client_message_id,
                sent_at: result.message.sent_at,
                conversation_updated_at: Some(result.conversation.updated_at),
                duplicate: false,
            }),
        )),
        SendOutcome::Duplicate(existing) => {
            // Keys are global; a replay must come from the same sender and
            // conversation to be acknowledged.
            if existing.conversation_id != conversation_id || existing.sender_id != user_id {
                return Err(api_error(
                    StatusCode::CONFLICT,
                    "client_message_id is already in use",
                ));
            }

            Ok((
                StatusCode::OK,
                Json(SendMessageResponse {
                    message_id: existing.id,
                    client_message_id,
                    sent_at: existing.sent_at,
                    conversation_updated_at: None,
                    duplicate: true,
                }),
            ))
        }
    }
}

pub async fn mark_as_read(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    require_participant(&store, conversation_id, user_id).await?;

    store
        .mark_messages_as_read_tx(conversation_id, user_id)
        .await
        .map_err(store_error)?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn unread_count(
    State(store): State<Store>,
    Extension(user_id): Extension<i64>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    require_participant(&store, conversation_id, user_id).await?;

    let unread_count = store
        .unread_count(conversation_id, user_id)
        .await
        .map_err(store_error)?;

    Ok(Json(UnreadCountResponse {
        conversation_id,
        unread_count,
    }))
}
