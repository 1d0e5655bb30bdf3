use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::db::{open_pool, DbPool};
use crate::models::{User, ROLE_CUSTOMER};
use crate::queries::{self, NewUser};
use crate::store::Store;

/// A fresh on-disk database; removed when dropped.
pub struct TestDb {
    pub pool: DbPool,
    pub store: Store,
    _dir: TempDir,
}

pub async fn test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("test.db"))
        .create_if_missing(true);

    let pool = open_pool(options, 8).await.expect("failed to open test database");

    TestDb {
        store: Store::new(pool.clone()),
        pool,
        _dir: dir,
    }
}

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn random_client_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn random_encrypted_content() -> String {
    let mut bytes = [0u8; 48];
    rand::thread_rng().fill(&mut bytes[..]);
    STANDARD.encode(bytes)
}

pub async fn create_random_user(pool: &SqlitePool) -> User {
    let username = format!("user_{}", random_string(8));
    let email = format!("{}@{}.com", random_string(6), random_string(4));

    queries::create_user(
        pool,
        NewUser {
            username: &username,
            email: &email,
            password_hash: "not-a-real-hash",
            role: ROLE_CUSTOMER,
        },
        Utc::now(),
    )
    .await
    .expect("failed to create user")
}
