use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A user record as stored in the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub age: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// The writable fields of this record.
    pub fn fields(&self) -> UserFields {
        UserFields {
            name: self.name.clone(),
            email: self.email.clone(),
            age: self.age,
        }
    }
}

/// Writable attributes of a user, as supplied by create and update requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFields {
    pub name: String,
    pub email: String,
    pub age: i32,
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Rows matched by the statement
    pub rows_affected: u64,
    /// Identifier generated by an insert (0 for other statements)
    pub last_insert_id: u64,
}

/// Storage backend for user records.
///
/// Implementations hold no per-request state; mutual exclusion between
/// concurrent writers is the caller's job.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Returns the backend identifier (e.g., "mysql").
    fn backend_name(&self) -> &'static str;

    /// Insert a new user with `created_at = updated_at = now`.
    async fn insert(&self, fields: &UserFields, now: DateTime<Utc>)
        -> Result<WriteResult, StorageError>;

    /// Load a user by id.
    async fn find(&self, id: i32) -> Result<Option<User>, StorageError>;

    /// Load all users.
    async fn list(&self) -> Result<Vec<User>, StorageError>;

    /// Overwrite a user's fields and set `updated_at = now`.
    async fn update(
        &self,
        id: i32,
        fields: &UserFields,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StorageError>;

    /// Delete a user by id.
    async fn delete(&self, id: i32) -> Result<WriteResult, StorageError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user() -> User {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        User {
            id: 1,
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
            age: 30,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn test_fields_copy_writable_attributes() {
        let fields = user().fields();
        assert_eq!(
            fields,
            UserFields {
                name: "Alice".to_string(),
                email: "alice@example.com".to_string(),
                age: 30,
            }
        );
    }

    #[test]
    fn test_user_json_uses_rfc3339_timestamps() {
        let json = serde_json::to_value(user()).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["created_at"], "2024-05-01T12:30:00Z");

        let back: User = serde_json::from_value(json).unwrap();
        assert_eq!(back, user());
    }
}
