use uuid::Uuid;

use crate::{api::error, modules::user::model::InsertUser, modules::user::schema::UserEntity};

#[async_trait::async_trait]
pub trait UserRepository {
    async fn find_by_id(&self, id: &Uuid) -> Result<Option<UserEntity>, error::SystemError>;

    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserEntity>, error::SystemError>;

    async fn create(&self, user: &InsertUser) -> Result<Uuid, error::SystemError>;

    /// Bump the last-active timestamp, e.g. on sign-in.
    async fn touch_last_active(&self, id: &Uuid) -> Result<(), error::SystemError>;

    /// Search users by username (case-insensitive, partial match)
    async fn search_users(
        &self,
        query: &str,
        limit: i32,
    ) -> Result<Vec<UserEntity>, error::SystemError>;
}
