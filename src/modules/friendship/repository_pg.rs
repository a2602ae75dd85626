use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    api::error,
    modules::friendship::{
        model::{PartnerRow, RequestRow},
        repository::FriendshipRepository,
        schema::{FriendshipEntity, FriendshipStatus, HandledType},
    },
};

#[derive(Clone)]
pub struct FriendshipRepositoryPg {
    pool: sqlx::PgPool,
}

impl FriendshipRepositoryPg {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl FriendshipRepository for FriendshipRepositoryPg {
    async fn find_directed(
        &self,
        sender_id: &Uuid,
        receiver_id: &Uuid,
    ) -> Result<Option<FriendshipEntity>, error::SystemError> {
        let record = sqlx::query_as::<_, FriendshipEntity>(
            "SELECT * FROM friendships WHERE sender_id = $1 AND receiver_id = $2",
        )
        .bind(sender_id)
        .bind(receiver_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_by_id(
        &self,
        id: &Uuid,
    ) -> Result<Option<FriendshipEntity>, error::SystemError> {
        let record =
            sqlx::query_as::<_, FriendshipEntity>("SELECT * FROM friendships WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    async fn find_between(
        &self,
        user_id_a: &Uuid,
        user_id_b: &Uuid,
    ) -> Result<Vec<FriendshipEntity>, error::SystemError> {
        let records = sqlx::query_as::<_, FriendshipEntity>(
            r#"
            SELECT *
            FROM friendships
            WHERE
                (sender_id = $1 AND receiver_id = $2)
            OR (sender_id = $2 AND receiver_id = $1)
            "#,
        )
        .bind(user_id_a)
        .bind(user_id_b)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn create_pending(
        &self,
        sender_id: &Uuid,
        receiver_id: &Uuid,
    ) -> Result<FriendshipEntity, error::SystemError> {
        let id = Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext));
        let record = sqlx::query_as::<_, FriendshipEntity>(
            r#"
            INSERT INTO friendships (id, sender_id, receiver_id, status)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(sender_id)
        .bind(receiver_id)
        .bind(FriendshipStatus::Pending)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_handled(
        &self,
        id: &Uuid,
        status: FriendshipStatus,
        handled_type: HandledType,
        at: DateTime<Utc>,
    ) -> Result<FriendshipEntity, error::SystemError> {
        let record = sqlx::query_as::<_, FriendshipEntity>(
            r#"
            UPDATE friendships
            SET status = $2, handled_type = $3, handled_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(handled_type)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| error::SystemError::not_found("Friend request not found"))?;

        Ok(record)
    }

    async fn approve_pair(
        &self,
        request_id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<FriendshipEntity, error::SystemError> {
        let mut tx = self.pool.begin().await?;

        let request = sqlx::query_as::<_, FriendshipEntity>(
            "SELECT * FROM friendships WHERE id = $1 FOR UPDATE",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| error::SystemError::not_found("Friend request not found"))?;

        if request.status != FriendshipStatus::Pending {
            tx.rollback().await?;
            return Err(error::SystemError::conflict("Friend request already handled"));
        }

        let approved = sqlx::query_as::<_, FriendshipEntity>(
            r#"
            UPDATE friendships
            SET status = $2, handled_type = $3, handled_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(FriendshipStatus::Approved)
        .bind(HandledType::Accept)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        // Synchronize the reverse direction: approve an existing record or
        // create it, in the same transaction as the forward approval.
        let reverse_id = Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext));
        sqlx::query(
            r#"
            INSERT INTO friendships
                (id, sender_id, receiver_id, status, requested_at, handled_at, handled_type)
            VALUES ($1, $2, $3, $4, $5, $5, $6)
            ON CONFLICT (sender_id, receiver_id)
            DO UPDATE SET status = $4, handled_at = $5, handled_type = $6
            "#,
        )
        .bind(reverse_id)
        .bind(request.receiver_id)
        .bind(request.sender_id)
        .bind(FriendshipStatus::Approved)
        .bind(at)
        .bind(HandledType::Accept)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(approved)
    }

    async fn delete_by_id(&self, id: &Uuid) -> Result<bool, error::SystemError> {
        let rows = sqlx::query("DELETE FROM friendships WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows > 0)
    }

    async fn delete_between(
        &self,
        user_id_a: &Uuid,
        user_id_b: &Uuid,
    ) -> Result<u64, error::SystemError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM friendships
            WHERE
                (sender_id = $1 AND receiver_id = $2)
            OR (sender_id = $2 AND receiver_id = $1)
            "#,
        )
        .bind(user_id_a)
        .bind(user_id_b)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    async fn exists_approved_between(
        &self,
        user_id_a: &Uuid,
        user_id_b: &Uuid,
    ) -> Result<bool, error::SystemError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM friendships
                WHERE (
                    (sender_id = $1 AND receiver_id = $2)
                 OR (sender_id = $2 AND receiver_id = $1)
                )
                AND status = $3
            )
            "#,
        )
        .bind(user_id_a)
        .bind(user_id_b)
        .bind(FriendshipStatus::Approved)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn count_approved_partners(&self, user_id: &Uuid) -> Result<i64, error::SystemError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT CASE WHEN sender_id = $1 THEN receiver_id ELSE sender_id END)
            FROM friendships
            WHERE (sender_id = $1 OR receiver_id = $1) AND status = $2
            "#,
        )
        .bind(user_id)
        .bind(FriendshipStatus::Approved)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_approved_partner_ids(
        &self,
        user_id: &Uuid,
    ) -> Result<Vec<Uuid>, error::SystemError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT CASE WHEN sender_id = $1 THEN receiver_id ELSE sender_id END
            FROM friendships
            WHERE (sender_id = $1 OR receiver_id = $1) AND status = $2
            "#,
        )
        .bind(user_id)
        .bind(FriendshipStatus::Approved)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn list_approved_partners(
        &self,
        user_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PartnerRow>, error::SystemError> {
        // The pair is two directed records; GROUP BY collapses them to one
        // partner before paging, so a page never double-counts a friendship.
        let rows = sqlx::query_as::<_, PartnerRow>(
            r#"
            SELECT
                u.id AS friend_id,
                u.username,
                u.points,
                u.last_active_at,
                p.became_friends_at
            FROM (
                SELECT
                    CASE WHEN f.sender_id = $1 THEN f.receiver_id ELSE f.sender_id END
                        AS partner_id,
                    MAX(f.handled_at) AS became_friends_at
                FROM friendships f
                WHERE (f.sender_id = $1 OR f.receiver_id = $1) AND f.status = $2
                GROUP BY partner_id
            ) p
            JOIN users u ON u.id = p.partner_id
            ORDER BY p.became_friends_at DESC NULLS LAST
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(FriendshipStatus::Approved)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_pending_received(
        &self,
        user_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RequestRow>, error::SystemError> {
        let rows = sqlx::query_as::<_, RequestRow>(
            r#"
            SELECT
                f.id AS request_id,
                u.id AS friend_id,
                u.username,
                u.points,
                u.last_active_at,
                f.requested_at
            FROM friendships f
            JOIN users u ON u.id = f.sender_id
            WHERE f.receiver_id = $1 AND f.status = $2
            ORDER BY f.requested_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(FriendshipStatus::Pending)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_pending_received(&self, user_id: &Uuid) -> Result<i64, error::SystemError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM friendships WHERE receiver_id = $1 AND status = $2",
        )
        .bind(user_id)
        .bind(FriendshipStatus::Pending)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn find_pending_sent(
        &self,
        user_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RequestRow>, error::SystemError> {
        let rows = sqlx::query_as::<_, RequestRow>(
            r#"
            SELECT
                f.id AS request_id,
                u.id AS friend_id,
                u.username,
                u.points,
                u.last_active_at,
                f.requested_at
            FROM friendships f
            JOIN users u ON u.id = f.receiver_id
            WHERE f.sender_id = $1 AND f.status = $2
            ORDER BY f.requested_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(FriendshipStatus::Pending)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_pending_sent(&self, user_id: &Uuid) -> Result<i64, error::SystemError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM friendships WHERE sender_id = $1 AND status = $2",
        )
        .bind(user_id)
        .bind(FriendshipStatus::Pending)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
