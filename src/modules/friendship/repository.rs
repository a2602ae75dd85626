use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::error;
use crate::modules::friendship::model::{PartnerRow, RequestRow};
use crate::modules::friendship::schema::{FriendshipEntity, FriendshipStatus, HandledType};

/// Store of directed relationship records, keyed by the ordered
/// (sender, receiver) pair. Multi-record mutations (`approve_pair`,
/// `delete_between`) are atomic inside the implementation; everything else is
/// single-record.
#[async_trait::async_trait]
pub trait FriendshipRepository: Send + Sync {
    async fn find_directed(
        &self,
        sender_id: &Uuid,
        receiver_id: &Uuid,
    ) -> Result<Option<FriendshipEntity>, error::SystemError>;

    async fn find_by_id(
        &self,
        id: &Uuid,
    ) -> Result<Option<FriendshipEntity>, error::SystemError>;

    /// All directed records involving both users, in either direction
    /// (0, 1, or 2).
    async fn find_between(
        &self,
        user_id_a: &Uuid,
        user_id_b: &Uuid,
    ) -> Result<Vec<FriendshipEntity>, error::SystemError>;

    /// Inserts a fresh pending record. A violation of the ordered-pair
    /// uniqueness constraint surfaces as `SystemError::UniqueViolation` so the
    /// caller can re-read instead of failing.
    async fn create_pending(
        &self,
        sender_id: &Uuid,
        receiver_id: &Uuid,
    ) -> Result<FriendshipEntity, error::SystemError>;

    /// Single-record transition out of `Pending`.
    async fn mark_handled(
        &self,
        id: &Uuid,
        status: FriendshipStatus,
        handled_type: HandledType,
        at: DateTime<Utc>,
    ) -> Result<FriendshipEntity, error::SystemError>;

    /// Approves the request record and synchronizes the reverse direction
    /// (update it if present, create it otherwise) in one transaction, so no
    /// concurrent call can observe a half-approved pair. Returns the approved
    /// request record.
    async fn approve_pair(
        &self,
        request_id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<FriendshipEntity, error::SystemError>;

    async fn delete_by_id(&self, id: &Uuid) -> Result<bool, error::SystemError>;

    /// Deletes every directed record between the pair atomically, returning
    /// how many were removed.
    async fn delete_between(
        &self,
        user_id_a: &Uuid,
        user_id_b: &Uuid,
    ) -> Result<u64, error::SystemError>;

    async fn exists_approved_between(
        &self,
        user_id_a: &Uuid,
        user_id_b: &Uuid,
    ) -> Result<bool, error::SystemError>;

    /// Counts distinct partner identities. Both directed records of a mutual
    /// pair must count as one friend.
    async fn count_approved_partners(&self, user_id: &Uuid) -> Result<i64, error::SystemError>;

    /// Deduplicated list of all approved partner ids.
    async fn list_approved_partner_ids(
        &self,
        user_id: &Uuid,
    ) -> Result<Vec<Uuid>, error::SystemError>;

    /// One page of deduplicated approved partners, most recently approved
    /// first, with profile fields for the projection.
    async fn list_approved_partners(
        &self,
        user_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PartnerRow>, error::SystemError>;

    async fn find_pending_received(
        &self,
        user_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RequestRow>, error::SystemError>;

    async fn count_pending_received(&self, user_id: &Uuid) -> Result<i64, error::SystemError>;

    async fn find_pending_sent(
        &self,
        user_id: &Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RequestRow>, error::SystemError>;

    async fn count_pending_sent(&self, user_id: &Uuid) -> Result<i64, error::SystemError>;
}
