use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::modules::friendship::schema::{FriendshipEntity, HandledType};
use crate::modules::user::schema::UserEntity;

/// A user addressed either by canonical id or by username. The engine itself
/// is keyed on ids; this adapter is resolved against the user store at the
/// service edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Id(Uuid),
    Username(String),
}

impl UserRef {
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(id) => UserRef::Id(id),
            Err(_) => UserRef::Username(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddFriendBody {
    pub friend: UserRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleDecision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HandleFriendBody {
    pub friend: UserRef,
    pub decision: HandleDecision,
}

/// Projection of a single directed relationship record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendshipResponse {
    pub friendship_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub receiver_id: Uuid,
    pub receiver_username: String,
    pub status: String,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub handled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub handled_type: Option<String>,
}

impl FriendshipResponse {
    /// Builds the projection from a record and the two involved users, in
    /// either order.
    pub fn from_parts(entity: &FriendshipEntity, a: &UserEntity, b: &UserEntity) -> Self {
        let (sender, receiver) = if entity.sender_id == a.id { (a, b) } else { (b, a) };

        FriendshipResponse {
            friendship_id: entity.id,
            sender_id: sender.id,
            sender_username: sender.username.clone(),
            receiver_id: receiver.id,
            receiver_username: receiver.username.clone(),
            status: entity.status.as_str().to_string(),
            requested_at: entity.requested_at,
            handled_at: entity.handled_at,
            handled_type: entity.handled_type.map(|t| HandledType::as_str(&t).to_string()),
        }
    }
}

/// One entry of a friend or request listing: the counterpart's profile plus
/// when the relationship became approved (friend list) or was requested
/// (pending/sent lists).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendSummary {
    pub friend_id: Uuid,
    pub friend_username: String,
    pub friend_points: i32,
    pub status: String,
    pub last_active_at: Option<chrono::DateTime<chrono::Utc>>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendListResponse {
    pub total: i64,
    pub friends: Vec<FriendSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendCheckResponse {
    pub is_friend: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendCountResponse {
    pub count: i64,
}

/// Row shape of the deduplicated approved-partner query (partner profile
/// joined onto the grouped pair).
#[derive(Debug, Clone, FromRow)]
pub struct PartnerRow {
    pub friend_id: Uuid,
    pub username: String,
    pub points: i32,
    pub last_active_at: Option<chrono::DateTime<chrono::Utc>>,
    pub became_friends_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Row shape of the pending-request queries (counterpart profile joined onto
/// the directed record).
#[derive(Debug, Clone, FromRow)]
pub struct RequestRow {
    pub request_id: Uuid,
    pub friend_id: Uuid,
    pub username: String,
    pub points: i32,
    pub last_active_at: Option<chrono::DateTime<chrono::Utc>>,
    pub requested_at: chrono::DateTime<chrono::Utc>,
}
