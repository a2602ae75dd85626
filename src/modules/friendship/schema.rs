use serde::{Deserialize, Serialize};
use sqlx::prelude::{FromRow, Type};
use uuid::Uuid;

/// Lifecycle of one directed relationship record. A record only ever moves
/// forward out of `Pending`; it is never reset in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(type_name = "friendship_status", rename_all = "UPPERCASE")]
pub enum FriendshipStatus {
    #[sqlx(rename = "PENDING")]
    Pending,
    #[sqlx(rename = "APPROVED")]
    Approved,
    #[sqlx(rename = "REJECTED")]
    Rejected,
}

impl FriendshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendshipStatus::Pending => "pending",
            FriendshipStatus::Approved => "approved",
            FriendshipStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(type_name = "handled_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HandledType {
    Accept,
    Reject,
}

impl HandledType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandledType::Accept => "accept",
            HandledType::Reject => "reject",
        }
    }
}

/// One half of a friendship: `sender` requested (or approved) a connection to
/// `receiver`. A mutual friendship is the pair of records in both directions,
/// both `Approved`. Uniqueness on the ordered (sender, receiver) pair is
/// enforced by the store.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FriendshipEntity {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub status: FriendshipStatus,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub handled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub handled_type: Option<HandledType>,
}
