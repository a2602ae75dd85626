use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    api::error,
    modules::{
        friendship::{
            model::{
                FriendListResponse, FriendSummary, FriendshipResponse, HandleDecision, UserRef,
            },
            repository::FriendshipRepository,
            schema::{FriendshipStatus, HandledType},
        },
        user::{repository::UserRepository, schema::UserEntity},
    },
    utils::Page,
};

#[derive(Clone)]
pub struct FriendService<R, U>
where
    R: FriendshipRepository,
    U: UserRepository + Send + Sync,
{
    friendship_repo: Arc<R>,
    user_repo: Arc<U>,
}

impl<R, U> FriendService<R, U>
where
    R: FriendshipRepository,
    U: UserRepository + Send + Sync,
{
    pub fn with_dependencies(friendship_repo: Arc<R>, user_repo: Arc<U>) -> Self {
        FriendService { friendship_repo, user_repo }
    }

    async fn require_user(&self, id: &Uuid) -> Result<UserEntity, error::SystemError> {
        self.user_repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| error::SystemError::not_found("User not found"))
    }

    async fn resolve_user(&self, user: &UserRef) -> Result<UserEntity, error::SystemError> {
        let found = match user {
            UserRef::Id(id) => self.user_repo.find_by_id(id).await?,
            UserRef::Username(name) => self.user_repo.find_by_username(name).await?,
        };
        found.ok_or_else(|| error::SystemError::not_found("Target user not found"))
    }

    /// Initiates a friend request, or resolves one. If the target already has
    /// a pending request towards the actor, this call is treated as an
    /// implicit acceptance and the pair becomes mutual friends immediately.
    pub async fn add_friend(
        &self,
        actor_id: Uuid,
        target: &UserRef,
    ) -> Result<FriendshipResponse, error::SystemError> {
        if matches!(target, UserRef::Id(id) if *id == actor_id) {
            return Err(error::SystemError::bad_request("Cannot add yourself as a friend"));
        }

        let actor = self.require_user(&actor_id).await?;
        let target = self.resolve_user(target).await?;

        if actor.id == target.id {
            return Err(error::SystemError::bad_request("Cannot add yourself as a friend"));
        }

        // Outgoing direction: a live request or friendship blocks a new one;
        // a stale rejection is cleared so the pair-uniqueness constraint
        // cannot trip on the re-request.
        if let Some(sent) = self.friendship_repo.find_directed(&actor.id, &target.id).await? {
            match sent.status {
                FriendshipStatus::Pending => {
                    return Err(error::SystemError::conflict("Friend request already sent"));
                }
                FriendshipStatus::Approved => {
                    return Err(error::SystemError::conflict("Users are already friends"));
                }
                FriendshipStatus::Rejected => {
                    self.friendship_repo.delete_by_id(&sent.id).await?;
                    info!(
                        "User {} re-requests user {}, dropped stale rejected record {}",
                        actor.id, target.id, sent.id
                    );
                }
            }
        }

        // Incoming direction: a pending request from the target collapses
        // into an immediate mutual friendship instead of a second pending
        // record.
        if let Some(received) = self.friendship_repo.find_directed(&target.id, &actor.id).await? {
            match received.status {
                FriendshipStatus::Pending => {
                    let approved =
                        self.friendship_repo.approve_pair(&received.id, Utc::now()).await?;
                    info!(
                        "User {} accepted user {}'s pending request {} by requesting back",
                        actor.id, target.id, approved.id
                    );
                    return Ok(FriendshipResponse::from_parts(&approved, &actor, &target));
                }
                FriendshipStatus::Approved => {
                    return Err(error::SystemError::conflict("Users are already friends"));
                }
                FriendshipStatus::Rejected => {
                    // A request the actor once rejected does not block them
                    // from initiating now; the pair check below still applies.
                }
            }
        }

        if self.friendship_repo.exists_approved_between(&actor.id, &target.id).await? {
            return Err(error::SystemError::conflict("Users are already friends"));
        }

        let created = match self.friendship_repo.create_pending(&actor.id, &target.id).await {
            Ok(record) => record,
            Err(error::SystemError::UniqueViolation(_)) => {
                // Lost a race against a concurrent call on the same pair:
                // re-read and report the state that won.
                return if self.friendship_repo.exists_approved_between(&actor.id, &target.id).await?
                {
                    Err(error::SystemError::conflict("Users are already friends"))
                } else {
                    Err(error::SystemError::conflict("Friend request already sent"))
                };
            }
            Err(e) => return Err(e),
        };

        info!("User {} sent friend request {} to user {}", actor.id, created.id, target.id);
        Ok(FriendshipResponse::from_parts(&created, &actor, &target))
    }

    /// Accepts or rejects the pending request the counterparty sent to the
    /// actor. Accepting synchronizes the reverse record so the mutual-pair
    /// invariant holds; rejecting marks the record in place, keeping history.
    pub async fn handle_friend_request(
        &self,
        actor_id: Uuid,
        counterparty: &UserRef,
        decision: HandleDecision,
    ) -> Result<FriendshipResponse, error::SystemError> {
        let actor = self.require_user(&actor_id).await?;
        let counterparty = self.resolve_user(counterparty).await?;

        let request = self
            .friendship_repo
            .find_directed(&counterparty.id, &actor.id)
            .await?
            .ok_or_else(|| error::SystemError::not_found("Friend request not found"))?;

        if request.receiver_id != actor.id {
            return Err(error::SystemError::forbidden(
                "You are not allowed to handle this friend request",
            ));
        }

        if request.status != FriendshipStatus::Pending {
            return Err(error::SystemError::conflict("Friend request already handled"));
        }

        let handled = match decision {
            HandleDecision::Accept => {
                let approved = self.friendship_repo.approve_pair(&request.id, Utc::now()).await?;
                info!(
                    "User {} accepted friend request {} from user {}",
                    actor.id, approved.id, counterparty.id
                );
                approved
            }
            HandleDecision::Reject => {
                let rejected = self
                    .friendship_repo
                    .mark_handled(
                        &request.id,
                        FriendshipStatus::Rejected,
                        HandledType::Reject,
                        Utc::now(),
                    )
                    .await?;
                info!(
                    "User {} rejected friend request {} from user {}",
                    actor.id, rejected.id, counterparty.id
                );
                rejected
            }
        };

        Ok(FriendshipResponse::from_parts(&handled, &counterparty, &actor))
    }

    /// Deletes every record between the pair. Removal is symmetric and total;
    /// it never leaves a dangling one-directional record behind.
    pub async fn remove_friend(
        &self,
        actor_id: Uuid,
        target: &UserRef,
    ) -> Result<(), error::SystemError> {
        let actor = self.require_user(&actor_id).await?;
        let target = self.resolve_user(target).await?;

        let removed = self.friendship_repo.delete_between(&actor.id, &target.id).await?;
        if removed == 0 {
            return Err(error::SystemError::not_found("Friendship not found"));
        }

        info!("User {} removed friend {} ({} records deleted)", actor.id, target.id, removed);
        Ok(())
    }

    /// Only the sender of a still-pending request may cancel it.
    pub async fn cancel_friend_request(
        &self,
        actor_id: Uuid,
        request_id: Uuid,
    ) -> Result<(), error::SystemError> {
        let request = self
            .friendship_repo
            .find_by_id(&request_id)
            .await?
            .ok_or_else(|| error::SystemError::not_found("Friend request not found"))?;

        if request.sender_id != actor_id {
            return Err(error::SystemError::forbidden(
                "Only the sender can cancel a friend request",
            ));
        }

        if request.status != FriendshipStatus::Pending {
            return Err(error::SystemError::conflict(
                "Only pending friend requests can be cancelled",
            ));
        }

        self.friendship_repo.delete_by_id(&request_id).await?;
        info!("User {} cancelled friend request {}", actor_id, request_id);
        Ok(())
    }

    /// Pages over the deduplicated partner list, not over raw records: the
    /// store holds two approved records per mutual friendship and paging over
    /// them directly would double-count.
    pub async fn get_friend_list(
        &self,
        actor_id: Uuid,
        page: &Page,
    ) -> Result<FriendListResponse, error::SystemError> {
        self.require_user(&actor_id).await?;

        let total = self.friendship_repo.count_approved_partners(&actor_id).await?;
        let rows = self
            .friendship_repo
            .list_approved_partners(&actor_id, page.limit(), page.offset())
            .await?;

        let friends = rows
            .into_iter()
            .map(|row| FriendSummary {
                friend_id: row.friend_id,
                friend_username: row.username,
                friend_points: row.points,
                status: FriendshipStatus::Approved.as_str().to_string(),
                last_active_at: row.last_active_at,
                since: row.became_friends_at,
            })
            .collect();

        debug!("User {} listed friends ({} total)", actor_id, total);
        Ok(FriendListResponse { total, friends })
    }

    pub async fn get_pending_requests(
        &self,
        actor_id: Uuid,
        page: &Page,
    ) -> Result<FriendListResponse, error::SystemError> {
        self.require_user(&actor_id).await?;

        let total = self.friendship_repo.count_pending_received(&actor_id).await?;
        let rows = self
            .friendship_repo
            .find_pending_received(&actor_id, page.limit(), page.offset())
            .await?;

        debug!("User {} listed pending requests ({} total)", actor_id, total);
        Ok(FriendListResponse { total, friends: rows.into_iter().map(request_summary).collect() })
    }

    pub async fn get_sent_requests(
        &self,
        actor_id: Uuid,
        page: &Page,
    ) -> Result<FriendListResponse, error::SystemError> {
        self.require_user(&actor_id).await?;

        let total = self.friendship_repo.count_pending_sent(&actor_id).await?;
        let rows =
            self.friendship_repo.find_pending_sent(&actor_id, page.limit(), page.offset()).await?;

        debug!("User {} listed sent requests ({} total)", actor_id, total);
        Ok(FriendListResponse { total, friends: rows.into_iter().map(request_summary).collect() })
    }

    pub async fn is_friend(
        &self,
        actor_id: Uuid,
        other: &UserRef,
    ) -> Result<bool, error::SystemError> {
        self.require_user(&actor_id).await?;
        let other = self.resolve_user(other).await?;
        self.friendship_repo.exists_approved_between(&actor_id, &other.id).await
    }

    pub async fn get_friend_count(&self, actor_id: Uuid) -> Result<i64, error::SystemError> {
        self.require_user(&actor_id).await?;
        self.friendship_repo.count_approved_partners(&actor_id).await
    }

    pub async fn get_friend_ids(&self, actor_id: Uuid) -> Result<Vec<Uuid>, error::SystemError> {
        self.require_user(&actor_id).await?;
        self.friendship_repo.list_approved_partner_ids(&actor_id).await
    }
}

fn request_summary(row: crate::modules::friendship::model::RequestRow) -> FriendSummary {
    FriendSummary {
        friend_id: row.friend_id,
        friend_username: row.username,
        friend_points: row.points,
        status: FriendshipStatus::Pending.as_str().to_string(),
        last_active_at: row.last_active_at,
        since: Some(row.requested_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::SystemError;
    use crate::modules::friendship::model::{PartnerRow, RequestRow};
    use crate::modules::friendship::schema::FriendshipEntity;
    use crate::modules::user::model::InsertUser;
    use crate::modules::user::schema::UserRole;
    use chrono::{DateTime, Duration};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemStore {
        users: Mutex<Vec<UserEntity>>,
        friendships: Mutex<Vec<FriendshipEntity>>,
    }

    impl MemStore {
        fn add_user(&self, username: &str) -> Uuid {
            let id = Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext));
            self.users.lock().unwrap().push(UserEntity {
                id,
                username: username.to_string(),
                email: format!("{username}@campus.test"),
                hash_password: String::new(),
                role: UserRole::User,
                points: 100,
                last_active_at: None,
                deleted_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
            id
        }

        fn records(&self) -> Vec<FriendshipEntity> {
            self.friendships.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl UserRepository for MemStore {
        async fn find_by_id(&self, id: &Uuid) -> Result<Option<UserEntity>, SystemError> {
            Ok(self.users.lock().unwrap().iter().find(|u| u.id == *id).cloned())
        }

        async fn find_by_username(
            &self,
            username: &str,
        ) -> Result<Option<UserEntity>, SystemError> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .iter()
                .find(|u| u.username.eq_ignore_ascii_case(username))
                .cloned())
        }

        async fn create(&self, user: &InsertUser) -> Result<Uuid, SystemError> {
            Ok(self.add_user(&user.username))
        }

        async fn touch_last_active(&self, id: &Uuid) -> Result<(), SystemError> {
            if let Some(u) = self.users.lock().unwrap().iter_mut().find(|u| u.id == *id) {
                u.last_active_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn search_users(
            &self,
            query: &str,
            limit: i32,
        ) -> Result<Vec<UserEntity>, SystemError> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .iter()
                .filter(|u| u.username.contains(query))
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    #[async_trait::async_trait]
    impl FriendshipRepository for MemStore {
        async fn find_directed(
            &self,
            sender_id: &Uuid,
            receiver_id: &Uuid,
        ) -> Result<Option<FriendshipEntity>, SystemError> {
            Ok(self
                .friendships
                .lock()
                .unwrap()
                .iter()
                .find(|f| f.sender_id == *sender_id && f.receiver_id == *receiver_id)
                .cloned())
        }

        async fn find_by_id(&self, id: &Uuid) -> Result<Option<FriendshipEntity>, SystemError> {
            Ok(self.friendships.lock().unwrap().iter().find(|f| f.id == *id).cloned())
        }

        async fn find_between(
            &self,
            a: &Uuid,
            b: &Uuid,
        ) -> Result<Vec<FriendshipEntity>, SystemError> {
            Ok(self
                .friendships
                .lock()
                .unwrap()
                .iter()
                .filter(|f| {
                    (f.sender_id == *a && f.receiver_id == *b)
                        || (f.sender_id == *b && f.receiver_id == *a)
                })
                .cloned()
                .collect())
        }

        async fn create_pending(
            &self,
            sender_id: &Uuid,
            receiver_id: &Uuid,
        ) -> Result<FriendshipEntity, SystemError> {
            let mut rows = self.friendships.lock().unwrap();
            if rows.iter().any(|f| f.sender_id == *sender_id && f.receiver_id == *receiver_id) {
                return Err(SystemError::UniqueViolation(None));
            }
            let record = FriendshipEntity {
                id: Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext)),
                sender_id: *sender_id,
                receiver_id: *receiver_id,
                status: FriendshipStatus::Pending,
                requested_at: Utc::now(),
                handled_at: None,
                handled_type: None,
            };
            rows.push(record.clone());
            Ok(record)
        }

        async fn mark_handled(
            &self,
            id: &Uuid,
            status: FriendshipStatus,
            handled_type: HandledType,
            at: DateTime<Utc>,
        ) -> Result<FriendshipEntity, SystemError> {
            let mut rows = self.friendships.lock().unwrap();
            let record = rows
                .iter_mut()
                .find(|f| f.id == *id)
                .ok_or_else(|| SystemError::not_found("Friend request not found"))?;
            record.status = status;
            record.handled_type = Some(handled_type);
            record.handled_at = Some(at);
            Ok(record.clone())
        }

        async fn approve_pair(
            &self,
            request_id: &Uuid,
            at: DateTime<Utc>,
        ) -> Result<FriendshipEntity, SystemError> {
            let mut rows = self.friendships.lock().unwrap();

            let (sender_id, receiver_id, approved) = {
                let record = rows
                    .iter_mut()
                    .find(|f| f.id == *request_id)
                    .ok_or_else(|| SystemError::not_found("Friend request not found"))?;
                if record.status != FriendshipStatus::Pending {
                    return Err(SystemError::conflict("Friend request already handled"));
                }
                record.status = FriendshipStatus::Approved;
                record.handled_type = Some(HandledType::Accept);
                record.handled_at = Some(at);
                (record.sender_id, record.receiver_id, record.clone())
            };

            match rows
                .iter_mut()
                .find(|f| f.sender_id == receiver_id && f.receiver_id == sender_id)
            {
                Some(reverse) => {
                    reverse.status = FriendshipStatus::Approved;
                    reverse.handled_type = Some(HandledType::Accept);
                    reverse.handled_at = Some(at);
                }
                None => rows.push(FriendshipEntity {
                    id: Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext)),
                    sender_id: receiver_id,
                    receiver_id: sender_id,
                    status: FriendshipStatus::Approved,
                    requested_at: at,
                    handled_at: Some(at),
                    handled_type: Some(HandledType::Accept),
                }),
            }

            Ok(approved)
        }

        async fn delete_by_id(&self, id: &Uuid) -> Result<bool, SystemError> {
            let mut rows = self.friendships.lock().unwrap();
            let before = rows.len();
            rows.retain(|f| f.id != *id);
            Ok(rows.len() < before)
        }

        async fn delete_between(&self, a: &Uuid, b: &Uuid) -> Result<u64, SystemError> {
            let mut rows = self.friendships.lock().unwrap();
            let before = rows.len();
            rows.retain(|f| {
                !((f.sender_id == *a && f.receiver_id == *b)
                    || (f.sender_id == *b && f.receiver_id == *a))
            });
            Ok((before - rows.len()) as u64)
        }

        async fn exists_approved_between(&self, a: &Uuid, b: &Uuid) -> Result<bool, SystemError> {
            Ok(self.friendships.lock().unwrap().iter().any(|f| {
                f.status == FriendshipStatus::Approved
                    && ((f.sender_id == *a && f.receiver_id == *b)
                        || (f.sender_id == *b && f.receiver_id == *a))
            }))
        }

        async fn count_approved_partners(&self, user_id: &Uuid) -> Result<i64, SystemError> {
            Ok(self.partner_set(user_id).len() as i64)
        }

        async fn list_approved_partner_ids(
            &self,
            user_id: &Uuid,
        ) -> Result<Vec<Uuid>, SystemError> {
            Ok(self.partner_set(user_id).into_iter().collect())
        }

        async fn list_approved_partners(
            &self,
            user_id: &Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<PartnerRow>, SystemError> {
            let mut partners: Vec<(Uuid, Option<DateTime<Utc>>)> = Vec::new();
            for f in self.friendships.lock().unwrap().iter() {
                if f.status != FriendshipStatus::Approved {
                    continue;
                }
                let partner = if f.sender_id == *user_id {
                    f.receiver_id
                } else if f.receiver_id == *user_id {
                    f.sender_id
                } else {
                    continue;
                };
                match partners.iter_mut().find(|(id, _)| *id == partner) {
                    Some(entry) => entry.1 = entry.1.max(f.handled_at),
                    None => partners.push((partner, f.handled_at)),
                }
            }
            partners.sort_by(|a, b| b.1.cmp(&a.1));

            let users = self.users.lock().unwrap();
            Ok(partners
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .filter_map(|(id, became_friends_at)| {
                    users.iter().find(|u| u.id == id).map(|u| PartnerRow {
                        friend_id: u.id,
                        username: u.username.clone(),
                        points: u.points,
                        last_active_at: u.last_active_at,
                        became_friends_at,
                    })
                })
                .collect())
        }

        async fn find_pending_received(
            &self,
            user_id: &Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<RequestRow>, SystemError> {
            Ok(self.pending_rows(user_id, true, limit, offset))
        }

        async fn count_pending_received(&self, user_id: &Uuid) -> Result<i64, SystemError> {
            Ok(self
                .friendships
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.receiver_id == *user_id && f.status == FriendshipStatus::Pending)
                .count() as i64)
        }

        async fn find_pending_sent(
            &self,
            user_id: &Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<RequestRow>, SystemError> {
            Ok(self.pending_rows(user_id, false, limit, offset))
        }

        async fn count_pending_sent(&self, user_id: &Uuid) -> Result<i64, SystemError> {
            Ok(self
                .friendships
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.sender_id == *user_id && f.status == FriendshipStatus::Pending)
                .count() as i64)
        }
    }

    impl MemStore {
        fn partner_set(&self, user_id: &Uuid) -> HashSet<Uuid> {
            self.friendships
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.status == FriendshipStatus::Approved)
                .filter_map(|f| {
                    if f.sender_id == *user_id {
                        Some(f.receiver_id)
                    } else if f.receiver_id == *user_id {
                        Some(f.sender_id)
                    } else {
                        None
                    }
                })
                .collect()
        }

        fn pending_rows(
            &self,
            user_id: &Uuid,
            received: bool,
            limit: i64,
            offset: i64,
        ) -> Vec<RequestRow> {
            let rows = self.friendships.lock().unwrap();
            let users = self.users.lock().unwrap();
            let mut pending: Vec<&FriendshipEntity> = rows
                .iter()
                .filter(|f| f.status == FriendshipStatus::Pending)
                .filter(|f| {
                    if received {
                        f.receiver_id == *user_id
                    } else {
                        f.sender_id == *user_id
                    }
                })
                .collect();
            pending.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
            pending
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .filter_map(|f| {
                    let counterpart = if received { f.sender_id } else { f.receiver_id };
                    users.iter().find(|u| u.id == counterpart).map(|u| RequestRow {
                        request_id: f.id,
                        friend_id: u.id,
                        username: u.username.clone(),
                        points: u.points,
                        last_active_at: u.last_active_at,
                        requested_at: f.requested_at,
                    })
                })
                .collect()
        }
    }

    /// Delegates to the shared store but always loses the insert race: by the
    /// time `create_pending` runs, a rival writer has claimed the pair and the
    /// uniqueness constraint fires. `winner_approved` controls whether the
    /// rival left the pair pending or completed a mutual acceptance.
    struct RacyStore {
        inner: Arc<MemStore>,
        winner_approved: bool,
    }

    #[async_trait::async_trait]
    impl FriendshipRepository for RacyStore {
        async fn find_directed(
            &self,
            sender_id: &Uuid,
            receiver_id: &Uuid,
        ) -> Result<Option<FriendshipEntity>, SystemError> {
            self.inner.find_directed(sender_id, receiver_id).await
        }

        async fn find_by_id(&self, id: &Uuid) -> Result<Option<FriendshipEntity>, SystemError> {
            FriendshipRepository::find_by_id(self.inner.as_ref(), id).await
        }

        async fn find_between(
            &self,
            a: &Uuid,
            b: &Uuid,
        ) -> Result<Vec<FriendshipEntity>, SystemError> {
            self.inner.find_between(a, b).await
        }

        async fn create_pending(
            &self,
            sender_id: &Uuid,
            receiver_id: &Uuid,
        ) -> Result<FriendshipEntity, SystemError> {
            if self.winner_approved {
                let at = Utc::now();
                let mut rows = self.inner.friendships.lock().unwrap();
                for (s, r) in [(sender_id, receiver_id), (receiver_id, sender_id)] {
                    rows.push(FriendshipEntity {
                        id: Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext)),
                        sender_id: *s,
                        receiver_id: *r,
                        status: FriendshipStatus::Approved,
                        requested_at: at,
                        handled_at: Some(at),
                        handled_type: Some(HandledType::Accept),
                    });
                }
            }
            Err(SystemError::UniqueViolation(None))
        }

        async fn mark_handled(
            &self,
            id: &Uuid,
            status: FriendshipStatus,
            handled_type: HandledType,
            at: DateTime<Utc>,
        ) -> Result<FriendshipEntity, SystemError> {
            self.inner.mark_handled(id, status, handled_type, at).await
        }

        async fn approve_pair(
            &self,
            request_id: &Uuid,
            at: DateTime<Utc>,
        ) -> Result<FriendshipEntity, SystemError> {
            self.inner.approve_pair(request_id, at).await
        }

        async fn delete_by_id(&self, id: &Uuid) -> Result<bool, SystemError> {
            self.inner.delete_by_id(id).await
        }

        async fn delete_between(&self, a: &Uuid, b: &Uuid) -> Result<u64, SystemError> {
            self.inner.delete_between(a, b).await
        }

        async fn exists_approved_between(&self, a: &Uuid, b: &Uuid) -> Result<bool, SystemError> {
            self.inner.exists_approved_between(a, b).await
        }

        async fn count_approved_partners(&self, user_id: &Uuid) -> Result<i64, SystemError> {
            self.inner.count_approved_partners(user_id).await
        }

        async fn list_approved_partner_ids(
            &self,
            user_id: &Uuid,
        ) -> Result<Vec<Uuid>, SystemError> {
            self.inner.list_approved_partner_ids(user_id).await
        }

        async fn list_approved_partners(
            &self,
            user_id: &Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<PartnerRow>, SystemError> {
            self.inner.list_approved_partners(user_id, limit, offset).await
        }

        async fn find_pending_received(
            &self,
            user_id: &Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<RequestRow>, SystemError> {
            self.inner.find_pending_received(user_id, limit, offset).await
        }

        async fn count_pending_received(&self, user_id: &Uuid) -> Result<i64, SystemError> {
            self.inner.count_pending_received(user_id).await
        }

        async fn find_pending_sent(
            &self,
            user_id: &Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<RequestRow>, SystemError> {
            self.inner.find_pending_sent(user_id, limit, offset).await
        }

        async fn count_pending_sent(&self, user_id: &Uuid) -> Result<i64, SystemError> {
            self.inner.count_pending_sent(user_id).await
        }
    }

    fn setup(usernames: &[&str]) -> (Arc<MemStore>, Vec<Uuid>, FriendService<MemStore, MemStore>) {
        let store = Arc::new(MemStore::default());
        let ids = usernames.iter().map(|name| store.add_user(name)).collect();
        let service = FriendService::with_dependencies(store.clone(), store.clone());
        (store, ids, service)
    }

    #[actix_web::test]
    async fn send_request_creates_pending_record() {
        let (store, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        let response = service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        assert_eq!(response.status, "pending");
        assert_eq!(response.sender_id, u1);
        assert_eq!(response.receiver_id, u2);

        let record = store.find_directed(&u1, &u2).await.unwrap().unwrap();
        assert_eq!(record.status, FriendshipStatus::Pending);
        assert!(store.find_directed(&u2, &u1).await.unwrap().is_none());
    }

    #[actix_web::test]
    async fn accept_synchronizes_both_directions() {
        let (store, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        let response = service
            .handle_friend_request(u2, &UserRef::Id(u1), HandleDecision::Accept)
            .await
            .unwrap();
        assert_eq!(response.status, "approved");

        let forward = store.find_directed(&u1, &u2).await.unwrap().unwrap();
        let reverse = store.find_directed(&u2, &u1).await.unwrap().unwrap();
        assert_eq!(forward.status, FriendshipStatus::Approved);
        assert_eq!(reverse.status, FriendshipStatus::Approved);
        assert_eq!(forward.handled_type, Some(HandledType::Accept));

        assert_eq!(service.get_friend_count(u1).await.unwrap(), 1);
        assert_eq!(service.get_friend_count(u2).await.unwrap(), 1);
        assert!(service.is_friend(u1, &UserRef::Id(u2)).await.unwrap());
        assert!(service.is_friend(u2, &UserRef::Id(u1)).await.unwrap());
    }

    #[actix_web::test]
    async fn counter_request_resolves_as_mutual_acceptance() {
        let (store, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        let response = service.add_friend(u2, &UserRef::Id(u1)).await.unwrap();

        // Not a second pending request: the collision is an implicit accept.
        assert_eq!(response.status, "approved");
        let records = store.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|f| f.status == FriendshipStatus::Approved));
        assert_eq!(service.get_friend_count(u1).await.unwrap(), 1);
        assert_eq!(service.get_friend_count(u2).await.unwrap(), 1);
    }

    #[actix_web::test]
    async fn duplicate_request_is_a_conflict() {
        let (_, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        let err = service.add_friend(u1, &UserRef::Id(u2)).await.unwrap_err();
        assert!(matches!(err, SystemError::Conflict(_)));
    }

    #[actix_web::test]
    async fn adding_an_existing_friend_is_a_conflict() {
        let (_, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        service.handle_friend_request(u2, &UserRef::Id(u1), HandleDecision::Accept).await.unwrap();

        let err = service.add_friend(u1, &UserRef::Id(u2)).await.unwrap_err();
        assert!(matches!(err, SystemError::Conflict(_)));
        let err = service.add_friend(u2, &UserRef::Id(u1)).await.unwrap_err();
        assert!(matches!(err, SystemError::Conflict(_)));
    }

    #[actix_web::test]
    async fn self_request_is_rejected() {
        let (_, ids, service) = setup(&["alice"]);
        let u1 = ids[0];

        let err = service.add_friend(u1, &UserRef::Id(u1)).await.unwrap_err();
        assert!(matches!(err, SystemError::BadRequest(_)));

        let err = service.add_friend(u1, &UserRef::Username("alice".into())).await.unwrap_err();
        assert!(matches!(err, SystemError::BadRequest(_)));
    }

    #[actix_web::test]
    async fn unknown_target_is_not_found() {
        let (_, ids, service) = setup(&["alice"]);
        let u1 = ids[0];

        let err =
            service.add_friend(u1, &UserRef::Username("nobody".into())).await.unwrap_err();
        assert!(matches!(err, SystemError::NotFound(_)));
    }

    #[actix_web::test]
    async fn username_ref_resolves_to_the_same_user() {
        let (store, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        let response = service.add_friend(u1, &UserRef::Username("Bob".into())).await.unwrap();
        assert_eq!(response.receiver_id, u2);
        assert!(store.find_directed(&u1, &u2).await.unwrap().is_some());
    }

    #[actix_web::test]
    async fn reject_keeps_history_and_allows_fresh_request() {
        let (store, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        let response = service
            .handle_friend_request(u2, &UserRef::Id(u1), HandleDecision::Reject)
            .await
            .unwrap();
        assert_eq!(response.status, "rejected");
        assert_eq!(response.handled_type.as_deref(), Some("reject"));

        let record = store.find_directed(&u1, &u2).await.unwrap().unwrap();
        assert_eq!(record.status, FriendshipStatus::Rejected);
        assert!(!service.is_friend(u1, &UserRef::Id(u2)).await.unwrap());

        // The stale rejected record is dropped on re-request instead of
        // blocking the pair forever.
        let retry = service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        assert_eq!(retry.status, "pending");
        let records = store.find_between(&u1, &u2).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, FriendshipStatus::Pending);
    }

    #[actix_web::test]
    async fn handling_a_decided_request_is_a_conflict() {
        let (_, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        service.handle_friend_request(u2, &UserRef::Id(u1), HandleDecision::Accept).await.unwrap();

        let err = service
            .handle_friend_request(u2, &UserRef::Id(u1), HandleDecision::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, SystemError::Conflict(_)));
    }

    #[actix_web::test]
    async fn handling_without_an_incoming_request_is_not_found() {
        let (_, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        // u1 sent the request, so u1 has nothing to handle from u2.
        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        let err = service
            .handle_friend_request(u1, &UserRef::Id(u2), HandleDecision::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, SystemError::NotFound(_)));
    }

    #[actix_web::test]
    async fn remove_friend_is_symmetric_and_total() {
        let (store, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        service.handle_friend_request(u2, &UserRef::Id(u1), HandleDecision::Accept).await.unwrap();

        service.remove_friend(u2, &UserRef::Id(u1)).await.unwrap();
        assert!(!service.is_friend(u1, &UserRef::Id(u2)).await.unwrap());
        assert!(!service.is_friend(u2, &UserRef::Id(u1)).await.unwrap());
        assert!(store.find_between(&u1, &u2).await.unwrap().is_empty());

        let err = service.remove_friend(u1, &UserRef::Id(u2)).await.unwrap_err();
        assert!(matches!(err, SystemError::NotFound(_)));
    }

    #[actix_web::test]
    async fn cancel_is_sender_only_and_not_repeatable() {
        let (_, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        let request = service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();

        let err = service.cancel_friend_request(u2, request.friendship_id).await.unwrap_err();
        assert!(matches!(err, SystemError::Forbidden(_)));

        service.cancel_friend_request(u1, request.friendship_id).await.unwrap();
        let err = service.cancel_friend_request(u1, request.friendship_id).await.unwrap_err();
        assert!(matches!(err, SystemError::NotFound(_)));
    }

    #[actix_web::test]
    async fn cancel_of_a_decided_request_is_a_conflict() {
        let (_, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        let request = service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        service.handle_friend_request(u2, &UserRef::Id(u1), HandleDecision::Accept).await.unwrap();

        let err = service.cancel_friend_request(u1, request.friendship_id).await.unwrap_err();
        assert!(matches!(err, SystemError::Conflict(_)));
    }

    #[actix_web::test]
    async fn friend_count_matches_distinct_id_list() {
        let (_, ids, service) = setup(&["alice", "bob", "carol"]);
        let (u1, u2, u3) = (ids[0], ids[1], ids[2]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();
        service.handle_friend_request(u2, &UserRef::Id(u1), HandleDecision::Accept).await.unwrap();
        service.add_friend(u3, &UserRef::Id(u1)).await.unwrap();
        service.add_friend(u1, &UserRef::Id(u3)).await.unwrap();

        let friend_ids = service.get_friend_ids(u1).await.unwrap();
        assert_eq!(service.get_friend_count(u1).await.unwrap(), friend_ids.len() as i64);
        assert_eq!(friend_ids.len(), 2);

        service.remove_friend(u1, &UserRef::Id(u2)).await.unwrap();
        let friend_ids = service.get_friend_ids(u1).await.unwrap();
        assert_eq!(service.get_friend_count(u1).await.unwrap(), friend_ids.len() as i64);
        assert_eq!(friend_ids, vec![u3]);
    }

    #[actix_web::test]
    async fn friend_list_pages_over_deduplicated_partners() {
        let (store, ids, service) = setup(&["alice", "bob", "carol", "dave"]);
        let u1 = ids[0];

        // Approve at controlled times so the ordering is deterministic.
        let base = Utc::now();
        for (offset, other) in ids[1..].iter().enumerate() {
            let request = service.add_friend(*other, &UserRef::Id(u1)).await.unwrap();
            store
                .approve_pair(&request.friendship_id, base + Duration::seconds(offset as i64 + 1))
                .await
                .unwrap();
        }

        let first = service
            .get_friend_list(u1, &Page { page: 1, size: 2 })
            .await
            .unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.friends.len(), 2);
        // Most recently approved first: dave, then carol.
        assert_eq!(first.friends[0].friend_username, "dave");
        assert_eq!(first.friends[1].friend_username, "carol");
        assert!(first.friends.iter().all(|f| f.status == "approved"));

        let second = service
            .get_friend_list(u1, &Page { page: 2, size: 2 })
            .await
            .unwrap();
        assert_eq!(second.total, 3);
        assert_eq!(second.friends.len(), 1);
        assert_eq!(second.friends[0].friend_username, "bob");
    }

    #[actix_web::test]
    async fn pending_and_sent_lists_are_mirrored() {
        let (_, ids, service) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        service.add_friend(u1, &UserRef::Id(u2)).await.unwrap();

        let sent = service.get_sent_requests(u1, &Page::default()).await.unwrap();
        assert_eq!(sent.total, 1);
        assert_eq!(sent.friends[0].friend_id, u2);
        assert_eq!(sent.friends[0].status, "pending");
        assert!(sent.friends[0].since.is_some());

        let pending = service.get_pending_requests(u2, &Page::default()).await.unwrap();
        assert_eq!(pending.total, 1);
        assert_eq!(pending.friends[0].friend_id, u1);

        assert_eq!(service.get_sent_requests(u2, &Page::default()).await.unwrap().total, 0);
        assert_eq!(service.get_pending_requests(u1, &Page::default()).await.unwrap().total, 0);
    }

    #[actix_web::test]
    async fn store_rejects_duplicate_ordered_pair() {
        let (store, ids, _) = setup(&["alice", "bob"]);
        let (u1, u2) = (ids[0], ids[1]);

        store.create_pending(&u1, &u2).await.unwrap();
        let err = store.create_pending(&u1, &u2).await.unwrap_err();
        assert!(matches!(err, SystemError::UniqueViolation(_)));
        // The reverse direction is a different ordered pair and stays legal.
        store.create_pending(&u2, &u1).await.unwrap();
    }

    #[actix_web::test]
    async fn lost_insert_race_resolves_as_conflict() {
        let store = Arc::new(MemStore::default());
        let u1 = store.add_user("alice");
        let u2 = store.add_user("bob");

        // The rival left the pair pending: the violation re-reads as a
        // duplicate request, not an internal error.
        let racy = Arc::new(RacyStore { inner: store.clone(), winner_approved: false });
        let service = FriendService::with_dependencies(racy, store.clone());
        let err = service.add_friend(u1, &UserRef::Id(u2)).await.unwrap_err();
        assert!(matches!(&err, SystemError::Conflict(msg) if msg.contains("already sent")));
        assert!(store.records().is_empty());

        // The rival completed a mutual acceptance: the violation re-reads as
        // already friends.
        let racy = Arc::new(RacyStore { inner: store.clone(), winner_approved: true });
        let service = FriendService::with_dependencies(racy, store.clone());
        let err = service.add_friend(u1, &UserRef::Id(u2)).await.unwrap_err();
        assert!(matches!(&err, SystemError::Conflict(msg) if msg.contains("already friends")));
    }

    #[actix_web::test]
    async fn reads_require_an_existing_subject() {
        let (_, _, service) = setup(&["alice"]);
        let ghost = Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext));

        let err = service.get_friend_count(ghost).await.unwrap_err();
        assert!(matches!(err, SystemError::NotFound(_)));
        let err = service.get_friend_list(ghost, &Page::default()).await.unwrap_err();
        assert!(matches!(err, SystemError::NotFound(_)));
    }
}
