use actix_web::{delete, get, post, put, web, HttpRequest};
use uuid::Uuid;

use crate::modules::friendship::{
    model::{self, UserRef},
    repository_pg::FriendshipRepositoryPg,
    service::FriendService,
};
use crate::modules::user::repository_pg::UserRepositoryPg;
use crate::{
    api::{error, success},
    middlewares::get_claims,
    utils::{Page, ValidatedJson, ValidatedQuery},
};

pub type FriendshipService = FriendService<FriendshipRepositoryPg, UserRepositoryPg>;

#[post("")]
pub async fn add_friend(
    friend_service: web::Data<FriendshipService>,
    body: ValidatedJson<model::AddFriendBody>,
    req: HttpRequest,
) -> Result<success::Success<model::FriendshipResponse>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    let friendship = friend_service.add_friend(actor_id, &body.0.friend).await?;

    let message = if friendship.status == "approved" {
        "Friend request accepted"
    } else {
        "Friend request sent"
    };
    Ok(success::Success::created(Some(friendship)).message(message))
}

#[put("/requests")]
pub async fn handle_request(
    friend_service: web::Data<FriendshipService>,
    body: ValidatedJson<model::HandleFriendBody>,
    req: HttpRequest,
) -> Result<success::Success<model::FriendshipResponse>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    let friendship =
        friend_service.handle_friend_request(actor_id, &body.0.friend, body.0.decision).await?;
    Ok(success::Success::ok(Some(friendship)).message("Friend request handled"))
}

#[delete("/requests/{request_id}")]
pub async fn cancel_request(
    friend_service: web::Data<FriendshipService>,
    request_id: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<success::Success<()>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    friend_service.cancel_friend_request(actor_id, request_id.into_inner()).await?;
    Ok(success::Success::no_content())
}

#[get("")]
pub async fn get_friends(
    friend_service: web::Data<FriendshipService>,
    page: ValidatedQuery<Page>,
    req: HttpRequest,
) -> Result<success::Success<model::FriendListResponse>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    let friends = friend_service.get_friend_list(actor_id, &page.0).await?;
    Ok(success::Success::ok(Some(friends)).message("Friends retrieved successfully"))
}

#[get("/requests/pending")]
pub async fn get_pending_requests(
    friend_service: web::Data<FriendshipService>,
    page: ValidatedQuery<Page>,
    req: HttpRequest,
) -> Result<success::Success<model::FriendListResponse>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    let requests = friend_service.get_pending_requests(actor_id, &page.0).await?;
    Ok(success::Success::ok(Some(requests)).message("Pending requests retrieved successfully"))
}

#[get("/requests/sent")]
pub async fn get_sent_requests(
    friend_service: web::Data<FriendshipService>,
    page: ValidatedQuery<Page>,
    req: HttpRequest,
) -> Result<success::Success<model::FriendListResponse>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    let requests = friend_service.get_sent_requests(actor_id, &page.0).await?;
    Ok(success::Success::ok(Some(requests)).message("Sent requests retrieved successfully"))
}

#[get("/check/{friend}")]
pub async fn check_friend(
    friend_service: web::Data<FriendshipService>,
    friend: web::Path<String>,
    req: HttpRequest,
) -> Result<success::Success<model::FriendCheckResponse>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    let is_friend = friend_service.is_friend(actor_id, &UserRef::parse(&friend)).await?;
    Ok(success::Success::ok(Some(model::FriendCheckResponse { is_friend })))
}

#[get("/count")]
pub async fn get_friend_count(
    friend_service: web::Data<FriendshipService>,
    req: HttpRequest,
) -> Result<success::Success<model::FriendCountResponse>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    let count = friend_service.get_friend_count(actor_id).await?;
    Ok(success::Success::ok(Some(model::FriendCountResponse { count })))
}

#[get("/ids")]
pub async fn get_friend_ids(
    friend_service: web::Data<FriendshipService>,
    req: HttpRequest,
) -> Result<success::Success<Vec<Uuid>>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    let ids = friend_service.get_friend_ids(actor_id).await?;
    Ok(success::Success::ok(Some(ids)))
}

#[delete("/{friend}")]
pub async fn remove_friend(
    friend_service: web::Data<FriendshipService>,
    friend: web::Path<String>,
    req: HttpRequest,
) -> Result<success::Success<()>, error::Error> {
    let actor_id = get_claims(&req)?.sub;
    friend_service.remove_friend(actor_id, &UserRef::parse(&friend)).await?;
    Ok(success::Success::no_content())
}
