use crate::modules::friendship::handle::*;
use actix_web::web::{scope, ServiceConfig};

pub fn configure(cfg: &mut ServiceConfig) {
    // Literal segments first so they are never swallowed by "/{friend}".
    cfg.service(
        scope("/friends")
            .service(get_pending_requests)
            .service(get_sent_requests)
            .service(handle_request)
            .service(cancel_request)
            .service(check_friend)
            .service(get_friend_count)
            .service(get_friend_ids)
            .service(add_friend)
            .service(get_friends)
            .service(remove_friend),
    );
}
