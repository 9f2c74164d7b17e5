use crate::models::{EntityId, RankingDomain};

pub fn friend_set_key(owner_id: EntityId) -> String {
    format!("friends:{}", owner_id)
}

pub fn interaction_key(owner_id: EntityId) -> String {
    format!("interaction:{}", owner_id)
}

pub fn ranking_key(domain: RankingDomain) -> String {
    format!("ranking:{}:realtime", domain.name())
}

pub fn refresh_lock_key(view: &str) -> String {
    format!("lock:refresh:{}", view)
}

pub fn view_key(view: &str) -> String {
    format!("view:{}", view)
}
