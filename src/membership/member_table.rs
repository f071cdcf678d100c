use std::sync::RwLock;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::membership::member::{Member, MemberId};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MemberUpdate {
    /// the member was not known before
    Added(Member),
    /// the member was known, its data and liveness timestamp were refreshed
    Refreshed(Member),
}

struct MemberEntry {
    member: Member,
    last_heard: Instant,
}

/// The authoritative table of remote members. It is read far more often than it is written to,
///  and it is only ever locked for short, non-blocking sections.
#[derive(Default)]
pub struct MemberTable {
    members: RwLock<FxHashMap<MemberId, MemberEntry>>,
}

impl MemberTable {
    pub fn new() -> MemberTable {
        Default::default()
    }

    /// Registers a sign of life from a member. If a member with the same unique id is known, the
    ///  most recently received data replaces the previous data.
    pub fn member_alive(&self, member: Member, now: Instant) -> MemberUpdate {
        let mut members = self.members.write().unwrap();
        let id = member.unique_id();
        let result = if members.contains_key(&id) {
            MemberUpdate::Refreshed(member.clone())
        }
        else {
            MemberUpdate::Added(member.clone())
        };
        members.insert(id, MemberEntry { member, last_heard: now });
        result
    }

    pub fn remove(&self, id: &MemberId) -> Option<Member> {
        self.members.write().unwrap()
            .remove(id)
            .map(|e| e.member)
    }

    /// Removes all members that were not heard from for longer than `timeout`, returning them.
    ///  A member is returned by at most one call.
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<Member> {
        let mut members = self.members.write().unwrap();
        let expired = members.iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_heard) > timeout)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        expired.into_iter()
            .filter_map(|id| members.remove(&id))
            .map(|e| {
                trace!(member = ?e.member, "member expired");
                e.member
            })
            .collect()
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.read().unwrap()
            .values()
            .map(|e| e.member.clone())
            .collect()
    }

    pub fn has_members(&self) -> bool {
        !self.members.read().unwrap().is_empty()
    }

    /// resolves a possibly stale reference to the current data of the member with the same
    ///  unique id, even if its address changed since
    pub fn get(&self, member: &Member) -> Option<Member> {
        self.members.read().unwrap()
            .get(&member.unique_id())
            .map(|e| e.member.clone())
    }

    pub fn clear(&self) -> Vec<Member> {
        self.members.write().unwrap()
            .drain()
            .map(|(_, e)| e.member)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use crate::test_util::member::test_member;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_added_then_refreshed() {
        let table = MemberTable::new();
        let now = Instant::now();

        assert!(!table.has_members());
        assert_eq!(table.member_alive(test_member(1), now), MemberUpdate::Added(test_member(1)));
        assert_eq!(table.member_alive(test_member(1), now), MemberUpdate::Refreshed(test_member(1)));
        assert_eq!(table.member_alive(test_member(2), now), MemberUpdate::Added(test_member(2)));

        let mut members = table.members();
        members.sort_by_key(|m| m.port());
        assert_eq!(members, vec![test_member(1), test_member(2)]);
        assert!(table.has_members());
    }

    #[tokio::test(start_paused = true)]
    async fn test_most_recent_data_wins() {
        let table = MemberTable::new();
        let now = Instant::now();

        table.member_alive(test_member(1), now);
        table.member_alive(test_member(1).with(|d| d.payload = Bytes::from_static(b"new")), now);

        let current = table.get(&test_member(1)).unwrap();
        assert_eq!(current.payload().as_ref(), b"new");
        assert_eq!(table.members().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_member_with_new_address() {
        let table = MemberTable::new();
        let now = Instant::now();

        table.member_alive(test_member(1), now);
        table.member_alive(test_member(1).with(|d| d.port = 4711), now);

        let current = table.get(&test_member(1)).unwrap();
        assert_eq!(current.port(), 4711);
        assert_eq!(current.unique_id(), test_member(1).unique_id());
        assert!(table.get(&test_member(2)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire() {
        let table = MemberTable::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(3);

        table.member_alive(test_member(1), start);
        table.member_alive(test_member(2), start + Duration::from_secs(2));

        assert!(table.expire(start + timeout, timeout).is_empty());

        let expired = table.expire(start + Duration::from_millis(3001), timeout);
        assert_eq!(expired, vec![test_member(1)]);
        assert!(table.expire(start + Duration::from_millis(3001), timeout).is_empty());
        assert_eq!(table.members(), vec![test_member(2)]);

        table.member_alive(test_member(2), start + Duration::from_secs(5));
        assert!(table.expire(start + Duration::from_secs(8), timeout).is_empty());
        assert_eq!(table.expire(start + Duration::from_secs(9), timeout), vec![test_member(2)]);
        assert!(!table.has_members());
    }

    #[test]
    fn test_get_unknown() {
        let table = MemberTable::new();
        assert!(table.get(&test_member(1)).is_none());
        assert!(table.remove(&test_member(1).unique_id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove() {
        let table = MemberTable::new();
        table.member_alive(test_member(1), Instant::now());
        assert_eq!(table.remove(&test_member(1).unique_id()), Some(test_member(1)));
        assert!(table.get(&test_member(1)).is_none());
    }
}
