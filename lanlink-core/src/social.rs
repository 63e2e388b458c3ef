//! Follow graph, posts with likes, and direct messages.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::{CoreError, DispatchError, Event, Node, OutboundAction};
use crate::identity::{random_hex_id, PeerId};
use crate::protocol::{Avatar, FollowRequest, LikeAction, Message, MessageKind};
use crate::router::Inbound;
use crate::token::{self, Scope};

#[derive(Debug, Clone)]
pub struct SentPost {
    pub content: String,
    pub timestamp: String,
    pub token: String,
    /// Distinct likers; a repeated LIKE from one peer counts once.
    pub likes: HashSet<PeerId>,
    pub created: f64,
}

#[derive(Debug, Clone)]
pub struct ReceivedPost {
    pub author: PeerId,
    pub content: String,
    pub timestamp: String,
    pub token: String,
    pub liked: bool,
    pub received: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone)]
pub struct DmRecord {
    pub message_id: String,
    pub from: PeerId,
    pub to: PeerId,
    pub content: String,
    pub timestamp: f64,
    pub direction: Direction,
    pub token: String,
    pub avatar: Option<Avatar>,
}

#[derive(Debug, Default)]
pub struct SocialState {
    following: HashSet<PeerId>,
    followers: HashSet<PeerId>,
    /// Keyed by the post's TIMESTAMP string.
    sent_posts: BTreeMap<String, SentPost>,
    received_posts: BTreeMap<String, ReceivedPost>,
    /// Conversations keyed by the other party.
    dms: HashMap<PeerId, Vec<DmRecord>>,
    /// message id -> declared expiry override. Local bookkeeping only.
    revoked_tokens: HashMap<String, f64>,
}

impl SocialState {
    pub(crate) fn purge_posts(&mut self, now: f64, ttl: f64) {
        let before = self.sent_posts.len() + self.received_posts.len();
        self.sent_posts.retain(|_, p| now - p.created <= ttl);
        self.received_posts.retain(|_, p| now - p.received <= ttl);
        let purged = before - self.sent_posts.len() - self.received_posts.len();
        if purged > 0 {
            tracing::info!(purged, "expired posts purged");
        }
    }

    fn has_dm(&self, peer: &PeerId, message_id: &str) -> bool {
        self.dms
            .get(peer)
            .is_some_and(|log| log.iter().any(|r| r.message_id == message_id))
    }
}

impl Node {
    pub fn follow(&mut self, peer: &PeerId, now: f64) -> Result<Vec<OutboundAction>, CoreError> {
        self.send_follow(peer, true, now)
    }

    pub fn unfollow(&mut self, peer: &PeerId, now: f64) -> Result<Vec<OutboundAction>, CoreError> {
        self.send_follow(peer, false, now)
    }

    fn send_follow(
        &mut self,
        peer: &PeerId,
        follow: bool,
        now: f64,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        let to = self.peer_addr(peer)?;
        let request = FollowRequest {
            message_id: random_hex_id(16),
            from: self.profile.id.clone(),
            to: peer.clone(),
            timestamp: now,
            token: self.issue_token(Scope::Follow, now),
        };
        let msg = if follow {
            Message::Follow(request)
        } else {
            Message::Unfollow(request)
        };
        let mut out = Vec::new();
        self.emit(&mut out, to, &msg, now)?;
        if follow {
            self.social.following.insert(peer.clone());
        } else {
            self.social.following.remove(peer);
        }
        Ok(out)
    }

    /// Broadcast a post to followers. Returns the post's timestamp key with the actions.
    pub fn post(
        &mut self,
        content: &str,
        now: f64,
    ) -> Result<(String, Vec<OutboundAction>), CoreError> {
        let mut timestamp = format!("{now}");
        while self.social.sent_posts.contains_key(&timestamp) {
            timestamp.push('0');
        }
        let token = self.issue_token(Scope::Broadcast, now);
        let msg = Message::Post {
            message_id: random_hex_id(16),
            from: self.profile.id.clone(),
            content: content.to_string(),
            ttl: self.config.timings.post_ttl_secs,
            timestamp: timestamp.clone(),
            token: token.clone(),
        };
        let mut out = Vec::new();
        self.emit(&mut out, self.broadcast_addr(), &msg, now)?;
        self.social.sent_posts.insert(
            timestamp.clone(),
            SentPost {
                content: content.to_string(),
                timestamp: timestamp.clone(),
                token,
                likes: HashSet::new(),
                created: now,
            },
        );
        Ok((timestamp, out))
    }

    pub fn like(&mut self, post_timestamp: &str, now: f64) -> Result<Vec<OutboundAction>, CoreError> {
        self.send_like(post_timestamp, LikeAction::Like, now)
    }

    pub fn unlike(&mut self, post_timestamp: &str, now: f64) -> Result<Vec<OutboundAction>, CoreError> {
        self.send_like(post_timestamp, LikeAction::Unlike, now)
    }

    fn send_like(
        &mut self,
        post_timestamp: &str,
        action: LikeAction,
        now: f64,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        let want = action == LikeAction::Like;
        let post = self
            .social
            .received_posts
            .get(post_timestamp)
            .ok_or_else(|| CoreError::UnknownPost(post_timestamp.to_string()))?;
        if post.liked == want {
            return Err(CoreError::LikeUnchanged(post_timestamp.to_string()));
        }
        let msg = Message::Like {
            from: self.profile.id.clone(),
            to: post.author.clone(),
            post_timestamp: post_timestamp.to_string(),
            action,
            timestamp: now,
            token: self.issue_token(Scope::Broadcast, now),
        };
        let mut out = Vec::new();
        self.emit(&mut out, self.broadcast_addr(), &msg, now)?;
        if let Some(post) = self.social.received_posts.get_mut(post_timestamp) {
            post.liked = want;
        }
        Ok(out)
    }

    /// Send a DM with a fresh chat token. Returns the message id with the actions.
    pub fn send_dm(
        &mut self,
        peer: &PeerId,
        content: &str,
        now: f64,
    ) -> Result<(String, Vec<OutboundAction>), CoreError> {
        self.send_dm_with_token(peer, content, None, now)
    }

    /// Send a DM, optionally overriding the token the receiver will validate.
    pub fn send_dm_with_token(
        &mut self,
        peer: &PeerId,
        content: &str,
        token: Option<&str>,
        now: f64,
    ) -> Result<(String, Vec<OutboundAction>), CoreError> {
        let to = self.peer_addr(peer)?;
        let token = match token {
            Some(t) => t.to_string(),
            None => self.issue_token(Scope::Chat, now),
        };
        let record = DmRecord {
            message_id: random_hex_id(16),
            from: self.profile.id.clone(),
            to: peer.clone(),
            content: content.to_string(),
            timestamp: now,
            direction: Direction::Sent,
            token,
            avatar: self.profile.avatar.clone(),
        };
        let msg = Message::Dm {
            message_id: record.message_id.clone(),
            from: record.from.clone(),
            to: record.to.clone(),
            content: record.content.clone(),
            timestamp: now,
            token: record.token.clone(),
            avatar: record.avatar.clone(),
        };
        // Encode before recording so a failed send leaves no trace.
        let mut out = Vec::new();
        self.emit(&mut out, to, &msg, now)?;
        let id = record.message_id.clone();
        self.social.dms.entry(peer.clone()).or_default().push(record);
        Ok((id, out))
    }

    /// Mark a DM's token as expired as of `at`. Not transmitted to the other party.
    pub fn revoke_dm_token(&mut self, message_id: &str, at: f64) -> Result<(), CoreError> {
        let known = self
            .social
            .dms
            .values()
            .flatten()
            .any(|r| r.message_id == message_id);
        if !known {
            return Err(CoreError::UnknownMessage(message_id.to_string()));
        }
        self.social.revoked_tokens.insert(message_id.to_string(), at);
        Ok(())
    }

    /// Whether a DM's token is expired at `now`, counting local revocations.
    pub fn dm_token_expired(&self, message_id: &str, now: f64) -> bool {
        if let Some(&at) = self.social.revoked_tokens.get(message_id) {
            if now >= at {
                return true;
            }
        }
        let record = self
            .social
            .dms
            .values()
            .flatten()
            .find(|r| r.message_id == message_id);
        match record {
            Some(r) => !token::validate(&r.token, Scope::Chat, None, now),
            None => true,
        }
    }

    pub fn following(&self) -> impl Iterator<Item = &PeerId> {
        self.social.following.iter()
    }

    pub fn followers(&self) -> impl Iterator<Item = &PeerId> {
        self.social.followers.iter()
    }

    pub fn is_following(&self, peer: &PeerId) -> bool {
        self.social.following.contains(peer)
    }

    pub fn sent_posts(&self) -> impl Iterator<Item = &SentPost> {
        self.social.sent_posts.values()
    }

    pub fn received_posts(&self) -> impl Iterator<Item = &ReceivedPost> {
        self.social.received_posts.values()
    }

    pub fn dm_history(&self, peer: &PeerId) -> &[DmRecord] {
        self.social.dms.get(peer).map_or(&[][..], Vec::as_slice)
    }

    pub fn dm_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.social.dms.keys()
    }
}

fn unauthorized(kind: MessageKind, reason: &'static str) -> DispatchError {
    DispatchError::Unauthorized { kind, reason }
}

pub(crate) fn handle_follow(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let kind = inbound.message.kind();
    let (Message::Follow(req) | Message::Unfollow(req)) = inbound.message else {
        return Ok(());
    };
    if req.to != node.profile.id {
        return Ok(());
    }
    if !token::validate(&req.token, Scope::Follow, Some(&req.from), inbound.now) {
        return Err(unauthorized(kind, "invalid follow token"));
    }
    node.push_ack(out, &req.message_id, inbound.source)?;
    let event = if kind == MessageKind::Follow {
        node.social
            .followers
            .insert(req.from.clone())
            .then(|| Event::NewFollower { id: req.from })
    } else {
        node.social
            .followers
            .remove(&req.from)
            .then(|| Event::LostFollower { id: req.from })
    };
    if let Some(event) = event {
        tracing::info!(?event, "follower change");
        out.push(OutboundAction::Notify(event));
    }
    Ok(())
}

pub(crate) fn handle_post(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::Post {
        from,
        content,
        timestamp,
        token: raw_token,
        ..
    } = inbound.message
    else {
        return Ok(());
    };
    if !node.social.following.contains(&from) {
        tracing::debug!(author = %from, "post from unfollowed peer ignored");
        return Ok(());
    }
    if !token::validate(&raw_token, Scope::Broadcast, Some(&from), inbound.now) {
        return Err(unauthorized(MessageKind::Post, "invalid broadcast token"));
    }
    if node.social.received_posts.contains_key(&timestamp) {
        return Ok(());
    }
    node.social.received_posts.insert(
        timestamp.clone(),
        ReceivedPost {
            author: from.clone(),
            content: content.clone(),
            timestamp: timestamp.clone(),
            token: raw_token,
            liked: false,
            received: inbound.now,
        },
    );
    out.push(OutboundAction::Notify(Event::PostReceived {
        from,
        timestamp,
        content,
    }));
    Ok(())
}

pub(crate) fn handle_like(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::Like {
        from,
        to,
        post_timestamp,
        action,
        token: raw_token,
        ..
    } = inbound.message
    else {
        return Ok(());
    };
    // Sent by broadcast; only the author acts on it.
    if to != node.profile.id {
        return Ok(());
    }
    if !token::validate(&raw_token, Scope::Broadcast, Some(&from), inbound.now) {
        return Err(unauthorized(MessageKind::Like, "invalid broadcast token"));
    }
    let Some(post) = node.social.sent_posts.get_mut(&post_timestamp) else {
        tracing::debug!(%post_timestamp, "like for unknown post");
        return Ok(());
    };
    let changed = match action {
        LikeAction::Like => post.likes.insert(from.clone()),
        LikeAction::Unlike => post.likes.remove(&from),
    };
    if changed {
        out.push(OutboundAction::Notify(Event::PostLiked {
            by: from,
            post_timestamp,
            action,
            likes: post.likes.len(),
        }));
    }
    Ok(())
}

pub(crate) fn handle_dm(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::Dm {
        message_id,
        from,
        to,
        content,
        timestamp,
        token: raw_token,
        avatar,
    } = inbound.message
    else {
        return Ok(());
    };
    if to != node.profile.id {
        return Ok(());
    }
    if !token::validate(&raw_token, Scope::Chat, None, inbound.now) {
        return Err(unauthorized(MessageKind::Dm, "invalid chat token"));
    }
    node.push_ack(out, &message_id, inbound.source)?;
    if node.social.has_dm(&from, &message_id) {
        return Ok(());
    }
    node.social.dms.entry(from.clone()).or_default().push(DmRecord {
        message_id: message_id.clone(),
        from: from.clone(),
        to,
        content: content.clone(),
        timestamp,
        direction: Direction::Received,
        token: raw_token,
        avatar: avatar.clone(),
    });
    out.push(OutboundAction::Notify(Event::DmReceived {
        from,
        message_id,
        content,
        avatar,
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{deliver_to, events, introduce, node, sends, source, T0};

    #[test]
    fn dm_acked_end_to_end() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);

        let (id, out) = a.send_dm(b.id(), "hi", T0).unwrap();
        assert!(a.pending_acks().is_pending(&id));
        assert_eq!(a.dm_history(b.id())[0].direction, Direction::Sent);

        let reply = deliver_to(&mut b, source(&a), &out, T0 + 10.0);
        let history = b.dm_history(a.id());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[0].direction, Direction::Received);
        assert!(matches!(&sends(&reply)[0], Message::Ack { message_id, .. } if *message_id == id));

        deliver_to(&mut a, source(&b), &reply, T0 + 10.5);
        assert!(!a.pending_acks().is_pending(&id));
    }

    #[test]
    fn duplicate_dm_acked_not_stored_twice() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);
        let (_, out) = a.send_dm(b.id(), "hi", T0).unwrap();
        deliver_to(&mut b, source(&a), &out, T0);
        let second = deliver_to(&mut b, source(&a), &out, T0 + 2.0);
        assert_eq!(sends(&second).len(), 1);
        assert!(events(&second).is_empty());
        assert_eq!(b.dm_history(a.id()).len(), 1);
    }

    #[test]
    fn expired_dm_token_dropped_without_ack() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);
        let (_, out) = a.send_dm(b.id(), "late", T0).unwrap();
        let OutboundAction::Send { bytes, .. } = &out[0] else { panic!() };
        assert!(matches!(
            b.handle_datagram(bytes, source(&a), T0 + 61.0),
            Err(DispatchError::Unauthorized { .. })
        ));
        assert!(b.dm_history(a.id()).is_empty());
    }

    #[test]
    fn custom_token_is_sent_verbatim() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);
        let (_, out) = a
            .send_dm_with_token(b.id(), "x", Some("alice@10.0.0.1|1|chat"), T0)
            .unwrap();
        let Message::Dm { token, .. } = &sends(&out)[0] else { panic!() };
        assert_eq!(token, "alice@10.0.0.1|1|chat");
        assert!(deliver_to(&mut b, source(&a), &out, T0).is_empty());
    }

    #[test]
    fn dm_to_unknown_peer_fails_cleanly() {
        let mut a = node("alice", "10.0.0.1");
        let ghost = PeerId::from("ghost@10.0.0.9");
        assert!(matches!(a.send_dm(&ghost, "hi", T0), Err(CoreError::UnknownPeer(_))));
        assert!(a.dm_history(&ghost).is_empty());
        assert!(a.pending_acks().is_empty());
    }

    #[test]
    fn revocation_is_local_bookkeeping() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);
        let (id, _) = a.send_dm(b.id(), "hi", T0).unwrap();
        assert!(!a.dm_token_expired(&id, T0 + 1.0));
        a.revoke_dm_token(&id, T0 + 5.0).unwrap();
        assert!(!a.dm_token_expired(&id, T0 + 4.0));
        assert!(a.dm_token_expired(&id, T0 + 5.0));
        assert!(matches!(a.revoke_dm_token("nope", T0), Err(CoreError::UnknownMessage(_))));
    }

    #[test]
    fn follow_updates_both_sides() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);

        let out = a.follow(b.id(), T0).unwrap();
        assert!(a.is_following(b.id()));
        let reply = deliver_to(&mut b, source(&a), &out, T0);
        assert_eq!(events(&reply), vec![Event::NewFollower { id: a.id().clone() }]);
        assert_eq!(b.followers().count(), 1);
        deliver_to(&mut a, source(&b), &reply, T0);
        assert!(a.pending_acks().is_empty());

        let out = a.unfollow(b.id(), T0 + 1.0).unwrap();
        assert!(!a.is_following(b.id()));
        deliver_to(&mut b, source(&a), &out, T0 + 1.0);
        assert_eq!(b.followers().count(), 0);
    }

    #[test]
    fn posts_reach_followers_only() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        let mut c = node("carol", "10.0.0.3");
        introduce(&mut a, &mut b, T0);
        introduce(&mut a, &mut c, T0);
        b.follow(a.id(), T0).unwrap();

        let (ts, out) = a.post("hello", T0 + 1.0).unwrap();
        let got = deliver_to(&mut b, source(&a), &out, T0 + 1.0);
        assert!(matches!(&events(&got)[0], Event::PostReceived { timestamp, .. } if *timestamp == ts));
        assert!(deliver_to(&mut c, source(&a), &out, T0 + 1.0).is_empty());
        assert_eq!(b.received_posts().count(), 1);
        assert_eq!(c.received_posts().count(), 0);
    }

    #[test]
    fn like_toggle_is_guarded_and_counted_once() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);
        b.follow(a.id(), T0).unwrap();
        let (ts, out) = a.post("hello", T0).unwrap();
        deliver_to(&mut b, source(&a), &out, T0);

        let like = b.like(&ts, T0 + 1.0).unwrap();
        assert!(matches!(b.like(&ts, T0 + 1.0), Err(CoreError::LikeUnchanged(_))));
        deliver_to(&mut a, source(&b), &like, T0 + 1.0);
        deliver_to(&mut a, source(&b), &like, T0 + 1.5);
        assert_eq!(a.sent_posts().next().unwrap().likes.len(), 1);

        let unlike = b.unlike(&ts, T0 + 2.0).unwrap();
        deliver_to(&mut a, source(&b), &unlike, T0 + 2.0);
        assert!(a.sent_posts().next().unwrap().likes.is_empty());
        assert!(matches!(b.like("0", T0), Err(CoreError::UnknownPost(_))));
    }

    #[test]
    fn posts_purged_after_ttl() {
        let mut a = node("alice", "10.0.0.1");
        a.post("old", T0).unwrap();
        a.cleanup(T0 + 3599.0);
        assert_eq!(a.sent_posts().count(), 1);
        a.cleanup(T0 + 3601.0);
        assert_eq!(a.sent_posts().count(), 0);
    }
}
