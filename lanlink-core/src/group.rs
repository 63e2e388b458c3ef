//! Groups: owner-authoritative membership, mirrored on every member.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::{CoreError, DispatchError, Event, Node, OutboundAction};
use crate::identity::{random_hex_id, PeerId};
use crate::protocol::{Message, MessageKind};
use crate::router::Inbound;
use crate::token::{self, Scope};

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub owner: PeerId,
    /// Always contains the owner.
    pub members: BTreeSet<PeerId>,
}

#[derive(Debug, Clone)]
pub struct GroupLogEntry {
    pub from: PeerId,
    pub content: String,
    pub timestamp: f64,
}

#[derive(Debug, Default)]
pub struct GroupState {
    owned: BTreeMap<String, Group>,
    joined: BTreeMap<String, Group>,
    history: HashMap<String, Vec<GroupLogEntry>>,
}

impl GroupState {
    fn get(&self, id: &str) -> Option<&Group> {
        self.owned.get(id).or_else(|| self.joined.get(id))
    }

    fn log(&mut self, group_id: &str, entry: GroupLogEntry) {
        self.history.entry(group_id.to_string()).or_default().push(entry);
    }
}

/// `lowercase(name)` with spaces as underscores, plus 16 random hex chars.
pub fn new_group_id(name: &str) -> String {
    format!(
        "{}{}",
        name.trim().to_lowercase().replace(' ', "_"),
        random_hex_id(16)
    )
}

impl Node {
    /// Create a group owned by this peer. Members not in the peer directory are dropped.
    pub fn create_group(
        &mut self,
        name: &str,
        members: &[PeerId],
        now: f64,
    ) -> Result<(String, Vec<OutboundAction>), CoreError> {
        let me = self.profile.id.clone();
        let mut set: BTreeSet<PeerId> = members
            .iter()
            .filter(|m| self.peers.contains(m))
            .cloned()
            .collect();
        set.insert(me.clone());
        let group = Group {
            id: new_group_id(name),
            name: name.to_string(),
            owner: me.clone(),
            members: set,
        };
        let msg = Message::GroupCreate {
            from: me,
            group_id: group.id.clone(),
            group_name: group.name.clone(),
            members: group.members.iter().cloned().collect(),
            timestamp: now,
            token: self.issue_token(Scope::Group, now),
        };
        let mut out = Vec::new();
        self.emit(&mut out, self.broadcast_addr(), &msg, now)?;
        tracing::info!(group = %group.id, members = group.members.len(), "group created");
        let id = group.id.clone();
        self.groups.owned.insert(id.clone(), group);
        Ok((id, out))
    }

    /// Owner-only membership change. The owner can never remove itself.
    pub fn update_group(
        &mut self,
        group_id: &str,
        add: &[PeerId],
        remove: &[PeerId],
        now: f64,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        let me = self.profile.id.clone();
        let Some(group) = self.groups.owned.get(group_id) else {
            return Err(if self.groups.joined.contains_key(group_id) {
                CoreError::NotGroupOwner(group_id.to_string())
            } else {
                CoreError::UnknownGroup(group_id.to_string())
            });
        };
        let add: Vec<PeerId> = add
            .iter()
            .filter(|p| self.peers.contains(p) && !group.members.contains(*p))
            .cloned()
            .collect();
        let remove: Vec<PeerId> = remove
            .iter()
            .filter(|p| **p != me && group.members.contains(*p))
            .cloned()
            .collect();
        let mut members = group.members.clone();
        members.extend(add.iter().cloned());
        for p in &remove {
            members.remove(p);
        }
        let msg = Message::GroupUpdate {
            from: me,
            group_id: group_id.to_string(),
            group_name: group.name.clone(),
            add,
            remove,
            members: Some(members.iter().cloned().collect()),
            timestamp: now,
            token: self.issue_token(Scope::Group, now),
        };
        let mut out = Vec::new();
        self.emit(&mut out, self.broadcast_addr(), &msg, now)?;
        if let Some(group) = self.groups.owned.get_mut(group_id) {
            group.members = members;
        }
        Ok(out)
    }

    pub fn send_group_message(
        &mut self,
        group_id: &str,
        content: &str,
        now: f64,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        if self.groups.get(group_id).is_none() {
            return Err(CoreError::NotGroupMember(group_id.to_string()));
        }
        let msg = Message::GroupMessage {
            from: self.profile.id.clone(),
            group_id: group_id.to_string(),
            content: content.to_string(),
            timestamp: now,
            token: self.issue_token(Scope::Group, now),
        };
        let mut out = Vec::new();
        self.emit(&mut out, self.broadcast_addr(), &msg, now)?;
        let from = self.profile.id.clone();
        self.groups.log(
            group_id,
            GroupLogEntry {
                from,
                content: content.to_string(),
                timestamp: now,
            },
        );
        Ok(out)
    }

    pub fn owned_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.owned.values()
    }

    pub fn joined_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.joined.values()
    }

    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.get(group_id)
    }

    pub fn group_history(&self, group_id: &str) -> &[GroupLogEntry] {
        self.groups
            .history
            .get(group_id)
            .map_or(&[][..], Vec::as_slice)
    }
}

fn check_token(raw: &str, from: &PeerId, kind: MessageKind, now: f64) -> Result<(), DispatchError> {
    if token::validate(raw, Scope::Group, Some(from), now) {
        Ok(())
    } else {
        Err(DispatchError::Unauthorized {
            kind,
            reason: "invalid group token",
        })
    }
}

pub(crate) fn handle_group_create(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::GroupCreate {
        from,
        group_id,
        group_name,
        members,
        token: raw_token,
        ..
    } = inbound.message
    else {
        return Ok(());
    };
    check_token(&raw_token, &from, MessageKind::GroupCreate, inbound.now)?;
    if let Some(group) = node.groups.get(&group_id) {
        if group.owner != from {
            return Err(DispatchError::Unauthorized {
                kind: MessageKind::GroupCreate,
                reason: "create not from group owner",
            });
        }
        // Rebroadcast of a create already applied.
        return Ok(());
    }
    if !members.contains(&node.profile.id) {
        return Ok(());
    }
    let mut set: BTreeSet<PeerId> = members.into_iter().collect();
    set.insert(from.clone());
    node.groups.joined.insert(
        group_id.clone(),
        Group {
            id: group_id.clone(),
            name: group_name.clone(),
            owner: from.clone(),
            members: set,
        },
    );
    tracing::info!(group = %group_id, owner = %from, "joined group");
    out.push(OutboundAction::Notify(Event::GroupJoined {
        group_id,
        group_name,
        owner: from,
    }));
    Ok(())
}

pub(crate) fn handle_group_update(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::GroupUpdate {
        from,
        group_id,
        group_name,
        add,
        remove,
        members,
        token: raw_token,
        ..
    } = inbound.message
    else {
        return Ok(());
    };
    check_token(&raw_token, &from, MessageKind::GroupUpdate, inbound.now)?;
    let me = node.profile.id.clone();

    if let Some(group) = node.groups.get(&group_id) {
        if group.owner != from {
            return Err(DispatchError::Unauthorized {
                kind: MessageKind::GroupUpdate,
                reason: "update not from group owner",
            });
        }
    }

    if remove.contains(&me) {
        if let Some(group) = node.groups.joined.remove(&group_id) {
            tracing::info!(group = %group_id, "removed from group");
            out.push(OutboundAction::Notify(Event::GroupLeft {
                group_id,
                group_name: group.name,
            }));
        }
        return Ok(());
    }

    match node.groups.joined.get_mut(&group_id) {
        Some(group) => {
            match members {
                Some(roster) => group.members = roster.into_iter().collect(),
                None => {
                    group.members.extend(add);
                    for p in &remove {
                        group.members.remove(p);
                    }
                }
            }
            group.members.insert(from);
            if !group_name.is_empty() {
                group.name = group_name;
            }
        }
        None if add.contains(&me) => {
            let mut set: BTreeSet<PeerId> = match members {
                Some(roster) => roster.into_iter().collect(),
                None => add.into_iter().collect(),
            };
            set.insert(from.clone());
            set.insert(me);
            tracing::info!(group = %group_id, owner = %from, "added to group");
            node.groups.joined.insert(
                group_id.clone(),
                Group {
                    id: group_id.clone(),
                    name: group_name.clone(),
                    owner: from.clone(),
                    members: set,
                },
            );
            out.push(OutboundAction::Notify(Event::GroupJoined {
                group_id,
                group_name,
                owner: from,
            }));
        }
        None => {}
    }
    Ok(())
}

pub(crate) fn handle_group_message(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::GroupMessage {
        from,
        group_id,
        content,
        timestamp,
        token: raw_token,
    } = inbound.message
    else {
        return Ok(());
    };
    if node.groups.get(&group_id).is_none() {
        return Ok(());
    }
    check_token(&raw_token, &from, MessageKind::GroupMessage, inbound.now)?;
    node.groups.log(
        &group_id,
        GroupLogEntry {
            from: from.clone(),
            content: content.clone(),
            timestamp,
        },
    );
    out.push(OutboundAction::Notify(Event::GroupMessage {
        group_id,
        from,
        content,
    }));
    Ok(())
}
