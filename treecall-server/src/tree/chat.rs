//! The `$chat` branch: rooms of long-running `Join` calls.
//!
//! A member's `Join` call stays open for as long as it is in the room and
//! carries everything the room says to it as progress notifications. The
//! call ends with `Exit`, or is killed when its connection goes away, which
//! takes the member out of the room.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Branch, HandlerFuture};
use crate::call::{Call, RETCODE_ERROR};
use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    Join,
    Exit,
    Talk,
    List,
}

/// What a member's `Join` call is notified with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessage {
    pub kind: ChatKind,
    pub payload: Value,
    pub from: String,
}

impl ChatMessage {
    fn new(kind: ChatKind, payload: impl Into<Value>, from: &str) -> Self {
        Self {
            kind,
            payload: payload.into(),
            from: from.to_string(),
        }
    }
}

struct Member {
    name: String,
    /// The member's `Join` call.
    call: Arc<Call>,
}

/// room -> member id -> member
type Rooms = HashMap<String, BTreeMap<String, Member>>;

pub struct ChatBranch {
    rooms: Mutex<Rooms>,
    this: Weak<ChatBranch>,
}

impl ChatBranch {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            rooms: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Names of the members of `room`, sorted.
    pub fn members(&self, room: &str) -> Vec<String> {
        let rooms = self.rooms.lock();
        let mut names: Vec<String> = rooms
            .get(room)
            .map(|members| members.values().map(|m| m.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn join(&self, call: Arc<Call>) {
        let (Some(room), Some(name)) = (call.arg(0), call.arg(1)) else {
            call.reject(RETCODE_ERROR, "usage: Join <room> <name>");
            return;
        };
        let room = room.to_string();
        let name = name.to_string();
        let member_id = call.connection().member_id();
        if call.status().is_terminal() {
            tracing::debug!(call_id = call.id(), %room, "join on a settled call ignored");
            return;
        }

        let joined = {
            let mut rooms = self.rooms.lock();
            let members = rooms.entry(room.clone()).or_default();
            if members.contains_key(&member_id) {
                None
            } else {
                members.insert(
                    member_id.clone(),
                    Member {
                        name: name.clone(),
                        call: call.clone(),
                    },
                );
                let others: Vec<Arc<Call>> = members
                    .iter()
                    .filter(|(id, _)| **id != member_id)
                    .map(|(_, m)| m.call.clone())
                    .collect();
                let names: Vec<String> = members.values().map(|m| m.name.clone()).collect();
                Some((others, names))
            }
        };
        let Some((others, mut names)) = joined else {
            call.reject(RETCODE_ERROR, format!("already joined {room}"));
            return;
        };
        tracing::info!(call_id = call.id(), %room, %name, "member joined");

        let weak = self.this.clone();
        let (kill_room, kill_member, serial) = (room.clone(), member_id, call.serial());
        let live = call.on_kill(move || {
            if let Some(chat) = weak.upgrade() {
                chat.leave(&kill_room, &kill_member, Some(serial));
            }
        });
        if !live {
            return;
        }

        let joined = ChatMessage::new(ChatKind::Join, name.clone(), &name);
        for other in &others {
            other.notify(&joined);
        }
        names.sort();
        call.notify(ChatMessage::new(ChatKind::List, names, &room));
    }

    /// Take `member_id` out of `room` and tell the others. With `serial`,
    /// only a membership held by that exact join call is removed.
    fn leave(&self, room: &str, member_id: &str, serial: Option<u64>) -> Option<Arc<Call>> {
        let (member, others) = {
            let mut rooms = self.rooms.lock();
            let members = rooms.get_mut(room)?;
            let current = members.get(member_id)?;
            if serial.is_some_and(|s| s != current.call.serial()) {
                return None;
            }
            let member = members.remove(member_id)?;
            let others: Vec<Arc<Call>> = members.values().map(|m| m.call.clone()).collect();
            if members.is_empty() {
                rooms.remove(room);
            }
            (member, others)
        };
        tracing::info!(call_id = member.call.id(), %room, name = %member.name, "member left");
        let exited = ChatMessage::new(ChatKind::Exit, member.name.clone(), &member.name);
        for other in &others {
            other.notify(&exited);
        }
        Some(member.call)
    }

    fn exit(&self, call: Arc<Call>) {
        let member_id = call.connection().member_id();
        let rooms: Vec<String> = match call.arg(0) {
            Some(room) => vec![room.to_string()],
            None => {
                let rooms = self.rooms.lock();
                rooms
                    .iter()
                    .filter(|(_, members)| members.contains_key(&member_id))
                    .map(|(room, _)| room.clone())
                    .collect()
            }
        };

        let mut left = 0;
        for room in &rooms {
            if let Some(join_call) = self.leave(room, &member_id, None) {
                join_call.resolve(1);
                left += 1;
            }
        }
        match call.arg(0) {
            Some(room) if left == 0 => call.reject(RETCODE_ERROR, format!("not in room {room}")),
            _ => call.resolve(1),
        }
    }

    fn talk(&self, call: Arc<Call>) {
        let (Some(room), Some(text)) = (call.arg(0), call.arg(1)) else {
            call.reject(RETCODE_ERROR, "usage: Talk <room> <text>");
            return;
        };
        let member_id = call.connection().member_id();
        let found = {
            let rooms = self.rooms.lock();
            match rooms.get(room) {
                None => Err(format!("no such room {room}")),
                Some(members) => match members.get(&member_id) {
                    None => Err(format!("not in room {room}")),
                    Some(me) => Ok((
                        me.name.clone(),
                        members
                            .iter()
                            .filter(|(id, _)| **id != member_id)
                            .map(|(_, m)| m.call.clone())
                            .collect::<Vec<Arc<Call>>>(),
                    )),
                },
            }
        };
        let (from, others) = match found {
            Ok(found) => found,
            Err(e) => {
                call.reject(RETCODE_ERROR, e);
                return;
            }
        };
        let said = ChatMessage::new(ChatKind::Talk, text, &from);
        for other in &others {
            other.notify(&said);
        }
        call.resolve(1);
    }
}

impl Branch for ChatBranch {
    fn name(&self) -> &str {
        "$chat"
    }

    fn exported_names(&self) -> Vec<String> {
        vec!["Exit".to_string(), "Join".to_string(), "Talk".to_string()]
    }

    fn invoke(self: Arc<Self>, name: &str, call: Arc<Call>) -> Result<HandlerFuture, CallError> {
        let fut: HandlerFuture = match name {
            "Join" => Box::pin(async move { self.join(call) }),
            "Exit" => Box::pin(async move { self.exit(call) }),
            "Talk" => Box::pin(async move { self.talk(call) }),
            other => return Err(CallError::NotFound(other.to_string())),
        };
        Ok(fut)
    }
}
