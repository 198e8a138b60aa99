//! Named groups of connection ids.
//!
//! Groups hold ids, not connections, so a member that disconnects simply
//! stops resolving through the manager.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::GroupError;
use crate::manager::ConnManager;
use crate::message::Message;

/// Identity of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Group {
    pub id: i32,
    pub name: String,
}

impl Group {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

struct GroupEntry {
    id: i32,
    members: HashSet<i32>,
}

/// Registry of groups and their members, keyed by group name.
#[derive(Default)]
pub struct ConnGroup {
    groups: DashMap<String, GroupEntry>,
}

impl ConnGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, group: &Group) -> Result<(), GroupError> {
        use dashmap::mapref::entry::Entry;

        match self.groups.entry(group.name.clone()) {
            Entry::Occupied(_) => Err(GroupError::Exists(group.name.clone())),
            Entry::Vacant(slot) => {
                slot.insert(GroupEntry {
                    id: group.id,
                    members: HashSet::new(),
                });
                debug!(group = %group.name, id = group.id, "Group added");
                Ok(())
            }
        }
    }

    /// Drop the group along with its member list.
    pub fn remove_group(&self, group: &Group) -> Result<(), GroupError> {
        self.groups
            .remove(&group.name)
            .map(|_| ())
            .ok_or_else(|| GroupError::NotFound(group.name.clone()))
    }

    pub fn contains_group(&self, group: &Group) -> bool {
        self.groups.contains_key(&group.name)
    }

    /// Member ids in ascending order.
    pub fn members(&self, group: &Group) -> Result<Vec<i32>, GroupError> {
        let entry = self
            .groups
            .get(&group.name)
            .ok_or_else(|| GroupError::NotFound(group.name.clone()))?;
        let mut ids: Vec<i32> = entry.members.iter().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Id the group was registered with.
    pub fn group_id(&self, group: &Group) -> Result<i32, GroupError> {
        self.groups
            .get(&group.name)
            .map(|entry| entry.id)
            .ok_or_else(|| GroupError::NotFound(group.name.clone()))
    }

    pub fn add_conn_to_group(&self, group: &Group, conn_id: i32) -> Result<(), GroupError> {
        let mut entry = self
            .groups
            .get_mut(&group.name)
            .ok_or_else(|| GroupError::NotFound(group.name.clone()))?;
        entry.members.insert(conn_id);
        Ok(())
    }

    pub fn remove_conn_from_group(&self, group: &Group, conn_id: i32) -> Result<(), GroupError> {
        let mut entry = self
            .groups
            .get_mut(&group.name)
            .ok_or_else(|| GroupError::NotFound(group.name.clone()))?;
        entry.members.remove(&conn_id);
        Ok(())
    }

    /// Remove every member but keep the group.
    pub fn clear_group(&self, group: &Group) -> Result<(), GroupError> {
        let mut entry = self
            .groups
            .get_mut(&group.name)
            .ok_or_else(|| GroupError::NotFound(group.name.clone()))?;
        entry.members.clear();
        Ok(())
    }

    /// Queue a copy of `msg` on every member that is still live.
    ///
    /// Never waits on a full queue. Returns the number of members reached.
    pub fn send_to_group(
        &self,
        group: &Group,
        manager: &ConnManager,
        msg: &Message,
    ) -> Result<usize, GroupError> {
        let mut delivered = 0;
        for conn_id in self.members(group)? {
            let sent = manager
                .find_conn(conn_id)
                .map_err(|e| e.to_string())
                .and_then(|conn| conn.try_send_message(msg.clone()).map_err(|e| e.to_string()));
            match sent {
                Ok(()) => delivered += 1,
                Err(error) => warn!(group = %group.name, conn_id, %error, "Group send skipped"),
            }
        }
        Ok(delivered)
    }
}
