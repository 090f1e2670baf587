//! Open-container bookkeeping.
//!
//! Containers get a global id when first opened and live for as long as any
//! player keeps them open. Each player addresses open containers through a
//! small local id (0..=63) picked at open time; the wire never sees the
//! global id.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::world::creature::CreatureId;
use crate::world::item::{Item, ItemTypeId};
use crate::world::position::Position;

/// Per-player open-container slots; the wire encodes the local id in six
/// bits, so 64 is also the protocol ceiling.
pub const MAX_OPEN_CONTAINERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerId(pub u32);

impl ContainerId {
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Where the backing item of a container lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerRoot {
    Tile { position: Position, stack_pos: u8 },
    Equipment { player: CreatureId, slot: u8 },
    Nested { parent: ContainerId, slot: u8 },
}

#[derive(Debug)]
pub struct Container {
    pub id: ContainerId,
    pub item_type_id: ItemTypeId,
    pub capacity: u16,
    pub items: Vec<Item>,
    pub root: ContainerRoot,
    /// Inverse of the per-player local mapping: (player, local id).
    pub open_by: Vec<(CreatureId, u8)>,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error("all container slots are in use")]
    NoSlot,
    #[error("no such container")]
    UnknownContainer,
    #[error("no such container slot")]
    UnknownSlot,
}

#[derive(Default)]
pub struct ContainerManager {
    next_id: u32,
    containers: HashMap<ContainerId, Container>,
    by_root: HashMap<ContainerRoot, ContainerId>,
    open_slots: HashMap<CreatureId, [Option<ContainerId>; MAX_OPEN_CONTAINERS]>,
}

impl ContainerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ContainerId) -> Option<&Container> {
        self.containers.get(&id)
    }

    /// The global container for a player's local id, if that slot is open.
    pub fn global_for(&self, player: CreatureId, local_id: u8) -> Option<ContainerId> {
        self.open_slots
            .get(&player)?
            .get(local_id as usize)
            .copied()
            .flatten()
    }

    /// The local id a player has for a global container, if any.
    pub fn local_for(&self, player: CreatureId, id: ContainerId) -> Option<u8> {
        self.open_slots.get(&player)?.iter().position(|slot| *slot == Some(id)).map(|i| i as u8)
    }

    /// Opens the container backed by the item at `root` for `player`,
    /// creating the container state on first open. Returns the local id,
    /// which is the existing one when the player already has it open.
    pub fn open(
        &mut self,
        player: CreatureId,
        item_type_id: ItemTypeId,
        capacity: u16,
        root: ContainerRoot,
    ) -> Result<(u8, ContainerId), ContainerError> {
        let id = match self.by_root.get(&root) {
            Some(&id) => id,
            None => {
                self.next_id += 1;
                let id = ContainerId(self.next_id);
                self.containers.insert(
                    id,
                    Container {
                        id,
                        item_type_id,
                        capacity,
                        items: Vec::new(),
                        root,
                        open_by: Vec::new(),
                    },
                );
                self.by_root.insert(root, id);
                debug!("created container {} for {:?}", id.0, root);
                id
            }
        };

        let slots = self
            .open_slots
            .entry(player)
            .or_insert([None; MAX_OPEN_CONTAINERS]);
        if let Some(existing) = slots.iter().position(|slot| *slot == Some(id)) {
            return Ok((existing as u8, id));
        }
        let Some(free) = slots.iter().position(|slot| slot.is_none()) else {
            return Err(ContainerError::NoSlot);
        };
        slots[free] = Some(id);
        self.containers
            .get_mut(&id)
            .expect("container just resolved")
            .open_by
            .push((player, free as u8));
        Ok((free as u8, id))
    }

    /// Frees the player's local slot. The container state is destroyed when
    /// the last player lets go; the backing item is untouched.
    pub fn close(&mut self, player: CreatureId, local_id: u8) -> Result<(), ContainerError> {
        let id = self
            .global_for(player, local_id)
            .ok_or(ContainerError::UnknownContainer)?;
        if let Some(slots) = self.open_slots.get_mut(&player) {
            slots[local_id as usize] = None;
        }
        let container = self
            .containers
            .get_mut(&id)
            .ok_or(ContainerError::UnknownContainer)?;
        container
            .open_by
            .retain(|(p, l)| !(*p == player && *l == local_id));
        if container.open_by.is_empty() {
            let root = container.root;
            self.containers.remove(&id);
            self.by_root.remove(&root);
            debug!("destroyed container {}", id.0);
        }
        Ok(())
    }

    /// Drops every slot a despawning player still has open.
    pub fn close_all(&mut self, player: CreatureId) {
        let Some(slots) = self.open_slots.get(&player).copied() else {
            return;
        };
        for (local_id, slot) in slots.iter().enumerate() {
            if slot.is_some() {
                let _ = self.close(player, local_id as u8);
            }
        }
        self.open_slots.remove(&player);
    }

    /// Adds an item to the front of the container. Returns the (player,
    /// local id) pairs that need a notification.
    pub fn add_item(
        &mut self,
        id: ContainerId,
        item: Item,
    ) -> Result<Vec<(CreatureId, u8)>, ContainerError> {
        let container = self
            .containers
            .get_mut(&id)
            .ok_or(ContainerError::UnknownContainer)?;
        if container.items.len() >= usize::from(container.capacity) {
            return Err(ContainerError::NoSlot);
        }
        container.items.insert(0, item);
        Ok(container.open_by.clone())
    }

    pub fn update_item(
        &mut self,
        id: ContainerId,
        slot: u8,
        item: Item,
    ) -> Result<Vec<(CreatureId, u8)>, ContainerError> {
        let container = self
            .containers
            .get_mut(&id)
            .ok_or(ContainerError::UnknownContainer)?;
        let entry = container
            .items
            .get_mut(usize::from(slot))
            .ok_or(ContainerError::UnknownSlot)?;
        *entry = item;
        Ok(container.open_by.clone())
    }

    pub fn remove_item(
        &mut self,
        id: ContainerId,
        slot: u8,
    ) -> Result<(Item, Vec<(CreatureId, u8)>), ContainerError> {
        let container = self
            .containers
            .get_mut(&id)
            .ok_or(ContainerError::UnknownContainer)?;
        if usize::from(slot) >= container.items.len() {
            return Err(ContainerError::UnknownSlot);
        }
        let item = container.items.remove(usize::from(slot));
        Ok((item, container.open_by.clone()))
    }
}
