//! Creatures, player data and the dense creature table.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::world::item::Item;
use crate::world::position::Direction;

/// Globally unique within a server run; never reused. 0 is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CreatureId(pub u32);

pub const INVALID_CREATURE_ID: CreatureId = CreatureId(0);

static NEXT_CREATURE_ID: AtomicU32 = AtomicU32::new(1);

impl CreatureId {
    pub fn next() -> Self {
        CreatureId(NEXT_CREATURE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for CreatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Five bytes on the wire: type, head, body, legs, feet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outfit {
    pub look_type: u8,
    pub head: u8,
    pub body: u8,
    pub legs: u8,
    pub feet: u8,
}

impl Default for Outfit {
    fn default() -> Self {
        Self {
            look_type: 0x80,
            head: 0x20,
            body: 0x30,
            legs: 0x40,
            feet: 0x50,
        }
    }
}

pub const EQUIPMENT_SLOT_FIRST: u8 = 1;
pub const EQUIPMENT_SLOT_LAST: u8 = 10;

/// Ten inventory slots, indices 1..=10 on the wire.
#[derive(Debug, Clone, Default)]
pub struct Equipment {
    slots: [Option<Item>; (EQUIPMENT_SLOT_LAST + 1) as usize],
}

impl Equipment {
    pub fn valid_slot(slot: u8) -> bool {
        (EQUIPMENT_SLOT_FIRST..=EQUIPMENT_SLOT_LAST).contains(&slot)
    }

    pub fn item(&self, slot: u8) -> Option<Item> {
        if !Self::valid_slot(slot) {
            return None;
        }
        self.slots[slot as usize]
    }

    pub fn can_add_item(&self, slot: u8) -> bool {
        Self::valid_slot(slot) && self.slots[slot as usize].is_none()
    }

    pub fn add_item(&mut self, item: Item, slot: u8) -> bool {
        if !self.can_add_item(slot) {
            return false;
        }
        self.slots[slot as usize] = Some(item);
        true
    }

    pub fn remove_item(&mut self, slot: u8) -> Option<Item> {
        if !Self::valid_slot(slot) {
            return None;
        }
        self.slots[slot as usize].take()
    }
}

pub const PLAYER_SKILL_COUNT: usize = 7;

/// State only players carry.
#[derive(Debug, Clone)]
pub struct PlayerData {
    pub mana: u16,
    pub max_mana: u16,
    pub capacity: u16,
    pub experience: u32,
    pub level: u8,
    pub magic_level: u8,
    pub skills: [u8; PLAYER_SKILL_COUNT],
    pub equipment: Equipment,
    pub queued_moves: VecDeque<Direction>,
    pub next_walk_time: Option<Instant>,
}

impl Default for PlayerData {
    fn default() -> Self {
        Self {
            mana: 100,
            max_mana: 100,
            capacity: 300,
            experience: 4200,
            level: 14,
            magic_level: 1,
            skills: [10; PLAYER_SKILL_COUNT],
            equipment: Equipment::default(),
            queued_moves: VecDeque::new(),
            next_walk_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CreatureKind {
    Player(PlayerData),
    Npc,
    Monster,
}

#[derive(Debug, Clone)]
pub struct Creature {
    pub id: CreatureId,
    pub name: String,
    pub health: u16,
    pub max_health: u16,
    pub direction: Direction,
    pub speed: u16,
    pub outfit: Outfit,
    pub kind: CreatureKind,
}

impl Creature {
    pub fn new_player(name: &str) -> Self {
        Self {
            id: CreatureId::next(),
            name: name.to_string(),
            health: 100,
            max_health: 100,
            direction: Direction::South,
            speed: 220,
            outfit: Outfit::default(),
            kind: CreatureKind::Player(PlayerData::default()),
        }
    }

    pub fn is_player(&self) -> bool {
        matches!(self.kind, CreatureKind::Player(_))
    }

    pub fn player_data(&self) -> Option<&PlayerData> {
        match &self.kind {
            CreatureKind::Player(data) => Some(data),
            _ => None,
        }
    }

    pub fn player_data_mut(&mut self) -> Option<&mut PlayerData> {
        match &mut self.kind {
            CreatureKind::Player(data) => Some(data),
            _ => None,
        }
    }

    /// 0..=100 for the wire, rounded; health never exceeds max_health.
    pub fn health_percent(&self) -> u8 {
        if self.max_health == 0 {
            return 0;
        }
        let percent =
            (u32::from(self.health) * 100 + u32::from(self.max_health) / 2) / u32::from(self.max_health);
        percent.min(100) as u8
    }
}

/// Creature storage: contiguous payload plus an id index. Removal
/// swap-removes, so slot order is not meaningful.
#[derive(Debug, Default)]
pub struct CreatureRegistry {
    creatures: Vec<Creature>,
    index: HashMap<CreatureId, usize>,
}

impl CreatureRegistry {
    pub fn contains(&self, id: CreatureId) -> bool {
        id.is_valid() && self.index.contains_key(&id)
    }

    pub fn get(&self, id: CreatureId) -> Option<&Creature> {
        self.index.get(&id).map(|&slot| &self.creatures[slot])
    }

    pub fn get_mut(&mut self, id: CreatureId) -> Option<&mut Creature> {
        match self.index.get(&id) {
            Some(&slot) => Some(&mut self.creatures[slot]),
            None => None,
        }
    }

    pub fn insert(&mut self, creature: Creature) -> bool {
        if self.contains(creature.id) || !creature.id.is_valid() {
            return false;
        }
        self.index.insert(creature.id, self.creatures.len());
        self.creatures.push(creature);
        true
    }

    pub fn remove(&mut self, id: CreatureId) -> Option<Creature> {
        let slot = self.index.remove(&id)?;
        let creature = self.creatures.swap_remove(slot);
        if let Some(moved) = self.creatures.get(slot) {
            self.index.insert(moved.id, slot);
        }
        Some(creature)
    }

    pub fn len(&self) -> usize {
        self.creatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creatures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Creature> {
        self.creatures.iter()
    }
}
