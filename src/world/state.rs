//! The authoritative world: tiles, creatures and the mutations the engine
//! is allowed to make. Owned exclusively by the engine thread.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::world::creature::{Creature, CreatureId, CreatureRegistry};
use crate::world::ctrl::CtrlRef;
use crate::world::item::{Item, ItemTypeId, ItemTypeIndex, CREATURE_MARKER_ID};
use crate::world::position::{Direction, Position};
use crate::world::tile::Tile;
use crate::xml::{attribute, XmlEvent, XmlScanner};

/// Map coordinates start here; the world file's first tile is (ORIGIN, ORIGIN).
pub const WORLD_ORIGIN: u16 = 192;

/// The loader populates a single floor.
pub const SURFACE_FLOOR: u8 = 7;

/// Spectator scan half-extents; one tile beyond the largest client viewport.
const NEAR_X: i32 = 9;
const NEAR_Y: i32 = 7;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("no such creature")]
    InvalidCreature,
    #[error("invalid position")]
    InvalidPosition,
    #[error("there is no room")]
    NoRoom,
    #[error("may not move yet")]
    MayNotMoveYet { ready_at: Instant },
    #[error("item not found")]
    ItemNotFound,
    #[error("cannot reach")]
    CannotReach,
    #[error("cannot move that object")]
    CannotMove,
}

#[derive(Debug, Error)]
pub enum WorldLoadError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("world file: {0}")]
    Malformed(String),
    #[error("world file references unknown item type {0}")]
    UnknownItemType(u16),
}

pub struct World {
    item_types: Arc<ItemTypeIndex>,
    width: u16,
    height: u16,
    spawn: Position,
    tiles: HashMap<Position, Tile>,
    creatures: CreatureRegistry,
    positions: HashMap<CreatureId, Position>,
    ctrls: HashMap<CreatureId, CtrlRef>,
}

impl World {
    pub fn new(
        item_types: Arc<ItemTypeIndex>,
        width: u16,
        height: u16,
        spawn: Position,
        tiles: HashMap<Position, Tile>,
    ) -> Self {
        Self {
            item_types,
            width,
            height,
            spawn,
            tiles,
            creatures: CreatureRegistry::default(),
            positions: HashMap::new(),
            ctrls: HashMap::new(),
        }
    }

    /// Loads the otserv-style world file: `<map width height [spawnx spawny]>`
    /// wrapping `width * height` `<tile>` nodes in row-major order, each with
    /// at least a ground `<item id/>`.
    pub fn load(path: &Path, item_types: Arc<ItemTypeIndex>) -> Result<Self, WorldLoadError> {
        let xml = std::fs::read_to_string(path).map_err(|source| WorldLoadError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let world = Self::from_world_xml(&xml, item_types)?;
        info!(
            "world loaded from {}: {} x {} tiles, spawn {}",
            path.display(),
            world.width,
            world.height,
            world.spawn
        );
        Ok(world)
    }

    pub fn from_world_xml(
        xml: &str,
        item_types: Arc<ItemTypeIndex>,
    ) -> Result<Self, WorldLoadError> {
        let mut scanner = XmlScanner::new(xml);

        let (width, height, spawn) = loop {
            match scanner.next_event() {
                Some(XmlEvent::Open { name, attributes, .. }) if name == "map" => {
                    let width: u16 = attribute(&attributes, "width")
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| {
                            WorldLoadError::Malformed("<map> has no numeric width".to_string())
                        })?;
                    let height: u16 = attribute(&attributes, "height")
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| {
                            WorldLoadError::Malformed("<map> has no numeric height".to_string())
                        })?;
                    let spawn_x = attribute(&attributes, "spawnx")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(WORLD_ORIGIN + width / 2);
                    let spawn_y = attribute(&attributes, "spawny")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(WORLD_ORIGIN + height / 2);
                    break (width, height, Position::new(spawn_x, spawn_y, SURFACE_FLOOR));
                }
                Some(_) => continue,
                None => return Err(WorldLoadError::Malformed("missing <map> root".to_string())),
            }
        };
        if width == 0 || height == 0 {
            return Err(WorldLoadError::Malformed("empty map".to_string()));
        }

        // Tile nodes appear row by row; within a tile the first item is the
        // ground and the rest stack in reverse document order, the way the
        // map editor wrote them.
        let mut tiles = HashMap::new();
        let mut tile_items: Vec<u16> = Vec::new();
        let mut in_tile = false;
        let mut tile_index: u32 = 0;
        let total = u32::from(width) * u32::from(height);

        while let Some(event) = scanner.next_event() {
            match event {
                XmlEvent::Open { name, attributes, self_closing } => match name.as_str() {
                    "tile" => {
                        in_tile = true;
                        tile_items.clear();
                        if self_closing {
                            return Err(WorldLoadError::Malformed(
                                "<tile> without ground item".to_string(),
                            ));
                        }
                    }
                    "item" if in_tile => {
                        let id: u16 = attribute(&attributes, "id")
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(|| {
                                WorldLoadError::Malformed("<item> has no numeric id".to_string())
                            })?;
                        tile_items.push(id);
                    }
                    _ => {}
                },
                XmlEvent::Close { name } if name == "tile" => {
                    in_tile = false;
                    if tile_index >= total {
                        return Err(WorldLoadError::Malformed(
                            "more tiles than width * height".to_string(),
                        ));
                    }
                    let x = WORLD_ORIGIN + (tile_index % u32::from(width)) as u16;
                    let y = WORLD_ORIGIN + (tile_index / u32::from(width)) as u16;
                    tile_index += 1;

                    let mut ids = tile_items.iter();
                    let ground_id = *ids.next().ok_or_else(|| {
                        WorldLoadError::Malformed("<tile> without ground item".to_string())
                    })?;
                    let ground_type = item_types
                        .get(ItemTypeId(ground_id))
                        .ok_or(WorldLoadError::UnknownItemType(ground_id))?;
                    if !ground_type.ground {
                        return Err(WorldLoadError::Malformed(format!(
                            "item {ground_id} is not a ground type"
                        )));
                    }
                    let mut tile = Tile::new(Item::new(ItemTypeId(ground_id)));
                    for &id in tile_items.iter().skip(1).rev() {
                        let item_type = item_types
                            .get(ItemTypeId(id))
                            .ok_or(WorldLoadError::UnknownItemType(id))?;
                        tile.add_item(Item::new(ItemTypeId(id)), item_type.always_on_top);
                    }
                    tiles.insert(Position::new(x, y, SURFACE_FLOOR), tile);
                }
                XmlEvent::Close { .. } => {}
            }
        }

        if tile_index != total {
            return Err(WorldLoadError::Malformed(format!(
                "expected {total} tiles, found {tile_index}"
            )));
        }

        Ok(Self::new(
            item_types,
            width,
            height,
            Position::new(
                spawn.x.clamp(WORLD_ORIGIN, WORLD_ORIGIN + width - 1),
                spawn.y.clamp(WORLD_ORIGIN, WORLD_ORIGIN + height - 1),
                SURFACE_FLOOR,
            ),
            tiles,
        ))
    }

    pub fn item_types(&self) -> &Arc<ItemTypeIndex> {
        &self.item_types
    }

    pub fn spawn_position(&self) -> Position {
        self.spawn
    }

    pub fn position_is_valid(&self, position: Position) -> bool {
        position.z == SURFACE_FLOOR
            && position.x >= WORLD_ORIGIN
            && position.x < WORLD_ORIGIN + self.width
            && position.y >= WORLD_ORIGIN
            && position.y < WORLD_ORIGIN + self.height
    }

    pub fn get_tile(&self, position: Position) -> Option<&Tile> {
        self.tiles.get(&position)
    }

    pub fn creature_exists(&self, creature_id: CreatureId) -> bool {
        self.creatures.contains(creature_id)
    }

    pub fn get_creature(&self, creature_id: CreatureId) -> Option<&Creature> {
        self.creatures.get(creature_id)
    }

    pub fn get_creature_mut(&mut self, creature_id: CreatureId) -> Option<&mut Creature> {
        self.creatures.get_mut(creature_id)
    }

    pub fn get_creature_position(&self, creature_id: CreatureId) -> Option<Position> {
        self.positions.get(&creature_id).copied()
    }

    /// The visibility predicate of the 18x14 client viewport.
    pub fn can_see(from: Position, to: Position) -> bool {
        i32::from(to.x) > i32::from(from.x) - 9
            && i32::from(to.x) <= i32::from(from.x) + 9
            && i32::from(to.y) > i32::from(from.y) - 7
            && i32::from(to.y) <= i32::from(from.y) + 7
    }

    pub fn creature_can_reach(&self, creature_id: CreatureId, position: Position) -> bool {
        match self.get_creature_position(creature_id) {
            Some(at) => {
                (i32::from(at.x) - i32::from(position.x)).abs() <= 1
                    && (i32::from(at.y) - i32::from(position.y)).abs() <= 1
                    && at.z == position.z
            }
            None => false,
        }
    }

    /// Throw target check for inventory-to-tile moves: anywhere on screen.
    pub fn creature_can_throw_to(&self, creature_id: CreatureId, position: Position) -> bool {
        match self.get_creature_position(creature_id) {
            Some(at) => Self::can_see(at, position),
            None => false,
        }
    }

    /// Tile refs for a rectangle, x-major (all rows of the first column,
    /// then the next column), the iteration order the map encoder expects.
    pub fn get_map_block(
        &self,
        top_left: Position,
        width: u16,
        height: u16,
    ) -> Vec<Option<&Tile>> {
        let mut block = Vec::with_capacity(usize::from(width) * usize::from(height));
        for dx in 0..width {
            for dy in 0..height {
                let position = top_left.offset(i32::from(dx), i32::from(dy));
                block.push(position.and_then(|p| self.tiles.get(&p)));
            }
        }
        block
    }

    fn ground_speed(&self, position: Position) -> u16 {
        let speed = self
            .tiles
            .get(&position)
            .and_then(|tile| self.item_types.get(tile.ground().type_id))
            .map(|t| t.speed)
            .unwrap_or(0);
        // A broken ground type must not zero the walk delay formula.
        if speed == 0 {
            150
        } else {
            speed
        }
    }

    fn tile_blocks(&self, position: Position) -> bool {
        let Some(tile) = self.tiles.get(&position) else {
            return true;
        };
        if !tile.creature_ids().is_empty() {
            return true;
        }
        let item_blocks = |item: &Item| {
            self.item_types
                .get(item.type_id)
                .map(|t| t.blocking)
                .unwrap_or(true)
        };
        item_blocks(&tile.ground())
            || tile.top_items().iter().any(item_blocks)
            || tile.bottom_items().iter().any(item_blocks)
    }

    fn ctrls_near(&self, position: Position, exclude: Option<CreatureId>) -> Vec<CtrlRef> {
        let mut refs = Vec::new();
        for creature_id in self.near_creature_ids(position) {
            if Some(creature_id) == exclude {
                continue;
            }
            if let Some(ctrl) = self.ctrls.get(&creature_id) {
                refs.push(Rc::clone(ctrl));
            }
        }
        refs
    }

    pub fn near_creature_ids(&self, position: Position) -> Vec<CreatureId> {
        let mut ids = Vec::new();
        for dx in -NEAR_X..=NEAR_X {
            for dy in -NEAR_Y..=NEAR_Y {
                let Some(p) = position.offset(dx, dy) else {
                    continue;
                };
                if let Some(tile) = self.tiles.get(&p) {
                    ids.extend_from_slice(tile.creature_ids());
                }
            }
        }
        ids
    }

    /// Places a creature at the spawn tile or an adjacent free one, binds
    /// its ctrl and announces it to everyone nearby.
    pub fn add_creature(
        &mut self,
        creature: Creature,
        ctrl: CtrlRef,
        position: Position,
    ) -> Result<Position, WorldError> {
        let creature_id = creature.id;
        if self.creature_exists(creature_id) {
            error!("add_creature: creature {} already exists", creature_id);
            return Err(WorldError::InvalidCreature);
        }
        if !self.position_is_valid(position) {
            return Err(WorldError::InvalidPosition);
        }

        let mut placed = None;
        let mut candidates = vec![position];
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                if let Some(p) = position.offset(dx, dy) {
                    candidates.push(p);
                }
            }
        }
        for candidate in candidates {
            if self.position_is_valid(candidate) && !self.tile_blocks(candidate) {
                placed = Some(candidate);
                break;
            }
        }
        let Some(placed) = placed else {
            debug!("add_creature: no room around {}", position);
            return Err(WorldError::NoRoom);
        };

        self.creatures.insert(creature);
        self.positions.insert(creature_id, placed);
        self.ctrls.insert(creature_id, ctrl);
        self.tiles
            .get_mut(&placed)
            .expect("spawn tile exists")
            .add_creature(creature_id);

        let spectators = self.ctrls_near(placed, Some(creature_id));
        let world: &World = &*self;
        let creature = world.creatures.get(creature_id).expect("just inserted");
        for ctrl in spectators {
            ctrl.borrow_mut().on_creature_spawn(world, creature, placed);
        }
        Ok(placed)
    }

    /// Removes a creature, telling everyone else nearby first.
    pub fn remove_creature(&mut self, creature_id: CreatureId) -> Result<(), WorldError> {
        if !self.creature_exists(creature_id) {
            return Err(WorldError::InvalidCreature);
        }
        let position = self.positions[&creature_id];
        let stack_pos = self
            .tiles
            .get(&position)
            .and_then(|tile| tile.creature_stack_pos(creature_id))
            .unwrap_or(u8::MAX);

        {
            let spectators = self.ctrls_near(position, Some(creature_id));
            let world: &World = &*self;
            let creature = world.creatures.get(creature_id).expect("exists");
            for ctrl in spectators {
                ctrl.borrow_mut()
                    .on_creature_despawn(world, creature, position, stack_pos);
            }
        }

        if let Some(tile) = self.tiles.get_mut(&position) {
            tile.remove_creature(creature_id);
        }
        self.positions.remove(&creature_id);
        self.ctrls.remove(&creature_id);
        self.creatures.remove(creature_id);
        Ok(())
    }

    pub fn creature_move(
        &mut self,
        creature_id: CreatureId,
        direction: Direction,
    ) -> Result<(), WorldError> {
        let from = self
            .get_creature_position(creature_id)
            .ok_or(WorldError::InvalidCreature)?;
        let to = from.step(direction).ok_or(WorldError::InvalidPosition)?;
        self.creature_move_to(creature_id, to)
    }

    /// One-step move with cooldown and blocking checks, then fan-out to
    /// every creature that could see either endpoint.
    pub fn creature_move_to(
        &mut self,
        creature_id: CreatureId,
        to: Position,
    ) -> Result<(), WorldError> {
        if !self.creature_exists(creature_id) {
            return Err(WorldError::InvalidCreature);
        }
        if !self.position_is_valid(to) {
            return Err(WorldError::InvalidPosition);
        }

        let now = Instant::now();
        if let Some(ready_at) = self
            .creatures
            .get(creature_id)
            .and_then(|c| c.player_data())
            .and_then(|p| p.next_walk_time)
        {
            if ready_at > now {
                return Err(WorldError::MayNotMoveYet { ready_at });
            }
        }

        if self.tile_blocks(to) {
            debug!("creature {} cannot move to {}: blocked", creature_id, to);
            return Err(WorldError::NoRoom);
        }

        let from = self.positions[&creature_id];
        let from_stack = self
            .tiles
            .get(&from)
            .and_then(|tile| tile.creature_stack_pos(creature_id))
            .ok_or(WorldError::InvalidCreature)?;

        self.tiles
            .get_mut(&from)
            .expect("source tile exists")
            .remove_creature(creature_id);
        self.tiles
            .get_mut(&to)
            .expect("destination tile checked")
            .add_creature(creature_id);
        let to_stack = self
            .tiles
            .get(&to)
            .and_then(|tile| tile.creature_stack_pos(creature_id))
            .expect("just added");
        self.positions.insert(creature_id, to);

        // Facing: vertical component first, horizontal wins on diagonals.
        let ground_speed = self.ground_speed(to);
        let diagonal = from.x != to.x && from.y != to.y;
        {
            let creature = self.creatures.get_mut(creature_id).expect("exists");
            if to.y < from.y {
                creature.direction = Direction::North;
            } else if to.y > from.y {
                creature.direction = Direction::South;
            }
            if to.x < from.x {
                creature.direction = Direction::West;
            } else if to.x > from.x {
                creature.direction = Direction::East;
            }

            let speed = creature.speed.max(1);
            let mut delay_ms = u64::from(ground_speed) * 1000 / u64::from(speed);
            if diagonal {
                delay_ms *= 2;
            }
            if let Some(player) = creature.player_data_mut() {
                player.next_walk_time = Some(now + Duration::from_millis(delay_ms));
            }
        }

        // Everyone who could see either endpoint hears about the move once.
        let mut spectator_ids = self.near_creature_ids(from);
        for id in self.near_creature_ids(to) {
            if !spectator_ids.contains(&id) {
                spectator_ids.push(id);
            }
        }
        let mut spectators = Vec::new();
        for id in spectator_ids {
            if let Some(ctrl) = self.ctrls.get(&id) {
                spectators.push(Rc::clone(ctrl));
            }
        }
        let world: &World = &*self;
        let creature = world.creatures.get(creature_id).expect("exists");
        for ctrl in spectators {
            ctrl.borrow_mut()
                .on_creature_move(world, creature, from, from_stack, to, to_stack);
        }
        Ok(())
    }

    pub fn creature_turn(
        &mut self,
        creature_id: CreatureId,
        direction: Direction,
    ) -> Result<(), WorldError> {
        if !self.creature_exists(creature_id) {
            return Err(WorldError::InvalidCreature);
        }
        self.creatures
            .get_mut(creature_id)
            .expect("exists")
            .direction = direction;

        let position = self.positions[&creature_id];
        let stack_pos = self
            .tiles
            .get(&position)
            .and_then(|tile| tile.creature_stack_pos(creature_id))
            .unwrap_or(u8::MAX);
        let spectators = self.ctrls_near(position, None);
        let world: &World = &*self;
        let creature = world.creatures.get(creature_id).expect("exists");
        for ctrl in spectators {
            ctrl.borrow_mut()
                .on_creature_turn(world, creature, position, stack_pos);
        }
        Ok(())
    }

    pub fn creature_say(
        &mut self,
        creature_id: CreatureId,
        message: &str,
    ) -> Result<(), WorldError> {
        if !self.creature_exists(creature_id) {
            return Err(WorldError::InvalidCreature);
        }
        let position = self.positions[&creature_id];
        let spectators = self.ctrls_near(position, None);
        let world: &World = &*self;
        let creature = world.creatures.get(creature_id).expect("exists");
        for ctrl in spectators {
            ctrl.borrow_mut()
                .on_creature_say(world, creature, position, message);
        }
        Ok(())
    }

    pub fn add_item(&mut self, position: Position, item: Item) -> Result<(), WorldError> {
        if !self.position_is_valid(position) {
            return Err(WorldError::InvalidPosition);
        }
        let always_on_top = self
            .item_types
            .get(item.type_id)
            .map(|t| t.always_on_top)
            .ok_or(WorldError::ItemNotFound)?;
        self.tiles
            .get_mut(&position)
            .ok_or(WorldError::InvalidPosition)?
            .add_item(item, always_on_top);

        let spectators = self.ctrls_near(position, None);
        let world: &World = &*self;
        for ctrl in spectators {
            ctrl.borrow_mut().on_item_added(world, item, position);
        }
        Ok(())
    }

    pub fn remove_item(
        &mut self,
        position: Position,
        item: Item,
        stack_pos: u8,
    ) -> Result<(), WorldError> {
        if !self.position_is_valid(position) {
            return Err(WorldError::InvalidPosition);
        }
        let removed = self
            .tiles
            .get_mut(&position)
            .ok_or(WorldError::InvalidPosition)?
            .remove_item(item, stack_pos);
        if !removed {
            return Err(WorldError::ItemNotFound);
        }

        let crowded = self
            .tiles
            .get(&position)
            .map(|tile| tile.thing_count() >= 10)
            .unwrap_or(false);
        let spectators = self.ctrls_near(position, None);
        {
            let world: &World = &*self;
            for ctrl in &spectators {
                ctrl.borrow_mut().on_item_removed(world, position, stack_pos);
            }
            // Clients cap a tile at ten entries, so removing from a crowded
            // tile exposes things they never saw; resend the whole tile.
            if crowded {
                for ctrl in &spectators {
                    ctrl.borrow_mut().on_tile_update(world, position);
                }
            }
        }
        Ok(())
    }

    /// Tile-to-tile move of an item (or, via the creature marker id, of a
    /// creature) performed by `creature_id`.
    pub fn move_item(
        &mut self,
        creature_id: CreatureId,
        from: Position,
        from_stack: u8,
        item_type_id: ItemTypeId,
        count: u8,
        to: Position,
    ) -> Result<(), WorldError> {
        if !self.creature_exists(creature_id) {
            return Err(WorldError::InvalidCreature);
        }
        if !self.position_is_valid(from) || !self.position_is_valid(to) {
            return Err(WorldError::InvalidPosition);
        }
        if !self.creature_can_reach(creature_id, from) {
            return Err(WorldError::CannotReach);
        }

        if item_type_id.0 == CREATURE_MARKER_ID {
            if count != 1 {
                return Err(WorldError::ItemNotFound);
            }
            if (i32::from(from.x) - i32::from(to.x)).abs() > 1
                || (i32::from(from.y) - i32::from(to.y)).abs() > 1
            {
                return Err(WorldError::CannotMove);
            }
            let moved_id = self
                .tiles
                .get(&from)
                .and_then(|tile| match tile.entry_at(from_stack) {
                    Some(crate::world::tile::TileEntry::Creature(id)) => Some(id),
                    _ => None,
                })
                .ok_or(WorldError::ItemNotFound)?;
            return self.creature_move_to(moved_id, to);
        }

        let item_type = self
            .item_types
            .get(item_type_id)
            .ok_or(WorldError::ItemNotFound)?;
        if item_type.not_movable {
            return Err(WorldError::CannotMove);
        }
        let item = self
            .tiles
            .get(&from)
            .and_then(|tile| tile.item_at(from_stack))
            .filter(|found| found.type_id == item_type_id)
            .ok_or(WorldError::ItemNotFound)?;

        let always_on_top = item_type.always_on_top;
        self.tiles
            .get_mut(&from)
            .expect("checked above")
            .remove_item(item, from_stack);
        self.tiles
            .get_mut(&to)
            .ok_or(WorldError::InvalidPosition)?
            .add_item(item, always_on_top);

        let crowded = self
            .tiles
            .get(&from)
            .map(|tile| tile.thing_count() >= 10)
            .unwrap_or(false);

        let removed_spectators = self.ctrls_near(from, None);
        let added_spectators = self.ctrls_near(to, None);
        let world: &World = &*self;
        for ctrl in &removed_spectators {
            ctrl.borrow_mut().on_item_removed(world, from, from_stack);
        }
        for ctrl in &added_spectators {
            ctrl.borrow_mut().on_item_added(world, item, to);
        }
        if crowded {
            for ctrl in &removed_spectators {
                ctrl.borrow_mut().on_tile_update(world, from);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::world::ctrl::CreatureCtrl;
    use crate::world::item::ItemType;
    use std::cell::RefCell;

    pub const GROUND: u16 = 100;
    pub const ROCK: u16 = 110;
    pub const BAG: u16 = 120;
    pub const COIN: u16 = 130;

    pub fn test_item_types() -> Arc<ItemTypeIndex> {
        let mut index = ItemTypeIndex::default();
        index.insert_for_test(ItemType {
            id: ItemTypeId(GROUND),
            name: "grass".to_string(),
            ground: true,
            speed: 150,
            ..ItemType::default()
        });
        index.insert_for_test(ItemType {
            id: ItemTypeId(ROCK),
            name: "rock".to_string(),
            blocking: true,
            not_movable: true,
            ..ItemType::default()
        });
        let mut bag = ItemType {
            id: ItemTypeId(BAG),
            name: "bag".to_string(),
            container: true,
            ..ItemType::default()
        };
        bag.attributes
            .insert("maxitems".to_string(), "8".to_string());
        index.insert_for_test(bag);
        let mut coin = ItemType {
            id: ItemTypeId(COIN),
            name: "gold coin".to_string(),
            stackable: true,
            ..ItemType::default()
        };
        coin.attributes
            .insert("weight".to_string(), "0.10".to_string());
        index.insert_for_test(coin);
        Arc::new(index)
    }

    pub fn empty_world(width: u16, height: u16) -> World {
        let item_types = test_item_types();
        let mut tiles = HashMap::new();
        for dx in 0..width {
            for dy in 0..height {
                tiles.insert(
                    Position::new(WORLD_ORIGIN + dx, WORLD_ORIGIN + dy, SURFACE_FLOOR),
                    Tile::new(Item::new(ItemTypeId(GROUND))),
                );
            }
        }
        let spawn = Position::new(
            WORLD_ORIGIN + width / 2,
            WORLD_ORIGIN + height / 2,
            SURFACE_FLOOR,
        );
        World::new(item_types, width, height, spawn, tiles)
    }

    /// Ctrl that records callback names for assertions.
    #[derive(Default)]
    pub struct RecordingCtrl {
        pub events: Vec<String>,
    }

    impl RecordingCtrl {
        pub fn shared() -> Rc<RefCell<RecordingCtrl>> {
            Rc::new(RefCell::new(RecordingCtrl::default()))
        }
    }

    impl CreatureCtrl for RecordingCtrl {
        fn on_creature_spawn(&mut self, _: &World, creature: &Creature, position: Position) {
            self.events.push(format!("spawn {} {}", creature.id, position));
        }

        fn on_creature_despawn(
            &mut self,
            _: &World,
            creature: &Creature,
            position: Position,
            stack_pos: u8,
        ) {
            self.events
                .push(format!("despawn {} {} {}", creature.id, position, stack_pos));
        }

        fn on_creature_move(
            &mut self,
            _: &World,
            creature: &Creature,
            old_position: Position,
            old_stack_pos: u8,
            new_position: Position,
            _new_stack_pos: u8,
        ) {
            self.events.push(format!(
                "move {} {} {} {}",
                creature.id, old_position, old_stack_pos, new_position
            ));
        }

        fn on_creature_turn(
            &mut self,
            _: &World,
            creature: &Creature,
            _position: Position,
            _stack_pos: u8,
        ) {
            self.events
                .push(format!("turn {} {}", creature.id, creature.direction.wire_code()));
        }

        fn on_creature_say(
            &mut self,
            _: &World,
            creature: &Creature,
            _position: Position,
            message: &str,
        ) {
            self.events.push(format!("say {} {}", creature.id, message));
        }

        fn on_item_added(&mut self, _: &World, item: Item, position: Position) {
            self.events
                .push(format!("item+ {} {}", item.type_id.0, position));
        }

        fn on_item_removed(&mut self, _: &World, position: Position, stack_pos: u8) {
            self.events.push(format!("item- {} {}", position, stack_pos));
        }

        fn on_tile_update(&mut self, _: &World, position: Position) {
            self.events.push(format!("tile {}", position));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn spawn_player(world: &mut World, name: &str, at: Position) -> (CreatureId, Rc<std::cell::RefCell<RecordingCtrl>>) {
        let creature = Creature::new_player(name);
        let id = creature.id;
        let ctrl = RecordingCtrl::shared();
        let placed = world
            .add_creature(creature, ctrl.clone(), at)
            .expect("spawn");
        assert_eq!(placed, at);
        (id, ctrl)
    }

    fn pos(x: u16, y: u16) -> Position {
        Position::new(WORLD_ORIGIN + x, WORLD_ORIGIN + y, SURFACE_FLOOR)
    }

    #[test]
    fn move_keeps_position_index_and_tile_lists_consistent() {
        let mut world = empty_world(20, 20);
        let (id, _ctrl) = spawn_player(&mut world, "Alice", pos(5, 5));

        world.creature_move(id, Direction::North).expect("move");

        let at = world.get_creature_position(id).expect("position");
        assert_eq!(at, pos(5, 4));
        let tile = world.get_tile(at).expect("tile");
        assert_eq!(tile.creature_ids(), &[id]);
        assert!(world
            .get_tile(pos(5, 5))
            .expect("old tile")
            .creature_ids()
            .is_empty());
        assert_eq!(
            world.get_creature(id).expect("creature").direction,
            Direction::North
        );
    }

    #[test]
    fn move_into_blocking_item_is_no_room() {
        let mut world = empty_world(10, 10);
        let (id, _ctrl) = spawn_player(&mut world, "Alice", pos(5, 5));
        world
            .add_item(pos(5, 4), Item::new(ItemTypeId(ROCK)))
            .expect("add rock");

        assert_eq!(
            world.creature_move(id, Direction::North),
            Err(WorldError::NoRoom)
        );
        assert_eq!(world.get_creature_position(id), Some(pos(5, 5)));
    }

    #[test]
    fn move_into_other_creature_is_no_room() {
        let mut world = empty_world(10, 10);
        let (alice, _a) = spawn_player(&mut world, "Alice", pos(5, 5));
        let (_bob, _b) = spawn_player(&mut world, "Bob", pos(5, 4));

        assert_eq!(
            world.creature_move(alice, Direction::North),
            Err(WorldError::NoRoom)
        );
    }

    #[test]
    fn second_step_hits_the_walk_cooldown() {
        let mut world = empty_world(20, 20);
        let (id, _ctrl) = spawn_player(&mut world, "Alice", pos(5, 5));

        world.creature_move(id, Direction::North).expect("move");
        match world.creature_move(id, Direction::North) {
            Err(WorldError::MayNotMoveYet { ready_at }) => {
                assert!(ready_at > Instant::now());
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
    }

    #[test]
    fn diagonal_steps_double_the_cooldown() {
        let mut world = empty_world(20, 20);
        let (id, _ctrl) = spawn_player(&mut world, "Alice", pos(5, 5));
        world.creature_move(id, Direction::North).expect("move");
        let cardinal_wait = world
            .get_creature(id)
            .and_then(|c| c.player_data())
            .and_then(|p| p.next_walk_time)
            .expect("cooldown")
            .duration_since(Instant::now());

        let mut world = empty_world(20, 20);
        let (id, _ctrl) = spawn_player(&mut world, "Bob", pos(5, 5));
        world
            .creature_move(id, Direction::NorthEast)
            .expect("move");
        let diagonal_wait = world
            .get_creature(id)
            .and_then(|c| c.player_data())
            .and_then(|p| p.next_walk_time)
            .expect("cooldown")
            .duration_since(Instant::now());

        // 1000 * 150 / 220 is ~681ms, doubled for the diagonal.
        assert!(cardinal_wait > Duration::from_millis(500));
        assert!(cardinal_wait < Duration::from_millis(700));
        assert!(diagonal_wait > Duration::from_millis(1200));
        assert!(diagonal_wait < Duration::from_millis(1400));
    }

    #[test]
    fn spectators_hear_moves_and_talk() {
        let mut world = empty_world(20, 20);
        let (alice, alice_ctrl) = spawn_player(&mut world, "Alice", pos(5, 5));
        let (_bob, bob_ctrl) = spawn_player(&mut world, "Bob", pos(7, 5));

        world.creature_move(alice, Direction::North).expect("move");
        world.creature_say(alice, "hello").expect("say");

        let bob_events = &bob_ctrl.borrow().events;
        assert!(bob_events.iter().any(|e| e.starts_with("spawn")));
        assert!(bob_events.iter().any(|e| e.starts_with("move")));
        assert!(bob_events.iter().any(|e| e == &format!("say {alice} hello")));
        // The mover sees its own move too.
        assert!(alice_ctrl
            .borrow()
            .events
            .iter()
            .any(|e| e.starts_with("move")));
    }

    #[test]
    fn despawn_is_announced_to_others_only() {
        let mut world = empty_world(20, 20);
        let (alice, alice_ctrl) = spawn_player(&mut world, "Alice", pos(5, 5));
        let (_bob, bob_ctrl) = spawn_player(&mut world, "Bob", pos(6, 5));

        world.remove_creature(alice).expect("despawn");
        assert!(!world.creature_exists(alice));
        assert!(world.get_creature_position(alice).is_none());
        assert!(bob_ctrl
            .borrow()
            .events
            .iter()
            .any(|e| e.starts_with("despawn")));
        assert!(!alice_ctrl
            .borrow()
            .events
            .iter()
            .any(|e| e.starts_with("despawn")));
    }

    #[test]
    fn blocked_spawn_tile_places_on_a_neighbour() {
        let mut world = empty_world(10, 10);
        let (_alice, _a) = spawn_player(&mut world, "Alice", pos(5, 5));

        let bob = Creature::new_player("Bob");
        let bob_id = bob.id;
        let placed = world
            .add_creature(bob, RecordingCtrl::shared(), pos(5, 5))
            .expect("adjusted spawn");
        assert_ne!(placed, pos(5, 5));
        assert_eq!(world.get_creature_position(bob_id), Some(placed));
    }

    #[test]
    fn remove_item_from_crowded_tile_triggers_tile_update() {
        let mut world = empty_world(10, 10);
        let (_alice, ctrl) = spawn_player(&mut world, "Alice", pos(5, 5));
        for _ in 0..10 {
            world
                .add_item(pos(5, 4), Item::new(ItemTypeId(COIN)))
                .expect("add");
        }
        world
            .remove_item(pos(5, 4), Item::new(ItemTypeId(COIN)), 1)
            .expect("remove");

        let events = &ctrl.borrow().events;
        assert!(events.iter().any(|e| e.starts_with("item-")));
        assert!(events.iter().any(|e| e.starts_with("tile")));
    }

    #[test]
    fn move_item_requires_reach_and_matching_type() {
        let mut world = empty_world(10, 10);
        let (alice, _ctrl) = spawn_player(&mut world, "Alice", pos(5, 5));
        world
            .add_item(pos(5, 4), Item::new(ItemTypeId(COIN)))
            .expect("add");

        assert_eq!(
            world.move_item(alice, pos(8, 8), 1, ItemTypeId(COIN), 1, pos(5, 5)),
            Err(WorldError::CannotReach)
        );
        assert_eq!(
            world.move_item(alice, pos(5, 4), 1, ItemTypeId(BAG), 1, pos(5, 5)),
            Err(WorldError::ItemNotFound)
        );
        world
            .move_item(alice, pos(5, 4), 1, ItemTypeId(COIN), 1, pos(5, 5))
            .expect("move");
        assert_eq!(world.get_tile(pos(5, 4)).expect("tile").thing_count(), 1);
        assert_eq!(world.get_tile(pos(5, 5)).expect("tile").thing_count(), 3);
    }

    #[test]
    fn map_block_is_column_major() {
        let mut world = empty_world(4, 4);
        world
            .add_item(pos(0, 1), Item::new(ItemTypeId(COIN)))
            .expect("add");
        let block = world.get_map_block(pos(0, 0), 2, 2);
        assert_eq!(block.len(), 4);
        // Order: (0,0) (0,1) (1,0) (1,1); the marked tile is second.
        assert_eq!(block[1].expect("tile").thing_count(), 2);
        assert_eq!(block[0].expect("tile").thing_count(), 1);
    }

    #[test]
    fn world_xml_loads_ground_and_stacked_items() {
        let item_types = test_item_types();
        let xml = "<map width=\"2\" height=\"1\" spawnx=\"192\" spawny=\"192\">\
                     <tile><item id=\"100\"/></tile>\
                     <tile><item id=\"100\"/><item id=\"130\"/><item id=\"120\"/></tile>\
                   </map>";
        let world = World::from_world_xml(xml, item_types).expect("load");
        assert!(world.get_tile(pos(0, 0)).is_some());
        let stacked = world.get_tile(pos(1, 0)).expect("tile");
        assert_eq!(stacked.thing_count(), 3);
        // Reverse document order: the bag was written last, so it sits
        // deepest in the bottom band.
        assert_eq!(stacked.bottom_items()[0].type_id, ItemTypeId(COIN));
        assert_eq!(stacked.bottom_items()[1].type_id, ItemTypeId(BAG));
        assert_eq!(world.spawn_position(), pos(0, 0));
    }

    #[test]
    fn world_xml_tile_count_must_match() {
        let item_types = test_item_types();
        let xml = "<map width=\"2\" height=\"2\"><tile><item id=\"100\"/></tile></map>";
        assert!(matches!(
            World::from_world_xml(xml, item_types),
            Err(WorldLoadError::Malformed(_))
        ));
    }

    #[test]
    fn can_see_matches_the_viewport_bounds() {
        let center = Position::new(100, 100, 7);
        assert!(World::can_see(center, Position::new(109, 107, 7)));
        assert!(!World::can_see(center, Position::new(110, 100, 7)));
        assert!(!World::can_see(center, Position::new(91, 100, 7)));
        assert!(World::can_see(center, Position::new(92, 94, 7)));
        assert!(!World::can_see(center, Position::new(100, 93, 7)));
    }
}
