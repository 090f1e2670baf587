//! The authoritative game engine.
//!
//! One thread owns a `GameEngine` and executes tasks popped from the engine
//! queue; sessions talk to it exclusively through an [`EngineHandle`], so
//! every command is serialized and no world state ever leaves this thread.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::accounts::AccountStore;
use crate::game::container::{ContainerError, ContainerManager, ContainerRoot};
use crate::game::ctrl::PlayerCtrl;
use crate::game::queue::TaskQueue;
use crate::proto::game::{GamePosition, ItemPosition, MESSAGE_INFO};
use crate::world::creature::{Creature, CreatureId, INVALID_CREATURE_ID};
use crate::world::ctrl::CreatureCtrl;
use crate::world::item::{Item, ItemTypeId, CREATURE_MARKER_ID};
use crate::world::position::{Direction, Position};
use crate::world::state::{World, WorldError};

pub type EngineTask = Box<dyn FnOnce(&mut GameEngine) + Send>;
pub type EngineQueue = TaskQueue<EngineTask>;

const CANCEL_NOT_POSSIBLE: &str = "Sorry, not possible.";
const CANCEL_NO_ROOM: &str = "There is no room.";
const CANCEL_TOO_FAR: &str = "You are too far away.";
const CANCEL_CANNOT_MOVE: &str = "You cannot move that object.";
const CANCEL_CANNOT_EQUIP: &str = "You cannot equip that object.";
const CANCEL_CANNOT_USE: &str = "You cannot use this object.";
const CANCEL_CANNOT_SEE: &str = "You cannot see this object.";
const CANCEL_NO_CONTAINER_SLOT: &str = "You cannot open any more containers.";

/// Cheap cloneable front door to the engine: every call becomes a queued
/// task, never work on the caller's stack.
#[derive(Clone)]
pub struct EngineHandle {
    queue: Arc<EngineQueue>,
}

impl EngineHandle {
    pub fn new(queue: Arc<EngineQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<EngineQueue> {
        &self.queue
    }

    pub fn spawn(&self, character_name: String, ctrl: PlayerCtrl) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.spawn(&character_name, ctrl)),
        );
    }

    pub fn despawn(&self, creature_id: CreatureId) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.despawn(creature_id)),
        );
    }

    pub fn move_creature(&self, creature_id: CreatureId, direction: Direction) {
        self.queue.push(
            creature_id,
            Box::new(move |engine| engine.move_creature(creature_id, direction)),
        );
    }

    pub fn move_path(&self, creature_id: CreatureId, path: VecDeque<Direction>) {
        self.queue.push(
            creature_id,
            Box::new(move |engine| engine.move_path(creature_id, path)),
        );
    }

    pub fn cancel_move(&self, creature_id: CreatureId) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.cancel_move(creature_id)),
        );
    }

    pub fn turn(&self, creature_id: CreatureId, direction: Direction) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.turn(creature_id, direction)),
        );
    }

    pub fn say(
        &self,
        creature_id: CreatureId,
        say_type: u8,
        text: String,
        receiver: Option<String>,
        channel_id: Option<u16>,
    ) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.say(creature_id, say_type, &text, receiver, channel_id)),
        );
    }

    pub fn move_item(
        &self,
        creature_id: CreatureId,
        from: ItemPosition,
        to: GamePosition,
        count: u8,
    ) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.move_item(creature_id, from, to, count)),
        );
    }

    pub fn use_item(&self, creature_id: CreatureId, item: ItemPosition, new_container_id: u8) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.use_item(creature_id, item, new_container_id)),
        );
    }

    pub fn look_at(&self, creature_id: CreatureId, item: ItemPosition) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.look_at(creature_id, item)),
        );
    }

    pub fn close_container(&self, creature_id: CreatureId, local_id: u8) {
        self.queue.push(
            INVALID_CREATURE_ID,
            Box::new(move |engine| engine.close_container(creature_id, local_id)),
        );
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

pub struct GameEngine {
    queue: Arc<EngineQueue>,
    world: World,
    containers: ContainerManager,
    ctrls: HashMap<CreatureId, Rc<RefCell<PlayerCtrl>>>,
    accounts: Arc<AccountStore>,
    motd: String,
}

impl GameEngine {
    pub fn new(
        queue: Arc<EngineQueue>,
        world: World,
        accounts: Arc<AccountStore>,
        motd: String,
    ) -> Self {
        Self {
            queue,
            world,
            containers: ContainerManager::new(),
            ctrls: HashMap::new(),
            accounts,
            motd,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(Arc::clone(&self.queue))
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Drains the queue until shutdown, then drops every session.
    pub fn run(mut self) {
        while let Some(task) = self.queue.pop() {
            task(&mut self);
        }
        info!("engine stopped, closing {} sessions", self.ctrls.len());
        let ids: Vec<CreatureId> = self.ctrls.keys().copied().collect();
        for id in ids {
            self.despawn(id);
        }
    }

    fn ctrl(&self, creature_id: CreatureId) -> Option<Rc<RefCell<PlayerCtrl>>> {
        self.ctrls.get(&creature_id).cloned()
    }

    fn send_cancel(&self, creature_id: CreatureId, message: &str) {
        if let Some(ctrl) = self.ctrl(creature_id) {
            ctrl.borrow_mut().send_cancel(message);
        }
    }

    pub fn spawn(&mut self, character_name: &str, mut ctrl: PlayerCtrl) {
        if !self.accounts.character_exists(character_name) {
            debug!("spawn refused, unknown character {}", character_name);
            ctrl.send_disconnect("Invalid character.");
            ctrl.close(false);
            return;
        }

        let creature = Creature::new_player(character_name);
        let creature_id = creature.id;
        ctrl.set_player_id(creature_id);
        let ctrl = Rc::new(RefCell::new(ctrl));
        let ctrl_ref: crate::world::ctrl::CtrlRef = Rc::clone(&ctrl) as crate::world::ctrl::CtrlRef;

        let spawn = self.world.spawn_position();
        match self
            .world
            .add_creature(creature, ctrl_ref, spawn)
        {
            Ok(position) => {
                info!("player {} spawned as {} at {}", character_name, creature_id, position);
                self.ctrls.insert(creature_id, Rc::clone(&ctrl));
                ctrl.borrow_mut().on_player_spawn(&self.world, position, &self.motd);
            }
            Err(err) => {
                error!("could not spawn {}: {}", character_name, err);
                let mut ctrl = ctrl.borrow_mut();
                ctrl.send_disconnect("The world is full at the moment.");
                ctrl.close(false);
            }
        }
    }

    pub fn despawn(&mut self, creature_id: CreatureId) {
        if !self.world.creature_exists(creature_id) {
            debug!("despawn of unknown creature {}", creature_id);
            return;
        }
        info!("despawning creature {}", creature_id);

        // Pending walk tasks must not fire for a gone creature.
        self.queue.cancel_all(creature_id);
        self.containers.close_all(creature_id);

        // The departing player gets the poff before the world forgets it;
        // this is also the terminal callback a dead session waits for.
        if let (Some(ctrl), Some(position)) = (
            self.ctrl(creature_id),
            self.world.get_creature_position(creature_id),
        ) {
            let stack_pos = self
                .world
                .get_tile(position)
                .and_then(|tile| tile.creature_stack_pos(creature_id))
                .unwrap_or(u8::MAX);
            if let Some(creature) = self.world.get_creature(creature_id) {
                ctrl.borrow_mut()
                    .on_creature_despawn(&self.world, creature, position, stack_pos);
            }
        }

        if let Err(err) = self.world.remove_creature(creature_id) {
            error!("despawn failed for {}: {}", creature_id, err);
        }
        if let Some(ctrl) = self.ctrls.remove(&creature_id) {
            ctrl.borrow_mut().close(false);
        }
    }

    pub fn move_creature(&mut self, creature_id: CreatureId, direction: Direction) {
        match self.world.creature_move(creature_id, direction) {
            Ok(()) => {}
            Err(WorldError::MayNotMoveYet { ready_at }) => {
                debug!("move of {} deferred until cooldown", creature_id);
                self.queue.push_at(
                    creature_id,
                    ready_at,
                    Box::new(move |engine| engine.move_creature(creature_id, direction)),
                );
            }
            Err(WorldError::NoRoom) => self.send_cancel(creature_id, CANCEL_NO_ROOM),
            Err(err) => debug!("move of {} failed: {}", creature_id, err),
        }
    }

    pub fn move_path(&mut self, creature_id: CreatureId, path: VecDeque<Direction>) {
        let Some(player) = self
            .world
            .get_creature_mut(creature_id)
            .and_then(|c| c.player_data_mut())
        else {
            return;
        };
        player.queued_moves = path;
        self.continue_path(creature_id);
    }

    /// One auto-walk step; reschedules itself while steps remain.
    fn continue_path(&mut self, creature_id: CreatureId) {
        let Some(next) = self
            .world
            .get_creature(creature_id)
            .and_then(|c| c.player_data())
            .and_then(|p| p.queued_moves.front().copied())
        else {
            return;
        };

        match self.world.creature_move(creature_id, next) {
            Ok(()) => {
                let Some(player) = self
                    .world
                    .get_creature_mut(creature_id)
                    .and_then(|c| c.player_data_mut())
                else {
                    return;
                };
                player.queued_moves.pop_front();
                if player.queued_moves.is_empty() {
                    return;
                }
                let ready_at = player.next_walk_time;
                match ready_at {
                    Some(at) => self.queue.push_at(
                        creature_id,
                        at,
                        Box::new(move |engine| engine.continue_path(creature_id)),
                    ),
                    None => self.continue_path(creature_id),
                }
            }
            Err(WorldError::MayNotMoveYet { ready_at }) => {
                self.queue.push_at(
                    creature_id,
                    ready_at,
                    Box::new(move |engine| engine.continue_path(creature_id)),
                );
            }
            Err(err) => {
                debug!("auto-walk of {} stopped: {}", creature_id, err);
                if matches!(err, WorldError::NoRoom) {
                    self.send_cancel(creature_id, CANCEL_NO_ROOM);
                }
                self.cancel_move(creature_id);
            }
        }
    }

    pub fn cancel_move(&mut self, creature_id: CreatureId) {
        self.queue.cancel_all(creature_id);
        let had_queued = self
            .world
            .get_creature_mut(creature_id)
            .and_then(|c| c.player_data_mut())
            .map(|p| {
                let had = !p.queued_moves.is_empty();
                p.queued_moves.clear();
                had
            })
            .unwrap_or(false);
        if had_queued {
            if let Some(ctrl) = self.ctrl(creature_id) {
                ctrl.borrow_mut().cancel_walk();
            }
        }
    }

    pub fn turn(&mut self, creature_id: CreatureId, direction: Direction) {
        if let Err(err) = self.world.creature_turn(creature_id, direction) {
            debug!("turn of {} failed: {}", creature_id, err);
        }
    }

    pub fn say(
        &mut self,
        creature_id: CreatureId,
        say_type: u8,
        text: &str,
        receiver: Option<String>,
        channel_id: Option<u16>,
    ) {
        debug!(
            "say from {}: type {} receiver {:?} channel {:?}",
            creature_id, say_type, receiver, channel_id
        );
        if let Some(command) = text.strip_prefix('/') {
            self.run_say_command(creature_id, command);
            return;
        }
        if let Err(err) = self.world.creature_say(creature_id, text) {
            debug!("say of {} failed: {}", creature_id, err);
        }
    }

    /// In-game slash commands, a leftover debugging surface the legacy
    /// client had no UI for.
    fn run_say_command(&mut self, creature_id: CreatureId, command: &str) {
        let (command, option) = match command.split_once(' ') {
            Some((c, o)) => (c, o),
            None => (command, ""),
        };
        match command {
            "debug" | "debugf" => {
                let Some(mut position) = self.world.get_creature_position(creature_id) else {
                    return;
                };
                if command == "debugf" {
                    let Some(creature) = self.world.get_creature(creature_id) else {
                        return;
                    };
                    match position.step(creature.direction) {
                        Some(front) => position = front,
                        None => return,
                    }
                }
                let Some(tile) = self.world.get_tile(position) else {
                    self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    return;
                };
                let mut text = format!("Position: {position}\n");
                let describe = |item: Item| {
                    let name = self
                        .world
                        .item_types()
                        .get(item.type_id)
                        .map(|t| t.name.clone())
                        .unwrap_or_default();
                    format!("Item: {} ({})\n", item.type_id.0, name)
                };
                text.push_str(&describe(tile.ground()));
                for item in tile.top_items() {
                    text.push_str(&describe(*item));
                }
                for id in tile.creature_ids() {
                    text.push_str(&format!("Creature: {id}\n"));
                }
                for item in tile.bottom_items() {
                    text.push_str(&describe(*item));
                }
                if let Some(ctrl) = self.ctrl(creature_id) {
                    ctrl.borrow_mut()
                        .send_text_message(MESSAGE_INFO, &text);
                }
            }
            "put" => {
                let Ok(type_id) = option.trim().parse::<u16>() else {
                    self.send_info(creature_id, "Invalid itemId");
                    return;
                };
                if !self
                    .world
                    .item_types()
                    .contains(ItemTypeId(type_id))
                {
                    self.send_info(creature_id, "Invalid itemId");
                    return;
                }
                let Some(creature) = self.world.get_creature(creature_id) else {
                    return;
                };
                let direction = creature.direction;
                let Some(front) = self
                    .world
                    .get_creature_position(creature_id)
                    .and_then(|p| p.step(direction))
                else {
                    return;
                };
                let item = Item::new(ItemTypeId(type_id));
                if let Err(err) = self.world.add_item(front, item) {
                    debug!("put failed: {}", err);
                }
            }
            _ => self.send_info(creature_id, "Invalid command"),
        }
    }

    fn send_info(&self, creature_id: CreatureId, text: &str) {
        if let Some(ctrl) = self.ctrl(creature_id) {
            ctrl.borrow_mut()
                .send_text_message(MESSAGE_INFO, text);
        }
    }

    pub fn move_item(
        &mut self,
        creature_id: CreatureId,
        from: ItemPosition,
        to: GamePosition,
        count: u8,
    ) {
        if !self.world.creature_exists(creature_id) {
            return;
        }
        match (from.position, to) {
            (GamePosition::Tile(from_pos), GamePosition::Tile(to_pos)) => {
                match self.world.move_item(
                    creature_id,
                    from_pos,
                    from.stack_pos,
                    from.item_type_id,
                    count,
                    to_pos,
                ) {
                    Ok(()) => {}
                    Err(WorldError::CannotReach) => {
                        self.send_cancel(creature_id, CANCEL_TOO_FAR)
                    }
                    Err(WorldError::NoRoom) => self.send_cancel(creature_id, CANCEL_NO_ROOM),
                    Err(WorldError::CannotMove) => {
                        self.send_cancel(creature_id, CANCEL_CANNOT_MOVE)
                    }
                    Err(err) => {
                        debug!("move item failed: {}", err);
                        self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    }
                }
            }
            (GamePosition::Tile(from_pos), GamePosition::Inventory { slot }) => {
                self.move_item_tile_to_inventory(creature_id, from, from_pos, slot);
            }
            (GamePosition::Inventory { slot }, GamePosition::Tile(to_pos)) => {
                self.move_item_inventory_to_tile(creature_id, from, slot, to_pos);
            }
            (GamePosition::Inventory { slot: from_slot }, GamePosition::Inventory { slot: to_slot }) => {
                self.move_item_inventory_to_inventory(creature_id, from, from_slot, to_slot);
            }
            (GamePosition::Container { local_id, slot }, to) => {
                self.move_item_from_container(creature_id, from, local_id, slot, to);
            }
            (from_pos, GamePosition::Container { local_id, slot }) => {
                self.move_item_to_container(creature_id, from, from_pos, local_id, slot);
            }
        }
    }

    fn move_item_tile_to_inventory(
        &mut self,
        creature_id: CreatureId,
        from: ItemPosition,
        from_pos: Position,
        slot: u8,
    ) {
        if from.item_type_id.0 == CREATURE_MARKER_ID {
            self.send_cancel(creature_id, CANCEL_CANNOT_MOVE);
            return;
        }
        if !self.world.creature_can_reach(creature_id, from_pos) {
            self.send_cancel(creature_id, CANCEL_TOO_FAR);
            return;
        }
        let item = self
            .world
            .get_tile(from_pos)
            .and_then(|tile| tile.item_at(from.stack_pos))
            .filter(|item| item.type_id == from.item_type_id);
        let Some(item) = item else {
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        };
        let can_add = self
            .world
            .get_creature(creature_id)
            .and_then(|c| c.player_data())
            .map(|p| p.equipment.can_add_item(slot))
            .unwrap_or(false);
        if !can_add {
            self.send_cancel(creature_id, CANCEL_CANNOT_EQUIP);
            return;
        }
        if let Err(err) = self.world.remove_item(from_pos, item, from.stack_pos) {
            debug!("tile-to-inventory remove failed: {}", err);
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        }
        if let Some(player) = self
            .world
            .get_creature_mut(creature_id)
            .and_then(|c| c.player_data_mut())
        {
            player.equipment.add_item(item, slot);
        }
        self.notify_equipment(creature_id, slot);
    }

    fn move_item_inventory_to_tile(
        &mut self,
        creature_id: CreatureId,
        from: ItemPosition,
        slot: u8,
        to_pos: Position,
    ) {
        let item = self
            .world
            .get_creature(creature_id)
            .and_then(|c| c.player_data())
            .and_then(|p| p.equipment.item(slot))
            .filter(|item| item.type_id == from.item_type_id);
        let Some(item) = item else {
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        };
        if !self.world.creature_can_throw_to(creature_id, to_pos) {
            self.send_cancel(creature_id, CANCEL_NO_ROOM);
            return;
        }
        if let Some(player) = self
            .world
            .get_creature_mut(creature_id)
            .and_then(|c| c.player_data_mut())
        {
            player.equipment.remove_item(slot);
        }
        self.notify_equipment(creature_id, slot);
        if let Err(err) = self.world.add_item(to_pos, item) {
            debug!("inventory-to-tile add failed: {}", err);
        }
    }

    fn move_item_inventory_to_inventory(
        &mut self,
        creature_id: CreatureId,
        from: ItemPosition,
        from_slot: u8,
        to_slot: u8,
    ) {
        let Some(player) = self
            .world
            .get_creature(creature_id)
            .and_then(|c| c.player_data())
        else {
            return;
        };
        let item = player
            .equipment
            .item(from_slot)
            .filter(|item| item.type_id == from.item_type_id);
        let Some(item) = item else {
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        };
        if !player.equipment.can_add_item(to_slot) {
            self.send_cancel(creature_id, CANCEL_CANNOT_EQUIP);
            return;
        }
        if let Some(player) = self
            .world
            .get_creature_mut(creature_id)
            .and_then(|c| c.player_data_mut())
        {
            player.equipment.remove_item(from_slot);
            player.equipment.add_item(item, to_slot);
        }
        self.notify_equipment(creature_id, from_slot);
        self.notify_equipment(creature_id, to_slot);
    }

    fn move_item_from_container(
        &mut self,
        creature_id: CreatureId,
        from: ItemPosition,
        local_id: u8,
        slot: u8,
        to: GamePosition,
    ) {
        let Some(global) = self.containers.global_for(creature_id, local_id) else {
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        };
        let item = self
            .containers
            .get(global)
            .and_then(|c| c.items.get(usize::from(slot)).copied())
            .filter(|item| item.type_id == from.item_type_id);
        let Some(item) = item else {
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        };

        match to {
            GamePosition::Tile(to_pos) => {
                if !self.world.creature_can_throw_to(creature_id, to_pos) {
                    self.send_cancel(creature_id, CANCEL_NO_ROOM);
                    return;
                }
                match self.containers.remove_item(global, slot) {
                    Ok((item, affected)) => {
                        self.notify_container_remove(&affected, slot);
                        if let Err(err) = self.world.add_item(to_pos, item) {
                            debug!("container-to-tile add failed: {}", err);
                        }
                    }
                    Err(err) => {
                        debug!("container remove failed: {}", err);
                        self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    }
                }
            }
            GamePosition::Inventory { slot: inv_slot } => {
                let can_add = self
                    .world
                    .get_creature(creature_id)
                    .and_then(|c| c.player_data())
                    .map(|p| p.equipment.can_add_item(inv_slot))
                    .unwrap_or(false);
                if !can_add {
                    self.send_cancel(creature_id, CANCEL_CANNOT_EQUIP);
                    return;
                }
                match self.containers.remove_item(global, slot) {
                    Ok((item, affected)) => {
                        self.notify_container_remove(&affected, slot);
                        if let Some(player) = self
                            .world
                            .get_creature_mut(creature_id)
                            .and_then(|c| c.player_data_mut())
                        {
                            player.equipment.add_item(item, inv_slot);
                        }
                        self.notify_equipment(creature_id, inv_slot);
                    }
                    Err(err) => {
                        debug!("container remove failed: {}", err);
                        self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    }
                }
            }
            GamePosition::Container {
                local_id: to_local, ..
            } => {
                let Some(to_global) = self.containers.global_for(creature_id, to_local) else {
                    self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    return;
                };
                let has_room = self
                    .containers
                    .get(to_global)
                    .map(|c| c.items.len() < usize::from(c.capacity))
                    .unwrap_or(false);
                if !has_room {
                    self.send_cancel(creature_id, CANCEL_NO_ROOM);
                    return;
                }
                let removed = match self.containers.remove_item(global, slot) {
                    Ok((item, affected)) => {
                        self.notify_container_remove(&affected, slot);
                        item
                    }
                    Err(err) => {
                        debug!("container remove failed: {}", err);
                        self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                        return;
                    }
                };
                match self.containers.add_item(to_global, removed) {
                    Ok(affected) => self.notify_container_add(&affected, removed),
                    Err(err) => debug!("container add failed: {}", err),
                }
            }
        }
    }

    fn move_item_to_container(
        &mut self,
        creature_id: CreatureId,
        from: ItemPosition,
        from_pos: GamePosition,
        local_id: u8,
        _slot: u8,
    ) {
        let Some(global) = self.containers.global_for(creature_id, local_id) else {
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        };
        let has_room = self
            .containers
            .get(global)
            .map(|c| c.items.len() < usize::from(c.capacity))
            .unwrap_or(false);
        if !has_room {
            self.send_cancel(creature_id, CANCEL_NO_ROOM);
            return;
        }

        let item = match from_pos {
            GamePosition::Tile(tile_pos) => {
                if from.item_type_id.0 == CREATURE_MARKER_ID {
                    self.send_cancel(creature_id, CANCEL_CANNOT_MOVE);
                    return;
                }
                if !self.world.creature_can_reach(creature_id, tile_pos) {
                    self.send_cancel(creature_id, CANCEL_TOO_FAR);
                    return;
                }
                let item = self
                    .world
                    .get_tile(tile_pos)
                    .and_then(|tile| tile.item_at(from.stack_pos))
                    .filter(|item| item.type_id == from.item_type_id);
                let Some(item) = item else {
                    self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    return;
                };
                if let Err(err) = self.world.remove_item(tile_pos, item, from.stack_pos) {
                    debug!("tile-to-container remove failed: {}", err);
                    self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    return;
                }
                item
            }
            GamePosition::Inventory { slot } => {
                let item = self
                    .world
                    .get_creature(creature_id)
                    .and_then(|c| c.player_data())
                    .and_then(|p| p.equipment.item(slot))
                    .filter(|item| item.type_id == from.item_type_id);
                let Some(item) = item else {
                    self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    return;
                };
                if let Some(player) = self
                    .world
                    .get_creature_mut(creature_id)
                    .and_then(|c| c.player_data_mut())
                {
                    player.equipment.remove_item(slot);
                }
                self.notify_equipment(creature_id, slot);
                item
            }
            GamePosition::Container { .. } => return, // handled by move_item_from_container
        };

        match self.containers.add_item(global, item) {
            Ok(affected) => self.notify_container_add(&affected, item),
            Err(err) => debug!("container add failed: {}", err),
        }
    }

    fn notify_equipment(&self, creature_id: CreatureId, slot: u8) {
        let Some(ctrl) = self.ctrl(creature_id) else {
            return;
        };
        if let Some(player) = self.world.get_creature(creature_id) {
            ctrl.borrow_mut().on_equipment_updated(player, slot);
        }
    }

    fn notify_container_add(&self, affected: &[(CreatureId, u8)], item: Item) {
        for (player, local_id) in affected {
            if let Some(ctrl) = self.ctrl(*player) {
                ctrl.borrow_mut().on_container_add_item(*local_id, item);
            }
        }
    }

    fn notify_container_remove(&self, affected: &[(CreatureId, u8)], slot: u8) {
        for (player, local_id) in affected {
            if let Some(ctrl) = self.ctrl(*player) {
                ctrl.borrow_mut().on_container_remove_item(*local_id, slot);
            }
        }
    }

    pub fn use_item(&mut self, creature_id: CreatureId, item: ItemPosition, new_container_id: u8) {
        // The client proposes a slot id; allocation is server-side, and the
        // open-container response names the slot actually used.
        let _ = new_container_id;
        if !self.world.creature_exists(creature_id) {
            return;
        }
        let Some(found) = self.resolve_item(creature_id, item) else {
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        };
        let Some(item_type) = self.world.item_types().get(found.type_id) else {
            self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            return;
        };
        if !item_type.container {
            self.send_cancel(creature_id, CANCEL_CANNOT_USE);
            return;
        }
        let Some(capacity) = item_type.max_items() else {
            error!(
                "container type {} has no maxitems attribute",
                found.type_id.0
            );
            self.send_cancel(creature_id, CANCEL_CANNOT_USE);
            return;
        };

        let root = match item.position {
            GamePosition::Tile(position) => {
                if !self.world.creature_can_reach(creature_id, position) {
                    self.send_cancel(creature_id, CANCEL_TOO_FAR);
                    return;
                }
                ContainerRoot::Tile {
                    position,
                    stack_pos: item.stack_pos,
                }
            }
            GamePosition::Inventory { slot } => ContainerRoot::Equipment {
                player: creature_id,
                slot,
            },
            GamePosition::Container { local_id, slot } => {
                let Some(parent) = self.containers.global_for(creature_id, local_id) else {
                    self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
                    return;
                };
                ContainerRoot::Nested { parent, slot }
            }
        };

        match self
            .containers
            .open(creature_id, found.type_id, capacity, root)
        {
            Ok((local_id, global)) => {
                if let (Some(ctrl), Some(container)) =
                    (self.ctrl(creature_id), self.containers.get(global))
                {
                    ctrl.borrow_mut().on_open_container(local_id, container);
                }
            }
            Err(ContainerError::NoSlot) => {
                self.send_cancel(creature_id, CANCEL_NO_CONTAINER_SLOT)
            }
            Err(err) => {
                debug!("container open failed: {}", err);
                self.send_cancel(creature_id, CANCEL_NOT_POSSIBLE);
            }
        }
    }

    pub fn look_at(&mut self, creature_id: CreatureId, item: ItemPosition) {
        if !self.world.creature_exists(creature_id) {
            return;
        }

        if item.item_type_id.0 == CREATURE_MARKER_ID {
            if let GamePosition::Tile(position) = item.position {
                let seen = self
                    .world
                    .get_tile(position)
                    .and_then(|tile| match tile.entry_at(item.stack_pos) {
                        Some(crate::world::tile::TileEntry::Creature(id)) => Some(id),
                        _ => tile.creature_ids().first().copied(),
                    })
                    .and_then(|id| self.world.get_creature(id))
                    .map(|creature| format!("You see {}.", creature.name));
                match seen {
                    Some(text) => self.send_info(creature_id, &text),
                    None => self.send_cancel(creature_id, CANCEL_CANNOT_SEE),
                }
                return;
            }
        }

        let Some(found) = self.resolve_item(creature_id, item) else {
            self.send_cancel(creature_id, CANCEL_CANNOT_SEE);
            return;
        };
        let Some(item_type) = self.world.item_types().get(found.type_id) else {
            self.send_cancel(creature_id, CANCEL_CANNOT_SEE);
            return;
        };

        let mut text = if item_type.name.is_empty() {
            format!("You see an item with id {}.", found.type_id.0)
        } else if item_type.stackable && found.count > 1 {
            format!("You see {} {}s.", found.count, item_type.name)
        } else {
            format!("You see a {}.", item_type.name)
        };
        if let Some(weight) = item_type.weight() {
            text.push_str(&format!("\nIt weighs {weight:.2} oz."));
        }
        if let Some(description) = item_type.description() {
            text.push('\n');
            text.push_str(description);
        }
        self.send_info(creature_id, &text);
    }

    pub fn close_container(&mut self, creature_id: CreatureId, local_id: u8) {
        if let Err(err) = self.containers.close(creature_id, local_id) {
            debug!(
                "close container {} for {} failed: {}",
                local_id, creature_id, err
            );
        }
    }

    /// Looks an item up the way the client addressed it.
    fn resolve_item(&self, creature_id: CreatureId, item: ItemPosition) -> Option<Item> {
        match item.position {
            GamePosition::Tile(position) => self
                .world
                .get_tile(position)
                .and_then(|tile| tile.item_at(item.stack_pos)),
            GamePosition::Inventory { slot } => self
                .world
                .get_creature(creature_id)
                .and_then(|c| c.player_data())
                .and_then(|p| p.equipment.item(slot)),
            GamePosition::Container { local_id, slot } => {
                let global = self.containers.global_for(creature_id, local_id)?;
                self.containers
                    .get(global)
                    .and_then(|c| c.items.get(usize::from(slot)).copied())
            }
        }
    }
}
