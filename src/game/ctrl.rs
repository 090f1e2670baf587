//! The engine's handle to one connected client.
//!
//! Translates world events into 7.1 packets, filtered through the client's
//! viewport, and tracks which creatures the client has already learned so
//! the encoder can pick the short known-creature form. Everything here runs
//! on the engine thread; the sink hands finished packets to the connection
//! writer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::game::container::Container;
use crate::net::packet::PacketWriter;
use crate::net::server::PacketSink;
use crate::proto::game::{
    add_item, add_position, EFFECT_POFF, EFFECT_SPAWN_BUBBLE, MESSAGE_CANCEL, MESSAGE_LOGIN,
    OPCODE_CANCEL_WALK, OPCODE_CONTAINER_ADD, OPCODE_CONTAINER_REMOVE, OPCODE_CONTAINER_UPDATE,
    OPCODE_CREATURE_KNOWN, OPCODE_CREATURE_SAY, OPCODE_CREATURE_TURN, OPCODE_CREATURE_UNKNOWN,
    OPCODE_DISCONNECT, OPCODE_FIELD_DATA, OPCODE_FULL_MAP, OPCODE_INVENTORY_CLEAR,
    OPCODE_INVENTORY_SET, OPCODE_MAGIC_EFFECT, OPCODE_MAP_COL_EAST, OPCODE_MAP_COL_WEST,
    OPCODE_MAP_ROW_NORTH, OPCODE_MAP_ROW_SOUTH, OPCODE_MOVE_CREATURE, OPCODE_OPEN_CONTAINER,
    OPCODE_PLAYER_SKILLS, OPCODE_PLAYER_SPAWN, OPCODE_PLAYER_STATS, OPCODE_TEXT_MESSAGE,
    OPCODE_TILE_ADD_THING, OPCODE_TILE_REMOVE_THING, OPCODE_WORLD_LIGHT,
};
use crate::world::creature::{Creature, CreatureId, EQUIPMENT_SLOT_FIRST, EQUIPMENT_SLOT_LAST};
use crate::world::ctrl::CreatureCtrl;
use crate::world::item::{Item, ItemTypeIndex};
use crate::world::position::Position;
use crate::world::state::World;
use crate::world::tile::Tile;

/// Known-creature cache slots. Slot reuse, not LRU: the first free slot
/// takes a new creature, slot 0 is sacrificed when none is free.
pub const KNOWN_CREATURES: usize = 64;

/// Full client viewport and the offsets of its top-left corner.
pub const VIEWPORT_WIDTH: u16 = 18;
pub const VIEWPORT_HEIGHT: u16 = 14;
const VIEW_OFFSET_X: i32 = -8;
const VIEW_OFFSET_Y: i32 = -6;

/// A tile entry budget of ten is baked into the client renderer.
const MAX_TILE_THINGS: usize = 10;

pub struct PlayerCtrl {
    sink: PacketSink,
    player_id: Arc<AtomicU32>,
    item_types: Arc<ItemTypeIndex>,
    known_creatures: [u32; KNOWN_CREATURES],
}

impl PlayerCtrl {
    pub fn new(sink: PacketSink, player_id: Arc<AtomicU32>, item_types: Arc<ItemTypeIndex>) -> Self {
        Self {
            sink,
            player_id,
            item_types,
            known_creatures: [0; KNOWN_CREATURES],
        }
    }

    pub fn player_id(&self) -> CreatureId {
        CreatureId(self.player_id.load(Ordering::SeqCst))
    }

    pub fn set_player_id(&self, id: CreatureId) {
        self.player_id.store(id.0, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    pub fn close(&self, force: bool) {
        self.sink.close(force);
    }

    fn send(&self, writer: PacketWriter) {
        if !writer.is_empty() {
            self.sink.send(writer.into_vec());
        }
    }

    fn own_position(&self, world: &World) -> Option<Position> {
        world.get_creature_position(self.player_id())
    }

    fn can_see(&self, world: &World, position: Position) -> bool {
        self.own_position(world)
            .map(|own| World::can_see(own, position))
            .unwrap_or(false)
    }

    /// Known/unknown creature encoding plus the common tail. The 0x61 form
    /// reports which cached id the client should forget.
    fn add_creature(&mut self, writer: &mut PacketWriter, creature: &Creature) {
        let id = creature.id.0;
        if self.known_creatures.contains(&id) {
            writer.add_u8(OPCODE_CREATURE_KNOWN);
            writer.add_u8(0x00);
            writer.add_u32(id);
        } else {
            let evicted = match self.known_creatures.iter().position(|&slot| slot == 0) {
                Some(free) => {
                    self.known_creatures[free] = id;
                    0
                }
                None => {
                    let evicted = self.known_creatures[0];
                    debug!("known-creature cache full, evicting {}", evicted);
                    self.known_creatures[0] = id;
                    evicted
                }
            };
            writer.add_u8(OPCODE_CREATURE_UNKNOWN);
            writer.add_u8(0x00);
            writer.add_u32(evicted);
            writer.add_u32(id);
            writer.add_string(creature.name.as_bytes());
        }

        writer.add_u8(creature.health_percent());
        writer.add_u8(creature.direction.wire_code());
        writer.add_u8(creature.outfit.look_type);
        writer.add_u8(creature.outfit.head);
        writer.add_u8(creature.outfit.body);
        writer.add_u8(creature.outfit.legs);
        writer.add_u8(creature.outfit.feet);
        writer.add_u8(0x00);
        writer.add_u8(0xdc);
        writer.add_u16(creature.speed);
    }

    fn add_tile(&mut self, writer: &mut PacketWriter, world: &World, tile: &Tile) {
        let mut count = 0;
        add_item(writer, tile.ground(), &self.item_types);
        count += 1;
        for item in tile.top_items() {
            if count >= MAX_TILE_THINGS {
                return;
            }
            add_item(writer, *item, &self.item_types);
            count += 1;
        }
        for creature_id in tile.creature_ids() {
            if count >= MAX_TILE_THINGS {
                return;
            }
            if let Some(creature) = world.get_creature(*creature_id) {
                self.add_creature(writer, creature);
                count += 1;
            }
        }
        for item in tile.bottom_items() {
            if count >= MAX_TILE_THINGS {
                return;
            }
            add_item(writer, *item, &self.item_types);
            count += 1;
        }
    }

    /// Rectangle of tiles with `0x00 0xFF` between tiles (not after the
    /// last). Absent tiles emit nothing but keep their separator.
    fn add_map_block(
        &mut self,
        writer: &mut PacketWriter,
        world: &World,
        top_left: Position,
        width: u16,
        height: u16,
    ) {
        let block = world.get_map_block(top_left, width, height);
        let last = block.len().saturating_sub(1);
        for (index, tile) in block.into_iter().enumerate() {
            if let Some(tile) = tile {
                self.add_tile(writer, world, tile);
            }
            if index != last {
                writer.add_u8(0x00);
                writer.add_u8(0xff);
            }
        }
    }

    /// The login composite: id, full map, effects, stats, skills and
    /// equipment, closed by the message of the day.
    pub fn on_player_spawn(&mut self, world: &World, position: Position, motd: &str) {
        if !self.is_connected() {
            return;
        }
        let player_id = self.player_id();
        let Some(player) = world.get_creature(player_id) else {
            return;
        };

        let mut writer = PacketWriter::with_capacity(2048);
        writer.add_u8(OPCODE_PLAYER_SPAWN);
        writer.add_u32(player_id.0);
        writer.add_u8(0x32);
        writer.add_u8(0x00);

        writer.add_u8(OPCODE_FULL_MAP);
        add_position(&mut writer, position);
        if let Some(top_left) = position.offset(VIEW_OFFSET_X, VIEW_OFFSET_Y) {
            self.add_map_block(&mut writer, world, top_left, VIEWPORT_WIDTH, VIEWPORT_HEIGHT);
        }
        for _ in 0..12 {
            writer.add_u8(0xff);
        }
        writer.add_u8(0xe4);
        writer.add_u8(0xff);

        writer.add_u8(OPCODE_MAGIC_EFFECT);
        add_position(&mut writer, position);
        writer.add_u8(EFFECT_SPAWN_BUBBLE);

        self.add_player_stats(&mut writer, player);

        writer.add_u8(OPCODE_WORLD_LIGHT);
        writer.add_u8(0x6f);
        writer.add_u8(0xd7);

        self.add_player_skills(&mut writer, player);
        for slot in EQUIPMENT_SLOT_FIRST..=EQUIPMENT_SLOT_LAST {
            self.add_equipment_slot(&mut writer, player, slot);
        }

        writer.add_u8(OPCODE_TEXT_MESSAGE);
        writer.add_u8(MESSAGE_LOGIN);
        writer.add_string_str(motd);

        self.send(writer);
    }

    fn add_player_stats(&self, writer: &mut PacketWriter, player: &Creature) {
        let Some(data) = player.player_data() else {
            return;
        };
        writer.add_u8(OPCODE_PLAYER_STATS);
        writer.add_u16(player.health);
        writer.add_u16(player.max_health);
        writer.add_u16(data.capacity);
        writer.add_u32(data.experience);
        writer.add_u8(data.level);
        writer.add_u16(data.mana);
        writer.add_u16(data.max_mana);
        writer.add_u8(data.magic_level);
    }

    fn add_player_skills(&self, writer: &mut PacketWriter, player: &Creature) {
        let Some(data) = player.player_data() else {
            return;
        };
        writer.add_u8(OPCODE_PLAYER_SKILLS);
        for skill in data.skills {
            writer.add_u8(skill);
        }
    }

    fn add_equipment_slot(&self, writer: &mut PacketWriter, player: &Creature, slot: u8) {
        let Some(data) = player.player_data() else {
            return;
        };
        match data.equipment.item(slot) {
            Some(item) => {
                writer.add_u8(OPCODE_INVENTORY_SET);
                writer.add_u8(slot);
                add_item(writer, item, &self.item_types);
            }
            None => {
                writer.add_u8(OPCODE_INVENTORY_CLEAR);
                writer.add_u8(slot);
            }
        }
    }

    pub fn on_equipment_updated(&mut self, player: &Creature, slot: u8) {
        if !self.is_connected() {
            return;
        }
        let mut writer = PacketWriter::new();
        self.add_equipment_slot(&mut writer, player, slot);
        self.send(writer);
    }

    pub fn on_open_container(&mut self, local_id: u8, container: &Container) {
        if !self.is_connected() {
            return;
        }
        let name = self
            .item_types
            .get(container.item_type_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_OPEN_CONTAINER);
        writer.add_u8(local_id);
        writer.add_u16(container.item_type_id.0);
        writer.add_string_str(&name);
        writer.add_u16(container.capacity);
        writer.add_u8(container.items.len().min(u8::MAX as usize) as u8);
        for item in &container.items {
            add_item(&mut writer, *item, &self.item_types);
        }
        self.send(writer);
    }

    pub fn on_container_add_item(&mut self, local_id: u8, item: Item) {
        if !self.is_connected() {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_CONTAINER_ADD);
        writer.add_u8(local_id);
        add_item(&mut writer, item, &self.item_types);
        self.send(writer);
    }

    pub fn on_container_update_item(&mut self, local_id: u8, slot: u8, item: Item) {
        if !self.is_connected() {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_CONTAINER_UPDATE);
        writer.add_u8(local_id);
        writer.add_u8(slot);
        add_item(&mut writer, item, &self.item_types);
        self.send(writer);
    }

    pub fn on_container_remove_item(&mut self, local_id: u8, slot: u8) {
        if !self.is_connected() {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_CONTAINER_REMOVE);
        writer.add_u8(local_id);
        writer.add_u8(slot);
        self.send(writer);
    }

    pub fn send_text_message(&mut self, message_type: u8, text: &str) {
        if !self.is_connected() {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_TEXT_MESSAGE);
        writer.add_u8(message_type);
        writer.add_string_str(text);
        self.send(writer);
    }

    pub fn send_cancel(&mut self, text: &str) {
        self.send_text_message(MESSAGE_CANCEL, text);
    }

    pub fn cancel_walk(&mut self) {
        if !self.is_connected() {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_CANCEL_WALK);
        self.send(writer);
    }

    /// Login refusal or forced logout reason, then the client disconnects.
    pub fn send_disconnect(&mut self, reason: &str) {
        if !self.is_connected() {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_DISCONNECT);
        writer.add_string_str(reason);
        self.send(writer);
    }
}

impl CreatureCtrl for PlayerCtrl {
    fn on_creature_spawn(&mut self, world: &World, creature: &Creature, position: Position) {
        if !self.is_connected() || !self.can_see(world, position) {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_TILE_ADD_THING);
        add_position(&mut writer, position);
        self.add_creature(&mut writer, creature);
        writer.add_u8(OPCODE_MAGIC_EFFECT);
        add_position(&mut writer, position);
        writer.add_u8(EFFECT_SPAWN_BUBBLE);
        self.send(writer);
    }

    fn on_creature_despawn(
        &mut self,
        world: &World,
        _creature: &Creature,
        position: Position,
        stack_pos: u8,
    ) {
        if !self.is_connected() || !self.can_see(world, position) {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_MAGIC_EFFECT);
        add_position(&mut writer, position);
        writer.add_u8(EFFECT_POFF);
        writer.add_u8(OPCODE_TILE_REMOVE_THING);
        add_position(&mut writer, position);
        writer.add_u8(stack_pos);
        self.send(writer);
    }

    fn on_creature_move(
        &mut self,
        world: &World,
        creature: &Creature,
        old_position: Position,
        old_stack_pos: u8,
        new_position: Position,
        _new_stack_pos: u8,
    ) {
        if !self.is_connected() {
            return;
        }
        let is_self = creature.id == self.player_id();
        // The mover's own viewport is centred on the destination.
        let own = if is_self {
            new_position
        } else {
            match self.own_position(world) {
                Some(own) => own,
                None => return,
            }
        };
        let sees_old = World::can_see(own, old_position);
        let sees_new = World::can_see(own, new_position);

        let mut writer = PacketWriter::new();
        if sees_old && sees_new {
            writer.add_u8(OPCODE_MOVE_CREATURE);
            add_position(&mut writer, old_position);
            writer.add_u8(old_stack_pos);
            add_position(&mut writer, new_position);
        } else if sees_old {
            writer.add_u8(OPCODE_TILE_REMOVE_THING);
            add_position(&mut writer, old_position);
            writer.add_u8(old_stack_pos);
        } else if sees_new {
            writer.add_u8(OPCODE_TILE_ADD_THING);
            add_position(&mut writer, new_position);
            self.add_creature(&mut writer, creature);
        } else {
            return;
        }

        if is_self {
            // The viewport shifted; stream the strip of tiles that entered it.
            if new_position.y < old_position.y {
                writer.add_u8(OPCODE_MAP_ROW_NORTH);
                if let Some(top_left) = new_position.offset(VIEW_OFFSET_X, VIEW_OFFSET_Y) {
                    self.add_map_block(&mut writer, world, top_left, VIEWPORT_WIDTH, 1);
                }
                writer.add_u8(0x7e);
                writer.add_u8(0xff);
            } else if new_position.y > old_position.y {
                writer.add_u8(OPCODE_MAP_ROW_SOUTH);
                if let Some(top_left) = new_position.offset(VIEW_OFFSET_X, 7) {
                    self.add_map_block(&mut writer, world, top_left, VIEWPORT_WIDTH, 1);
                }
                writer.add_u8(0x7e);
                writer.add_u8(0xff);
            }
            if new_position.x < old_position.x {
                writer.add_u8(OPCODE_MAP_COL_WEST);
                if let Some(top_left) = new_position.offset(VIEW_OFFSET_X, VIEW_OFFSET_Y) {
                    self.add_map_block(&mut writer, world, top_left, 1, VIEWPORT_HEIGHT);
                }
                writer.add_u8(0x62);
                writer.add_u8(0xff);
            } else if new_position.x > old_position.x {
                writer.add_u8(OPCODE_MAP_COL_EAST);
                if let Some(top_left) = new_position.offset(9, VIEW_OFFSET_Y) {
                    self.add_map_block(&mut writer, world, top_left, 1, VIEWPORT_HEIGHT);
                }
                writer.add_u8(0x62);
                writer.add_u8(0xff);
            }
        }

        self.send(writer);
    }

    fn on_creature_turn(
        &mut self,
        world: &World,
        creature: &Creature,
        position: Position,
        stack_pos: u8,
    ) {
        if !self.is_connected() || !self.can_see(world, position) {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_CREATURE_TURN);
        add_position(&mut writer, position);
        writer.add_u8(stack_pos);
        writer.add_u8(0x63);
        writer.add_u8(0x00);
        writer.add_u32(creature.id.0);
        writer.add_u8(creature.direction.wire_code());
        self.send(writer);
    }

    fn on_creature_say(
        &mut self,
        _world: &World,
        creature: &Creature,
        position: Position,
        message: &str,
    ) {
        if !self.is_connected() {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_CREATURE_SAY);
        writer.add_string(creature.name.as_bytes());
        writer.add_u8(0x01);
        add_position(&mut writer, position);
        writer.add_string_str(message);
        self.send(writer);
    }

    fn on_item_added(&mut self, world: &World, item: Item, position: Position) {
        if !self.is_connected() || !self.can_see(world, position) {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_TILE_ADD_THING);
        add_position(&mut writer, position);
        add_item(&mut writer, item, &self.item_types);
        self.send(writer);
    }

    fn on_item_removed(&mut self, world: &World, position: Position, stack_pos: u8) {
        if !self.is_connected() || !self.can_see(world, position) {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_TILE_REMOVE_THING);
        add_position(&mut writer, position);
        writer.add_u8(stack_pos);
        self.send(writer);
    }

    fn on_tile_update(&mut self, world: &World, position: Position) {
        if !self.is_connected() || !self.can_see(world, position) {
            return;
        }
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_FIELD_DATA);
        add_position(&mut writer, position);
        if let Some(tile) = world.get_tile(position) {
            self.add_tile(&mut writer, world, tile);
        }
        writer.add_u8(0x00);
        writer.add_u8(0xff);
        self.send(writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::server::{read_frame, start_connection_writer, ConnectionId};
    use crate::world::creature::Creature;
    use crate::world::state::testutil::{empty_world, test_item_types};
    use crate::world::state::{SURFACE_FLOOR, WORLD_ORIGIN};
    use std::cell::RefCell;
    use std::net::{TcpListener, TcpStream};
    use std::rc::Rc;

    fn harness() -> (PlayerCtrl, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        let (sink, _handle) = start_connection_writer(ConnectionId(1), &server).expect("writer");
        let ctrl = PlayerCtrl::new(sink, Arc::new(AtomicU32::new(0)), test_item_types());
        (ctrl, client)
    }

    fn pos(x: u16, y: u16) -> Position {
        Position::new(WORLD_ORIGIN + x, WORLD_ORIGIN + y, SURFACE_FLOOR)
    }

    #[test]
    fn unknown_then_known_creature_forms() {
        let (mut ctrl, mut peer) = harness();
        let creature = Creature::new_player("Alice");

        let mut writer = PacketWriter::new();
        ctrl.add_creature(&mut writer, &creature);
        ctrl.send(writer);
        let frame = read_frame(&mut peer).expect("read").expect("frame");
        assert_eq!(frame[0], OPCODE_CREATURE_UNKNOWN);
        assert_eq!(frame[1], 0x00);
        assert_eq!(&frame[2..6], &[0, 0, 0, 0]); // nothing evicted
        assert_eq!(&frame[6..10], &creature.id.0.to_le_bytes());
        // name string
        assert_eq!(&frame[10..12], &(5u16).to_le_bytes());
        assert_eq!(&frame[12..17], b"Alice");
        // health, direction, outfit, 0x00 0xdc, speed
        assert_eq!(frame[17], 100);
        assert_eq!(frame[18], creature.direction.wire_code());
        assert_eq!(frame[24], 0x00);
        assert_eq!(frame[25], 0xdc);
        assert_eq!(&frame[26..28], &creature.speed.to_le_bytes());

        let mut writer = PacketWriter::new();
        ctrl.add_creature(&mut writer, &creature);
        ctrl.send(writer);
        let frame = read_frame(&mut peer).expect("read").expect("frame");
        assert_eq!(frame[0], OPCODE_CREATURE_KNOWN);
        assert_eq!(&frame[2..6], &creature.id.0.to_le_bytes());
    }

    #[test]
    fn full_cache_evicts_slot_zero_and_reports_it() {
        let (mut ctrl, mut peer) = harness();

        let mut first_id = 0;
        for i in 0..KNOWN_CREATURES {
            let creature = Creature::new_player(&format!("Npc{i}"));
            if i == 0 {
                first_id = creature.id.0;
            }
            let mut writer = PacketWriter::new();
            ctrl.add_creature(&mut writer, &creature);
            ctrl.send(writer);
            read_frame(&mut peer).expect("read").expect("frame");
        }

        let newcomer = Creature::new_player("Newcomer");
        let mut writer = PacketWriter::new();
        ctrl.add_creature(&mut writer, &newcomer);
        ctrl.send(writer);
        let frame = read_frame(&mut peer).expect("read").expect("frame");
        assert_eq!(frame[0], OPCODE_CREATURE_UNKNOWN);
        assert_eq!(&frame[2..6], &first_id.to_le_bytes());
        assert_eq!(&frame[6..10], &newcomer.id.0.to_le_bytes());

        // The evicted creature comes back in full form, evicting again.
        let returned = Creature::new_player("Returned");
        let mut writer = PacketWriter::new();
        ctrl.add_creature(&mut writer, &returned);
        ctrl.send(writer);
        let frame = read_frame(&mut peer).expect("read").expect("frame");
        assert_eq!(frame[0], OPCODE_CREATURE_UNKNOWN);
        assert_eq!(&frame[2..6], &newcomer.id.0.to_le_bytes());
    }

    #[test]
    fn player_spawn_packet_layout() {
        let (ctrl, mut peer) = harness();
        let mut world = empty_world(20, 20);
        let player = Creature::new_player("Hero");
        let player_id = player.id;
        ctrl.set_player_id(player_id);
        let ctrl = Rc::new(RefCell::new(ctrl));
        let spawn = pos(10, 10);
        world
            .add_creature(player, ctrl.clone(), spawn)
            .expect("spawn");

        ctrl.borrow_mut().on_player_spawn(&world, spawn, "Welcome!");
        let frame = read_frame(&mut peer).expect("read").expect("frame");

        assert_eq!(frame[0], OPCODE_PLAYER_SPAWN);
        assert_eq!(&frame[1..5], &player_id.0.to_le_bytes());
        assert_eq!(&frame[5..7], &[0x32, 0x00]);
        assert_eq!(frame[7], OPCODE_FULL_MAP);
        assert_eq!(&frame[8..10], &spawn.x.to_le_bytes());
        assert_eq!(&frame[10..12], &spawn.y.to_le_bytes());
        assert_eq!(frame[12], spawn.z);

        // The composite ends with the motd message.
        let tail_text = b"Welcome!";
        let tail_start = frame.len() - tail_text.len();
        assert_eq!(&frame[tail_start..], tail_text);
        let header = &frame[tail_start - 4..tail_start];
        assert_eq!(header[0], OPCODE_TEXT_MESSAGE);
        assert_eq!(header[1], MESSAGE_LOGIN);
        assert_eq!(&header[2..4], &(tail_text.len() as u16).to_le_bytes());

        // Stats block is present with the default player values.
        let stats_at = frame
            .iter()
            .position(|&b| b == OPCODE_PLAYER_STATS)
            .expect("stats opcode");
        let stats = &frame[stats_at..stats_at + 15];
        assert_eq!(&stats[1..3], &100u16.to_le_bytes()); // health
        assert_eq!(&stats[3..5], &100u16.to_le_bytes()); // max health
        assert_eq!(&stats[5..7], &300u16.to_le_bytes()); // capacity
        assert_eq!(&stats[7..11], &4200u32.to_le_bytes()); // experience
        assert_eq!(stats[11], 14); // level
    }

    #[test]
    fn self_move_appends_an_edge_strip() {
        let (ctrl, mut peer) = harness();
        let mut world = empty_world(24, 24);
        let player = Creature::new_player("Hero");
        let player_id = player.id;
        ctrl.set_player_id(player_id);
        let ctrl = Rc::new(RefCell::new(ctrl));
        world
            .add_creature(player, ctrl.clone(), pos(12, 12))
            .expect("spawn");

        world
            .creature_move(player_id, crate::world::position::Direction::North)
            .expect("move");
        let frame = read_frame(&mut peer).expect("read").expect("frame");
        assert_eq!(frame[0], OPCODE_MOVE_CREATURE);
        let strip_at = frame
            .iter()
            .position(|&b| b == OPCODE_MAP_ROW_NORTH)
            .expect("north strip");
        assert_eq!(frame[frame.len() - 2], 0x7e);
        assert_eq!(frame[frame.len() - 1], 0xff);
        assert!(strip_at > 0);
    }

    #[test]
    fn spectator_sees_remove_when_mover_leaves_view() {
        let (ctrl, mut peer) = harness();
        let mut world = empty_world(40, 40);
        let watcher = Creature::new_player("Watcher");
        let watcher_id = watcher.id;
        ctrl.set_player_id(watcher_id);
        let ctrl = Rc::new(RefCell::new(ctrl));
        world
            .add_creature(watcher, ctrl.clone(), pos(20, 20))
            .expect("spawn watcher");

        // A walker at the eastern edge of the watcher's view.
        let walker = Creature::new_player("Walker");
        let walker_id = walker.id;
        let walker_ctrl = crate::world::state::testutil::RecordingCtrl::shared();
        world
            .add_creature(walker, walker_ctrl, pos(29, 20))
            .expect("spawn walker");
        read_frame(&mut peer).expect("read").expect("spawn frame");

        world
            .creature_move(walker_id, crate::world::position::Direction::East)
            .expect("move");
        let frame = read_frame(&mut peer).expect("read").expect("frame");
        assert_eq!(frame[0], OPCODE_TILE_REMOVE_THING);
    }

    #[test]
    fn cancel_and_text_messages() {
        let (mut ctrl, mut peer) = harness();
        ctrl.send_cancel("Sorry, not possible.");
        let frame = read_frame(&mut peer).expect("read").expect("frame");
        assert_eq!(frame[0], OPCODE_TEXT_MESSAGE);
        assert_eq!(frame[1], MESSAGE_CANCEL);
        assert_eq!(&frame[4..], b"Sorry, not possible.");

        ctrl.cancel_walk();
        let frame = read_frame(&mut peer).expect("read").expect("frame");
        assert_eq!(frame, vec![OPCODE_CANCEL_WALK]);
    }

    #[test]
    fn disconnected_ctrl_drops_everything() {
        let (mut ctrl, mut peer) = harness();
        ctrl.close(true);
        ctrl.send_cancel("nope");
        ctrl.cancel_walk();
        assert!(read_frame(&mut peer).expect("read").is_none());
    }
}
