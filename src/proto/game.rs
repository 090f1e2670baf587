//! World-server wire protocol, client version 7.1.
//!
//! Inbound frames decode into [`ClientCommand`] values on the session
//! thread; the byte layouts of outbound packets live with the session ctrl,
//! which owns the per-client state (known creatures) they depend on.

use thiserror::Error;

use crate::net::packet::{PacketReader, PacketWriter};
use crate::world::item::{Item, ItemTypeId, ItemTypeIndex};
use crate::world::position::{Direction, Position};

// Inbound opcodes.
pub const OPCODE_LOGIN: u8 = 0x0a;
pub const OPCODE_LOGOUT: u8 = 0x14;
pub const OPCODE_AUTO_WALK: u8 = 0x64;
pub const OPCODE_MOVE_NORTH: u8 = 0x65;
pub const OPCODE_MOVE_EAST: u8 = 0x66;
pub const OPCODE_MOVE_SOUTH: u8 = 0x67;
pub const OPCODE_MOVE_WEST: u8 = 0x68;
pub const OPCODE_CANCEL_AUTO_WALK: u8 = 0x69;
pub const OPCODE_TURN_NORTH: u8 = 0x6f;
pub const OPCODE_TURN_EAST: u8 = 0x70;
pub const OPCODE_TURN_SOUTH: u8 = 0x71;
pub const OPCODE_TURN_WEST: u8 = 0x72;
pub const OPCODE_MOVE_ITEM: u8 = 0x78;
pub const OPCODE_USE_ITEM: u8 = 0x82;
pub const OPCODE_CLOSE_CONTAINER: u8 = 0x87;
pub const OPCODE_LOOK_AT: u8 = 0x8c;
pub const OPCODE_SAY: u8 = 0x96;
pub const OPCODE_CANCEL_ACTION: u8 = 0xbe;

// Outbound opcodes.
pub const OPCODE_PLAYER_SPAWN: u8 = 0x0a;
pub const OPCODE_DISCONNECT: u8 = 0x14;
pub const OPCODE_CREATURE_UNKNOWN: u8 = 0x61;
pub const OPCODE_CREATURE_KNOWN: u8 = 0x62;
pub const OPCODE_FULL_MAP: u8 = 0x64;
pub const OPCODE_MAP_ROW_NORTH: u8 = 0x65;
pub const OPCODE_MAP_COL_EAST: u8 = 0x66;
pub const OPCODE_MAP_ROW_SOUTH: u8 = 0x67;
pub const OPCODE_MAP_COL_WEST: u8 = 0x68;
pub const OPCODE_FIELD_DATA: u8 = 0x69;
pub const OPCODE_TILE_ADD_THING: u8 = 0x6a;
pub const OPCODE_CREATURE_TURN: u8 = 0x6b;
pub const OPCODE_TILE_REMOVE_THING: u8 = 0x6c;
pub const OPCODE_MOVE_CREATURE: u8 = 0x6d;
pub const OPCODE_OPEN_CONTAINER: u8 = 0x6e;
pub const OPCODE_CONTAINER_ADD: u8 = 0x70;
pub const OPCODE_CONTAINER_UPDATE: u8 = 0x71;
pub const OPCODE_CONTAINER_REMOVE: u8 = 0x72;
pub const OPCODE_INVENTORY_SET: u8 = 0x78;
pub const OPCODE_INVENTORY_CLEAR: u8 = 0x79;
pub const OPCODE_WORLD_LIGHT: u8 = 0x82;
pub const OPCODE_MAGIC_EFFECT: u8 = 0x83;
pub const OPCODE_PLAYER_STATS: u8 = 0xa0;
pub const OPCODE_PLAYER_SKILLS: u8 = 0xa1;
pub const OPCODE_CREATURE_SAY: u8 = 0xaa;
pub const OPCODE_TEXT_MESSAGE: u8 = 0xb4;
pub const OPCODE_CANCEL_WALK: u8 = 0xb5;

// Magic effect ids.
pub const EFFECT_SPAWN_BUBBLE: u8 = 0x0a;
pub const EFFECT_POFF: u8 = 0x02;

// Text message types.
pub const MESSAGE_LOGIN: u8 = 0x11;
pub const MESSAGE_INFO: u8 = 0x13;
pub const MESSAGE_CANCEL: u8 = 0x14;

// Say types that carry an extra argument before the text.
pub const SAY_PRIVATE: u8 = 0x06;
pub const SAY_CHANNEL_YELLOW: u8 = 0x07;
pub const SAY_CHANNEL_RED: u8 = 0x0a;
pub const SAY_PRIVATE_RED: u8 = 0x0b;

/// Virtual positions put 0xFFFF in the x field; bit 6 of y picks container
/// versus inventory addressing.
const VIRTUAL_POSITION_MARKER: u16 = 0xffff;
const CONTAINER_FLAG: u16 = 0x40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet ended short")]
    Truncated,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("direction code {0} out of range")]
    BadDirection(u8),
}

/// A thing's place as clients address it: on a tile, in an equipment slot,
/// or in a slot of an open container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePosition {
    Tile(Position),
    Inventory { slot: u8 },
    Container { local_id: u8, slot: u8 },
}

/// A fully addressed item: where it is, what the client believes it is, and
/// its stack position there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPosition {
    pub position: GamePosition,
    pub item_type_id: ItemTypeId,
    pub stack_pos: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Login {
        client_os: u8,
        client_version: u16,
        character_name: String,
        password: String,
    },
    Logout,
    AutoWalk(Vec<Direction>),
    Move(Direction),
    CancelMove,
    Turn(Direction),
    MoveItem {
        from: ItemPosition,
        to: GamePosition,
        count: u8,
    },
    UseItem {
        item: ItemPosition,
        new_container_id: u8,
    },
    CloseContainer {
        local_id: u8,
    },
    LookAt(ItemPosition),
    Say {
        say_type: u8,
        receiver: Option<String>,
        channel_id: Option<u16>,
        text: String,
    },
}

/// Decodes the next command of a frame. Frames may carry several commands
/// back to back; callers loop until the reader is empty.
pub fn parse_client_command(reader: &mut PacketReader) -> Result<ClientCommand, ProtocolError> {
    let opcode = reader.get_u8().ok_or(ProtocolError::Truncated)?;
    match opcode {
        OPCODE_LOGIN => {
            // Marker byte (0x02) precedes the real fields.
            reader.get_u8().ok_or(ProtocolError::Truncated)?;
            let client_os = reader.get_u8().ok_or(ProtocolError::Truncated)?;
            let client_version = reader.get_u16().ok_or(ProtocolError::Truncated)?;
            reader.skip(1).ok_or(ProtocolError::Truncated)?;
            let character_name = reader.get_string_lossy().ok_or(ProtocolError::Truncated)?;
            let password = reader.get_string_lossy().ok_or(ProtocolError::Truncated)?;
            Ok(ClientCommand::Login {
                client_os,
                client_version,
                character_name,
                password,
            })
        }
        OPCODE_LOGOUT => Ok(ClientCommand::Logout),
        OPCODE_AUTO_WALK => {
            let len = reader.get_u8().ok_or(ProtocolError::Truncated)?;
            let mut path = Vec::with_capacity(usize::from(len));
            for _ in 0..len {
                let code = reader.get_u8().ok_or(ProtocolError::Truncated)?;
                path.push(Direction::from_wire(code).ok_or(ProtocolError::BadDirection(code))?);
            }
            Ok(ClientCommand::AutoWalk(path))
        }
        OPCODE_MOVE_NORTH..=OPCODE_MOVE_WEST => {
            let code = opcode - OPCODE_MOVE_NORTH;
            let direction = Direction::from_wire(code).ok_or(ProtocolError::BadDirection(code))?;
            Ok(ClientCommand::Move(direction))
        }
        OPCODE_CANCEL_AUTO_WALK | OPCODE_CANCEL_ACTION => Ok(ClientCommand::CancelMove),
        OPCODE_TURN_NORTH..=OPCODE_TURN_WEST => {
            let code = opcode - OPCODE_TURN_NORTH;
            let direction = Direction::from_wire(code).ok_or(ProtocolError::BadDirection(code))?;
            Ok(ClientCommand::Turn(direction))
        }
        OPCODE_MOVE_ITEM => {
            let from = parse_item_position(reader)?;
            let to = parse_game_position(reader)?;
            let count = reader.get_u8().ok_or(ProtocolError::Truncated)?;
            Ok(ClientCommand::MoveItem { from, to, count })
        }
        OPCODE_USE_ITEM => {
            let item = parse_item_position(reader)?;
            let new_container_id = reader.get_u8().ok_or(ProtocolError::Truncated)?;
            Ok(ClientCommand::UseItem {
                item,
                new_container_id,
            })
        }
        OPCODE_CLOSE_CONTAINER => {
            let local_id = reader.get_u8().ok_or(ProtocolError::Truncated)?;
            Ok(ClientCommand::CloseContainer { local_id })
        }
        OPCODE_LOOK_AT => Ok(ClientCommand::LookAt(parse_item_position(reader)?)),
        OPCODE_SAY => {
            let say_type = reader.get_u8().ok_or(ProtocolError::Truncated)?;
            let mut receiver = None;
            let mut channel_id = None;
            match say_type {
                SAY_PRIVATE | SAY_PRIVATE_RED => {
                    receiver = Some(reader.get_string_lossy().ok_or(ProtocolError::Truncated)?);
                }
                SAY_CHANNEL_YELLOW | SAY_CHANNEL_RED => {
                    channel_id = Some(reader.get_u16().ok_or(ProtocolError::Truncated)?);
                }
                _ => {}
            }
            let text = reader.get_string_lossy().ok_or(ProtocolError::Truncated)?;
            Ok(ClientCommand::Say {
                say_type,
                receiver,
                channel_id,
                text,
            })
        }
        other => Err(ProtocolError::UnknownOpcode(other)),
    }
}

/// `x:u16 | y:u16 | z:u8`, where x = 0xFFFF flags a virtual position.
pub fn parse_game_position(reader: &mut PacketReader) -> Result<GamePosition, ProtocolError> {
    let x = reader.get_u16().ok_or(ProtocolError::Truncated)?;
    let y = reader.get_u16().ok_or(ProtocolError::Truncated)?;
    let z = reader.get_u8().ok_or(ProtocolError::Truncated)?;
    if x != VIRTUAL_POSITION_MARKER {
        return Ok(GamePosition::Tile(Position::new(x, y, z)));
    }
    if y & CONTAINER_FLAG != 0 {
        Ok(GamePosition::Container {
            local_id: (y & !CONTAINER_FLAG) as u8,
            slot: z,
        })
    } else {
        Ok(GamePosition::Inventory { slot: y as u8 })
    }
}

pub fn parse_item_position(reader: &mut PacketReader) -> Result<ItemPosition, ProtocolError> {
    let position = parse_game_position(reader)?;
    let item_type_id = ItemTypeId(reader.get_u16().ok_or(ProtocolError::Truncated)?);
    let stack_pos = reader.get_u8().ok_or(ProtocolError::Truncated)?;
    Ok(ItemPosition {
        position,
        item_type_id,
        stack_pos,
    })
}

pub fn add_position(writer: &mut PacketWriter, position: Position) {
    writer.add_u16(position.x);
    writer.add_u16(position.y);
    writer.add_u8(position.z);
}

/// Item on the wire: type id, then a count byte for stackables or a subtype
/// byte for multitype items.
pub fn add_item(writer: &mut PacketWriter, item: Item, item_types: &ItemTypeIndex) {
    writer.add_u16(item.type_id.0);
    if let Some(item_type) = item_types.get(item.type_id) {
        if item_type.stackable {
            writer.add_u8(item.count);
        } else if item_type.multitype {
            writer.add_u8(item.subtype);
        }
    }
}
