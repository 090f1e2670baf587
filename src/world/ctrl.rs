//! Observer seam between the world and per-session encoders.
//!
//! The world calls these for every creature whose tile falls inside the
//! affected area; each implementation filters with its own visibility and
//! turns the event into client packets. Callbacks run on the engine thread,
//! synchronously, before the mutating operation returns.

use std::cell::RefCell;
use std::rc::Rc;

use crate::world::creature::Creature;
use crate::world::item::Item;
use crate::world::position::Position;
use crate::world::state::World;

pub trait CreatureCtrl {
    fn on_creature_spawn(&mut self, world: &World, creature: &Creature, position: Position);

    fn on_creature_despawn(
        &mut self,
        world: &World,
        creature: &Creature,
        position: Position,
        stack_pos: u8,
    );

    fn on_creature_move(
        &mut self,
        world: &World,
        creature: &Creature,
        old_position: Position,
        old_stack_pos: u8,
        new_position: Position,
        new_stack_pos: u8,
    );

    fn on_creature_turn(
        &mut self,
        world: &World,
        creature: &Creature,
        position: Position,
        stack_pos: u8,
    );

    fn on_creature_say(
        &mut self,
        world: &World,
        creature: &Creature,
        position: Position,
        message: &str,
    );

    fn on_item_added(&mut self, world: &World, item: Item, position: Position);

    fn on_item_removed(&mut self, world: &World, position: Position, stack_pos: u8);

    /// Full-tile refresh, sent when a tile held more entries than the
    /// client renders and one of them went away.
    fn on_tile_update(&mut self, world: &World, position: Position);
}

/// Shared handle the world keeps per creature for notification fan-out.
pub type CtrlRef = Rc<RefCell<dyn CreatureCtrl>>;
