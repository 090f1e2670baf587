//! Tile coordinates and walk directions.

/// Integer tile coordinates. Floor 0 is the highest, 15 the lowest; only
/// the surface floor (7) is populated by the world loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: u8,
}

impl Position {
    pub fn new(x: u16, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Option<Self> {
        let x = i32::from(self.x) + dx;
        let y = i32::from(self.y) + dy;
        if x < 0 || y < 0 || x > i32::from(u16::MAX) || y > i32::from(u16::MAX) {
            return None;
        }
        Some(Self {
            x: x as u16,
            y: y as u16,
            z: self.z,
        })
    }

    pub fn step(self, direction: Direction) -> Option<Self> {
        let (dx, dy) = direction.delta();
        self.offset(dx, dy)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Walk direction. Cardinals carry the wire codes 0..=3 used by the step and
/// turn opcodes and by the creature facing byte; 4..=7 are the diagonal
/// codes that only appear inside auto-walk paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    East,
    South,
    West,
    NorthEast,
    SouthEast,
    SouthWest,
    NorthWest,
}

impl Direction {
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(Direction::North),
            1 => Some(Direction::East),
            2 => Some(Direction::South),
            3 => Some(Direction::West),
            4 => Some(Direction::NorthEast),
            5 => Some(Direction::SouthEast),
            6 => Some(Direction::SouthWest),
            7 => Some(Direction::NorthWest),
            _ => None,
        }
    }

    /// Facing byte for the wire; diagonals never appear as a facing.
    pub fn wire_code(self) -> u8 {
        match self {
            Direction::North => 0,
            Direction::East => 1,
            Direction::South => 2,
            Direction::West => 3,
            Direction::NorthEast | Direction::SouthEast => 1,
            Direction::SouthWest | Direction::NorthWest => 3,
        }
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::East => (1, 0),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
            Direction::NorthEast => (1, -1),
            Direction::SouthEast => (1, 1),
            Direction::SouthWest => (-1, 1),
            Direction::NorthWest => (-1, -1),
        }
    }

    pub fn is_diagonal(self) -> bool {
        matches!(
            self,
            Direction::NorthEast
                | Direction::SouthEast
                | Direction::SouthWest
                | Direction::NorthWest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opposite(direction: Direction) -> Direction {
        match direction {
            Direction::North => Direction::South,
            Direction::East => Direction::West,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
            Direction::NorthEast => Direction::SouthWest,
            Direction::SouthEast => Direction::NorthWest,
            Direction::SouthWest => Direction::NorthEast,
            Direction::NorthWest => Direction::SouthEast,
        }
    }

    #[test]
    fn step_roundtrip_with_opposites() {
        let origin = Position::new(100, 100, 7);
        for code in 0..8u8 {
            let direction = Direction::from_wire(code).expect("direction");
            let next = origin.step(direction).expect("step");
            let back = next.step(opposite(direction)).expect("step back");
            assert_eq!(back, origin);
        }
    }

    #[test]
    fn steps_at_the_map_edge_fail() {
        let origin = Position::new(0, 0, 7);
        assert_eq!(origin.step(Direction::North), None);
        assert_eq!(origin.step(Direction::West), None);
        assert!(origin.step(Direction::SouthEast).is_some());
    }

    #[test]
    fn cardinal_wire_codes_are_stable() {
        assert_eq!(Direction::North.wire_code(), 0);
        assert_eq!(Direction::East.wire_code(), 1);
        assert_eq!(Direction::South.wire_code(), 2);
        assert_eq!(Direction::West.wire_code(), 3);
    }

    #[test]
    fn unknown_wire_code_is_rejected() {
        assert!(Direction::from_wire(8).is_none());
    }
}
