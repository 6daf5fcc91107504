//! Frame shapes and their register encoding.
//!
//! A SoundWire frame is a `rows x cols` bit matrix. Column 0 carries the
//! control word (48 bits per frame); the remaining columns carry payload.
//! Only the row and column counts listed here can be expressed in the frame
//! control register.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Legal row counts, in the order the solver tries them.
pub const ROWS: [u16; 23] = [
    100, 48, 50, 60, 64, 72, 75, 80, 90, 96, 125, 144, 147, 120, 128, 150, 160, 180, 192, 200,
    240, 250, 256,
];

/// Legal column counts, in the order the solver tries them.
pub const COLS: [u16; 8] = [2, 4, 6, 8, 10, 12, 14, 16];

/// Bits per frame consumed by the control word.
pub const CONTROL_BITS: u32 = 48;

/// Shape every device uses after reset.
pub const RESET_SHAPE: FrameShape = FrameShape::new(48, 2);

const COL_CODES: [(u16, u8); 8] = [
    (2, 0),
    (4, 1),
    (6, 2),
    (8, 3),
    (10, 4),
    (12, 5),
    (14, 6),
    (16, 7),
];

const ROW_CODES: [(u16, u8); 23] = [
    (48, 0),
    (50, 1),
    (60, 2),
    (64, 3),
    (75, 4),
    (80, 5),
    (125, 6),
    (147, 7),
    (96, 8),
    (100, 9),
    (120, 10),
    (128, 11),
    (150, 12),
    (160, 13),
    (250, 14),
    (192, 16),
    (200, 17),
    (240, 18),
    (256, 19),
    (72, 20),
    (144, 21),
    (90, 22),
    (180, 23),
];

/// Register code for a column count.
pub fn col_code(cols: u16) -> Option<u8> {
    COL_CODES.iter().find(|(c, _)| *c == cols).map(|(_, v)| *v)
}

/// Register code for a row count.
pub fn row_code(rows: u16) -> Option<u8> {
    ROW_CODES.iter().find(|(r, _)| *r == rows).map(|(_, v)| *v)
}

/// Column count for a register code.
pub fn col_from_code(code: u8) -> Option<u16> {
    COL_CODES.iter().find(|(_, v)| *v == code).map(|(c, _)| *c)
}

/// Row count for a register code.
pub fn row_from_code(code: u8) -> Option<u16> {
    ROW_CODES.iter().find(|(_, v)| *v == code).map(|(r, _)| *r)
}

/// Frame dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    /// Rows per frame.
    pub rows: u16,
    /// Columns per frame.
    pub cols: u16,
}

impl FrameShape {
    /// Create a frame shape. Legality is checked by [`is_legal`](Self::is_legal).
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Bits per frame.
    pub const fn interval(&self) -> u32 {
        self.rows as u32 * self.cols as u32
    }

    /// Payload bits per frame.
    pub const fn data_bits(&self) -> u32 {
        self.interval().saturating_sub(CONTROL_BITS)
    }

    /// Whether both dimensions have a register encoding.
    pub fn is_legal(&self) -> bool {
        self.encode().is_some()
    }

    /// Frame control register value: column code in bits 0-2, row code above.
    pub fn encode(&self) -> Option<u8> {
        Some(col_code(self.cols)? | (row_code(self.rows)? << 3))
    }

    /// Decode a frame control register value.
    pub fn decode(value: u8) -> Option<Self> {
        let cols = col_from_code(value & 0x07)?;
        let rows = row_from_code(value >> 3)?;
        Some(Self { rows, cols })
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// All legal shapes in search order: columns outer, rows inner.
pub fn candidates() -> impl Iterator<Item = FrameShape> {
    COLS.iter()
        .flat_map(|&cols| ROWS.iter().map(move |&rows| FrameShape::new(rows, cols)))
}
