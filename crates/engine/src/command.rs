// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ASCII command frames understood by the diverter modules.
//!
//! The pairing of `STACH2`/`STACH3` with left/right has differed between
//! hardware revisions, so the whole mapping lives in one [`CommandSet`]
//! value that can be swapped at engine construction without touching the
//! state machine.

/// Which way the pendulum arm swings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Odd chutes sit left of the arm, even chutes right.
    pub fn for_slot(slot: i32) -> Self {
        if slot.rem_euclid(2) == 1 {
            Self::Left
        } else {
            Self::Right
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six command frames for one diverter module, CRLF-terminated.
#[derive(Debug, Clone, Copy)]
pub struct CommandSet {
    pub start: &'static [u8],
    pub stop: &'static [u8],
    pub swing_left: &'static [u8],
    pub swing_right: &'static [u8],
    pub reset_left: &'static [u8],
    pub reset_right: &'static [u8],
}

impl CommandSet {
    pub fn swing(&self, side: Side) -> &'static [u8] {
        match side {
            Side::Left => self.swing_left,
            Side::Right => self.swing_right,
        }
    }

    pub fn reset(&self, side: Side) -> &'static [u8] {
        match side {
            Side::Left => self.reset_left,
            Side::Right => self.reset_right,
        }
    }
}

/// Pairing as shipped: channel 3 drives the left swing, channel 2 the right.
pub const DEFAULT_COMMANDS: CommandSet = CommandSet {
    start: b"AT+STACH1=1\r\n",
    stop: b"AT+STACH1=0\r\n",
    swing_left: b"AT+STACH3=1\r\n",
    reset_left: b"AT+STACH3=0\r\n",
    swing_right: b"AT+STACH2=1\r\n",
    reset_right: b"AT+STACH2=0\r\n",
};

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
