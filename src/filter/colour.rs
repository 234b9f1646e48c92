//! ANSI terminal colour control strings

/// Foreground colours used to tell the two directions apart in a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalColour {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

impl TerminalColour {
    /// Resets colours. SGR 0 alone is not honoured by every terminal, so
    /// the default foreground/background codes are sent too.
    pub const NONE: &'static str = "\x1b[0;40;37;39;49m";

    /// Control string that switches to this colour
    pub fn control_string(self) -> &'static str {
        match self {
            TerminalColour::Black => "\x1b[30m",
            TerminalColour::Red => "\x1b[31m",
            TerminalColour::Green => "\x1b[32m",
            TerminalColour::Yellow => "\x1b[33m",
            TerminalColour::Blue => "\x1b[34m",
            TerminalColour::Magenta => "\x1b[35m",
            TerminalColour::Cyan => "\x1b[36m",
            TerminalColour::White => "\x1b[37m",
        }
    }
}
