//! HAProxy agent-check command vocabulary
//!
//! Seven command tokens are recognised, each carrying a state flag in the
//! high nibble of its code marking it as an online or offline command. A
//! responder's configured command list is parsed into a bitmask; the wire
//! serialisation walks the tokens in their fixed order so that peers always
//! receive commands in precedence order.

use crate::error::{AgentError, Result};

/// High-nibble flag marking a command as applying to the online state.
pub const STATE_FLAG_ONLINE: u8 = 0x10;
/// High-nibble flag marking a command as applying to the offline state.
pub const STATE_FLAG_OFFLINE: u8 = 0x20;

/// Bitmask over the command vocabulary; bit positions follow the fixed
/// token order.
pub type CommandMask = u16;

/// No commands enabled.
pub const MASK_NONE: CommandMask = 0;

/// A single HAProxy agent-check command token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HaproxyCommand {
    Up = STATE_FLAG_ONLINE,
    Ready = STATE_FLAG_ONLINE | 1,
    Down = STATE_FLAG_OFFLINE | 2,
    Drain = STATE_FLAG_OFFLINE | 3,
    Fail = STATE_FLAG_OFFLINE | 4,
    Maint = STATE_FLAG_OFFLINE | 5,
    Stopped = STATE_FLAG_OFFLINE | 6,
}

impl HaproxyCommand {
    /// All commands in wire precedence order.
    pub const ALL: [HaproxyCommand; 7] = [
        HaproxyCommand::Up,
        HaproxyCommand::Ready,
        HaproxyCommand::Down,
        HaproxyCommand::Drain,
        HaproxyCommand::Fail,
        HaproxyCommand::Maint,
        HaproxyCommand::Stopped,
    ];

    pub fn token(self) -> &'static str {
        match self {
            HaproxyCommand::Up => "up",
            HaproxyCommand::Ready => "ready",
            HaproxyCommand::Down => "down",
            HaproxyCommand::Drain => "drain",
            HaproxyCommand::Fail => "fail",
            HaproxyCommand::Maint => "maint",
            HaproxyCommand::Stopped => "stopped",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.token() == token)
    }

    /// The command's bit within a [`CommandMask`].
    pub fn bit(self) -> CommandMask {
        1 << (self as u8 & 0x0F)
    }

    /// Whether this command applies to the online state.
    pub fn is_online(self) -> bool {
        self as u8 & STATE_FLAG_ONLINE != 0
    }
}

/// The mask produced by the `default` sentinel: `up` and `ready` while
/// online, `drain` while offline.
pub fn default_mask() -> CommandMask {
    HaproxyCommand::Up.bit() | HaproxyCommand::Ready.bit() | HaproxyCommand::Drain.bit()
}

/// Override mask applied by a forced halt.
pub fn maint_mask() -> CommandMask {
    HaproxyCommand::Maint.bit()
}

/// Override mask applied by a forced drain.
pub fn drain_mask() -> CommandMask {
    HaproxyCommand::Drain.bit()
}

/// Override mask applied by a forced online.
pub fn online_mask() -> CommandMask {
    HaproxyCommand::Up.bit() | HaproxyCommand::Ready.bit()
}

/// Parses a command list configuration string into a bitmask.
///
/// Recognises the `default` and `none` sentinels; otherwise the string is a
/// whitespace or comma separated list of command tokens.
pub fn parse_command_list(list: &str) -> Result<CommandMask> {
    let trimmed = list.trim().to_ascii_lowercase();
    match trimmed.as_str() {
        "" | "default" => return Ok(default_mask()),
        "none" => return Ok(MASK_NONE),
        _ => {}
    }
    let mut mask = MASK_NONE;
    for token in trimmed.split(|c: char| c.is_whitespace() || c == ',') {
        if token.is_empty() {
            continue;
        }
        let command = HaproxyCommand::from_token(token).ok_or_else(|| {
            AgentError::Config(format!("unrecognised command token '{token}'"))
        })?;
        mask |= command.bit();
    }
    Ok(mask)
}

/// Serialises the commands enabled in `mask` for the given state polarity,
/// in fixed precedence order, space separated.
pub fn format_commands(mask: CommandMask, online: bool) -> String {
    let mut out = String::new();
    for command in HaproxyCommand::ALL {
        if command.is_online() == online && mask & command.bit() != 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(command.token());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sentinel_expands_to_up_ready_drain() {
        let mask = parse_command_list("default").unwrap();
        assert_eq!(format_commands(mask, true), "up ready");
        assert_eq!(format_commands(mask, false), "drain");
    }

    #[test]
    fn test_none_sentinel_disables_all_commands() {
        let mask = parse_command_list("none").unwrap();
        assert_eq!(mask, MASK_NONE);
        assert_eq!(format_commands(mask, true), "");
        assert_eq!(format_commands(mask, false), "");
    }

    #[test]
    fn test_explicit_token_list() {
        let mask = parse_command_list("maint down").unwrap();
        assert_eq!(format_commands(mask, false), "down maint");
        assert_eq!(format_commands(mask, true), "");
    }

    #[test]
    fn test_serialisation_order_is_fixed() {
        // Tokens come back in precedence order regardless of input order.
        let mask = parse_command_list("stopped fail drain down").unwrap();
        assert_eq!(format_commands(mask, false), "down drain fail stopped");
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        assert!(parse_command_list("up bogus").is_err());
    }

    #[test]
    fn test_state_flags() {
        assert!(HaproxyCommand::Up.is_online());
        assert!(HaproxyCommand::Ready.is_online());
        for offline in [
            HaproxyCommand::Down,
            HaproxyCommand::Drain,
            HaproxyCommand::Fail,
            HaproxyCommand::Maint,
            HaproxyCommand::Stopped,
        ] {
            assert!(!offline.is_online());
        }
    }

    #[test]
    fn test_bits_are_distinct() {
        let mut seen = MASK_NONE;
        for command in HaproxyCommand::ALL {
            assert_eq!(seen & command.bit(), 0);
            seen |= command.bit();
        }
    }
}
