//! Command Parsing
//!
//! Turns a decoded [`Invocation`] into a validated [`Command`]. All argument
//! checking happens here, so executing a `Command` never fails half-way.

use crate::protocol::{Invocation, RespValue};
use crate::storage::SetCondition;
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `GET key`
    Get { key: Bytes },

    /// `SET key value [NX|XX] [EX seconds|PX milliseconds]`
    Set {
        key: Bytes,
        value: Bytes,
        condition: SetCondition,
        ttl: Option<Duration>,
    },

    /// `DEL key [key ...]`
    Del { keys: Vec<Bytes> },

    /// `QUIT`
    Quit,

    /// Anything else, carrying the name as sent
    Unsupported { name: String },
}

/// Errors reported back to the client as `-ERR <message>`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("expiration option is not valid")]
    InvalidExpiryOption,

    #[error("invalid expire time in '{0}' command")]
    InvalidExpireTime(String),

    #[error("syntax error")]
    Syntax,
}

impl CommandError {
    pub fn to_resp(&self) -> RespValue {
        RespValue::error(format!("ERR {}", self))
    }
}

impl Command {
    /// Parses an invocation. The command name is matched case-insensitively.
    ///
    /// # Example
    ///
    /// ```
    /// use tidekv::commands::Command;
    /// use bytes::Bytes;
    ///
    /// let cmd = Command::parse(vec![Bytes::from("get"), Bytes::from("k")]).unwrap();
    /// assert_eq!(cmd, Command::Get { key: Bytes::from("k") });
    /// ```
    pub fn parse(invocation: Invocation) -> Result<Command, CommandError> {
        let arity = invocation.len();
        let mut args = invocation.into_iter();
        let name_bytes = args.next().ok_or(CommandError::Empty)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        let wrong_arity = || CommandError::WrongArity(name.clone());

        if name.eq_ignore_ascii_case("GET") {
            if arity != 2 {
                return Err(wrong_arity());
            }
            let key = args.next().ok_or_else(wrong_arity)?;
            Ok(Command::Get { key })
        } else if name.eq_ignore_ascii_case("SET") {
            if !(3..=6).contains(&arity) {
                return Err(wrong_arity());
            }
            let key = args.next().ok_or_else(wrong_arity)?;
            let value = args.next().ok_or_else(wrong_arity)?;
            let (condition, ttl) = parse_set_options(&name, args)?;
            Ok(Command::Set {
                key,
                value,
                condition,
                ttl,
            })
        } else if name.eq_ignore_ascii_case("DEL") {
            if arity < 2 {
                return Err(wrong_arity());
            }
            Ok(Command::Del {
                keys: args.collect(),
            })
        } else if name.eq_ignore_ascii_case("QUIT") {
            if arity != 1 {
                return Err(wrong_arity());
            }
            Ok(Command::Quit)
        } else {
            Ok(Command::Unsupported { name })
        }
    }

    /// Canonical upper-case name, for logging.
    pub fn name(&self) -> &str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Quit => "QUIT",
            Command::Unsupported { name } => name,
        }
    }
}

/// Parses `[NX|XX] [EX seconds|PX milliseconds]`.
///
/// The first option token is a condition if it is `NX` or `XX`; anything
/// else is read as the expiry keyword.
fn parse_set_options(
    name: &str,
    mut options: impl Iterator<Item = Bytes>,
) -> Result<(SetCondition, Option<Duration>), CommandError> {
    let mut condition = SetCondition::Always;
    let mut token = options.next();

    if let Some(option) = &token {
        if option.eq_ignore_ascii_case(b"NX") {
            condition = SetCondition::IfAbsent;
            token = options.next();
        } else if option.eq_ignore_ascii_case(b"XX") {
            condition = SetCondition::IfPresent;
            token = options.next();
        }
    }

    let ttl = match token {
        None => None,
        Some(keyword) => {
            let to_duration: fn(u64) -> Duration = if keyword.eq_ignore_ascii_case(b"EX") {
                Duration::from_secs
            } else if keyword.eq_ignore_ascii_case(b"PX") {
                Duration::from_millis
            } else {
                return Err(CommandError::InvalidExpiryOption);
            };

            let amount = options.next().ok_or(CommandError::Syntax)?;
            let amount = std::str::from_utf8(&amount)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|&n| n > 0)
                .map(to_duration)
                // The deadline must be representable
                .filter(|&ttl| Instant::now().checked_add(ttl).is_some())
                .ok_or_else(|| CommandError::InvalidExpireTime(name.to_string()))?;
            Some(amount)
        }
    };

    if options.next().is_some() {
        return Err(CommandError::Syntax);
    }

    Ok((condition, ttl))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(args: &[&str]) -> Invocation {
        args.iter().map(|a| Bytes::from(a.to_string())).collect()
    }

    fn set(args: &[&str]) -> Result<(SetCondition, Option<Duration>), CommandError> {
        match Command::parse(inv(args))? {
            Command::Set { condition, ttl, .. } => Ok((condition, ttl)),
            other => panic!("expected SET, got {:?}", other),
        }
    }

    #[test]
    fn test_names_are_case_insensitive() {
        assert_eq!(
            Command::parse(inv(&["gEt", "k"])).unwrap(),
            Command::Get { key: Bytes::from("k") }
        );
        assert_eq!(Command::parse(inv(&["quit"])).unwrap(), Command::Quit);
        assert_eq!(Command::parse(inv(&["Quit"])).unwrap().name(), "QUIT");
    }

    #[test]
    fn test_arity_errors_name_command_as_sent() {
        assert_eq!(
            Command::parse(inv(&["get"])).unwrap_err(),
            CommandError::WrongArity("get".into())
        );
        assert_eq!(
            Command::parse(inv(&["GET", "a", "b"])).unwrap_err().to_string(),
            "wrong number of arguments for 'GET' command"
        );
        assert!(Command::parse(inv(&["SET", "k"])).is_err());
        assert!(Command::parse(inv(&["SET", "k", "v", "NX", "EX", "1", "x"])).is_err());
        assert!(Command::parse(inv(&["DEL"])).is_err());
        assert!(Command::parse(inv(&["QUIT", "now"])).is_err());
    }

    #[test]
    fn test_unsupported() {
        assert_eq!(
            Command::parse(inv(&["PING"])).unwrap(),
            Command::Unsupported {
                name: "PING".into()
            }
        );
    }

    #[test]
    fn test_del_collects_keys() {
        assert_eq!(
            Command::parse(inv(&["DEL", "a", "b", "c"])).unwrap(),
            Command::Del {
                keys: vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
            }
        );
    }

    #[test]
    fn test_set_plain() {
        assert_eq!(set(&["SET", "k", "v"]), Ok((SetCondition::Always, None)));
    }

    #[test]
    fn test_set_conditions() {
        assert_eq!(
            set(&["SET", "k", "v", "nx"]),
            Ok((SetCondition::IfAbsent, None))
        );
        assert_eq!(
            set(&["SET", "k", "v", "XX"]),
            Ok((SetCondition::IfPresent, None))
        );
    }

    #[test]
    fn test_set_expiry() {
        assert_eq!(
            set(&["SET", "k", "v", "EX", "10"]),
            Ok((SetCondition::Always, Some(Duration::from_secs(10))))
        );
        assert_eq!(
            set(&["SET", "k", "v", "NX", "px", "250"]),
            Ok((SetCondition::IfAbsent, Some(Duration::from_millis(250))))
        );
    }

    #[test]
    fn test_set_bad_expiry_keyword() {
        assert_eq!(
            set(&["SET", "k", "v", "KEEPTTL"]),
            Err(CommandError::InvalidExpiryOption)
        );
        assert_eq!(
            set(&["SET", "k", "v", "NX", "XX"]),
            Err(CommandError::InvalidExpiryOption)
        );
        assert_eq!(
            CommandError::InvalidExpiryOption.to_resp().serialize(),
            b"-ERR expiration option is not valid\r\n"
        );
    }

    #[test]
    fn test_set_bad_expiry_values() {
        assert_eq!(set(&["SET", "k", "v", "EX"]), Err(CommandError::Syntax));
        assert_eq!(
            set(&["SET", "k", "v", "EX", "soon"]),
            Err(CommandError::InvalidExpireTime("SET".into()))
        );
        assert_eq!(
            set(&["set", "k", "v", "PX", "0"]),
            Err(CommandError::InvalidExpireTime("set".into()))
        );
        assert_eq!(
            set(&["SET", "k", "v", "PX", "-5"]),
            Err(CommandError::InvalidExpireTime("SET".into()))
        );
    }

    #[test]
    fn test_set_expiry_past_representable_deadline() {
        for seconds in ["18446744073709551615", "9223372036854775807"] {
            assert_eq!(
                set(&["SET", "k", "v", "EX", seconds]),
                Err(CommandError::InvalidExpireTime("SET".into()))
            );
        }
        assert!(set(&["SET", "k", "v", "EX", "184467440737095516150"]).is_err());

        // u64::MAX milliseconds still fits
        assert_eq!(
            set(&["SET", "k", "v", "PX", "18446744073709551615"]),
            Ok((SetCondition::Always, Some(Duration::from_millis(u64::MAX))))
        );
    }

    #[test]
    fn test_set_trailing_token() {
        assert_eq!(
            set(&["SET", "k", "v", "EX", "10", "extra"]),
            Err(CommandError::Syntax)
        );
    }
}
