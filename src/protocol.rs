//! The line-oriented TCP control protocol.
//!
//! Parsing is split in two: [`parse_line`] tokenizes the outer command
//! shape (everything is whitespace-separated except the parenthesized
//! predicate/address groups, which may themselves contain spaces inside
//! quoted values), and [`parse_predicate_fields`]/[`parse_address`] parse
//! the groups themselves. `combineMatch`'s connector and address
//! arguments get their own unambiguous slots rather than being packed
//! into one token: `combineMatch <id> (<predicate>) AND|OR (<addr>)`.

use crate::error::{CommandError, EvalError};
use crate::predicate::{MatchField, Operator, Predicate};
use crate::rule_tree::{Address, Connector, Side};
use crate::LwId;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Create,
    List,
    Register(LwId),
    Unregister(LwId),
    Select(LwId),
    SetMatch { id: LwId, predicate: Predicate, addr: Address },
    CombineMatch { id: LwId, predicate: Predicate, connector: Connector, addr: Address },
    DelMatch { id: LwId, addr: Address },
    Save(LwId),
    Load(LwId),
}

impl ClientCommand {
    /// `select` is the one command answered without the `respond\n`
    /// frame.
    pub fn is_select(&self) -> bool {
        matches!(self, ClientCommand::Select(_))
    }
}

pub fn parse_line(line: &str) -> Result<ClientCommand, CommandError> {
    let line = line.trim();
    let (word, rest) = split_first_token(line).ok_or(CommandError::Protocol)?;
    match word {
        "create" => Ok(ClientCommand::Create),
        "list" => Ok(ClientCommand::List),
        "register" => parse_id(rest).map(ClientCommand::Register),
        "unregister" => parse_id(rest).map(ClientCommand::Unregister),
        "select" => parse_id(rest).map(ClientCommand::Select),
        "save" => parse_id(rest).map(ClientCommand::Save),
        "load" => parse_id(rest).map(ClientCommand::Load),
        "setMatch" => parse_set_match(rest),
        "combineMatch" => parse_combine_match(rest),
        "delMatch" => parse_del_match(rest),
        _ => Err(CommandError::Protocol),
    }
}

fn parse_id(rest: &str) -> Result<LwId, CommandError> {
    rest.trim().parse::<LwId>().map_err(|_| CommandError::Protocol)
}

fn parse_set_match(rest: &str) -> Result<ClientCommand, CommandError> {
    let (id_str, rest) = split_first_token(rest).ok_or(CommandError::Protocol)?;
    let id = id_str.parse::<LwId>().map_err(|_| CommandError::Protocol)?;
    let (predicate_group, rest) = take_paren_group(rest.trim_start())?;
    let (addr_group, rest) = take_paren_group(rest.trim_start())?;
    if !rest.trim().is_empty() {
        return Err(CommandError::Protocol);
    }
    let predicate = parse_predicate_fields(predicate_group)?;
    let addr = parse_address(addr_group)?;
    Ok(ClientCommand::SetMatch { id, predicate, addr })
}

fn parse_combine_match(rest: &str) -> Result<ClientCommand, CommandError> {
    let (id_str, rest) = split_first_token(rest).ok_or(CommandError::Protocol)?;
    let id = id_str.parse::<LwId>().map_err(|_| CommandError::Protocol)?;
    let (predicate_group, rest) = take_paren_group(rest.trim_start())?;
    let (connector_str, rest) = split_first_token(rest.trim_start()).ok_or(CommandError::Protocol)?;
    let connector = Connector::parse(connector_str).ok_or(CommandError::Protocol)?;
    let (addr_group, rest) = take_paren_group(rest.trim_start())?;
    if !rest.trim().is_empty() {
        return Err(CommandError::Protocol);
    }
    let predicate = parse_predicate_fields(predicate_group)?;
    let addr = parse_address(addr_group)?;
    Ok(ClientCommand::CombineMatch { id, predicate, connector, addr })
}

fn parse_del_match(rest: &str) -> Result<ClientCommand, CommandError> {
    let (id_str, rest) = split_first_token(rest).ok_or(CommandError::Protocol)?;
    let id = id_str.parse::<LwId>().map_err(|_| CommandError::Protocol)?;
    let (addr_group, rest) = take_paren_group(rest.trim_start())?;
    if !rest.trim().is_empty() {
        return Err(CommandError::Protocol);
    }
    let addr = parse_address(addr_group)?;
    Ok(ClientCommand::DelMatch { id, addr })
}

fn split_first_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

/// Extracts the contents of a balanced `(...)` group starting at `s`,
/// treating `"..."`-quoted spans as opaque so a quoted value may contain
/// parens, commas, or spaces. Returns the inside text and whatever
/// followed the closing paren.
fn take_paren_group(s: &str) -> Result<(&str, &str), CommandError> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, '(')) => {}
        _ => return Err(CommandError::Protocol),
    }
    let mut depth = 1usize;
    let mut in_quotes = false;
    for (idx, c) in chars {
        if in_quotes {
            if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&s[1..idx], &s[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(CommandError::Protocol)
}

/// Splits `inside` on top-level commas, respecting `"..."` quoting.
fn split_top_level_commas(inside: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, c) in inside.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(&inside[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    fields.push(&inside[start..]);
    fields
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s)
}

pub fn parse_predicate_fields(inside: &str) -> Result<Predicate, CommandError> {
    let fields = split_top_level_commas(inside);
    if fields.len() != 5 {
        return Err(CommandError::Protocol);
    }
    let matchfield = MatchField::parse(unquote(fields[0])).map_err(CommandError::from)?;
    let operator = Operator::parse(unquote(fields[1]).trim()).map_err(CommandError::from)?;
    let value = unquote(fields[2]).to_string();
    let negated = parse_bool(fields[3])?;
    let case_insensitive = parse_bool(fields[4])?;
    Ok(Predicate { matchfield, operator, value, negated, case_insensitive })
}

fn parse_bool(s: &str) -> Result<bool, CommandError> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CommandError::from(EvalError::InvalidValue(s.trim().to_string()))),
    }
}

pub fn parse_address(inside: &str) -> Result<Address, CommandError> {
    let inside = inside.trim();
    if inside.is_empty() {
        return Ok(Vec::new());
    }
    inside
        .split(',')
        .map(|tok| match tok.trim() {
            "0" => Ok(Side::Left),
            "1" => Ok(Side::Right),
            _ => Err(CommandError::Protocol),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_and_list() {
        assert_eq!(parse_line("create").unwrap(), ClientCommand::Create);
        assert_eq!(parse_line(" list ").unwrap(), ClientCommand::List);
    }

    #[test]
    fn parses_register_family() {
        assert_eq!(parse_line("register 3").unwrap(), ClientCommand::Register(3));
        assert_eq!(parse_line("unregister 3").unwrap(), ClientCommand::Unregister(3));
        assert_eq!(parse_line("select 3").unwrap(), ClientCommand::Select(3));
    }

    #[test]
    fn parses_set_match_with_quoted_value() {
        let cmd = parse_line(r#"setMatch 0 (WHOLE, RE, "ssh.*", false, false) ()"#).unwrap();
        match cmd {
            ClientCommand::SetMatch { id, predicate, addr } => {
                assert_eq!(id, 0);
                assert_eq!(predicate.matchfield, MatchField::Whole);
                assert_eq!(predicate.operator, Operator::Re);
                assert_eq!(predicate.value, "ssh.*");
                assert!(addr.is_empty());
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_combine_match_with_connector_and_nested_address() {
        let cmd = parse_line(r#"combineMatch 0 (SEVERITY, GE, "warning", false, false) AND (1,0)"#).unwrap();
        match cmd {
            ClientCommand::CombineMatch { id, connector, addr, .. } => {
                assert_eq!(id, 0);
                assert_eq!(connector, Connector::And);
                assert_eq!(addr, vec![Side::Right, Side::Left]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_del_match() {
        let cmd = parse_line("delMatch 2 (1)").unwrap();
        assert_eq!(cmd, ClientCommand::DelMatch { id: 2, addr: vec![Side::Right] });
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_line("frobnicate"), Err(CommandError::Protocol)));
        assert!(matches!(parse_line("setMatch 0 (WHOLE) extra"), Err(CommandError::Protocol)));
    }
}
