//! Predicate leaves and the pure evaluator that runs them against a record.
//!
//! `Predicate` is the only leaf payload a [`crate::rule_tree::Node`]
//! carries. Parsing to/from the text forms used on the wire (`WHOLE`,
//! `FIELD:1-2:,`, `RE:ssh.*:1`, ...) and in the JSON persistence schema
//! both live here, since both reduce to the same `MatchField`/`Operator`
//! grammar.

use std::net::Ipv4Addr;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::error::EvalError;
use crate::record::{Facility, Severity, SyslogRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Range {
    Single(usize),
    Span(usize, usize),
}

impl Range {
    fn to_wire_string(&self) -> String {
        match self {
            Range::Single(i) => i.to_string(),
            Range::Span(i, j) => format!("{i}-{j}"),
        }
    }

    fn parse(s: &str) -> Result<Self, EvalError> {
        if let Some((a, b)) = s.split_once('-') {
            let a: usize = a.parse().map_err(|_| EvalError::InvalidValue(s.to_string()))?;
            let b: usize = b.parse().map_err(|_| EvalError::InvalidValue(s.to_string()))?;
            Ok(Range::Span(a, b))
        } else {
            let i: usize = s.parse().map_err(|_| EvalError::InvalidValue(s.to_string()))?;
            Ok(Range::Single(i))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchField {
    Whole,
    Ip,
    Severity,
    Facility,
    Field { range: Range, sep: String },
    Regex { pattern: String, group: String },
}

impl MatchField {
    pub fn to_wire_string(&self) -> String {
        match self {
            MatchField::Whole => "WHOLE".to_string(),
            MatchField::Ip => "IP".to_string(),
            MatchField::Severity => "SEVERITY".to_string(),
            MatchField::Facility => "FACILITY".to_string(),
            MatchField::Field { range, sep } => format!("FIELD:{}:{}", range.to_wire_string(), sep),
            MatchField::Regex { pattern, group } => format!("RE:{pattern}:{group}"),
        }
    }

    pub fn parse(s: &str) -> Result<Self, EvalError> {
        match s {
            "WHOLE" => Ok(MatchField::Whole),
            "IP" => Ok(MatchField::Ip),
            "SEVERITY" => Ok(MatchField::Severity),
            "FACILITY" => Ok(MatchField::Facility),
            _ if s.starts_with("FIELD:") => {
                let rest = &s["FIELD:".len()..];
                let (range, sep) = rest
                    .split_once(':')
                    .ok_or_else(|| EvalError::InvalidMatchField(s.to_string()))?;
                Ok(MatchField::Field {
                    range: Range::parse(range)?,
                    sep: sep.to_string(),
                })
            }
            _ if s.starts_with("RE:") => {
                let rest = &s["RE:".len()..];
                let (pattern, group) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| EvalError::InvalidMatchField(s.to_string()))?;
                Ok(MatchField::Regex {
                    pattern: pattern.to_string(),
                    group: group.to_string(),
                })
            }
            other => Err(EvalError::InvalidMatchField(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Re,
}

impl Operator {
    pub fn to_wire_string(self) -> &'static str {
        match self {
            Operator::Eq => "EQ",
            Operator::Lt => "LT",
            Operator::Le => "LE",
            Operator::Gt => "GT",
            Operator::Ge => "GE",
            Operator::Re => "RE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EvalError> {
        match s {
            "EQ" => Ok(Operator::Eq),
            "LT" => Ok(Operator::Lt),
            "LE" => Ok(Operator::Le),
            "GT" => Ok(Operator::Gt),
            "GE" => Ok(Operator::Ge),
            "RE" => Ok(Operator::Re),
            other => Err(EvalError::InvalidOperator(other.to_string())),
        }
    }
}

/// A leaf of the rule tree: `(matchfield, operator, value, negated,
/// case_insensitive)`.
///
/// # Why
/// - Every leaf a client can install, whether through the line protocol
///   or a loaded JSON file, reduces to the same five fields. Keeping
///   them in one flat struct means the evaluator, the wire grammar, and
///   the JSON tuple schema all agree on one shape instead of three.
///
/// # What (contract)
/// - `value` is always the literal text a client sent or a JSON file
///   held, never pre-parsed; `matchfield` alone decides how it gets
///   interpreted at evaluation time (numeric rank, IPv4 octets, or
///   plain string) and `operator` decides how the interpreted value and
///   the record's projected field get compared.
/// - `negated` flips the comparison's final boolean, applied after
///   `operator`, not before.
/// - `case_insensitive` only affects string comparisons (`EQ`/`RE` on
///   text); it's inert for `SEVERITY`/`FACILITY` ranks and `IP` octets,
///   which have no case to fold.
///
/// # Trade-offs
/// - Storing `value` as `String` instead of a pre-parsed `enum Value`
///   means every `evaluate` call re-parses it (re-splitting a `FIELD`
///   range, re-building an `Ipv4Addr`, ...). Simpler to keep in sync
///   with the wire format; the cost is one extra parse per record per
///   leaf, acceptable given leaves are small and trees are shallow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub matchfield: MatchField,
    pub operator: Operator,
    pub value: String,
    pub negated: bool,
    pub case_insensitive: bool,
}

impl Serialize for Predicate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        (
            self.matchfield.to_wire_string(),
            self.operator.to_wire_string(),
            &self.value,
            self.negated,
            self.case_insensitive,
        )
            .serialize(serializer)
    }
}

impl Predicate {
    pub fn from_json_tuple(value: serde_json::Value) -> Result<Self, EvalError> {
        let arr = value
            .as_array()
            .ok_or_else(|| EvalError::InvalidValue("predicate is not a 5-tuple".to_string()))?;
        if arr.len() != 5 {
            return Err(EvalError::InvalidValue("predicate must have 5 elements".to_string()));
        }
        let as_str = |v: &serde_json::Value| -> Result<String, EvalError> {
            v.as_str()
                .map(str::to_string)
                .or_else(|| v.as_f64().map(|n| {
                    if n.fract() == 0.0 { format!("{}", n as i64) } else { n.to_string() }
                }))
                .ok_or_else(|| EvalError::InvalidValue(v.to_string()))
        };
        let as_bool = |v: &serde_json::Value| -> Result<bool, EvalError> {
            v.as_bool().ok_or_else(|| EvalError::InvalidValue(v.to_string()))
        };
        Ok(Predicate {
            matchfield: MatchField::parse(&as_str(&arr[0])?)?,
            operator: Operator::parse(&as_str(&arr[1])?)?,
            value: as_str(&arr[2])?,
            negated: as_bool(&arr[3])?,
            case_insensitive: as_bool(&arr[4])?,
        })
    }
}

enum Operand {
    Str(String),
    Num(i32),
}

impl Operand {
    fn display(&self) -> String {
        match self {
            Operand::Str(s) => s.clone(),
            Operand::Num(n) => n.to_string(),
        }
    }
}

fn project_record(mf: &MatchField, record: &SyslogRecord) -> Result<Operand, EvalError> {
    match mf {
        MatchField::Whole => Ok(Operand::Str(record.msg.clone())),
        MatchField::Ip => unreachable!("IP is evaluated by evaluate_ip, not project_record"),
        MatchField::Severity => Ok(Operand::Num(record.severity.rank())),
        MatchField::Facility => Ok(Operand::Num(record.facility.rank())),
        MatchField::Field { range, sep } => {
            let tokens: Vec<&str> = record.msg.split(sep.as_str()).collect();
            let text = match range {
                Range::Single(i) => tokens.get(*i).copied().ok_or_else(|| EvalError::FieldIndexOutOfRange {
                    range: range.to_wire_string(),
                    index: *i,
                    available: tokens.len(),
                })?,
                Range::Span(i, j) => {
                    if *j >= tokens.len() {
                        return Err(EvalError::FieldIndexOutOfRange {
                            range: range.to_wire_string(),
                            index: *j,
                            available: tokens.len(),
                        });
                    }
                    return Ok(Operand::Str(tokens[*i..=*j].join(sep)));
                }
            };
            Ok(Operand::Str(text.to_string()))
        }
        MatchField::Regex { pattern, group } => {
            let re = Regex::new(pattern).map_err(|e| EvalError::InvalidRegex(pattern.clone(), e.to_string()))?;
            let captured = re
                .captures(&record.msg)
                .and_then(|caps| {
                    if let Ok(idx) = group.parse::<usize>() {
                        caps.get(idx).map(|m| m.as_str().to_string())
                    } else {
                        caps.name(group).map(|m| m.as_str().to_string())
                    }
                })
                .unwrap_or_default();
            Ok(Operand::Str(captured))
        }
    }
}

fn project_value(mf: &MatchField, value: &str) -> Result<Operand, EvalError> {
    match mf {
        MatchField::Severity => {
            if let Ok(code) = value.parse::<u8>() {
                Ok(Operand::Num(Severity(code).rank()))
            } else {
                Severity::from_name(value)
                    .map(|s| Operand::Num(s.rank()))
                    .ok_or_else(|| EvalError::InvalidValue(value.to_string()))
            }
        }
        MatchField::Facility => {
            if let Ok(code) = value.parse::<u8>() {
                Ok(Operand::Num(Facility(Some(code)).rank()))
            } else {
                Facility::from_name(value)
                    .map(|f| Operand::Num(f.rank()))
                    .ok_or_else(|| EvalError::InvalidValue(value.to_string()))
            }
        }
        _ => Ok(Operand::Str(value.to_string())),
    }
}

fn compare_ordered(lhs: &Operand, op: Operator, rhs: &Operand, case_insensitive: bool) -> Result<bool, EvalError> {
    match (lhs, rhs) {
        (Operand::Num(a), Operand::Num(b)) => Ok(match op {
            Operator::Eq => a == b,
            Operator::Lt => a < b,
            Operator::Le => a <= b,
            Operator::Gt => a > b,
            Operator::Ge => a >= b,
            Operator::Re => a.to_string() == b.to_string(),
        }),
        (Operand::Str(a), Operand::Str(b)) => {
            let (a, b) = if case_insensitive {
                (a.to_lowercase(), b.to_lowercase())
            } else {
                (a.clone(), b.clone())
            };
            Ok(match op {
                Operator::Eq => a == b,
                Operator::Lt => a < b,
                Operator::Le => a <= b,
                Operator::Gt => a > b,
                Operator::Ge => a >= b,
                Operator::Re => false, // RE is handled before reaching here for string operands
            })
        }
        _ => Err(EvalError::InvalidOperator(op.to_wire_string().to_string())),
    }
}

fn evaluate_regex(operand: &Operand, pattern: &str, case_insensitive: bool) -> Result<bool, EvalError> {
    let re = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| EvalError::InvalidRegex(pattern.to_string(), e.to_string()))?;
    Ok(re.is_match(&operand.display()))
}

/// IP comparison asymmetry: if both `value` and `record.hostname` parse
/// as dotted-decimal IPv4, compare numerically; if `value` looks like an
/// IPv4 literal but the hostname doesn't, the comparison is undefined
/// and returns `false` *without* applying `negated`; otherwise both
/// sides are compared as plain strings with `negated` applied normally.
/// See DESIGN.md for why the unprojectable case ignores `negated`.
fn evaluate_ip(predicate: &Predicate, record: &SyslogRecord) -> Result<bool, EvalError> {
    let value_ip = predicate.value.parse::<Ipv4Addr>();
    match value_ip {
        Ok(v) => match record.hostname.parse::<Ipv4Addr>() {
            Ok(h) => {
                let lhs = Operand::Num(u32::from(h) as i32);
                let rhs = Operand::Num(u32::from(v) as i32);
                let result = compare_ordered(&lhs, predicate.operator, &rhs, false)?;
                Ok(if predicate.negated { !result } else { result })
            }
            Err(_) => Ok(false),
        },
        Err(_) => {
            let lhs = Operand::Str(record.hostname.clone());
            let rhs = Operand::Str(predicate.value.clone());
            let result = if predicate.operator == Operator::Re {
                evaluate_regex(&lhs, &predicate.value, predicate.case_insensitive)?
            } else {
                compare_ordered(&lhs, predicate.operator, &rhs, predicate.case_insensitive)?
            };
            Ok(if predicate.negated { !result } else { result })
        }
    }
}

/// Evaluates a single predicate against a record.
///
/// # Why
/// - This is the one function every leaf in a rule tree ultimately runs
///   through, so it's the natural place to keep the matchfield/operator
///   grammar entirely in one spot rather than spread across the tree,
///   the protocol parser, and the JSON schema.
///
/// # What (contract)
/// - `Ip` is dispatched to [`evaluate_ip`] first, since it has its own
///   asymmetric comparison rule that doesn't fit the general
///   project-then-compare path every other matchfield takes.
/// - For every other matchfield: project the record's field, and either
///   run `RE` as a regex match against the projected text or parse
///   `predicate.value` the same way the field was projected and run an
///   ordered comparison between the two.
/// - `negated` is applied last, after the comparison and after `RE`,
///   uniformly for every matchfield except the `Ip`-unprojectable case
///   documented on [`evaluate_ip`].
///
/// # How
/// - Parse failures on either side (an out-of-range `FIELD` index, an
///   invalid regex, a non-numeric value compared against a rank)
///   surface as `EvalError` rather than `false`; a predicate a client
///   could never satisfy is a configuration problem worth reporting,
///   not a silent non-match.
pub fn evaluate(predicate: &Predicate, record: &SyslogRecord) -> Result<bool, EvalError> {
    if predicate.matchfield == MatchField::Ip {
        return evaluate_ip(predicate, record);
    }

    let operand = project_record(&predicate.matchfield, record)?;
    let result = if predicate.operator == Operator::Re {
        evaluate_regex(&operand, &predicate.value, predicate.case_insensitive)?
    } else {
        let value_operand = project_value(&predicate.matchfield, &predicate.value)?;
        compare_ordered(&operand, predicate.operator, &value_operand, predicate.case_insensitive)?
    };
    Ok(if predicate.negated { !result } else { result })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_record;

    #[test]
    fn whole_regex_match() {
        let p = Predicate {
            matchfield: MatchField::Whole,
            operator: Operator::Re,
            value: "ssh.*".to_string(),
            negated: false,
            case_insensitive: false,
        };
        assert!(evaluate(&p, &test_record(6, Some(1), "h", "sshd: accepted")).unwrap());
        assert!(!evaluate(&p, &test_record(6, Some(1), "h", "cron run")).unwrap());
    }

    #[test]
    fn severity_ge_by_name() {
        let p = Predicate {
            matchfield: MatchField::Severity,
            operator: Operator::Ge,
            value: "warning".to_string(),
            negated: false,
            case_insensitive: false,
        };
        assert!(!evaluate(&p, &test_record(6, None, "h", "ssh login")).unwrap()); // info
        assert!(evaluate(&p, &test_record(3, None, "h", "ssh fail")).unwrap()); // err
    }

    #[test]
    fn ip_numeric_compare() {
        let p = Predicate {
            matchfield: MatchField::Ip,
            operator: Operator::Eq,
            value: "10.0.0.1".to_string(),
            negated: false,
            case_insensitive: false,
        };
        assert!(evaluate(&p, &test_record(6, None, "10.0.0.1", "x")).unwrap());
        assert!(!evaluate(&p, &test_record(6, None, "10.0.0.2", "x")).unwrap());
    }

    #[test]
    fn ip_asymmetry_negation_does_not_flip_unprojectable_false() {
        let p = Predicate {
            matchfield: MatchField::Ip,
            operator: Operator::Eq,
            value: "10.0.0.1".to_string(),
            negated: true,
            case_insensitive: false,
        };
        assert!(!evaluate(&p, &test_record(6, None, "host.example", "x")).unwrap());
    }

    #[test]
    fn negation_is_its_own_inverse_outside_ip_mismatch() {
        let record = test_record(6, Some(1), "h", "sshd: accepted");
        let base = Predicate {
            matchfield: MatchField::Whole,
            operator: Operator::Re,
            value: "ssh.*".to_string(),
            negated: false,
            case_insensitive: false,
        };
        let negated = Predicate { negated: true, ..base.clone() };
        assert_eq!(evaluate(&base, &record).unwrap(), !evaluate(&negated, &record).unwrap());
    }

    #[test]
    fn field_range_and_sep() {
        let p = Predicate {
            matchfield: MatchField::Field {
                range: Range::Span(0, 1),
                sep: ",".to_string(),
            },
            operator: Operator::Eq,
            value: "a,b".to_string(),
            negated: false,
            case_insensitive: false,
        };
        assert!(evaluate(&p, &test_record(6, None, "h", "a,b,c")).unwrap());
    }

    #[test]
    fn matchfield_round_trips_through_wire_string() {
        let mf = MatchField::Field {
            range: Range::Single(2),
            sep: ":".to_string(),
        };
        assert_eq!(MatchField::parse(&mf.to_wire_string()).unwrap(), mf);
        let re = MatchField::Regex {
            pattern: "a:b.*".to_string(),
            group: "name".to_string(),
        };
        assert_eq!(MatchField::parse(&re.to_wire_string()).unwrap(), re);
    }
}
