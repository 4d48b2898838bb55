//! Command registry of the control protocol.
//!
//! Every command the master understands is described once, statically, by a
//! [`CommandSpec`]: its name, what it dispatches to and the arguments it
//! accepts. Requests are checked for arity and argument types
//! before anything runs.

use crate::error::{Error, Result};
use crate::group::Operation;
use nix::sys::signal::Signal;
use std::collections::HashMap;

/// What a command dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ping,
    Notify,
    StopMaster,
    RestartMaster,
    Op(Operation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int,
    /// String words appended to the positional list
    Target,
}

#[derive(Debug)]
pub struct Param {
    pub name: &'static str,
    pub ty: ParamType,
}

/// Static description of one command.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub kind: CommandKind,
    /// Accepted `key=value` parameters
    pub params: &'static [Param],
    /// Whether bare words are collected as positional arguments
    pub positional: bool,
    pub min_args: usize,
    pub max_args: Option<usize>,
    /// Whether the command holds the global mutation lock while it runs
    pub exclusive: bool,
}

const OP_PARAMS: &[Param] = &[
    Param { name: "wait", ty: ParamType::Bool },
    Param { name: "verbose", ty: ParamType::Bool },
    Param { name: "name", ty: ParamType::Target },
];

const STOP_PARAMS: &[Param] = &[
    Param { name: "wait", ty: ParamType::Bool },
    Param { name: "verbose", ty: ParamType::Bool },
    Param { name: "name", ty: ParamType::Target },
    Param { name: "signal", ty: ParamType::Int },
];

const fn op(name: &'static str, operation: Operation, params: &'static [Param]) -> CommandSpec {
    CommandSpec {
        name,
        kind: CommandKind::Op(operation),
        params,
        positional: true,
        min_args: 0,
        max_args: None,
        exclusive: !matches!(operation, Operation::Status),
    }
}

/// All commands, looked up case-insensitively by name.
pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "PING",
        kind: CommandKind::Ping,
        params: &[],
        positional: true,
        min_args: 0,
        max_args: None,
        exclusive: false,
    },
    CommandSpec {
        name: "NOTIFY",
        kind: CommandKind::Notify,
        params: &[],
        positional: true,
        min_args: 1,
        max_args: Some(1),
        exclusive: false,
    },
    CommandSpec {
        name: "STOP-MASTER",
        kind: CommandKind::StopMaster,
        params: &[],
        positional: false,
        min_args: 0,
        max_args: Some(0),
        exclusive: true,
    },
    CommandSpec {
        name: "RESTART-MASTER",
        kind: CommandKind::RestartMaster,
        params: &[],
        positional: false,
        min_args: 0,
        max_args: Some(0),
        exclusive: true,
    },
    op("START", Operation::Start, OP_PARAMS),
    op("STOP", Operation::Stop, STOP_PARAMS),
    op("RESTART", Operation::Restart, OP_PARAMS),
    op("BG-RESTART", Operation::BgRestart, OP_PARAMS),
    op("WARMUP", Operation::Warmup, OP_PARAMS),
    op("STATUS", Operation::Status, OP_PARAMS),
];

/// Find a command by name, ignoring case.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Coerced value of a keyed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "y" | "yes" | "true"
    )
}

/// Validated arguments of one request.
#[derive(Debug, Default)]
pub struct Args {
    values: HashMap<&'static str, Value>,
    positional: Vec<String>,
}

impl Args {
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(Value::Bool(true)))
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn positional(&self) -> &[String] {
        &self.positional
    }
}

/// A parsed, validated request.
#[derive(Debug)]
pub struct Request {
    pub spec: &'static CommandSpec,
    pub args: Args,
}

impl Request {
    /// Parse the words of a request line.
    pub fn parse(words: &[String]) -> Result<Self> {
        let (name, rest) = words
            .split_first()
            .ok_or_else(|| Error::UnknownCommand(String::new()))?;
        let spec = lookup(name).ok_or_else(|| Error::UnknownCommand(name.clone()))?;

        if rest.len() < spec.min_args {
            return Err(Error::TooFewArgs {
                command: spec.name.to_string(),
                min: spec.min_args,
            });
        }
        if let Some(max) = spec.max_args {
            if rest.len() > max {
                return Err(Error::TooManyArgs {
                    command: spec.name.to_string(),
                    max,
                });
            }
        }

        let mut args = Args::default();
        for word in rest {
            let keyed = word.split_once('=').and_then(|(key, value)| {
                spec.params
                    .iter()
                    .find(|p| p.name.eq_ignore_ascii_case(key))
                    .map(|p| (p, value))
            });

            match keyed {
                Some((param, value)) => match param.ty {
                    ParamType::Bool => {
                        args.values.insert(param.name, Value::Bool(parse_bool(value)));
                    }
                    ParamType::Int => {
                        let v = value.parse::<i64>().map_err(|_| {
                            Error::Syntax(format!("{}: not a number: {:?}", param.name, value))
                        })?;
                        args.values.insert(param.name, Value::Int(v));
                    }
                    ParamType::Target => args.positional.push(value.to_string()),
                },
                None if spec.positional => args.positional.push(word.clone()),
                None => {
                    return Err(Error::Syntax(format!(
                        "{} does not take argument {:?}",
                        spec.name, word
                    )))
                }
            }
        }

        Ok(Self { spec, args })
    }

    /// Signal requested with `signal=<n>`, SIGTERM by default.
    pub fn signal(&self) -> Result<Signal> {
        match self.args.int("signal") {
            None => Ok(Signal::SIGTERM),
            Some(n) => i32::try_from(n)
                .ok()
                .and_then(|n| Signal::try_from(n).ok())
                .ok_or_else(|| Error::Syntax(format!("signal: not a signal number: {}", n))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(lookup("status").unwrap().name, "STATUS");
        assert_eq!(lookup("Bg-Restart").unwrap().kind, CommandKind::Op(Operation::BgRestart));
        assert!(lookup("FROB").is_none());
        for operation in Operation::ALL {
            let spec = lookup(operation.name()).unwrap();
            assert_eq!(spec.kind, CommandKind::Op(operation));
        }
    }

    #[test]
    fn test_op_arguments() {
        let req = Request::parse(&words("stop a name=b wait=YES verbose=no signal=9 c")).unwrap();
        assert_eq!(req.spec.kind, CommandKind::Op(Operation::Stop));
        assert!(req.args.flag("wait"));
        assert!(!req.args.flag("verbose"));
        assert_eq!(req.args.positional(), &["a", "b", "c"]);
        assert_eq!(req.signal().unwrap(), Signal::SIGKILL);

        let req = Request::parse(&words("START")).unwrap();
        assert!(!req.args.flag("wait"));
        assert_eq!(req.signal().unwrap(), Signal::SIGTERM);
    }

    #[test]
    fn test_bad_arguments() {
        let err = |line: &str| Request::parse(&words(line)).unwrap_err().code();

        assert_eq!(err("STOP signal=abc"), "SYNTAX");
        assert_eq!(err("NOTIFY"), "TFARGS");
        assert_eq!(err("NOTIFY a b"), "TMARGS");
        assert_eq!(err("STOP-MASTER now"), "TMARGS");
        assert_eq!(err("FROB"), "NXCMD");
        assert_eq!(Request::parse(&[]).unwrap_err().code(), "NXCMD");

        let req = Request::parse(&words("STOP signal=999")).unwrap();
        assert_eq!(req.signal().unwrap_err().code(), "SYNTAX");
    }

    #[test]
    fn test_lock_requirements() {
        assert!(!lookup("PING").unwrap().exclusive);
        assert!(!lookup("NOTIFY").unwrap().exclusive);
        assert!(!lookup("STATUS").unwrap().exclusive);
        assert!(lookup("START").unwrap().exclusive);
        assert!(lookup("RESTART-MASTER").unwrap().exclusive);
    }

    #[test]
    fn test_ping_keeps_keyed_words() {
        let req = Request::parse(&words("PING a=b c")).unwrap();
        assert_eq!(req.args.positional(), &["a=b", "c"]);
    }
}
