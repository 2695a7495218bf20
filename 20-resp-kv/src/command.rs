//! Command dispatch.
//!
//! A decoded frame is first shaped into a [`Request`] (command name plus byte
//! arguments), then looked up in the [`CommandTable`] and run against the
//! [`Keyspace`] the table was built with.

use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;

use crate::{keyspace::Keyspace, resp::Value};

type Handler = fn(&Keyspace, &[Vec<u8>]) -> Value;

/// Every command the server understands.
const COMMANDS: [Command; 7] = [
    Command::new("PING", false, ping),
    Command::new("SET", true, set),
    Command::new("GET", false, get),
    Command::new("DEL", true, del),
    Command::new("HSET", true, hset),
    Command::new("HGET", false, hget),
    Command::new("HGETALL", false, hgetall),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub args: Vec<Vec<u8>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("expected an array request, got {0}")]
    NotArray(&'static str),
    #[error("request array is empty")]
    Empty,
    #[error("request element {index} is a {kind}, expected a bulk string")]
    NotText { index: usize, kind: &'static str },
}

impl Request {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Shapes a decoded frame into a request.
    ///
    /// Requests are non-empty arrays of bulk strings. Simple strings are
    /// accepted too since they carry the same text. A command name that is
    /// not UTF-8 is kept lossily; no command will match it.
    pub fn parse(frame: &Value) -> Result<Self, RequestError> {
        let items = match frame {
            Value::Array(items) => items,
            other => return Err(RequestError::NotArray(other.kind())),
        };
        if items.is_empty() {
            return Err(RequestError::Empty);
        }

        let mut parts = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match item {
                Value::Bulk(bytes) => parts.push(bytes.clone()),
                Value::String(text) => parts.push(text.clone().into_bytes()),
                other => {
                    return Err(RequestError::NotText {
                        index,
                        kind: other.kind(),
                    })
                }
            }
        }

        let mut parts = parts.into_iter();
        let name = parts.next().ok_or(RequestError::Empty)?;
        Ok(Self {
            name: String::from_utf8_lossy(&name).into_owned(),
            args: parts.collect(),
        })
    }

    /// The wire form of this request: an array of bulk strings.
    pub fn to_value(&self) -> Value {
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(Value::bulk(self.name.clone()));
        items.extend(self.args.iter().cloned().map(Value::Bulk));
        Value::Array(items)
    }
}

#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    /// Whether successful runs change the key space and must be logged.
    pub mutates: bool,
    handler: Handler,
}

impl Command {
    const fn new(name: &'static str, mutates: bool, handler: Handler) -> Self {
        Self {
            name,
            mutates,
            handler,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("mutates", &self.mutates)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
}

/// Outcome of running one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub command: &'static str,
    pub mutates: bool,
    pub reply: Value,
}

impl Execution {
    /// Mutating commands are persisted unless the handler rejected them.
    pub fn should_persist(&self) -> bool {
        self.mutates && !self.reply.is_error()
    }
}

pub struct CommandTable {
    keyspace: Arc<Keyspace>,
    commands: HashMap<&'static str, Command>,
}

impl CommandTable {
    pub fn new(keyspace: Arc<Keyspace>) -> Self {
        let commands = COMMANDS
            .iter()
            .map(|command| (command.name, *command))
            .collect();
        Self { keyspace, commands }
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    /// Case-insensitive lookup.
    pub fn lookup(&self, name: &str) -> Option<&Command> {
        self.commands.get(name.to_ascii_uppercase().as_str())
    }

    pub fn execute(&self, request: &Request) -> Result<Execution, CommandError> {
        let command = self
            .lookup(&request.name)
            .ok_or_else(|| CommandError::Unknown(request.name.clone()))?;
        let reply = (command.handler)(&self.keyspace, &request.args);
        Ok(Execution {
            command: command.name,
            mutates: command.mutates,
            reply,
        })
    }
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("CommandTable")
            .field("commands", &names)
            .finish()
    }
}

fn wrong_arity(name: &str) -> Value {
    Value::error(format!("ERR wrong number of arguments for '{name}' command"))
}

fn ping(_: &Keyspace, args: &[Vec<u8>]) -> Value {
    match args {
        [] => Value::simple("PONG"),
        // A simple string cannot carry line breaks or raw bytes.
        [message] => match std::str::from_utf8(message) {
            Ok(text) if !text.contains(['\r', '\n']) => Value::simple(text),
            _ => Value::Bulk(message.clone()),
        },
        _ => wrong_arity("PING"),
    }
}

fn set(keyspace: &Keyspace, args: &[Vec<u8>]) -> Value {
    match args {
        [key, value] => {
            keyspace.set(key.clone(), value.clone());
            Value::ok()
        }
        _ => wrong_arity("SET"),
    }
}

fn get(keyspace: &Keyspace, args: &[Vec<u8>]) -> Value {
    match args {
        [key] => keyspace.get(key).map_or(Value::Null, Value::Bulk),
        _ => wrong_arity("GET"),
    }
}

fn del(keyspace: &Keyspace, args: &[Vec<u8>]) -> Value {
    match args {
        [key] if keyspace.del(key) => Value::ok(),
        [_] => Value::Null,
        _ => wrong_arity("DEL"),
    }
}

fn hset(keyspace: &Keyspace, args: &[Vec<u8>]) -> Value {
    match args {
        [key, field, value] => {
            keyspace.hset(key.clone(), field.clone(), value.clone());
            Value::ok()
        }
        _ => wrong_arity("HSET"),
    }
}

fn hget(keyspace: &Keyspace, args: &[Vec<u8>]) -> Value {
    match args {
        [key, field] => keyspace.hget(key, field).map_or(Value::Null, Value::Bulk),
        _ => wrong_arity("HGET"),
    }
}

fn hgetall(keyspace: &Keyspace, args: &[Vec<u8>]) -> Value {
    match args {
        [key] => match keyspace.hgetall(key) {
            Some(fields) => Value::Array(
                fields
                    .into_iter()
                    .flat_map(|(field, value)| [Value::Bulk(field), Value::Bulk(value)])
                    .collect(),
            ),
            None => Value::Null,
        },
        _ => wrong_arity("HGETALL"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CommandTable {
        CommandTable::new(Arc::new(Keyspace::new()))
    }

    fn run(table: &CommandTable, name: &str, args: &[&str]) -> Value {
        table
            .execute(&Request::new(name, args.iter().copied()))
            .expect("registered command")
            .reply
    }

    fn assert_arity_error(reply: Value, name: &str) {
        match reply {
            Value::Error(message) => assert!(
                message.contains(&format!("'{name}'")),
                "error {message:?} should name {name}"
            ),
            other => panic!("expected arity error for {name}, got {other:?}"),
        }
    }

    #[test]
    fn ping_replies_pong_or_echoes() {
        let table = table();
        assert_eq!(run(&table, "PING", &[]), Value::simple("PONG"));
        assert_eq!(run(&table, "PING", &["x"]), Value::simple("x"));
        assert_eq!(run(&table, "PING", &["two\r\nlines"]), Value::bulk("two\r\nlines"));
        assert_arity_error(run(&table, "PING", &["x", "y"]), "PING");
    }

    #[test]
    fn wrong_arity_names_the_command() {
        let table = table();
        assert_arity_error(run(&table, "SET", &["a"]), "SET");
        assert_arity_error(run(&table, "GET", &["a", "b"]), "GET");
        assert_arity_error(run(&table, "DEL", &["a", "b"]), "DEL");
        assert_arity_error(run(&table, "HSET", &["h", "f"]), "HSET");
        assert_arity_error(run(&table, "HSET", &["h", "f", "v", "extra"]), "HSET");
        assert_arity_error(run(&table, "HGET", &["h"]), "HGET");
        assert_arity_error(run(&table, "HGETALL", &[]), "HGETALL");
    }

    #[test]
    fn arity_errors_do_not_mutate() {
        let table = table();
        run(&table, "SET", &["only-key"]);
        run(&table, "HSET", &["h", "f"]);
        assert!(table.keyspace().is_empty());
    }

    #[test]
    fn string_commands() {
        let table = table();
        assert_eq!(run(&table, "SET", &["k", "v"]), Value::ok());
        assert_eq!(run(&table, "GET", &["k"]), Value::bulk("v"));
        assert_eq!(run(&table, "SET", &["k", "w"]), Value::ok());
        assert_eq!(run(&table, "GET", &["k"]), Value::bulk("w"));
        assert_eq!(run(&table, "DEL", &["k"]), Value::ok());
        assert_eq!(run(&table, "GET", &["k"]), Value::Null);
        assert_eq!(run(&table, "GET", &["missing"]), Value::Null);
        assert_eq!(run(&table, "DEL", &["missing"]), Value::Null);
    }

    #[test]
    fn hash_commands() {
        let table = table();
        assert_eq!(run(&table, "HSET", &["h", "f", "v"]), Value::ok());
        assert_eq!(run(&table, "HGET", &["h", "f"]), Value::bulk("v"));
        assert_eq!(run(&table, "HGET", &["h", "nofield"]), Value::Null);
        assert_eq!(run(&table, "HGET", &["nohash", "f"]), Value::Null);
        assert_eq!(
            run(&table, "HGETALL", &["h"]),
            Value::Array(vec![Value::bulk("f"), Value::bulk("v")])
        );
        assert_eq!(run(&table, "HGETALL", &["missing"]), Value::Null);
    }

    #[test]
    fn hgetall_is_ordered_by_field() {
        let table = table();
        run(&table, "HSET", &["h", "zeta", "1"]);
        run(&table, "HSET", &["h", "alpha", "2"]);
        run(&table, "HSET", &["h", "mid", "3"]);

        assert_eq!(
            run(&table, "HGETALL", &["h"]),
            Value::Array(vec![
                Value::bulk("alpha"),
                Value::bulk("2"),
                Value::bulk("mid"),
                Value::bulk("3"),
                Value::bulk("zeta"),
                Value::bulk("1"),
            ])
        );
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let table = table();
        assert_eq!(run(&table, "set", &["k", "v"]), Value::ok());
        assert_eq!(run(&table, "GeT", &["k"]), Value::bulk("v"));
        assert_eq!(table.lookup("hgetall").map(|c| c.name), Some("HGETALL"));
    }

    #[test]
    fn unknown_command_is_reported() {
        let table = table();
        let err = table
            .execute(&Request::new("FLUSHALL", Vec::<String>::new()))
            .unwrap_err();
        assert_eq!(err, CommandError::Unknown("FLUSHALL".into()));
        assert!(table.keyspace().is_empty());
    }

    #[test]
    fn only_successful_mutations_are_persisted() {
        let table = table();
        let exec = |name: &str, args: &[&str]| {
            table
                .execute(&Request::new(name, args.iter().copied()))
                .expect("registered command")
        };

        assert!(exec("SET", &["k", "v"]).should_persist());
        assert!(exec("HSET", &["h", "f", "v"]).should_persist());
        assert!(exec("DEL", &["k"]).should_persist());
        assert!(!exec("SET", &["k"]).should_persist());
        assert!(!exec("GET", &["k"]).should_persist());
        assert!(!exec("PING", &[]).should_persist());
    }

    #[test]
    fn parse_accepts_arrays_of_strings() {
        let frame = Value::Array(vec![
            Value::bulk("SET"),
            Value::bulk("k"),
            Value::simple("v"),
        ]);
        let request = Request::parse(&frame).expect("valid request");
        assert_eq!(request, Request::new("SET", ["k", "v"]));
        assert_eq!(
            request.to_value(),
            Value::Array(vec![Value::bulk("SET"), Value::bulk("k"), Value::bulk("v")])
        );
    }

    #[test]
    fn binary_keys_and_values() {
        let table = table();
        let key = vec![0xff, 0x00];
        let value = vec![0xfe, b'\r', b'\n', 0x80];
        let exec = |name: &str, args: Vec<Vec<u8>>| {
            table
                .execute(&Request::new(name, args))
                .expect("registered command")
                .reply
        };

        assert_eq!(exec("SET", vec![key.clone(), value.clone()]), Value::ok());
        assert_eq!(exec("GET", vec![key.clone()]), Value::Bulk(value.clone()));
        assert_eq!(exec("HSET", vec![key.clone(), key.clone(), value.clone()]), Value::ok());
        assert_eq!(
            exec("HGETALL", vec![key.clone()]),
            Value::Array(vec![Value::Bulk(key), Value::Bulk(value)])
        );
    }

    #[test]
    fn parse_keeps_bulk_bytes() {
        let frame = Value::Array(vec![
            Value::bulk("SET"),
            Value::bulk("k"),
            Value::bulk(vec![0xff]),
        ]);
        let request = Request::parse(&frame).expect("valid request");
        assert_eq!(request.args, vec![b"k".to_vec(), vec![0xff]]);
        assert_eq!(request.to_value(), frame);
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert_eq!(
            Request::parse(&Value::bulk("PING")),
            Err(RequestError::NotArray("bulk string"))
        );
        assert_eq!(
            Request::parse(&Value::Array(vec![])),
            Err(RequestError::Empty)
        );
        assert_eq!(
            Request::parse(&Value::Array(vec![Value::bulk("GET"), Value::Null])),
            Err(RequestError::NotText {
                index: 1,
                kind: "null"
            })
        );
    }
}
