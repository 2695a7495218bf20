//! A small key-value server that speaks the Redis serialization protocol.
//!
//! String keys and hash records live in memory. Every successful write is
//! appended to a log on disk and replayed on startup. The modules are layered
//! bottom-up:
//!
//! - [`resp`] encodes and decodes wire values.
//! - [`keyspace`] holds the two namespaces behind reader/writer locks.
//! - [`command`] turns a request array into a handler call and a reply.
//! - [`aof`] appends requests to the log, fsyncs it periodically, and
//!   replays it.
//! - [`db`] ties the command table to the log and decides what gets persisted.
//! - [`server`] accepts TCP connections and runs one request loop per client.
//! - [`cli`] parses the command-line flags.

pub mod aof;
pub mod cli;
pub mod command;
pub mod db;
pub mod keyspace;
pub mod resp;
pub mod server;
