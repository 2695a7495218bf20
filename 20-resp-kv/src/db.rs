//! The database: a command table over a key space, backed by an append-only
//! file.
//!
//! [`Db::open`] replays the file before returning, so the key space is fully
//! restored before the server accepts its first connection.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    aof::{Aof, AofError},
    command::{CommandTable, Request, RequestError},
    keyspace::Keyspace,
    resp::Value,
};

#[derive(Debug)]
pub struct Db {
    commands: CommandTable,
    aof: Aof,
    // Held across apply and append of a mutating command, so the file records
    // writes in the order the key space saw them.
    writes: Mutex<()>,
}

impl Db {
    pub async fn open(path: impl AsRef<Path>, fsync_interval: Duration) -> Result<Self> {
        let path = path.as_ref();
        let aof = Aof::open_with_interval(path, fsync_interval)
            .await
            .with_context(|| format!("failed to open append-only file {}", path.display()))?;

        let commands = CommandTable::new(Arc::new(Keyspace::new()));
        let records = aof
            .replay(|record| apply_record(&commands, record))
            .await
            .with_context(|| format!("failed to replay append-only file {}", path.display()))?;

        info!(
            path = %path.display(),
            records,
            keys = commands.keyspace().len(),
            "restored key space"
        );
        Ok(Self {
            commands,
            aof,
            writes: Mutex::new(()),
        })
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        self.commands.keyspace()
    }

    /// Runs one decoded frame and returns the reply to send back.
    ///
    /// A frame that is not a request is rejected with a [`RequestError`] and
    /// gets no reply. Unknown commands get an empty simple string and are
    /// never logged. Persisted records are the normalized request, an array
    /// of bulk strings. If persisting a mutation fails the caller gets an
    /// error reply, but the in-memory change has already been applied and
    /// stays.
    pub async fn process(&self, frame: Value) -> Result<Value, RequestError> {
        let request = Request::parse(&frame)?;
        let mutates = self
            .commands
            .lookup(&request.name)
            .is_some_and(|command| command.mutates);
        let _write_guard = if mutates {
            Some(self.writes.lock().await)
        } else {
            None
        };

        let execution = match self.commands.execute(&request) {
            Ok(execution) => execution,
            Err(err) => {
                warn!(error = %err, "rejecting request");
                return Ok(Value::simple(""));
            }
        };
        debug!(command = execution.command, args = request.args.len(), "executed");

        if execution.should_persist() {
            if let Err(err) = self.aof.append(&request.to_value()).await {
                error!(command = execution.command, error = %err, "failed to persist command");
                return Ok(Value::error(format!("ERR failed to persist command: {err}")));
            }
        }

        Ok(execution.reply)
    }

    pub async fn close(&self) -> Result<(), AofError> {
        self.aof.close().await
    }
}

fn apply_record(commands: &CommandTable, record: Value) -> Result<()> {
    let request = Request::parse(&record)?;
    let execution = commands.execute(&request)?;
    if let Value::Error(message) = &execution.reply {
        // Older files may hold rejected requests; replaying them is a no-op.
        debug!(command = execution.command, %message, "replayed record was rejected");
    }
    Ok(())
}
