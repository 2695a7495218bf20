use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    db::Db,
    resp::{read_value, write_value},
};

pub struct Server {
    listener: TcpListener,
    db: Arc<Db>,
}

impl Server {
    pub fn new(listener: TcpListener, db: Arc<Db>) -> Self {
        Self { listener, db }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// being served keep running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, db } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &db);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, db: &Arc<Db>) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, db),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, db: &Arc<Db>) {
    let db = Arc::clone(db);
    tokio::spawn(async move {
        debug!(%peer, "client connected");
        match handle_connection(stream, &db).await {
            Ok(()) => debug!(%peer, "client disconnected"),
            Err(err) => warn!(peer = %peer, error = ?err, "client connection closed with error"),
        }
    });
}

async fn handle_connection(stream: TcpStream, db: &Db) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;
    serve(db, &mut reader, &mut writer).await
}

/// Reads requests off `reader` and answers each on `writer`, strictly in
/// order, until the peer hangs up.
///
/// Undecodable input ends the session with an error. Frames that decode but
/// are not requests are logged and get no reply.
pub async fn serve<R, W>(db: &Db, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = match read_value(reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("skipped a byte that is not a type tag");
                continue;
            }
            Err(err) if err.is_end_of_stream() => return Ok(()),
            Err(err) => return Err(err).context("failed to decode request"),
        };

        match db.process(frame).await {
            Ok(reply) => write_value(writer, &reply)
                .await
                .context("failed to write reply")?,
            Err(err) => warn!(error = %err, "dropping invalid request"),
        }
    }
}
