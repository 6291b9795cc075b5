//! TCP edge: accepts clients and bridges each socket to the pipeline.
//!
//! Every connection gets a reader task and a writer task. The reader
//! parses frames into commands and parks them in an [`Inbox`], which the
//! pipeline's ingest threads drain through [`CommandSource`]. The pipeline
//! hands responses to a [`ChannelSink`]; the writer task encodes and
//! writes them.
//!
//! On SIGINT the accept loop stops and the pipeline shuts down, which
//! closes every sink and so ends every connection task.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use kinetic_core::{
    CommandSource, IncomingCommand, Pipeline, Response, ResponseSink, SinkError, SourceError,
};
use kinetic_protocol::{encode_response, encoded_len, parse_frame, CommandDecoder, ProtocolError};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::metrics;

/// Decoded commands buffered per connection before the reader pauses.
const INBOX_DEPTH: usize = 256;

/// Read buffer growth step.
const READ_CHUNK: usize = 16 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Commands read off one socket, waiting for an ingest thread.
#[derive(Default)]
pub struct Inbox {
    items: Mutex<InboxState>,
    drained: Notify,
}

#[derive(Default)]
struct InboxState {
    queue: VecDeque<Result<IncomingCommand, SourceError>>,
    closed: bool,
}

impl Inbox {
    fn push(&self, item: Result<IncomingCommand, SourceError>) {
        self.items.lock().queue.push_back(item);
    }

    fn len(&self) -> usize {
        self.items.lock().queue.len()
    }

    /// No more input: once drained, reads report `Closed`.
    fn close(&self) {
        self.items.lock().closed = true;
    }

    async fn wait_for_room(&self) {
        loop {
            let notified = self.drained.notified();
            if self.len() < INBOX_DEPTH {
                return;
            }
            notified.await;
        }
    }
}

impl CommandSource for Inbox {
    fn read_next_command(&self) -> Result<Option<IncomingCommand>, SourceError> {
        let mut state = self.items.lock();
        match state.queue.pop_front() {
            Some(item) => {
                drop(state);
                self.drained.notify_one();
                item.map(Some)
            }
            None if state.closed => Err(SourceError::Closed),
            None => Ok(None),
        }
    }
}

/// Response sink backed by the connection's writer task.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<Response>>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Response>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl ResponseSink for ChannelSink {
    fn encoded_len(&self, response: &Response) -> usize {
        encoded_len(response)
    }

    fn send(&self, response: Response) -> Result<(), SinkError> {
        match &*self.tx.lock() {
            Some(tx) => tx.send(response).map_err(|_| SinkError::Closed),
            None => Err(SinkError::Closed),
        }
    }

    fn close(&self) {
        // dropping the sender lets the writer drain what's queued, then stop
        self.tx.lock().take();
    }
}

/// Binds `addr` and serves until SIGINT.
pub async fn run(
    addr: SocketAddr,
    pipeline: Arc<Pipeline>,
) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr).await?;
    info!(
        "listening on {addr} (max {} connections)",
        pipeline.config().max_connections
    );
    serve(listener, pipeline, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Accept loop. Returns once `shutdown` resolves and the pipeline has
/// stopped.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), BoxError> {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, stopping pipeline...");
                break;
            }

            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    handle(stream, peer, pipeline).await;
                });
            }
        }
    }

    // joins worker threads, so keep it off the runtime
    let stopping = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;

    for entry in pipeline.latency_log().get(None) {
        info!(
            conn_id = entry.conn_id,
            seq = ?entry.sequence,
            op = %entry.op,
            total_ms = entry.timings.total_ms(),
            "slow command"
        );
    }
    info!("server stopped");
    Ok(())
}

async fn handle(stream: TcpStream, peer: SocketAddr, pipeline: Arc<Pipeline>) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let inbox = Arc::new(Inbox::default());
    let (tx, rx) = mpsc::unbounded_channel();

    let conn = match pipeline.register_connection(
        peer.to_string(),
        Box::new(Arc::clone(&inbox)),
        Box::new(ChannelSink::new(tx)),
    ) {
        Ok(conn) => conn,
        Err(e) => {
            metrics::on_connection_rejected();
            warn!("rejecting {peer}: {e}");
            return;
        }
    };
    metrics::on_connection_accepted();
    let conn_id = conn.id();
    drop(conn);

    let write = write_loop(writer, rx);
    tokio::pin!(write);

    tokio::select! {
        result = read_loop(reader, &inbox, &pipeline, conn_id) => {
            if let Err(e) = result {
                debug!(conn_id, "read ended: {e}");
            }
            // let ingest see the end of input, then wait for the final
            // responses to go out
            inbox.close();
            pipeline.notify_readable(conn_id);
            let _ = (&mut write).await;
        }
        result = &mut write => {
            if let Err(e) = result {
                debug!(conn_id, "write failed: {e}");
            }
        }
    }

    pipeline.close_connection(conn_id);
    debug!(conn_id, %peer, "connection task finished");
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbox: &Inbox,
    pipeline: &Pipeline,
    conn_id: u64,
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut decoder = CommandDecoder::new();

    loop {
        let mut parsed = 0;
        loop {
            match parse_frame(&buf) {
                Ok(Some((frame, used))) => {
                    let _ = buf.split_to(used);
                    let item = decoder
                        .decode(frame)
                        .map_err(|e| SourceError::Malformed(e.to_string()));
                    inbox.push(item);
                    parsed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    // framing is lost; report it and drop the connection
                    inbox.push(Err(SourceError::Malformed(e.to_string())));
                    for _ in 0..=parsed {
                        pipeline.notify_readable(conn_id);
                    }
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
                }
            }
        }
        for _ in 0..parsed {
            pipeline.notify_readable(conn_id);
        }
        inbox.wait_for_room().await;

        buf.reserve(READ_CHUNK);
        if reader.read_buf(&mut buf).await? == 0 {
            if !buf.is_empty() {
                let e = ProtocolError::Incomplete;
                debug!(conn_id, "peer closed mid-frame: {e}");
            }
            return Ok(());
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Response>,
) -> std::io::Result<()> {
    let mut out = BytesMut::with_capacity(READ_CHUNK);
    while let Some(response) = rx.recv().await {
        encode_response(&response).serialize(&mut out);
        // coalesce whatever else is already waiting
        while let Ok(more) = rx.try_recv() {
            encode_response(&more).serialize(&mut out);
        }
        writer.write_all(&out).await?;
        out.clear();
    }
    writer.shutdown().await
}
