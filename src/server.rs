//! TCP accept loop and per-connection tasks
//!
//! Every accepted socket gets one task that reads frames and dispatches
//! them strictly in order, and one writer task draining the connection's
//! outgoing channel into the socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::protocol::{Message, MessageCodec};
use crate::session::{ConnHandle, ConnId, Session};

/// Pending replies per connection before dispatch waits on the socket
const OUTGOING_CAPACITY: usize = 64;

/// Pause after a temporary accept failure
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Listen backlog
const BACKLOG: u32 = 1024;

/// Gateway server
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    next_conn_id: AtomicU64,
}

impl Server {
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Bind the configured address
    ///
    /// Buffer sizes are set on the listening socket; accepted sockets
    /// inherit them.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.listen;
        let bind_err = |source| ServerError::Bind { addr, source };

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket
            .set_recv_buffer_size(self.config.read_buffer)
            .map_err(bind_err)?;
        socket
            .set_send_buffer_size(self.config.write_buffer)
            .map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(BACKLOG).map_err(bind_err)?;

        info!(
            addr = %listener.local_addr().unwrap_or(addr),
            read_buffer = self.config.read_buffer,
            write_buffer = self.config.write_buffer,
            "listening"
        );
        Ok(listener)
    }

    /// Bind and accept forever
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    ///
    /// Returns only on a non-temporary accept error.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_temporary(&e) => {
                    warn!(error = %e, "temporary accept error");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(ServerError::Accept(e));
                }
            };

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let dispatcher = self.dispatcher.clone();
            let max_frame_len = self.config.max_frame_len;
            debug!(conn_id, peer = %peer, "connection accepted");

            tokio::spawn(async move {
                serve_connection(stream, conn_id, dispatcher, max_frame_len).await;
            });
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen", &self.config.listen)
            .field("next_conn_id", &self.next_conn_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Run one connection until the peer leaves or sends garbage
pub async fn serve_connection(
    stream: TcpStream,
    conn_id: ConnId,
    dispatcher: Arc<Dispatcher>,
    max_frame_len: usize,
) {
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, MessageCodec::new(max_frame_len));
    let mut sink = FramedWrite::new(writer, MessageCodec::new(max_frame_len));

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_CAPACITY);
    tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                warn!(conn_id, error = %e, "failed to write reply");
                break;
            }
        }
    });

    let mut session = Session::new(ConnHandle::new(conn_id, outgoing_tx));

    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id, error = %e, "failed to read message");
                break;
            }
        };

        if let Err(e) = dispatcher.dispatch(&mut session, message).await {
            if e.is_fatal() {
                debug!(conn_id, error = %e, "connection writer closed");
                break;
            }
            error!(conn_id, uid = %session.uid(), error = %e, "dispatch failed");
        }
    }

    let rooms = session.rooms().len();
    session.release(dispatcher.rooms().as_ref());
    debug!(conn_id, uid = %session.uid(), rooms, "connection closed");
}

/// Accept errors worth retrying instead of shutting down
fn is_temporary(err: &io::Error) -> bool {
    // EMFILE / ENFILE: out of file descriptors, clears as connections close
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;

    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(ENFILE) | Some(EMFILE))
}

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::hub::Hub;
    use crate::message_log::MemoryMessageLog;
    use crate::protocol::Cmd;
    use crate::publish::PublishRouter;
    use crate::publish::tests::ScriptedBackend;
    use pretty_assertions::assert_eq;
    use tokio_util::codec::Framed;

    async fn start(max_rooms: usize) -> (SocketAddr, Arc<Hub>, Arc<MemoryMessageLog>) {
        let hub = Arc::new(Hub::new());
        let log = Arc::new(MemoryMessageLog::new(10));
        let router = PublishRouter::new(HashMap::new(), Arc::new(ScriptedBackend::always_failing()));
        let dispatcher = Arc::new(Dispatcher::new(
            hub.clone(),
            log.clone(),
            Arc::new(router),
            max_rooms,
        ));

        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = Server::new(config, dispatcher);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        (addr, hub, log)
    }

    fn message(cmd: Cmd, rid: &str, body: &str) -> Message {
        Message {
            uid: "u1".to_string(),
            sid: "s1".to_string(),
            rid: rid.to_string(),
            body: body.to_string(),
            ..Message::new(cmd)
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[test]
    fn test_temporary_errors() {
        assert!(is_temporary(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_temporary(&io::Error::from_raw_os_error(24)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_end_to_end_session() {
        let (addr, hub, log) = start(4).await;
        log.append("lobby", 1, "m1", "hello");

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, MessageCodec::default());

        client.send(message(Cmd::Ping, "", "")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.cmd, Cmd::Ping);

        client
            .send(message(Cmd::Enter, "lobby", r#"{"1":""}"#))
            .await
            .unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.cmd, Cmd::Msgs);
        assert_eq!(reply.body, r#"{"1":["hello"]}"#);
        assert_eq!(hub.member_count("lobby"), 1);

        client.send(message(Cmd::Msgs, "lobby", "")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.cmd, Cmd::Msgs);
        assert_eq!(reply.body, "{}");

        drop(client);
        assert!(wait_until(|| hub.member_count("lobby") == 0).await);
    }

    #[tokio::test]
    async fn test_connections_are_isolated() {
        let (addr, hub, _log) = start(1).await;

        let mut a = Framed::new(TcpStream::connect(addr).await.unwrap(), MessageCodec::default());
        let mut b = Framed::new(TcpStream::connect(addr).await.unwrap(), MessageCodec::default());

        a.send(message(Cmd::Enter, "r1", "")).await.unwrap();
        b.send(message(Cmd::Enter, "r1", "")).await.unwrap();
        assert!(wait_until(|| hub.member_count("r1") == 2).await);

        // a hits its own limit; b is unaffected
        a.send(message(Cmd::Enter, "r2", "")).await.unwrap();
        let reply = a.next().await.unwrap().unwrap();
        assert_eq!(reply.cmd, Cmd::Err);

        b.send(message(Cmd::Ping, "", "")).await.unwrap();
        assert_eq!(b.next().await.unwrap().unwrap().cmd, Cmd::Ping);

        drop(a);
        assert!(wait_until(|| hub.member_count("r1") == 1).await);
    }

    #[tokio::test]
    async fn test_garbage_frame_closes_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (addr, hub, _log) = start(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, MessageCodec::default());
        framed.send(message(Cmd::Enter, "r1", "")).await.unwrap();
        assert!(wait_until(|| hub.member_count("r1") == 1).await);

        stream = framed.into_inner();
        // Length prefix far above the frame limit
        stream.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(wait_until(|| hub.member_count("r1") == 0).await);
    }
}
