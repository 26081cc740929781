//! QUIC listener: the unreliable datagram transport.
//!
//! The endpoint shares the HTTPS address (UDP instead of TCP) and the same
//! certificate. Where the WebSocket path carries its join parameters in the
//! `/join` query string, a QUIC client opens one bidirectional stream right
//! after the handshake and writes a bincode `JoinRequest` on it. An empty
//! stream reply means the join was accepted and the `JoinSuccess` arrives
//! as the first datagram; a refusal is answered with an encoded Join
//! failure on the stream before the connection closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::VarInt;
use tokio::time::timeout;

use shared::{JoinFail, JoinRequest, JoinResult, SessionResponse};

use crate::admission::{self, JoinParams};
use crate::error::ServerError;
use crate::registry::Registry;
use crate::session::Session;

const DATAGRAM_BUFFER_SIZE: usize = 1024 * 1024;
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_JOIN_BYTES: usize = 4096;
const IDLE_TIMEOUT_MS: u32 = 30_000;

/// Binds the endpoint and serves connections until the process exits.
pub async fn serve(
    addr: SocketAddr,
    tls: rustls::ServerConfig,
    registry: Arc<Registry>,
) -> Result<(), ServerError> {
    let crypto = QuicServerConfig::try_from(tls)
        .map_err(|e| ServerError::Internal(format!("quic crypto config: {}", e)))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.datagram_receive_buffer_size(Some(DATAGRAM_BUFFER_SIZE));
    transport.datagram_send_buffer_size(DATAGRAM_BUFFER_SIZE);
    transport.keep_alive_interval(Some(Duration::from_secs(5)));
    transport.max_idle_timeout(Some(VarInt::from_u32(IDLE_TIMEOUT_MS).into()));
    server_config.transport_config(Arc::new(transport));

    let endpoint = quinn::Endpoint::server(server_config, addr)
        .map_err(|e| ServerError::Transport(format!("quic bind: {}", e)))?;
    info!("quic endpoint listening on {}", addr);

    while let Some(incoming) = endpoint.accept().await {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let peer = incoming.remote_address();
            if let Err(e) = handle_connection(incoming, registry).await {
                debug!("quic connection from {} ended: {}", peer, e);
            }
        });
    }
    Ok(())
}

async fn handle_connection(
    incoming: quinn::Incoming,
    registry: Arc<Registry>,
) -> Result<(), ServerError> {
    let conn = incoming
        .await
        .map_err(|e| ServerError::Transport(format!("quic handshake: {}", e)))?;
    let peer = conn.remote_address();
    debug!("quic connection from {}", peer);

    let (mut send, mut recv) = timeout(JOIN_TIMEOUT, conn.accept_bi())
        .await
        .map_err(|_| ServerError::Transport("join handshake timed out".into()))?
        .map_err(|e| ServerError::Transport(format!("join stream: {}", e)))?;

    let raw = recv
        .read_to_end(MAX_JOIN_BYTES)
        .await
        .map_err(|e| ServerError::Transport(format!("join read: {}", e)))?;
    let join: JoinRequest = bincode::deserialize(&raw)?;

    let params = JoinParams {
        room_id: join.room_id,
        key: join.key,
        reconnect_token: join.reconnect_token,
    };

    match admission::authorize(&registry, &params).await {
        Ok(admitted) => {
            // Empty reply = accepted; the JoinSuccess arrives as the first
            // datagram once the room loop registers the client.
            let _ = send.finish();
            admission::attach(admitted, Session::from_quic(conn))?;
            Ok(())
        }
        Err(e) => {
            info!("quic join from {} refused: {}", peer, e);
            let refusal = SessionResponse::Join {
                code: e.http_status(),
                result: JoinResult::Fail(JoinFail {
                    message: e.to_string(),
                }),
            };
            if let Ok(bytes) = shared::encode_response(&refusal) {
                let _ = send.write_all(&bytes).await;
                let _ = send.finish();
            }
            conn.close(
                VarInt::from_u32(e.http_status() as u32),
                e.to_string().as_bytes(),
            );
            Err(e)
        }
    }
}
