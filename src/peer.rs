//! One outbound request/response exchange with a branch.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::config::{AddressFamily, ReplyFraming};
use crate::error::PeerError;
use crate::protocol::{has_terminator, REQUEST};
use crate::types::PeerAddr;

/// Lifecycle of an open channel. A peer that never accepted a connection
/// has no channel at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Pending,
    Complete,
    Failed,
    Dead,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Pending => "pending",
            ChannelState::Complete => "complete",
            ChannelState::Failed => "failed",
            ChannelState::Dead => "dead",
        };
        f.write_str(name)
    }
}

pub struct PeerChannel {
    peer: PeerAddr,
    stream: Option<TcpStream>,
    state: ChannelState,
}

impl PeerChannel {
    /// Resolve `peer` within `family` and connect to the first address that
    /// answers. Each attempt is bounded by `connect_timeout`.
    pub async fn connect(
        peer: PeerAddr,
        family: AddressFamily,
        connect_timeout: Duration,
    ) -> Result<Self, PeerError> {
        let label = peer.to_string();
        let unreachable = |reason: String| PeerError::Unreachable {
            peer: label.clone(),
            reason,
        };

        let candidates: Vec<SocketAddr> =
            timeout(connect_timeout, lookup_host((peer.host.clone(), peer.port)))
                .await
                .map_err(|_| unreachable("address resolution timed out".into()))?
                .map_err(|e| unreachable(format!("address resolution failed: {e}")))?
                .filter(|addr| family.accepts(addr))
                .collect();

        let mut last_error = format!("no {family:?} address found");
        for addr in candidates {
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%peer, %addr, "Connected");
                    return Ok(Self {
                        peer,
                        stream: Some(stream),
                        state: ChannelState::Pending,
                    });
                }
                Ok(Err(e)) => last_error = format!("{addr}: {e}"),
                Err(_) => last_error = format!("{addr}: connect timed out"),
            }
        }
        Err(unreachable(last_error))
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub async fn send_request(&mut self) -> Result<(), PeerError> {
        let result = match self.stream.as_mut() {
            Some(stream) => stream.write_all(REQUEST.as_bytes()).await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        };
        result.map_err(|source| {
            self.state = ChannelState::Failed;
            PeerError::Io {
                peer: self.peer.to_string(),
                source,
            }
        })
    }

    /// Read one reply of at most `max_bytes`.
    ///
    /// With [`ReplyFraming::SingleRead`] the first read is the reply, whole or
    /// not. With [`ReplyFraming::Sentinel`] reads continue until the `END`
    /// line, EOF, or the bound. EOF before any byte is [`PeerError::ClosedEarly`].
    pub async fn recv_reply(
        &mut self,
        max_bytes: usize,
        framing: ReplyFraming,
    ) -> Result<Vec<u8>, PeerError> {
        let result = self.read_reply(max_bytes, framing).await;
        if result.is_err() {
            self.state = ChannelState::Failed;
        }
        result
    }

    async fn read_reply(
        &mut self,
        max_bytes: usize,
        framing: ReplyFraming,
    ) -> Result<Vec<u8>, PeerError> {
        let peer = self.peer.to_string();
        let Some(stream) = self.stream.as_mut() else {
            return Err(PeerError::ClosedEarly { peer });
        };

        let mut buf = vec![0u8; max_bytes];
        let mut filled = 0;
        loop {
            let n = stream
                .read(&mut buf[filled..])
                .await
                .map_err(|source| PeerError::Io {
                    peer: peer.clone(),
                    source,
                })?;
            filled += n;

            let done = match framing {
                ReplyFraming::SingleRead => true,
                ReplyFraming::Sentinel => {
                    n == 0 || filled == max_bytes || has_terminator(&buf[..filled])
                }
            };
            if done {
                break;
            }
        }

        if filled == 0 {
            return Err(PeerError::ClosedEarly { peer });
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Record a decoded reply as committed or rejected.
    pub fn mark(&mut self, succeeded: bool) {
        self.state = if succeeded {
            ChannelState::Complete
        } else {
            ChannelState::Failed
        };
    }

    /// Close the socket. The channel takes no further part in the run.
    pub fn retire(&mut self) {
        self.stream = None;
        self.state = ChannelState::Dead;
    }
}

impl fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannel")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}
