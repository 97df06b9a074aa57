//! Drives a single bandwidth/latency measurement against a discovered relay,
//! ported from `pkg/speedtest/{speedtest,measure}.go`.
//!
//! Two sessions are opened against the same endpoint: one sends a stream of
//! timestamped, fixed-size packets addressed to the other's public key for
//! the full measurement window, while the other drains them and accumulates
//! a running total. Both loops observe a shared deadline instead of each
//! racing its own timer, which is the one place this port intentionally
//! diverges from the two independent `time.After` calls in the Go source —
//! a single `tokio::time::Instant` shared between the two tasks cannot drift
//! apart the way two wall-clock timers started a few instructions apart can.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crypto_box::PublicKey;
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::registry::{Endpoint, ProbeOutcome};
use crate::relay::{DynStream, FirstMessage, RelaySession};
use crate::unit::Unit;

const PACKET_SIZE: usize = 64 * 1024;

/// Opens a fresh transport to a relay endpoint. Production code connects a
/// real TCP socket; tests substitute an in-memory duplex pair wired to a
/// fake relay, without the Prober itself needing to know the difference.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<RelaySession<DynStream>>> + Send + 'a>>;
}

pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<RelaySession<DynStream>>> + Send + 'a>> {
        Box::pin(async move {
            let sock_addr: SocketAddr = tokio::net::lookup_host(addr)
                .await?
                .next()
                .ok_or_else(|| anyhow::anyhow!("{addr} resolved to no address"))?;
            let stream = TcpStream::connect(sock_addr).await?;
            let boxed: DynStream = Box::pin(stream);
            RelaySession::handshake(boxed).await
        })
    }
}

pub struct Prober {
    connector: Arc<dyn Connector>,
}

impl Prober {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn with_tcp() -> Self {
        Self::new(Arc::new(TcpConnector))
    }

    /// Opens two sessions against `endpoint`, registers one as preferred so
    /// it can be addressed by the other, then measures throughput and
    /// latency for `duration`. Every suspension point races `cancel` so a
    /// fired root cancellation aborts the probe at the next I/O boundary
    /// instead of running to completion.
    pub async fn probe(
        &self,
        endpoint: &Endpoint,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, ProbeError> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);

        let mut c1 = cancellable(cancel, self.connector.connect(&addr))
            .await?
            .map_err(ProbeError::Handshake)?;
        let mut c2 = cancellable(cancel, self.connector.connect(&addr))
            .await?
            .map_err(ProbeError::Handshake)?;

        cancellable(cancel, c2.note_preferred(true))
            .await?
            .map_err(|err| ProbeError::Io(err.into()))?;

        match cancellable(cancel, c2.recv_first())
            .await?
            .map_err(ProbeError::Handshake)?
        {
            FirstMessage::ServerInfo => {}
            FirstMessage::Other(_) => return Err(ProbeError::UnexpectedMessage),
        }
        match cancellable(cancel, c1.recv_first())
            .await?
            .map_err(ProbeError::Handshake)?
        {
            FirstMessage::ServerInfo => {}
            FirstMessage::Other(_) => return Err(ProbeError::UnexpectedMessage),
        }

        let c2_dst = c2.public_key();
        measure(c1, c2, c2_dst, duration, cancel).await
    }
}

/// Races `fut` against `cancel`, turning a fired cancellation into
/// [`ProbeError::Cancelled`] instead of waiting for `fut` to finish.
async fn cancellable<F: std::future::Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, ProbeError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        output = fut => Ok(output),
    }
}

async fn measure(
    mut sender: RelaySession<DynStream>,
    mut receiver: RelaySession<DynStream>,
    dst: PublicKey,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome, ProbeError> {
    let deadline = Instant::now() + duration;

    let send_cancel = cancel.clone();
    let send_task = tokio::spawn(async move {
        let mut buf = vec![0u8; PACKET_SIZE];
        rand::thread_rng().fill_bytes(&mut buf);
        while Instant::now() < deadline {
            let now_nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            buf[..8].copy_from_slice(&now_nanos.to_le_bytes());
            tokio::select! {
                _ = send_cancel.cancelled() => return Err(ProbeError::Cancelled),
                result = sender.send_packet(&dst, &buf) => {
                    if let Err(err) = result {
                        return Err(ProbeError::Io(err.into()));
                    }
                }
            }
        }
        Ok(())
    });

    let start = Instant::now();
    let mut packet_count: u64 = 0;
    let mut total_latency = Duration::ZERO;
    let mut cancelled = false;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            result = tokio::time::timeout(remaining, receiver.recv_packet()) => {
                match result {
                    Ok(Ok((_src, body))) => {
                        if body.len() >= 8 {
                            let sent_nanos = u64::from_le_bytes(body[..8].try_into().unwrap());
                            let sent_at = UNIX_EPOCH + Duration::from_nanos(sent_nanos);
                            if let Ok(latency) = SystemTime::now().duration_since(sent_at) {
                                total_latency += latency;
                            }
                        }
                        packet_count += 1;
                    }
                    Ok(Err(err)) => return Err(ProbeError::Io(err.into())),
                    Err(_elapsed) => break,
                }
            }
        }
    }
    let elapsed = start.elapsed();

    match send_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err),
        Err(join_err) => return Err(ProbeError::Io(join_err.into())),
    }

    if cancelled {
        return Err(ProbeError::Cancelled);
    }

    finish(packet_count, total_latency, elapsed, PACKET_SIZE)
}

/// The pure arithmetic half of [`measure`]: turns accumulated packet
/// counts/latency/elapsed time into a [`ProbeOutcome`], or
/// [`ProbeError::NoPackets`] if nothing arrived before the deadline.
/// Split out so the formula itself (`bps = packetCount*packetSize*8 /
/// elapsed`; `latency = totalLatency/packetCount/2`) can be exercised
/// without a live (or faked) relay session.
fn finish(
    packet_count: u64,
    total_latency: Duration,
    elapsed: Duration,
    packet_size: usize,
) -> Result<ProbeOutcome, ProbeError> {
    if packet_count == 0 {
        return Err(ProbeError::NoPackets);
    }

    let bps = (packet_count * packet_size as u64) as f64 * 8.0 / elapsed.as_secs_f64();
    let latency = total_latency / packet_count as u32 / 2;

    Ok(ProbeOutcome {
        latency,
        bandwidth: Unit::new(bps, "bps"),
    })
}
