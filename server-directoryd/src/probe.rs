//! Network round-trips against a single game server.
//!
//! The exchange is one JSON datagram each way on the server's query port.
//! Ping is the time between sending the request and receiving the reply.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use shared::protocol::{BookingResponse, ProbeRequest, ProbeResponse, MAX_DATAGRAM};
use shared::types::{ProbeReport, UpdateMode};
use crate::error::ProbeError;

/// One network round-trip producing a state delta.
pub trait StateProbe: Send + Sync {
    fn probe(&self, address: SocketAddr, mode: UpdateMode) -> BoxFuture<'_, Result<ProbeReport, ProbeError>>;
}

/// Slot reservations ahead of session start.
pub trait Booker: Send + Sync {
    /// Reserve a slot. Returns how long the reservation is held.
    fn book<'a>(
        &'a self,
        address: SocketAddr,
        car: &'a str,
        skin: Option<&'a str>,
        driver: &'a str,
    ) -> BoxFuture<'a, Result<Duration, ProbeError>>;

    fn unbook<'a>(&'a self, address: SocketAddr, driver: &'a str) -> BoxFuture<'a, Result<(), ProbeError>>;
}

/// JSON-over-UDP probe.
#[derive(Debug, Clone)]
pub struct UdpProbe {
    /// Bounds booking requests. Sweep probes are bounded by the engine.
    timeout: Duration,
}

impl UdpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(address: SocketAddr, request: &ProbeRequest) -> Result<(Vec<u8>, Duration), ProbeError> {
        let bind: SocketAddr = match address.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        socket
            .connect(address)
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        let payload = serde_json::to_vec(request).map_err(|e| ProbeError::Protocol(e.to_string()))?;
        let started = Instant::now();
        socket
            .send(&payload)
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = socket
            .recv(&mut buf)
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        buf.truncate(len);
        Ok((buf, started.elapsed()))
    }

    async fn book_with_timeout(&self, address: SocketAddr, request: ProbeRequest) -> Result<BookingResponse, ProbeError> {
        let (bytes, _) = tokio::time::timeout(self.timeout, Self::exchange(address, &request))
            .await
            .map_err(|_| ProbeError::Timeout)??;
        serde_json::from_slice(&bytes).map_err(|e| ProbeError::Protocol(e.to_string()))
    }
}

/// Validate a reply and turn it into a report.
pub fn to_report(response: ProbeResponse, mode: UpdateMode, rtt: Duration) -> Result<ProbeReport, ProbeError> {
    if response.name.trim().is_empty() {
        return Err(ProbeError::Protocol("missing server name".to_string()));
    }
    if response.capacity == 0 {
        return Err(ProbeError::Protocol("missing capacity".to_string()));
    }
    if response.clients > response.capacity {
        return Err(ProbeError::Protocol(format!(
            "{} clients on a {} slot server",
            response.clients, response.capacity
        )));
    }

    let drivers = match mode {
        UpdateMode::Full => Some(response.drivers.unwrap_or_default()),
        UpdateMode::Normal => None,
    };

    Ok(ProbeReport {
        name: response.name,
        capacity: response.capacity,
        current_drivers: response.clients,
        cars: response.cars,
        drivers,
        session: response.session,
        track_id: response.track,
        has_password: response.password,
        ping_ms: rtt.as_millis().min(u32::MAX as u128) as u32,
    })
}

impl StateProbe for UdpProbe {
    fn probe(&self, address: SocketAddr, mode: UpdateMode) -> BoxFuture<'_, Result<ProbeReport, ProbeError>> {
        Box::pin(async move {
            let request = match mode {
                UpdateMode::Normal => ProbeRequest::Ping,
                UpdateMode::Full => ProbeRequest::Query,
            };
            let (bytes, rtt) = Self::exchange(address, &request).await?;
            let response: ProbeResponse =
                serde_json::from_slice(&bytes).map_err(|e| ProbeError::Protocol(e.to_string()))?;
            to_report(response, mode, rtt)
        })
    }
}

impl Booker for UdpProbe {
    fn book<'a>(
        &'a self,
        address: SocketAddr,
        car: &'a str,
        skin: Option<&'a str>,
        driver: &'a str,
    ) -> BoxFuture<'a, Result<Duration, ProbeError>> {
        Box::pin(async move {
            let request = ProbeRequest::Book {
                car: car.to_string(),
                skin: skin.map(str::to_string),
                driver: driver.to_string(),
            };
            let response = self.book_with_timeout(address, request).await?;
            if !response.ok {
                return Err(ProbeError::Protocol(
                    response.message.unwrap_or_else(|| "booking refused".to_string()),
                ));
            }
            Ok(Duration::from_secs(response.time_left_secs))
        })
    }

    fn unbook<'a>(&'a self, address: SocketAddr, driver: &'a str) -> BoxFuture<'a, Result<(), ProbeError>> {
        Box::pin(async move {
            let request = ProbeRequest::Unbook { driver: driver.to_string() };
            let response = self.book_with_timeout(address, request).await?;
            if !response.ok {
                tracing::warn!("Server {} refused to cancel booking: {:?}", address, response.message);
            }
            Ok(())
        })
    }
}
