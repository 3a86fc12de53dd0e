//! Guest boot verification.
//!
//! Polls guest reachability with a bounded-time TCP connect probe. Exceeding
//! the bound is fatal and terminal: the VM stays defined and started, the
//! build is reported incomplete.

use crate::errors::{VmforgeError, VmforgeResult};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Port probed to decide the guest is up.
pub const GUEST_SSH_PORT: u16 = 22;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Wait until a TCP connect to the guest succeeds, up to `timeout`.
pub async fn wait_for_guest(
    address: Ipv4Addr,
    port: u16,
    timeout: Duration,
) -> VmforgeResult<()> {
    let deadline = Instant::now() + timeout;
    tracing::info!(%address, port, "Waiting for guest to boot");

    loop {
        let attempt = tokio::time::timeout(
            PROBE_TIMEOUT,
            TcpStream::connect((IpAddr::V4(address), port)),
        )
        .await;
        if let Ok(Ok(_stream)) = attempt {
            tracing::info!(%address, "Guest is reachable");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(VmforgeError::Hypervisor(format!(
                "guest {address} did not come up within {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reachable_guest_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        wait_for_guest(Ipv4Addr::LOCALHOST, port, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_guest_times_out() {
        // Bind then drop so the port is closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = wait_for_guest(Ipv4Addr::LOCALHOST, port, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, VmforgeError::Hypervisor(_)));
    }
}
