//! Gossip socket plumbing: announcer and listener tasks.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::{GossipMessage, ServiceAnnouncement, ServiceDirectory, ServiceKind};

/// How often a node announces itself.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
/// Default UDP port for gossip traffic.
pub const DEFAULT_GOSSIP_PORT: u16 = 5504;
/// Default bind address for the gossip listener.
pub const DEFAULT_GOSSIP_BIND: &str = "127.0.0.1";

const MAX_DATAGRAM: usize = 65_536;

/// Bind the listening socket for incoming announcements.
///
/// # Errors
///
/// Bind failures are fatal to the gossip subsystem only; callers report
/// them and keep the hosting process running.
pub async fn bind_listener(bind: &str, port: u16) -> io::Result<Arc<UdpSocket>> {
    Ok(Arc::new(UdpSocket::bind((bind, port)).await?))
}

/// Bind an ephemeral socket used only for sending announcements.
pub async fn bind_sender(bind: &str) -> io::Result<Arc<UdpSocket>> {
    Ok(Arc::new(UdpSocket::bind((bind, 0)).await?))
}

/// Resolve the unicast fan-out list: every configured target, with the
/// gossip port appended when the entry carries none.
pub fn announce_targets<I, S>(gossip_port: u16, extra_targets: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut targets = vec![format!("127.0.0.1:{gossip_port}")];
    for target in extra_targets {
        let target = target.as_ref().trim();
        if target.is_empty() {
            continue;
        }
        if target.contains(':') {
            targets.push(target.to_string());
        } else {
            targets.push(format!("{target}:{gossip_port}"));
        }
    }
    targets.sort();
    targets.dedup();
    targets
}

/// Spawn the periodic announcer for this process.
///
/// `identity` is the announcement template; its heartbeat is refreshed on
/// every tick. Send failures are logged and retried on the next tick.
pub fn spawn_announcer(
    socket: Arc<UdpSocket>,
    kind: ServiceKind,
    identity: ServiceAnnouncement,
    targets: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(ANNOUNCE_INTERVAL);
        tracing::info!(kind = %kind, targets = targets.len(), "gossip announcer started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let mut announcement = identity.clone();
                    announcement.last_heartbeat = Utc::now();
                    let message = GossipMessage::new(kind, announcement);
                    let payload = match message.to_json() {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to serialize announcement");
                            continue;
                        }
                    };
                    for target in &targets {
                        if let Err(err) = socket.send_to(payload.as_bytes(), target.as_str()).await {
                            tracing::warn!(target = %target, error = %err, "gossip send failed");
                        }
                    }
                }
            }
        }
        tracing::info!(kind = %kind, "gossip announcer stopped");
    })
}

/// Spawn the receive loop feeding `directory`.
///
/// Unparseable datagrams are dropped without logging; transient socket
/// errors back off for a second before retrying.
pub fn spawn_listener(
    socket: Arc<UdpSocket>,
    directory: ServiceDirectory,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, addr)) => {
                        let Ok(text) = std::str::from_utf8(&buffer[..len]) else {
                            continue;
                        };
                        let Ok(message) = GossipMessage::from_json(text) else {
                            continue;
                        };
                        let (kind, announcement) = message.into_parts();
                        directory.absorb(kind, announcement, &addr.ip().to_string());
                    }
                    Err(err) => {
                        if err.kind() == io::ErrorKind::ConnectionReset {
                            continue;
                        }
                        tracing::error!(error = %err, "gossip receive failed");
                        time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_get_the_port_appended() {
        let targets = announce_targets(5504, ["10.0.0.8", "10.0.0.9:6000", ""]);
        assert_eq!(
            targets,
            vec![
                "10.0.0.8:5504".to_string(),
                "10.0.0.9:6000".to_string(),
                "127.0.0.1:5504".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn announcements_reach_a_listener() {
        let listener = bind_listener("127.0.0.1", 0).await.unwrap();
        let listen_port = listener.local_addr().unwrap().port();
        let sender = bind_sender("127.0.0.1").await.unwrap();

        let directory = ServiceDirectory::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_listener(Arc::clone(&listener), directory.clone(), shutdown_rx.clone());
        spawn_announcer(
            sender,
            ServiceKind::WebService,
            ServiceAnnouncement::new("svc-test", "", 8080),
            vec![format!("127.0.0.1:{listen_port}")],
            shutdown_rx,
        );

        let url = tokio::time::timeout(
            Duration::from_secs(5),
            directory.wait_for_url(ServiceKind::WebService),
        )
        .await
        .expect("no announcement arrived");
        assert_eq!(url, "http://127.0.0.1:8080/");

        let _ = shutdown_tx.send(true);
    }
}
