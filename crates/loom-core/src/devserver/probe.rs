//! Active readiness probing for servers that never print their URL.

use std::time::Duration;

use tokio::task::JoinSet;
use tracing::debug;

/// Ordered candidate list: `hint` first, then `common` in order, without
/// duplicates and without anything in `excluded`.
pub fn candidate_ports(hint: Option<u16>, common: &[u16], excluded: &[u16]) -> Vec<u16> {
    let mut ports: Vec<u16> = Vec::with_capacity(common.len() + 1);
    for port in hint.into_iter().chain(common.iter().copied()) {
        if port != 0 && !excluded.contains(&port) && !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

/// Port of an `http://host:port/...` URL.
pub fn port_of_url(url: &str) -> Option<u16> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}

fn probe_url(port: u16) -> String {
    format!("http://localhost:{port}/")
}

fn build_client(per_port: Duration) -> Option<reqwest::Client> {
    match reqwest::Client::builder()
        .timeout(per_port)
        .connect_timeout(per_port)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
    {
        Ok(client) => Some(client),
        Err(e) => {
            debug!(error = %e, "failed to build probe client");
            None
        }
    }
}

/// `true` if anything answers HTTP on `port`, whatever the status.
async fn answers(client: &reqwest::Client, port: u16) -> bool {
    match client.get(probe_url(port)).send().await {
        Ok(response) => {
            debug!(port, status = %response.status(), "probe answered");
            true
        }
        Err(_) => false,
    }
}

/// Find a listening HTTP server among `ports`.
///
/// The first port is tried on its own (it is the one the output hinted at);
/// the rest are probed concurrently and the first to answer wins. Returns the
/// URL of the winner.
pub async fn probe_ports(ports: &[u16], per_port: Duration) -> Option<String> {
    let (first, rest) = ports.split_first()?;
    let client = build_client(per_port)?;

    if answers(&client, *first).await {
        return Some(probe_url(*first));
    }

    let mut probes = JoinSet::new();
    for &port in rest {
        let client = client.clone();
        probes.spawn(async move { answers(&client, port).await.then_some(port) });
    }

    while let Some(joined) = probes.join_next().await {
        if let Ok(Some(port)) = joined {
            // Dropping the set aborts the losers.
            return Some(probe_url(port));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Answers every connection with a 500; an error status still counts.
    async fn serve_errors() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });
        port
    }

    #[test]
    fn hint_goes_first_and_exclusions_are_dropped() {
        let ports = candidate_ports(Some(3000), &[5173, 3000, 8080, 4321], &[8080]);
        assert_eq!(ports, vec![3000, 5173, 4321]);

        let ports = candidate_ports(Some(8080), &[5173], &[8080]);
        assert_eq!(ports, vec![5173]);
    }

    #[test]
    fn url_ports_are_extracted() {
        assert_eq!(port_of_url("http://localhost:5173/"), Some(5173));
        assert_eq!(port_of_url("http://localhost:3000"), Some(3000));
        assert_eq!(port_of_url("http://localhost/app"), None);
        assert_eq!(port_of_url("not a url"), None);
    }

    #[tokio::test]
    async fn finds_listener_behind_dead_ports() {
        let dead = unused_port().await;
        let live = serve_errors().await;

        let url = probe_ports(&[dead, live], Duration::from_millis(500)).await;
        assert_eq!(url, Some(format!("http://localhost:{live}/")));
    }

    #[tokio::test]
    async fn hinted_port_is_accepted_directly() {
        let live = serve_errors().await;
        let url = probe_ports(&[live], Duration::from_millis(500)).await;
        assert_eq!(url, Some(format!("http://localhost:{live}/")));
    }

    #[tokio::test]
    async fn nothing_listening_yields_none() {
        let a = unused_port().await;
        let b = unused_port().await;
        assert_eq!(probe_ports(&[a, b], Duration::from_millis(200)).await, None);
        assert_eq!(probe_ports(&[], Duration::from_millis(200)).await, None);
    }
}
