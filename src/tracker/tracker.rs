use reqwest::{Client, StatusCode, Url};

use crate::error::tracker::{Result, TrackerError};

use super::announce::AnnounceParams;
use super::response::TrackerResponse;

/// The HTTP tracker client for a single tracker endpoint.
///
/// Speaks this protocol's JSON announce (spec §6) over a plain
/// `{client, url}` pair.
pub struct Tracker {
    client: Client,
    url: Url,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Tracker { client: Client::new(), url }
    }

    /// Sends a single announce request and returns the tracker's peer list
    /// and recommended next-announce interval.
    ///
    /// A 404 means the tracker doesn't know this torrent; per spec that's
    /// reported as [`TrackerError::NotFound`] and must not be retried by the
    /// caller.
    pub async fn announce(&self, params: AnnounceParams) -> Result<TrackerResponse> {
        let query = [
            ("info_hash", hex::encode(params.info_hash.as_bytes())),
            ("peer_id", hex::encode(params.peer_id)),
            ("ip", params.ip.to_string()),
            ("port", params.port.to_string()),
            ("complete", if params.complete { "1".to_string() } else { "0".to_string() }),
        ];

        let resp = self.client.get(self.url.clone()).query(&query).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(TrackerError::NotFound);
        }

        let resp = resp.error_for_status()?;
        let body = resp.json::<TrackerResponse>().await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::InfoHash;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash::from([7u8; 20]),
            peer_id: [9u8; 20],
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 6881,
            complete: false,
        }
    }

    #[tokio::test]
    async fn announce_returns_peers_on_success() {
        let mut server = mockito::Server::new_async().await;
        let info_hash_hex = hex::encode([7u8; 20]);
        let peer_id_hex = hex::encode([9u8; 20]);

        let body = serde_json::json!({
            "interval": 120,
            "peers": [
                { "peer_id": hex::encode([1u8; 20]), "ip": "10.0.0.2", "port": 6882 },
            ],
        });

        let mock = server
            .mock("GET", "/announce")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("info_hash".into(), info_hash_hex),
                mockito::Matcher::UrlEncoded("peer_id".into(), peer_id_hex),
                mockito::Matcher::UrlEncoded("complete".into(), "0".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let url = format!("{}/announce", server.url());
        let tracker = Tracker::new(url.parse().unwrap());
        let resp = tracker.announce(params()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(resp.interval, std::time::Duration::from_secs(120));
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].port, 6882);
    }

    #[tokio::test]
    async fn not_found_is_reported_distinctly() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/announce").match_query(mockito::Matcher::Any).with_status(404).create_async().await;

        let url = format!("{}/announce", server.url());
        let tracker = Tracker::new(url.parse().unwrap());
        let err = tracker.announce(params()).await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, TrackerError::NotFound));
    }
}
