//! C10: the origin cluster's view of the swarm.
//!
//! Two unrelated responsibilities share this module because spec §2 groups
//! them under the same component: [`OriginClient`] is the narrow HTTP
//! interface C2 (the archive) uses to resolve a name to metainfo or, for a
//! blob's very first copy into the cluster, its bytes; [`Rendezvous`] is the
//! weighted HRW hashing an origin peer's own scheduler uses to find which
//! other origin owns a digest, with no consensus protocol required.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode, Url};
use sha2::{Digest, Sha256};

use crate::error::tracker::{OriginError, OriginResult};
use crate::metainfo::Metainfo;

/// The archive's view of the origin/backend cluster. A trait (rather than a
/// concrete HTTP type used everywhere) so tests substitute an in-memory
/// fake instead of making real HTTP calls, the same narrow-interface
/// approach the tracker client (`crate::tracker::Tracker`) takes.
///
/// Methods return boxed futures instead of being declared `async fn`
/// directly so the trait stays object-safe: [`crate::archive::Archive`]
/// holds this behind an `Arc<dyn OriginClient>`.
pub trait OriginClient: Send + Sync {
    fn get_metainfo<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, OriginResult<Metainfo>>;
    fn download<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, OriginResult<Bytes>>;
}

/// The production origin client: speaks the JSON HTTP API of spec §6
/// (`GET /namespace/<ns>/blobs/<digest>/metainfo` and
/// `GET /namespace/<ns>/blobs/<digest>`), same `{client, base_url}` shape
/// as `crate::tracker::Tracker`.
pub struct HttpOriginClient {
    client: Client,
    base_url: Url,
}

impl HttpOriginClient {
    pub fn new(base_url: Url) -> Self {
        Self { client: Client::new(), base_url }
    }

    fn metainfo_url(&self, namespace: &str, name: &str) -> Url {
        self.base_url
            .join(&format!("namespace/{namespace}/blobs/{name}/metainfo"))
            .expect("namespace and name must be valid URL path segments")
    }

    fn blob_url(&self, namespace: &str, name: &str) -> Url {
        self.base_url
            .join(&format!("namespace/{namespace}/blobs/{name}"))
            .expect("namespace and name must be valid URL path segments")
    }
}

impl OriginClient for HttpOriginClient {
    fn get_metainfo<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, OriginResult<Metainfo>> {
        Box::pin(async move {
            let resp = self.client.get(self.metainfo_url(namespace, name)).send().await?;
            match resp.status() {
                StatusCode::NOT_FOUND => Err(OriginError::NotFound),
                // the origin is still computing metainfo for a freshly
                // landed blob; the archive's caller retries with backoff.
                StatusCode::ACCEPTED => Err(OriginError::MetaInfoPending),
                _ => {
                    let bytes = resp.error_for_status()?.bytes().await?;
                    Metainfo::from_bytes(&bytes).map_err(|e| OriginError::Invalid(e.to_string()))
                }
            }
        })
    }

    fn download<'a>(&'a self, namespace: &'a str, name: &'a str) -> BoxFuture<'a, OriginResult<Bytes>> {
        Box::pin(async move {
            let resp = self.client.get(self.blob_url(namespace, name)).send().await?;
            match resp.status() {
                StatusCode::NOT_FOUND => Err(OriginError::NotFound),
                _ => Ok(resp.error_for_status()?.bytes().await?),
            }
        })
    }
}

/// A cluster member eligible to own blobs: a stable address label and an
/// integer weight (heavier members get a proportionally larger share of
/// digests under HRW hashing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginMember {
    pub addr: SocketAddr,
    pub weight: u32,
}

/// Static rendezvous (highest-random-weight) hashing over a fixed origin
/// membership map. Deterministic and coordination-free: every origin in the
/// cluster computes the same ranking for the same digest independently
/// (spec §9's "the static config map is the only shared state").
#[derive(Debug, Clone)]
pub struct Rendezvous {
    members: Vec<OriginMember>,
}

impl Rendezvous {
    pub fn new(members: Vec<OriginMember>) -> Self {
        Self { members }
    }

    /// Every member ranked by HRW score for `digest`, highest first. The
    /// first entry is the authoritative owner; the rest are a deterministic
    /// fallback order usable if the primary is unreachable.
    pub fn owners(&self, digest: &str) -> Vec<SocketAddr> {
        let mut scored: Vec<(f64, SocketAddr)> =
            self.members.iter().map(|m| (hrw_score(m, digest), m.addr)).collect();
        // ties broken by the hex/string peer label, per spec §9.
        scored.sort_by(|(score_a, addr_a), (score_b, addr_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| addr_a.to_string().cmp(&addr_b.to_string()))
        });
        scored.into_iter().map(|(_, addr)| addr).collect()
    }

    /// The single authoritative owner of `digest`, or `None` if the
    /// membership table is empty.
    pub fn owner(&self, digest: &str) -> Option<SocketAddr> {
        self.owners(digest).into_iter().next()
    }
}

/// Weighted HRW score: `weight * (-1 / ln(u))`, `u` a uniform value in
/// `(0, 1)` derived by hashing `(addr, digest)`. Adding or removing a member
/// only reshuffles the digests that would have hashed to it, not the whole
/// keyspace — the property that makes HRW preferable to a naive `hash(digest)
/// % n` assignment for a cluster whose membership changes over time.
fn hrw_score(member: &OriginMember, digest: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(member.addr.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(digest.as_bytes());
    let hash = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash[..8]);
    let raw = u64::from_be_bytes(buf);
    // map to (0, 1) excluding the endpoints so ln() never degenerates.
    let u = (raw as f64 + 1.0) / (u64::MAX as f64 + 2.0);
    member.weight as f64 * (-1.0 / u.ln())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(label: &str, weight: u32) -> OriginMember {
        OriginMember { addr: format!("10.0.0.{label}:6881").parse().unwrap(), weight }
    }

    #[test]
    fn owner_is_deterministic_across_calls() {
        let hrw = Rendezvous::new(vec![member("1", 1), member("2", 1), member("3", 1)]);
        let a = hrw.owner("abc123");
        let b = hrw.owner("abc123");
        assert_eq!(a, b);
    }

    #[test]
    fn single_member_always_owns() {
        let hrw = Rendezvous::new(vec![member("1", 1)]);
        assert_eq!(hrw.owner("anything"), Some(member("1", 1).addr));
    }

    #[test]
    fn different_digests_spread_across_members() {
        let hrw = Rendezvous::new(vec![member("1", 1), member("2", 1), member("3", 1), member("4", 1)]);
        let owners: std::collections::HashSet<_> =
            (0..50).map(|i| hrw.owner(&format!("digest-{i}")).unwrap()).collect();
        assert!(owners.len() > 1, "50 distinct digests over 4 equal-weight members should not all land on one");
    }

    #[test]
    fn owners_is_a_total_ranking_of_every_member() {
        let hrw = Rendezvous::new(vec![member("1", 1), member("2", 3), member("3", 1)]);
        let ranking = hrw.owners("digest");
        assert_eq!(ranking.len(), 3);
        let unique: std::collections::HashSet<_> = ranking.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn empty_membership_has_no_owner() {
        let hrw = Rendezvous::new(vec![]);
        assert_eq!(hrw.owner("x"), None);
    }
}
