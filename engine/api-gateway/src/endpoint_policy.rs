//! Endpoint allow and deny lists
//!
//! Checked before any authentication runs, for HTTP routes and WebSocket
//! upgrades alike. An entry matches its own path and everything below it,
//! segment-wise: `/api/v1` matches `/api/v1/offers` but not `/api/v10`.

use crate::canonical::normalize_path_and_query;
use crate::config::ServerConfig;
use std::sync::Arc;
use tracing::warn;
use warp::path::FullPath;
use warp::{Filter, Rejection};

/// Request path refused by the endpoint lists
#[derive(Debug)]
pub struct EndpointForbidden {
    pub path: String,
}

impl warp::reject::Reject for EndpointForbidden {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointPolicy {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl EndpointPolicy {
    /// An empty whitelist allows every path the blacklist does not name
    pub fn new(whitelist: &[String], blacklist: &[String]) -> Self {
        Self { whitelist: normalize_all(whitelist), blacklist: normalize_all(blacklist) }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(&config.whitelist_endpoints, &config.blacklist_endpoints)
    }

    /// Blacklist entries win over whitelist entries
    pub fn is_allowed(&self, path: &str) -> bool {
        let path = normalize_path_and_query(path, None);
        if self.blacklist.iter().any(|entry| covers(entry, &path)) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.iter().any(|entry| covers(entry, &path))
    }
}

fn normalize_all(entries: &[String]) -> Vec<String> {
    entries.iter().map(|entry| normalize_path_and_query(entry.trim(), None)).collect()
}

fn covers(entry: &str, path: &str) -> bool {
    entry == "/"
        || path == entry
        || path.strip_prefix(entry).map_or(false, |rest| rest.starts_with('/'))
}

/// Warp filter rejecting paths outside the policy with [`EndpointForbidden`]
pub fn filter(policy: Arc<EndpointPolicy>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::path::full()
        .and_then(move |path: FullPath| {
            let policy = policy.clone();
            async move {
                if policy.is_allowed(path.as_str()) {
                    Ok(())
                } else {
                    warn!("Request to {} refused by endpoint policy", path.as_str());
                    Err(warp::reject::custom(EndpointForbidden { path: path.as_str().to_string() }))
                }
            }
        })
        .untuple_one()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_empty_policy_allows_everything() {
        let policy = EndpointPolicy::default();
        assert!(policy.is_allowed("/"));
        assert!(policy.is_allowed("/api/v1/offers"));
    }

    #[test]
    fn test_whitelist_is_segment_prefix() {
        let policy = EndpointPolicy::new(&entries(&["/api/v1/", "/health"]), &[]);
        assert!(policy.is_allowed("/api/v1"));
        assert!(policy.is_allowed("/api/v1/offers/"));
        assert!(policy.is_allowed("/health"));
        assert!(!policy.is_allowed("/api/v10"));
        assert!(!policy.is_allowed("/api"));
        assert!(!policy.is_allowed("/healthz"));
    }

    #[test]
    fn test_blacklist_wins() {
        let policy = EndpointPolicy::new(&entries(&["/api"]), &entries(&["/api/v1/access/echo"]));
        assert!(policy.is_allowed("/api/v1/access/session"));
        assert!(!policy.is_allowed("/api/v1/access/echo"));
        assert!(!policy.is_allowed("/api/v1/access/echo/"));
    }

    #[tokio::test]
    async fn test_filter_rejects_before_the_route() {
        let policy = Arc::new(EndpointPolicy::new(&[], &entries(&["/ws"])));
        let route = filter(policy).map(|| "ok");

        let allowed = warp::test::request().path("/api").filter(&route).await;
        assert_eq!(allowed.unwrap(), "ok");

        let refused = warp::test::request().path("/ws/trades").filter(&route).await.unwrap_err();
        assert_eq!(refused.find::<EndpointForbidden>().map(|f| f.path.as_str()), Some("/ws/trades"));
    }
}
