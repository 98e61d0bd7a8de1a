//! Feed-group table: each upstream feed covers a fixed set of routes.

use std::time::Duration;

/// Descriptor for one upstream realtime feed.
#[derive(Debug, Clone)]
pub struct FeedDescriptor {
    pub feed_id: String,
    pub url: String,
    pub timeout: Duration,
}

/// (feed_id, url suffix, routes served).
const FEED_GROUPS: &[(&str, &str, &[&str])] = &[
    ("1234567", "", &["1", "2", "3", "4", "5", "6", "7", "GS"]),
    ("ace", "-ace", &["A", "C", "E"]),
    ("bdfm", "-bdfm", &["B", "D", "F", "M"]),
    ("g", "-g", &["G"]),
    ("jz", "-jz", &["J", "Z"]),
    ("nqrw", "-nqrw", &["N", "Q", "R", "W"]),
    ("l", "-l", &["L"]),
    ("si", "-si", &["SI"]),
];

/// Build descriptors for every feed group against a base URL.
pub fn feed_descriptors(base_url: &str, timeout: Duration) -> Vec<FeedDescriptor> {
    FEED_GROUPS
        .iter()
        .map(|(feed_id, suffix, _)| FeedDescriptor {
            feed_id: feed_id.to_string(),
            url: format!("{}{}", base_url, suffix),
            timeout,
        })
        .collect()
}

/// The feed id that carries a given route.
pub fn feed_for_route(route_id: &str) -> Option<&'static str> {
    FEED_GROUPS
        .iter()
        .find(|(_, _, routes)| routes.contains(&route_id))
        .map(|(feed_id, _, _)| *feed_id)
}

/// The routes carried by a given feed id.
pub fn routes_for_feed(feed_id: &str) -> &'static [&'static str] {
    FEED_GROUPS
        .iter()
        .find(|(id, _, _)| *id == feed_id)
        .map(|(_, _, routes)| *routes)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_maps_to_one_feed() {
        assert_eq!(feed_for_route("6"), Some("1234567"));
        assert_eq!(feed_for_route("A"), Some("ace"));
        assert_eq!(feed_for_route("L"), Some("l"));
        assert_eq!(feed_for_route("X99"), None);
    }

    #[test]
    fn descriptors_cover_all_groups() {
        let descs = feed_descriptors("http://example/gtfs", Duration::from_secs(10));
        assert_eq!(descs.len(), 8);
        assert!(descs.iter().any(|d| d.url == "http://example/gtfs"));
        assert!(descs.iter().any(|d| d.url == "http://example/gtfs-ace"));
    }

    #[test]
    fn feed_routes_roundtrip() {
        for (feed_id, _, routes) in FEED_GROUPS {
            for route in *routes {
                assert_eq!(feed_for_route(route), Some(*feed_id));
            }
            assert_eq!(routes_for_feed(feed_id), *routes);
        }
    }
}
