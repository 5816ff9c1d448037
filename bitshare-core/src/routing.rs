//! Routes to peers and best-route selection.

use std::fmt;

use serde::Serialize;

use crate::protocol::RouteAdvert;

/// A path to `destination_id` through `next_hop`. Direct routes have `hop_count == 1`
/// and `next_hop == destination_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub destination_id: String,
    pub next_hop: String,
    pub hop_count: u32,
    pub quality: u8,
}

impl Route {
    pub fn direct(peer_id: &str, quality: u8) -> Self {
        Self {
            destination_id: peer_id.to_string(),
            next_hop: peer_id.to_string(),
            hop_count: 1,
            quality: quality.min(100),
        }
    }
}

/// A direct hop wins outright; otherwise the highest quality, first one on ties.
pub fn find_best_route(routes: &[Route]) -> Option<&Route> {
    if let Some(direct) = routes.iter().find(|r| r.hop_count == 1) {
        return Some(direct);
    }
    routes.iter().fold(None, |best: Option<&Route>, r| match best {
        Some(b) if r.quality <= b.quality => Some(b),
        _ => Some(r),
    })
}

/// Coarse label for a link's signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    pub fn from_signal(signal: u8) -> Self {
        match signal {
            0 => ConnectionQuality::Offline,
            1..=39 => ConnectionQuality::Poor,
            40..=59 => ConnectionQuality::Fair,
            60..=79 => ConnectionQuality::Good,
            _ => ConnectionQuality::Excellent,
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionQuality::Offline => "offline",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Excellent => "excellent",
        };
        f.write_str(s)
    }
}

/// Turn a neighbor's advertisement into routes through that neighbor.
/// Entries for ourselves or for the neighbor itself are skipped.
pub fn learn_routes(
    self_id: &str,
    neighbor: &str,
    neighbor_quality: u8,
    adverts: &[RouteAdvert],
) -> Vec<Route> {
    adverts
        .iter()
        .filter(|a| a.destination != self_id && a.destination != neighbor)
        .map(|a| Route {
            destination_id: a.destination.clone(),
            next_hop: neighbor.to_string(),
            hop_count: a.hop_count.saturating_add(1),
            quality: a.quality.min(neighbor_quality).min(100),
        })
        .collect()
}

/// Replace the route through the same next hop, or add it.
pub fn upsert_route(routes: &mut Vec<Route>, route: Route) {
    match routes.iter_mut().find(|r| r.next_hop == route.next_hop) {
        Some(existing) => *existing = route,
        None => routes.push(route),
    }
}

/// Drop every route through `next_hop`. Returns how many were removed.
pub fn drop_routes_via(routes: &mut Vec<Route>, next_hop: &str) -> usize {
    let before = routes.len();
    routes.retain(|r| r.next_hop != next_hop);
    before - routes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(hop: u32, q: u8, via: &str) -> Route {
        Route {
            destination_id: "d".into(),
            next_hop: via.into(),
            hop_count: hop,
            quality: q,
        }
    }

    #[test]
    fn direct_hop_beats_quality() {
        let routes = vec![route(3, 90, "a"), route(1, 40, "b"), route(2, 95, "c")];
        let best = find_best_route(&routes).unwrap();
        assert_eq!(best.hop_count, 1);
        assert_eq!(best.quality, 40);
    }

    #[test]
    fn highest_quality_first_on_ties() {
        let routes = vec![route(3, 70, "a"), route(2, 90, "b"), route(4, 90, "c")];
        assert_eq!(find_best_route(&routes).unwrap().next_hop, "b");
        assert!(find_best_route(&[]).is_none());
    }

    #[test]
    fn learned_routes_add_a_hop_and_cap_quality() {
        let adverts = vec![
            RouteAdvert {
                destination: "far".into(),
                hop_count: 1,
                quality: 90,
            },
            RouteAdvert {
                destination: "me".into(),
                hop_count: 1,
                quality: 90,
            },
            RouteAdvert {
                destination: "nb".into(),
                hop_count: 1,
                quality: 90,
            },
        ];
        let learned = learn_routes("me", "nb", 60, &adverts);
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].destination_id, "far");
        assert_eq!(learned[0].next_hop, "nb");
        assert_eq!(learned[0].hop_count, 2);
        assert_eq!(learned[0].quality, 60);
    }

    #[test]
    fn upsert_and_drop() {
        let mut routes = vec![Route::direct("d", 80)];
        upsert_route(&mut routes, route(2, 50, "x"));
        upsert_route(&mut routes, route(3, 20, "x"));
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[1].hop_count, 3);
        assert_eq!(drop_routes_via(&mut routes, "x"), 1);
        assert_eq!(routes, vec![Route::direct("d", 80)]);
    }

    #[test]
    fn quality_labels() {
        assert_eq!(ConnectionQuality::from_signal(0), ConnectionQuality::Offline);
        assert_eq!(ConnectionQuality::from_signal(100), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::from_signal(45).to_string(), "fair");
    }
}
