//! Static route and station catalog, loaded once at startup from a GTFS
//! schedule bundle (zip archive or unpacked directory).
//!
//! The catalog is read-only after load; child platforms are collapsed into
//! their parent station so analytics never see a platform-level stop.

mod bundle;
mod error;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use headway_core::{Route, Station};

pub use bundle::Bundle;
pub use error::CatalogError;

/// Geographic bounding box for station queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    routes: HashMap<String, Route>,
    /// Parent (analytics-unit) stations only.
    stations: HashMap<String, Station>,
    /// Child stop id → parent stop id.
    child_to_parent: HashMap<String, String>,
    /// Scheduled arrival second-of-day per (trip_id, stop_id), when the
    /// bundle shipped stop_times.txt. Used to derive delay when the feed
    /// omits it.
    #[serde(skip)]
    scheduled_arrivals: HashMap<(String, String), u32>,
    /// Rows dropped during load (bad floats, missing ids).
    pub skipped: u32,
}

impl Catalog {
    /// Load the catalog from a zip bundle or an unpacked directory.
    ///
    /// Fatal ([`CatalogError::Missing`]) only when neither `stops.txt` nor
    /// `routes.txt` can be found; an invalid row is skipped and counted.
    pub fn load(path: &Path) -> Result<Catalog, CatalogError> {
        let mut bundle = Bundle::open(path)?;
        let stops_txt = bundle.read("stops.txt")?;
        let routes_txt = bundle.read("routes.txt")?;
        if stops_txt.is_none() && routes_txt.is_none() {
            return Err(CatalogError::Missing(path.display().to_string()));
        }

        let mut catalog = Catalog::default();

        if let Some(data) = routes_txt {
            catalog.load_routes(&data);
        }
        if let Some(data) = stops_txt {
            catalog.load_stops(&data);
        }

        // trips.txt + stop_times.txt are optional at runtime; when present
        // they give us routes_served per station and scheduled arrivals.
        if let (Some(trips), Some(stop_times)) =
            (bundle.read("trips.txt")?, bundle.read("stop_times.txt")?)
        {
            catalog.load_schedule(&trips, &stop_times);
        }

        info!(
            "Catalog loaded: {} routes, {} stations, {} child stops, {} rows skipped",
            catalog.routes.len(),
            catalog.stations.len(),
            catalog.child_to_parent.len(),
            catalog.skipped
        );
        Ok(catalog)
    }

    fn load_routes(&mut self, data: &str) {
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(e) => {
                warn!("routes.txt has no parsable header: {}", e);
                return;
            }
        };
        let col = |name: &str| headers.iter().position(|h| h == name);
        let (id_col, short_col, long_col, color_col) = (
            col("route_id"),
            col("route_short_name"),
            col("route_long_name"),
            col("route_color"),
        );

        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(_) => {
                    self.skipped += 1;
                    continue;
                }
            };
            let field = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or("").trim();

            let route_id = field(id_col);
            if route_id.is_empty() {
                self.skipped += 1;
                continue;
            }
            let short = field(short_col);
            let long = field(long_col);
            let display_name = if !short.is_empty() { short } else { long };

            self.routes.insert(
                route_id.to_string(),
                Route {
                    route_id: route_id.to_string(),
                    display_name: display_name.to_string(),
                    color: field(color_col).to_string(),
                },
            );
        }
    }

    fn load_stops(&mut self, data: &str) {
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(e) => {
                warn!("stops.txt has no parsable header: {}", e);
                return;
            }
        };
        let col = |name: &str| headers.iter().position(|h| h == name);
        let (id_col, name_col, lat_col, lon_col, parent_col) = (
            col("stop_id"),
            col("stop_name"),
            col("stop_lat"),
            col("stop_lon"),
            col("parent_station"),
        );

        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(_) => {
                    self.skipped += 1;
                    continue;
                }
            };
            let field = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or("").trim();

            let stop_id = field(id_col);
            if stop_id.is_empty() {
                self.skipped += 1;
                continue;
            }

            let parent = field(parent_col);
            if !parent.is_empty() {
                // Platform-level stop: remember the rollup, never surface it.
                self.child_to_parent
                    .insert(stop_id.to_string(), parent.to_string());
                continue;
            }

            let (lat, lon) = match (field(lat_col).parse(), field(lon_col).parse()) {
                (Ok(lat), Ok(lon)) => (lat, lon),
                _ => {
                    self.skipped += 1;
                    continue;
                }
            };

            self.stations.insert(
                stop_id.to_string(),
                Station {
                    stop_id: stop_id.to_string(),
                    name: field(name_col).to_string(),
                    lat,
                    lon,
                    parent_id: None,
                    routes_served: BTreeSet::new(),
                },
            );
        }
    }

    /// Join trips.txt and stop_times.txt into per-station served routes and
    /// scheduled arrival times.
    fn load_schedule(&mut self, trips: &str, stop_times: &str) {
        let mut trip_route: HashMap<String, String> = HashMap::new();
        {
            let mut reader = csv::Reader::from_reader(trips.as_bytes());
            let headers = match reader.headers() {
                Ok(h) => h.clone(),
                Err(_) => return,
            };
            let trip_col = headers.iter().position(|h| h == "trip_id");
            let route_col = headers.iter().position(|h| h == "route_id");
            for record in reader.records().flatten() {
                let field = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or("").trim();
                let (trip_id, route_id) = (field(trip_col), field(route_col));
                if !trip_id.is_empty() && !route_id.is_empty() {
                    trip_route.insert(trip_id.to_string(), route_id.to_string());
                }
            }
        }

        let mut reader = csv::Reader::from_reader(stop_times.as_bytes());
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(_) => return,
        };
        let trip_col = headers.iter().position(|h| h == "trip_id");
        let stop_col = headers.iter().position(|h| h == "stop_id");
        let arrival_col = headers.iter().position(|h| h == "arrival_time");

        for record in reader.records().flatten() {
            let field = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or("").trim();
            let (trip_id, stop_id) = (field(trip_col), field(stop_col));
            if trip_id.is_empty() || stop_id.is_empty() {
                continue;
            }

            if let Some(route_id) = trip_route.get(trip_id) {
                let parent = self.resolve_id(stop_id).to_string();
                if let Some(station) = self.stations.get_mut(&parent) {
                    station.routes_served.insert(route_id.clone());
                }
            }

            if let Some(seconds) = parse_gtfs_time(field(arrival_col)) {
                self.scheduled_arrivals
                    .insert((trip_id.to_string(), stop_id.to_string()), seconds);
            }
        }
    }

    /// Resolve a stop id to its analytics unit: parent station when the stop
    /// is a child platform, otherwise the id itself (with the NYC N/S
    /// platform suffix stripped as a fallback).
    pub fn resolve_id<'a>(&'a self, stop_id: &'a str) -> &'a str {
        if let Some(parent) = self.child_to_parent.get(stop_id) {
            return parent;
        }
        if self.stations.contains_key(stop_id) {
            return stop_id;
        }
        // Realtime feeds use platform ids like "635N" even when the bundle
        // only lists "635".
        let trimmed = stop_id.trim_end_matches(['N', 'S']);
        if self.stations.contains_key(trimmed) {
            return trimmed;
        }
        stop_id
    }

    /// Look up the analytics-unit station for a (possibly child) stop id.
    pub fn lookup_station(&self, stop_id: &str) -> Option<&Station> {
        self.stations.get(self.resolve_id(stop_id))
    }

    pub fn lookup_route(&self, route_id: &str) -> Option<&Route> {
        self.routes.get(route_id)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn stations(&self) -> impl Iterator<Item = &Station> {
        self.stations.values()
    }

    pub fn stations_in_bounds(&self, bbox: BoundingBox) -> Vec<&Station> {
        let mut hits: Vec<&Station> = self
            .stations
            .values()
            .filter(|s| bbox.contains(s.lat, s.lon))
            .collect();
        hits.sort_by(|a, b| a.stop_id.cmp(&b.stop_id));
        hits
    }

    /// Scheduled arrival as second-of-day, when the bundle had a schedule.
    pub fn scheduled_arrival(&self, trip_id: &str, stop_id: &str) -> Option<u32> {
        self.scheduled_arrivals
            .get(&(trip_id.to_string(), stop_id.to_string()))
            .copied()
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Parse a GTFS HH:MM:SS time into seconds past midnight. Hours may exceed
/// 23 for overnight trips.
fn parse_gtfs_time(s: &str) -> Option<u32> {
    let mut parts = s.splitn(3, ':');
    let h: u32 = parts.next()?.trim().parse().ok()?;
    let m: u32 = parts.next()?.trim().parse().ok()?;
    let sec: u32 = parts.next()?.trim().parse().ok()?;
    if m > 59 || sec > 59 {
        return None;
    }
    Some(h * 3600 + m * 60 + sec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const STOPS: &str = "\
stop_id,stop_name,stop_lat,stop_lon,location_type,parent_station
635,14 St - Union Sq,40.734673,-73.989951,1,
635N,14 St - Union Sq,40.734673,-73.989951,0,635
635S,14 St - Union Sq,40.734673,-73.989951,0,635
631,Grand Central - 42 St,40.751776,-73.976848,1,
broken,,not_a_float,,0,
";

    const ROUTES: &str = "\
route_id,route_short_name,route_long_name,route_color
6,6,Lexington Avenue Local,00933C
L,L,14 St - Canarsie Local,A7A9AC
,missing id,,
";

    const TRIPS: &str = "\
trip_id,route_id,service_id
t1,6,wk
t2,L,wk
";

    const STOP_TIMES: &str = "\
trip_id,arrival_time,departure_time,stop_id,stop_sequence
t1,08:00:30,08:01:00,635N,1
t1,08:05:00,08:05:30,631,2
t2,25:10:00,25:10:30,635S,1
";

    fn write_bundle_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, data) in [
            ("stops.txt", STOPS),
            ("routes.txt", ROUTES),
            ("trips.txt", TRIPS),
            ("stop_times.txt", STOP_TIMES),
        ] {
            std::fs::write(dir.path().join(name), data).unwrap();
        }
        dir
    }

    fn write_bundle_zip() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut zip = zip::ZipWriter::new(file.reopen().unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in [
            ("stops.txt", STOPS),
            ("routes.txt", ROUTES),
            ("trips.txt", TRIPS),
            ("stop_times.txt", STOP_TIMES),
        ] {
            zip.start_file(name, options).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        file
    }

    #[test]
    fn loads_from_directory() {
        let dir = write_bundle_dir();
        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.route_count(), 2);
        assert_eq!(catalog.station_count(), 2);
        // One bad stop row and one bad route row.
        assert_eq!(catalog.skipped, 2);
    }

    #[test]
    fn loads_from_zip() {
        let file = write_bundle_zip();
        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.route_count(), 2);
        assert_eq!(catalog.station_count(), 2);
    }

    #[test]
    fn child_stops_collapse_to_parent() {
        let dir = write_bundle_dir();
        let catalog = Catalog::load(dir.path()).unwrap();

        let station = catalog.lookup_station("635N").unwrap();
        assert_eq!(station.stop_id, "635");
        // Children never appear as stations.
        assert!(catalog.stations().all(|s| s.parent_id.is_none()));
        assert!(!catalog.stations().any(|s| s.stop_id == "635N"));
    }

    #[test]
    fn routes_served_joined_from_schedule() {
        let dir = write_bundle_dir();
        let catalog = Catalog::load(dir.path()).unwrap();
        let union_sq = catalog.lookup_station("635").unwrap();
        assert!(union_sq.routes_served.contains("6"));
        assert!(union_sq.routes_served.contains("L"));
        let grand_central = catalog.lookup_station("631").unwrap();
        assert_eq!(grand_central.routes_served.len(), 1);
    }

    #[test]
    fn scheduled_arrival_lookup() {
        let dir = write_bundle_dir();
        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.scheduled_arrival("t1", "635N"), Some(8 * 3600 + 30));
        // Overnight times past 24:00 are valid in GTFS.
        assert_eq!(catalog.scheduled_arrival("t2", "635S"), Some(25 * 3600 + 600));
        assert_eq!(catalog.scheduled_arrival("t1", "nope"), None);
    }

    #[test]
    fn bounding_box_query() {
        let dir = write_bundle_dir();
        let catalog = Catalog::load(dir.path()).unwrap();
        let bbox = BoundingBox {
            min_lat: 40.73,
            min_lon: -74.0,
            max_lat: 40.74,
            max_lon: -73.98,
        };
        let hits = catalog.stations_in_bounds(bbox);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].stop_id, "635");
    }

    #[test]
    fn missing_bundle_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Catalog::load(dir.path()).unwrap_err();
        assert!(matches!(err, CatalogError::Missing(_)));
    }

    #[test]
    fn load_is_deterministic() {
        let dir = write_bundle_dir();
        let a = Catalog::load(dir.path()).unwrap();
        let b = Catalog::load(dir.path()).unwrap();
        let mut ids_a: Vec<_> = a.stations().map(|s| s.stop_id.clone()).collect();
        let mut ids_b: Vec<_> = b.stations().map(|s| s.stop_id.clone()).collect();
        ids_a.sort();
        ids_b.sort();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.skipped, b.skipped);
    }

    #[test]
    fn gtfs_time_parsing() {
        assert_eq!(parse_gtfs_time("08:00:30"), Some(28830));
        assert_eq!(parse_gtfs_time("25:00:00"), Some(90000));
        assert_eq!(parse_gtfs_time("8:61:00"), None);
        assert_eq!(parse_gtfs_time("garbage"), None);
    }
}
