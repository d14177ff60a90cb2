//! Location Service
//!
//! Wraps a geolocation sensor with the guarantees callers need: a reading
//! never blocks longer than the configured timeout, failures degrade to a
//! fixed default coordinate, repeated refresh requests are throttled, and
//! background polling stops when its handle is cancelled or dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Timestamp;
use crate::coalesce::Throttle;
use crate::error::{Error, Result};
use crate::memo::Memoizer;

/// Mean Earth radius used for great-circle distances
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Decimal places kept when fingerprinting coordinates (about 11 m)
pub const COORDINATE_PRECISION: usize = 4;

/// Shortest background polling interval; shorter requests are raised to it
pub const MIN_BACKGROUND_INTERVAL: Duration = Duration::from_millis(100);

/// Geographic coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Create a coordinate
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether latitude and longitude are within range
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.prec$},{:.prec$}",
            self.latitude,
            self.longitude,
            prec = COORDINATE_PRECISION
        )
    }
}

/// Location service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Longest wait for a sensor reading
    #[serde(with = "crate::config::duration_millis", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Minimum spacing between sensor refreshes
    #[serde(with = "crate::config::duration_millis", rename = "refresh_throttle_ms")]
    pub refresh_throttle: Duration,
    /// Coordinate used when the sensor fails
    pub default_coordinate: Coordinate,
    /// Memoized distance results kept
    pub distance_cache_size: usize,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            refresh_throttle: Duration::from_secs(30),
            default_coordinate: Coordinate::new(40.7128, -74.0060),
            distance_cache_size: crate::memo::DEFAULT_MEMO_SIZE,
        }
    }
}

impl LocationConfig {
    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::Config("location timeout must be positive".into()));
        }
        if !self.default_coordinate.is_valid() {
            return Err(Error::Config(format!(
                "default coordinate {} is out of range",
                self.default_coordinate
            )));
        }
        if self.distance_cache_size == 0 {
            return Err(Error::Config(
                "location distance_cache_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a location request
///
/// A fallback fix carries the default coordinate and the reason the sensor
/// was not used. The reason is advisory; the coordinate is always usable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    pub error: Option<String>,
    pub acquired_at: Timestamp,
}

impl LocationFix {
    /// Whether this fix is the default coordinate
    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }
}

/// Geolocation sensor
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Take one reading
    async fn current_reading(&self) -> Result<Coordinate>;
}

/// Sensor that always reports the same coordinate
#[derive(Debug, Clone, Copy)]
pub struct FixedSource(pub Coordinate);

#[async_trait]
impl LocationSource for FixedSource {
    async fn current_reading(&self) -> Result<Coordinate> {
        Ok(self.0)
    }
}

/// Great-circle distance between two coordinates
pub fn haversine_km(a: &Coordinate, b: &Coordinate) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

fn pair_fingerprint((a, b): &(Coordinate, Coordinate)) -> String {
    format!("{}|{}", a, b)
}

struct Core {
    source: Arc<dyn LocationSource>,
    clock: Arc<dyn crate::clock::Clock>,
    timeout: Duration,
    default_coordinate: Coordinate,
    latest: watch::Sender<Option<LocationFix>>,
}

impl Core {
    async fn locate(&self) -> LocationFix {
        let reading = match tokio::time::timeout(self.timeout, self.source.current_reading()).await
        {
            Ok(reading) => reading,
            Err(_) => Err(Error::SensorTimeout(self.timeout)),
        };
        let acquired_at = self.clock.now_millis();

        match reading {
            Ok(coordinate) if coordinate.is_valid() => {
                debug!(%coordinate, "Location acquired");
                LocationFix {
                    coordinate,
                    error: None,
                    acquired_at,
                }
            }
            Ok(coordinate) => self.fallback(
                acquired_at,
                Error::SensorUnavailable(format!("reading {} out of range", coordinate)),
            ),
            Err(e) => self.fallback(acquired_at, e),
        }
    }

    fn fallback(&self, acquired_at: Timestamp, error: Error) -> LocationFix {
        warn!("Location unavailable, using default coordinate: {}", error);
        LocationFix {
            coordinate: self.default_coordinate,
            error: Some(error.to_string()),
            acquired_at,
        }
    }

    async fn refresh(&self) -> LocationFix {
        let fix = self.locate().await;
        self.latest.send_replace(Some(fix.clone()));
        fix
    }
}

/// Timeout-bounded, throttled access to a location sensor
pub struct LocationService {
    core: Arc<Core>,
    refresh: Throttle<()>,
    distances: Memoizer<(Coordinate, Coordinate), f64>,
}

impl LocationService {
    /// Create a service over `source`
    pub fn new(source: Arc<dyn LocationSource>, config: LocationConfig) -> Self {
        Self::with_clock(source, config, Arc::new(crate::clock::SystemClock))
    }

    /// Create a service with an explicit clock for fix timestamps
    pub fn with_clock(
        source: Arc<dyn LocationSource>,
        config: LocationConfig,
        clock: Arc<dyn crate::clock::Clock>,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        let core = Arc::new(Core {
            source,
            clock,
            timeout: config.timeout,
            default_coordinate: config.default_coordinate,
            latest,
        });

        // Each throttled refresh runs on its own task; the throttle only
        // decides when one may start.
        let refresh_core = core.clone();
        let refresh = Throttle::new(config.refresh_throttle, move |()| {
            let core = refresh_core.clone();
            tokio::spawn(async move {
                core.refresh().await;
            });
        });

        let distances = Memoizer::with_fingerprint(
            |(a, b): &(Coordinate, Coordinate)| haversine_km(a, b),
            pair_fingerprint,
            config.distance_cache_size,
        );

        Self {
            core,
            refresh,
            distances,
        }
    }

    /// Take a reading, falling back to the default coordinate on failure
    /// or timeout
    #[instrument(skip(self))]
    pub async fn locate(&self) -> LocationFix {
        self.core.refresh().await
    }

    /// Ask for a fresh reading, at most once per throttle window
    ///
    /// Requests inside a window collapse into one trailing refresh. Observe
    /// results through [`LocationService::subscribe`].
    pub fn request_refresh(&self) {
        self.refresh.call(());
    }

    /// Whether refresh requests are currently being throttled
    pub fn is_refresh_throttled(&self) -> bool {
        self.refresh.is_throttled()
    }

    /// Most recent fix, if any
    pub fn latest(&self) -> Option<LocationFix> {
        self.core.latest.borrow().clone()
    }

    /// Observe new fixes
    pub fn subscribe(&self) -> watch::Receiver<Option<LocationFix>> {
        self.core.latest.subscribe()
    }

    /// Poll the sensor every `interval` until the handle is cancelled
    ///
    /// `interval` is raised to [`MIN_BACKGROUND_INTERVAL`] if shorter.
    pub fn spawn_background_refresh(&self, interval: Duration) -> RefreshHandle {
        if interval < MIN_BACKGROUND_INTERVAL {
            warn!(
                ?interval,
                "Background refresh interval too short, using {:?}",
                MIN_BACKGROUND_INTERVAL
            );
        }
        let interval = interval.max(MIN_BACKGROUND_INTERVAL);
        let token = CancellationToken::new();
        let child = token.child_token();
        let core = self.core.clone();

        let handle = tokio::spawn(async move {
            info!(?interval, "Background location refresh started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = async {
                        ticker.tick().await;
                        core.refresh().await
                    } => {}
                }
            }
            info!("Background location refresh stopped");
        });

        RefreshHandle { token, handle }
    }

    /// Distance between two coordinates in kilometres
    ///
    /// Memoized on coordinates rounded to four decimal places.
    pub fn distance_km(&self, a: Coordinate, b: Coordinate) -> f64 {
        self.distances
            .call(&(a, b))
            .unwrap_or_else(|_| haversine_km(&a, &b))
    }

    /// Distance from the latest fix (or the default coordinate) to `target`
    pub fn distance_from_latest(&self, target: Coordinate) -> f64 {
        let origin = self
            .latest()
            .map(|fix| fix.coordinate)
            .unwrap_or(self.core.default_coordinate);
        self.distance_km(origin, target)
    }

    /// Memoized distance lookups so far
    pub fn distance_cache_stats(&self) -> crate::memo::MemoStats {
        self.distances.stats()
    }
}

impl std::fmt::Debug for LocationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationService")
            .field("timeout", &self.core.timeout)
            .field("default_coordinate", &self.core.default_coordinate)
            .finish()
    }
}

/// Handle to a background refresh task; dropping it stops the task
#[derive(Debug)]
pub struct RefreshHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RefreshHandle {
    /// Stop polling; an in-flight reading is abandoned
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the task has been told to stop
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the task to exit
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Err(e) = (&mut self.handle).await {
            warn!("Background location refresh ended abnormally: {}", e);
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        reading: Result<Coordinate>,
        latency: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(reading: Result<Coordinate>, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                reading,
                latency,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LocationSource for ScriptedSource {
        async fn current_reading(&self) -> Result<Coordinate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            match &self.reading {
                Ok(c) => Ok(*c),
                Err(e) => Err(Error::SensorUnavailable(e.to_string())),
            }
        }
    }

    const PARIS: Coordinate = Coordinate::new(48.8566, 2.3522);
    const LONDON: Coordinate = Coordinate::new(51.5074, -0.1278);

    fn service(source: Arc<ScriptedSource>) -> LocationService {
        LocationService::new(source, LocationConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_returns_reading() {
        let svc = service(ScriptedSource::new(Ok(PARIS), Duration::from_millis(200)));
        let fix = svc.locate().await;
        assert_eq!(fix.coordinate, PARIS);
        assert!(!fix.is_fallback());
        assert_eq!(svc.latest(), Some(fix));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sensor_falls_back_after_timeout() {
        let source = ScriptedSource::new(Ok(PARIS), Duration::from_secs(60));
        let svc = service(source);

        let start = tokio::time::Instant::now();
        let fix = svc.locate().await;

        assert!(start.elapsed() <= Duration::from_secs(5) + Duration::from_millis(1));
        assert!(fix.is_fallback());
        assert_eq!(fix.coordinate, LocationConfig::default().default_coordinate);
        assert!(fix.error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_error_falls_back() {
        let svc = service(ScriptedSource::new(
            Err(Error::SensorUnavailable("permission denied".into())),
            Duration::ZERO,
        ));
        let fix = svc.locate().await;
        assert!(fix.is_fallback());
        assert!(fix.error.unwrap().contains("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_reading_falls_back() {
        let svc = service(ScriptedSource::new(
            Ok(Coordinate::new(123.0, 0.0)),
            Duration::ZERO,
        ));
        assert!(svc.locate().await.is_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_requests_are_throttled() {
        let source = ScriptedSource::new(Ok(PARIS), Duration::ZERO);
        let svc = service(source.clone());
        let mut rx = svc.subscribe();

        for _ in 0..5 {
            svc.request_refresh();
        }
        rx.changed().await.unwrap();
        assert_eq!(source.calls(), 1);
        assert!(svc.is_refresh_throttled());

        // One trailing refresh at the end of the window
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(source.calls(), 2);
        assert!(!svc.is_refresh_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_stops_on_cancel() {
        let source = ScriptedSource::new(Ok(PARIS), Duration::ZERO);
        let svc = service(source.clone());

        let handle = svc.spawn_background_refresh(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(source.calls(), 4);

        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls(), 4);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_stops_on_drop() {
        let source = ScriptedSource::new(Ok(PARIS), Duration::ZERO);
        let svc = service(source.clone());

        let handle = svc.spawn_background_refresh(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(handle);
        let seen = source.calls();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls(), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_background_interval_is_clamped() {
        let source = ScriptedSource::new(Ok(PARIS), Duration::ZERO);
        let svc = service(source.clone());

        let handle = svc.spawn_background_refresh(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(250)).await;
        // Ticks at 0, 100 and 200 ms
        assert_eq!(source.calls(), 3);
        assert!(!handle.handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_distance_is_memoized_on_rounded_coordinates() {
        let svc = LocationService::new(Arc::new(FixedSource(PARIS)), LocationConfig::default());

        let d = svc.distance_km(PARIS, LONDON);
        assert!((d - 343.5).abs() < 1.0, "got {}", d);

        let nudged = Coordinate::new(PARIS.latitude + 0.00001, PARIS.longitude);
        assert_eq!(svc.distance_km(nudged, LONDON), d);

        let stats = svc.distance_cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_distance_from_latest_uses_default_before_any_fix() {
        let config = LocationConfig::default();
        let svc = LocationService::new(Arc::new(FixedSource(PARIS)), config.clone());
        assert_eq!(svc.distance_from_latest(config.default_coordinate), 0.0);

        svc.locate().await;
        assert_eq!(svc.distance_from_latest(PARIS), 0.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(LocationConfig::default().validate().is_ok());

        let config = LocationConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = LocationConfig {
            default_coordinate: Coordinate::new(0.0, 200.0),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }
}
