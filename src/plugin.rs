//! Forwarding of counter samples and live reconfiguration of the transports
//!
//! Samples are delivered through whichever transport the current
//! configuration selects. A configuration change is applied while holding the
//! snapshot lock for writing, and every sample holds it for reading from the
//! moment it reads the mode until its transport call returns, so no sample
//! can reach a transport that is being reconfigured or has been switched off.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::{TransportConfig, TransportMode};
use crate::error::{ForwarderError, Result};
use crate::point::PointEncoder;
use crate::registry::ObjectRegistry;
use crate::sample::CounterSample;
use crate::store::ConfigStore;
use crate::transport::{BatchedTransport, DatagramTransport};

/// Name under which the plugin subscribes to configuration changes
pub const OBSERVER_NAME: &str = "influxdb-forwarder";

/// Counters describing what happened to incoming samples
#[derive(Debug, Default)]
pub struct PluginStats {
    forwarded: AtomicU64,
    failed: AtomicU64,
    skipped_disabled: AtomicU64,
    skipped_non_realtime: AtomicU64,
    reconfigurations: AtomicU64,
}

/// Point-in-time copy of [`PluginStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub forwarded: u64,
    pub failed: u64,
    pub skipped_disabled: u64,
    pub skipped_non_realtime: u64,
    pub reconfigurations: u64,
}

impl PluginStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_disabled: self.skipped_disabled.load(Ordering::Relaxed),
            skipped_non_realtime: self.skipped_non_realtime.load(Ordering::Relaxed),
            reconfigurations: self.reconfigurations.load(Ordering::Relaxed),
        }
    }
}

/// Configuration snapshot plus the transports it controls
struct Router {
    store: Arc<dyn ConfigStore>,
    config: RwLock<TransportConfig>,
    udp: Arc<dyn DatagramTransport>,
    http: Arc<dyn BatchedTransport>,
    stats: Arc<PluginStats>,
}

impl Router {
    fn activate(&self, config: &TransportConfig) {
        match config.mode {
            TransportMode::Udp => self.configure_udp(config),
            TransportMode::Http => self.configure_http(config),
        }
    }

    fn deactivate(&self, mode: TransportMode) {
        match mode {
            TransportMode::Udp => self.udp.shutdown(),
            TransportMode::Http => self.http.shutdown(),
        }
    }

    fn configure_udp(&self, config: &TransportConfig) {
        if let Err(e) = self.udp.configure(&config.udp_local, &config.udp_target) {
            error!(
                "Failed to configure UDP transport for {}: {}",
                config.udp_target, e
            );
        }
    }

    fn configure_http(&self, config: &TransportConfig) {
        if let Err(e) = self.http.configure(&config.http_settings()) {
            error!(
                "Failed to configure HTTP transport for {}: {}",
                config.http_target, e
            );
        }
    }

    /// Re-read the store and apply whatever changed
    ///
    /// The new snapshot is kept even when a transport fails to reconfigure.
    /// The store is read under the write lock so that concurrent changes are
    /// applied in order and the last one sees the latest values.
    fn reconfigure(&self) {
        let mut current = match self.config.write() {
            Ok(current) => current,
            Err(_) => {
                error!("Transport configuration lock poisoned, ignoring configuration change");
                return;
            }
        };

        let next = TransportConfig::from_store(self.store.as_ref());

        if *current == next {
            debug!("Configuration change does not affect the forwarder");
            return;
        }

        let previous = std::mem::replace(&mut *current, next);
        let next = &*current;
        self.stats.reconfigurations.fetch_add(1, Ordering::Relaxed);

        if previous.enabled != next.enabled {
            info!(
                "Forwarding {}",
                if next.enabled { "enabled" } else { "disabled" }
            );
        }
        if previous.measurement != next.measurement {
            info!(
                "Measurement changed from '{}' to '{}'",
                previous.measurement, next.measurement
            );
        }

        if previous.mode != next.mode {
            info!("Switching transport from {} to {}", previous.mode, next.mode);
            self.deactivate(previous.mode);
            self.activate(next);
            return;
        }

        // Settings of the inactive transport are applied when it is next activated
        match next.mode {
            TransportMode::Udp => {
                if previous.udp_local != next.udp_local || previous.udp_target != next.udp_target {
                    info!("UDP target changed to {}", next.udp_target);
                    self.configure_udp(next);
                }
            }
            TransportMode::Http => {
                if previous.http_settings() != next.http_settings()
                    || previous.retention_policy != next.retention_policy
                {
                    info!("HTTP target changed to {}", next.http_target);
                    self.configure_http(next);
                }
            }
        }
    }
}

/// Forwards real-time counter samples to InfluxDB
pub struct ForwardingPlugin {
    registry: Arc<dyn ObjectRegistry>,
    encoder: PointEncoder,
    router: Arc<Router>,
    stats: Arc<PluginStats>,
}

impl ForwardingPlugin {
    /// Read the configuration, activate the selected transport and subscribe
    /// to configuration changes
    pub fn new(
        store: Arc<dyn ConfigStore>,
        registry: Arc<dyn ObjectRegistry>,
        udp: Arc<dyn DatagramTransport>,
        http: Arc<dyn BatchedTransport>,
    ) -> Self {
        let config = TransportConfig::from_store(store.as_ref());
        info!(
            "Starting InfluxDB forwarder in {} mode (enabled: {}, measurement: {})",
            config.mode, config.enabled, config.measurement
        );

        let stats = Arc::new(PluginStats::default());
        let router = Arc::new(Router {
            store: Arc::clone(&store),
            config: RwLock::new(config.clone()),
            udp,
            http,
            stats: Arc::clone(&stats),
        });
        router.activate(&config);

        // The store owns the observer, so it must not keep the router alive
        let weak = Arc::downgrade(&router);
        store.subscribe(
            OBSERVER_NAME,
            Arc::new(move || {
                if let Some(router) = weak.upgrade() {
                    router.reconfigure();
                }
            }),
        );

        Self {
            registry,
            encoder: PointEncoder::new(),
            router,
            stats,
        }
    }

    /// Handle one counter sample
    ///
    /// Never fails: problems with a sample are logged and counted.
    pub fn on_sample(&self, sample: &CounterSample) {
        let config = match self.router.config.read() {
            Ok(config) => config,
            Err(_) => {
                error!("Transport configuration lock poisoned, dropping sample");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if !config.enabled {
            self.stats.skipped_disabled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !sample.time_type.is_realtime() {
            self.stats.skipped_non_realtime.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.forward(sample, &config) {
            Ok(()) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                if config.trace {
                    error!(
                        "Failed to forward sample of {}: {:?}\n{:#?}",
                        sample.object_name, e, sample
                    );
                } else {
                    warn!("Failed to forward sample of {}: {}", sample.object_name, e);
                }
            }
        }
    }

    fn forward(&self, sample: &CounterSample, config: &TransportConfig) -> Result<()> {
        let info = self.registry.lookup(&sample.object_name)?;
        let point = self.encoder.encode(
            sample,
            &info.object_type,
            &info.object_family,
            &config.measurement,
        )?;

        match config.mode {
            TransportMode::Udp => self.router.udp.send(&point.to_line_protocol()),
            TransportMode::Http => {
                self.router
                    .http
                    .send(&point, &config.database, &config.retention_policy)
            }
        }
    }

    /// Re-read the configuration store now
    pub fn on_config_change(&self) {
        self.router.reconfigure();
    }

    /// Copy of the configuration currently in effect
    pub fn config(&self) -> Result<TransportConfig> {
        self.router
            .config
            .read()
            .map(|config| config.clone())
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop listening for configuration changes and shut both transports down
    pub fn shutdown(&self) {
        self.router.store.unsubscribe(OBSERVER_NAME);
        self.router.udp.shutdown();
        self.router.http.shutdown();
        info!("InfluxDB forwarder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, Endpoint, HttpSettings, LocalBind};
    use crate::point::EncodedPoint;
    use crate::registry::{ObjectInfo, StaticRegistry};
    use crate::sample::TimeType;
    use crate::store::MemoryConfigStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Records calls and refuses traffic while not configured
    #[derive(Default)]
    struct FakeUdp {
        configures: Mutex<Vec<(LocalBind, Endpoint)>>,
        lines: Mutex<Vec<String>>,
        shutdowns: AtomicUsize,
        active: AtomicBool,
        stale_sends: AtomicUsize,
        fail: AtomicBool,
    }

    impl DatagramTransport for FakeUdp {
        fn configure(&self, local: &LocalBind, target: &Endpoint) -> Result<()> {
            self.configures
                .lock()
                .unwrap()
                .push((local.clone(), target.clone()));
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn send(&self, line: &str) -> Result<()> {
            if !self.active.load(Ordering::SeqCst) {
                self.stale_sends.fetch_add(1, Ordering::SeqCst);
                return Err(ForwarderError::Transport("UDP socket is not bound".to_string()));
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ForwarderError::Transport("network unreachable".to_string()));
            }
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeHttp {
        configures: Mutex<Vec<HttpSettings>>,
        points: Mutex<Vec<(String, String, String)>>,
        shutdowns: AtomicUsize,
        active: AtomicBool,
        stale_sends: AtomicUsize,
    }

    impl BatchedTransport for FakeHttp {
        fn configure(&self, settings: &HttpSettings) -> Result<()> {
            self.configures.lock().unwrap().push(settings.clone());
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn send(&self, point: &EncodedPoint, database: &str, retention_policy: &str) -> Result<()> {
            if !self.active.load(Ordering::SeqCst) {
                self.stale_sends.fetch_add(1, Ordering::SeqCst);
                return Err(ForwarderError::Transport("HTTP transport is not connected".to_string()));
            }
            self.points.lock().unwrap().push((
                point.to_line_protocol(),
                database.to_string(),
                retention_policy.to_string(),
            ));
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
        }
    }

    struct CountingRegistry {
        inner: StaticRegistry,
        lookups: AtomicUsize,
    }

    impl ObjectRegistry for CountingRegistry {
        fn lookup(&self, object_name: &str) -> Result<ObjectInfo> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(object_name)
        }
    }

    struct Harness {
        store: Arc<MemoryConfigStore>,
        udp: Arc<FakeUdp>,
        http: Arc<FakeHttp>,
        registry: Arc<CountingRegistry>,
        plugin: ForwardingPlugin,
    }

    impl Harness {
        fn new(settings: &[(&str, &str)]) -> Self {
            let store = Arc::new(MemoryConfigStore::new());
            for (key, value) in settings {
                store.set(*key, *value);
            }

            let inner = StaticRegistry::new();
            inner.register_object("WEB1", "TOMCAT").unwrap();
            inner.register_family("TOMCAT", "WEB").unwrap();
            let registry = Arc::new(CountingRegistry {
                inner,
                lookups: AtomicUsize::new(0),
            });

            let udp = Arc::new(FakeUdp::default());
            let http = Arc::new(FakeHttp::default());
            let plugin = ForwardingPlugin::new(
                store.clone(),
                registry.clone(),
                udp.clone(),
                http.clone(),
            );

            Self {
                store,
                udp,
                http,
                registry,
                plugin,
            }
        }

        fn change(&self, key: &str, value: &str) {
            self.store.set(key, value);
            self.store.notify_changed();
        }

        fn udp_lines(&self) -> usize {
            self.udp.lines.lock().unwrap().len()
        }

        fn http_points(&self) -> usize {
            self.http.points.lock().unwrap().len()
        }

        fn udp_configures(&self) -> usize {
            self.udp.configures.lock().unwrap().len()
        }

        fn http_configures(&self) -> usize {
            self.http.configures.lock().unwrap().len()
        }

        fn stale_sends(&self) -> usize {
            self.udp.stale_sends.load(Ordering::SeqCst) + self.http.stale_sends.load(Ordering::SeqCst)
        }
    }

    fn web_sample() -> CounterSample {
        CounterSample::new("WEB1", TimeType::Realtime, 1000)
            .with_field("CPU", 55.2)
            .with_field("MEM", 1024i64)
            .with_field("label", "x")
            .with_field("time", 999i64)
    }

    const WEB_LINE: &str = "counter,obj=WEB1,objType=TOMCAT,objFamily=WEB CPU=55.2,MEM=1024i 1000";

    #[test]
    fn test_udp_mode_sends_one_datagram() {
        let h = Harness::new(&[(keys::UDP_TARGET_IP, "10.0.0.5"), (keys::UDP_TARGET_PORT, "8089")]);

        h.plugin.on_sample(&web_sample());

        let configures = h.udp.configures.lock().unwrap().clone();
        assert_eq!(configures.len(), 1);
        assert_eq!(configures[0].1, Endpoint::new("10.0.0.5", 8089));
        assert_eq!(*h.udp.lines.lock().unwrap(), vec![WEB_LINE.to_string()]);
        assert_eq!(h.http_configures(), 0);
        assert_eq!(h.plugin.stats().forwarded, 1);
    }

    #[test]
    fn test_http_mode_queues_point_for_database() {
        let h = Harness::new(&[(keys::UDP, "false")]);

        h.plugin.on_sample(&web_sample());

        assert_eq!(h.http_configures(), 1);
        assert_eq!(h.udp_configures(), 0);
        let points = h.http.points.lock().unwrap().clone();
        assert_eq!(
            points,
            vec![(
                WEB_LINE.to_string(),
                "scouterCounter".to_string(),
                "autogen".to_string()
            )]
        );
    }

    #[test]
    fn test_disabled_plugin_does_nothing() {
        let h = Harness::new(&[(keys::ENABLED, "false")]);

        h.plugin.on_sample(&web_sample());

        assert_eq!(h.registry.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(h.udp_lines(), 0);
        assert_eq!(h.http_points(), 0);
        assert_eq!(h.plugin.stats().skipped_disabled, 1);
    }

    #[test]
    fn test_non_realtime_samples_are_ignored() {
        let h = Harness::new(&[]);

        for time_type in [
            TimeType::OneMin,
            TimeType::FiveMin,
            TimeType::TenMin,
            TimeType::Hour,
            TimeType::Day,
        ] {
            let mut sample = web_sample();
            sample.time_type = time_type;
            h.plugin.on_sample(&sample);
        }

        assert_eq!(h.registry.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(h.udp_lines(), 0);
        assert_eq!(h.plugin.stats().skipped_non_realtime, 5);
    }

    #[test]
    fn test_switch_udp_to_http() {
        let h = Harness::new(&[]);
        h.plugin.on_sample(&web_sample());
        assert_eq!(h.udp_lines(), 1);

        h.change(keys::UDP, "false");
        assert_eq!(h.udp.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(h.http_configures(), 1);

        for _ in 0..10 {
            h.plugin.on_sample(&web_sample());
        }

        assert_eq!(h.http_points(), 10);
        assert_eq!(h.udp_lines(), 1);
        assert_eq!(h.stale_sends(), 0);
    }

    #[test]
    fn test_switch_http_to_udp() {
        let h = Harness::new(&[(keys::UDP, "false")]);
        h.plugin.on_sample(&web_sample());

        h.change(keys::UDP, "true");
        assert_eq!(h.http.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(h.udp_configures(), 1);

        for _ in 0..10 {
            h.plugin.on_sample(&web_sample());
        }

        assert_eq!(h.udp_lines(), 10);
        assert_eq!(h.http_points(), 1);
        assert_eq!(h.stale_sends(), 0);
    }

    #[test]
    fn test_credential_change_reconnects_once() {
        let h = Harness::new(&[(keys::UDP, "false")]);
        assert_eq!(h.http_configures(), 1);

        h.change(keys::PASSWORD, "secret");
        for _ in 0..5 {
            h.plugin.on_sample(&web_sample());
        }
        // A notification without a relevant change must not reconnect
        h.store.notify_changed();

        let configures = h.http.configures.lock().unwrap().clone();
        assert_eq!(configures.len(), 2);
        assert_eq!(configures[1].credentials.password, "secret");
        assert_eq!(h.http_points(), 5);
    }

    #[test]
    fn test_endpoint_and_retention_changes_reconnect() {
        let h = Harness::new(&[(keys::UDP, "false")]);

        h.change(keys::HTTP_TARGET_IP, "10.0.0.9");
        h.change(keys::HTTP_RETENTION_POLICY, "one_week");
        h.plugin.on_sample(&web_sample());

        let configures = h.http.configures.lock().unwrap().clone();
        assert_eq!(configures.len(), 3);
        assert_eq!(configures[2].endpoint, Endpoint::new("10.0.0.9", 8086));
        assert_eq!(h.http.points.lock().unwrap()[0].2, "one_week");
    }

    #[test]
    fn test_udp_address_change_applies_both_values() {
        let h = Harness::new(&[(keys::UDP_TARGET_IP, "10.0.0.5")]);

        h.change(keys::UDP_LOCAL_PORT, "5000");

        let configures = h.udp.configures.lock().unwrap().clone();
        assert_eq!(configures.len(), 2);
        assert_eq!(configures[1].0.port, 5000);
        assert_eq!(configures[1].1, Endpoint::new("10.0.0.5", 8089));
    }

    #[test]
    fn test_udp_target_port_change() {
        let h = Harness::new(&[]);

        h.change(keys::UDP_TARGET_PORT, "9089");

        let configures = h.udp.configures.lock().unwrap().clone();
        assert_eq!(configures.last().unwrap().1.port, 9089);
        assert_eq!(configures.last().unwrap().0.port, 0);
    }

    #[test]
    fn test_inactive_transport_configured_on_activation() {
        let h = Harness::new(&[]);

        h.change(keys::HTTP_TARGET_IP, "10.0.0.9");
        assert_eq!(h.http_configures(), 0);

        h.change(keys::UDP, "false");
        let configures = h.http.configures.lock().unwrap().clone();
        assert_eq!(configures.len(), 1);
        assert_eq!(configures[0].endpoint.host, "10.0.0.9");
    }

    #[test]
    fn test_measurement_and_enabled_changes() {
        let h = Harness::new(&[]);

        h.change(keys::MEASUREMENT, "perf");
        h.plugin.on_sample(&web_sample());
        assert!(h.udp.lines.lock().unwrap()[0].starts_with("perf,"));
        assert_eq!(h.udp_configures(), 1);

        h.change(keys::ENABLED, "false");
        h.plugin.on_sample(&web_sample());
        assert_eq!(h.udp_lines(), 1);

        h.change(keys::ENABLED, "true");
        h.plugin.on_sample(&web_sample());
        assert_eq!(h.udp_lines(), 2);
        assert_eq!(h.plugin.stats().reconfigurations, 3);
    }

    #[test]
    fn test_failures_do_not_stop_processing() {
        let h = Harness::new(&[(keys::TRACE, "true")]);

        let unknown = CounterSample::new("UNKNOWN", TimeType::Realtime, 1).with_field("v", 1i64);
        for _ in 0..3 {
            h.plugin.on_sample(&unknown);
        }

        h.udp.fail.store(true, Ordering::SeqCst);
        h.plugin.on_sample(&web_sample());
        h.udp.fail.store(false, Ordering::SeqCst);

        let text_only = CounterSample::new("WEB1", TimeType::Realtime, 1).with_field("label", "x");
        h.plugin.on_sample(&text_only);

        h.plugin.on_sample(&web_sample());

        let stats = h.plugin.stats();
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(h.udp_lines(), 1);
    }

    #[test]
    fn test_shutdown_unsubscribes() {
        let h = Harness::new(&[]);
        h.plugin.shutdown();
        assert_eq!(h.udp.shutdowns.load(Ordering::SeqCst), 1);

        h.change(keys::UDP, "false");
        assert_eq!(h.http_configures(), 0);
        assert_eq!(h.plugin.config().unwrap().mode, TransportMode::Udp);
    }

    #[test]
    fn test_manual_config_change() {
        let h = Harness::new(&[]);
        h.store.set(keys::MEASUREMENT, "manual");
        assert_eq!(h.plugin.config().unwrap().measurement, "counter");

        h.plugin.on_config_change();
        assert_eq!(h.plugin.config().unwrap().measurement, "manual");
    }

    #[test]
    fn test_mode_flips_during_traffic_never_hit_inactive_transport() {
        let h = Harness::new(&[]);
        let per_thread = 200;

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..per_thread {
                        h.plugin.on_sample(&web_sample());
                    }
                });
            }
            scope.spawn(|| {
                for i in 0..50 {
                    h.change(keys::UDP, if i % 2 == 0 { "false" } else { "true" });
                }
            });
        });

        assert_eq!(h.stale_sends(), 0);
        assert_eq!(h.udp_lines() + h.http_points(), 4 * per_thread);
        assert_eq!(h.plugin.stats().failed, 0);
    }

    /// Stalls after reading the measurement key once, holding on to the old value
    struct SlowMeasurementStore {
        inner: MemoryConfigStore,
        stall_next: AtomicBool,
    }

    impl ConfigStore for SlowMeasurementStore {
        fn get_value(&self, key: &str) -> Option<String> {
            let value = self.inner.get_value(key);
            if key == keys::MEASUREMENT && self.stall_next.swap(false, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(300));
            }
            value
        }

        fn subscribe(&self, name: &str, observer: crate::store::ConfigObserver) {
            self.inner.subscribe(name, observer);
        }

        fn unsubscribe(&self, name: &str) {
            self.inner.unsubscribe(name);
        }
    }

    #[test]
    fn test_overlapping_changes_keep_latest_values() {
        let store = Arc::new(SlowMeasurementStore {
            inner: MemoryConfigStore::new(),
            stall_next: AtomicBool::new(false),
        });
        store.inner.set(keys::MEASUREMENT, "old");
        let plugin = ForwardingPlugin::new(
            store.clone(),
            Arc::new(StaticRegistry::new()),
            Arc::new(FakeUdp::default()),
            Arc::new(FakeHttp::default()),
        );

        store.stall_next.store(true, Ordering::SeqCst);
        std::thread::scope(|scope| {
            // Reads "old", then stalls
            scope.spawn(|| plugin.on_config_change());
            std::thread::sleep(Duration::from_millis(100));

            store.inner.set(keys::MEASUREMENT, "new");
            plugin.on_config_change();
        });

        assert_eq!(store.inner.get_value(keys::MEASUREMENT).as_deref(), Some("new"));
        assert_eq!(plugin.config().unwrap().measurement, "new");
    }
}
