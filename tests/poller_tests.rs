use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use neigh_watch::config::{Backoff, PollerConfig, Privilege};
use neigh_watch::source::SourceReader;
use neigh_watch::types::SourceKind;
use neigh_watch::{DeviceSet, ErrorKind, NeighborPoller, SourceError};
use tokio::sync::Notify;
use tokio::time::Instant;

const NEIGH: &str = "\
192.168.43.12 dev wlan0 lladdr aa:bb:cc:dd:ee:01 REACHABLE
192.168.43.13 dev wlan0 lladdr aa:bb:cc:dd:ee:02 STALE
10.0.0.1 dev eth0 lladdr aa:bb:cc:dd:ee:03 REACHABLE
192.168.43.12 dev wlan0 lladdr aa:bb:cc:dd:ee:99 REACHABLE
";

const ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.43.20    0x1         0x2         aa:bb:cc:dd:ee:20     *        wlan0
192.168.43.21    0x1
";

#[derive(Clone)]
enum Reply {
    Ok(String),
    Fail,
    Timeout,
}

/// Answers commands (keyed by space-joined argv) and file reads from a script.
#[derive(Default)]
struct ScriptedReader {
    commands: HashMap<String, Reply>,
    files: HashMap<PathBuf, Reply>,
    calls: Mutex<Vec<String>>,
    // (entered, release): when set, every command waits for `release` after signalling `entered`.
    hold: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl ScriptedReader {
    fn command(mut self, key: &str, reply: Reply) -> Self {
        self.commands.insert(key.to_string(), reply);
        self
    }

    fn file(mut self, path: &str, reply: Reply) -> Self {
        self.files.insert(PathBuf::from(path), reply);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(what: &str, reply: Option<Reply>) -> Result<String, SourceError> {
        match reply {
            Some(Reply::Ok(s)) => Ok(s),
            Some(Reply::Timeout) => Err(SourceError::Timeout {
                what: what.to_string(),
                after: Duration::from_millis(1),
            }),
            Some(Reply::Fail) | None => Err(SourceError::Exit {
                command: what.to_string(),
                status: "exit status: 1".into(),
                stderr: String::new(),
            }),
        }
    }
}

#[async_trait]
impl SourceReader for ScriptedReader {
    async fn run_command(&self, argv: &[String], _timeout: Duration) -> Result<String, SourceError> {
        let key = argv.join(" ");
        self.calls.lock().unwrap().push(key.clone());
        if let Some((entered, release)) = &self.hold {
            entered.notify_one();
            release.notified().await;
        }
        Self::answer(&key, self.commands.get(&key).cloned())
    }

    async fn read_file(&self, path: &Path, _timeout: Duration) -> Result<String, SourceError> {
        let key = format!("read {}", path.display());
        self.calls.lock().unwrap().push(key.clone());
        Self::answer(&key, self.files.get(path).cloned())
    }
}

fn config() -> PollerConfig {
    PollerConfig {
        privilege: Privilege::Never,
        ..PollerConfig::default()
    }
}

fn ips(set: &DeviceSet) -> Vec<Ipv4Addr> {
    set.devices().iter().map(|d| d.ip()).collect()
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn neigh_command_result_is_deduplicated_in_order() {
    let reader = Arc::new(ScriptedReader::default().command("ip neigh show", Reply::Ok(NEIGH.into())));
    let poller = NeighborPoller::new(config(), reader.clone(), false);

    let set = poller.poll_once().await;
    assert_eq!(
        ips(&set),
        vec![Ipv4Addr::new(192, 168, 43, 12), Ipv4Addr::new(192, 168, 43, 13)]
    );
    assert_eq!(set.devices()[0].mac(), Some("aa:bb:cc:dd:ee:01"));
    assert_eq!(set.source(), SourceKind::NeighCommand);
    assert_eq!(poller.state().last_error, None);
    // First success wins: the cache file is never consulted.
    assert_eq!(reader.calls(), vec!["ip neigh show"]);
}

#[tokio::test]
async fn empty_neigh_output_falls_back_to_arp_cache() {
    let reader = Arc::new(
        ScriptedReader::default()
            .command("ip neigh show", Reply::Ok(String::new()))
            .file("/proc/net/arp", Reply::Ok(ARP.into())),
    );
    let poller = NeighborPoller::new(config(), reader.clone(), false);

    let set = poller.poll_once().await;
    assert_eq!(ips(&set), vec![Ipv4Addr::new(192, 168, 43, 20)]);
    assert_eq!(set.source(), SourceKind::ArpCache);
    assert_eq!(reader.calls(), vec!["ip neigh show", "read /proc/net/arp"]);
}

#[tokio::test]
async fn failed_neigh_command_falls_back_to_arp_cache() {
    let reader = Arc::new(ScriptedReader::default().file("/proc/net/arp", Reply::Ok(ARP.into())));
    let poller = NeighborPoller::new(config(), reader, false);

    let set = poller.poll_once().await;
    assert_eq!(set.len(), 1);
    assert_eq!(poller.state().last_error, None);
}

#[tokio::test]
async fn privileged_failures_fall_back_to_unprivileged_command() {
    let reader = Arc::new(
        ScriptedReader::default()
            .command("su -c ip neigh show", Reply::Fail)
            .command("su -c cat /proc/net/arp", Reply::Fail)
            .command("ip neigh show", Reply::Ok(NEIGH.into())),
    );
    let poller = NeighborPoller::new(config(), reader.clone(), true);

    let set = poller.poll_once().await;
    assert_eq!(set.len(), 2);
    assert_eq!(set.source(), SourceKind::UnprivilegedNeighCommand);
    assert_eq!(poller.state().last_error, None);
    assert_eq!(
        reader.calls(),
        vec!["su -c ip neigh show", "su -c cat /proc/net/arp", "ip neigh show"]
    );
}

#[tokio::test]
async fn privileged_cache_read_uses_escalation() {
    let reader = Arc::new(
        ScriptedReader::default()
            .command("su -c ip neigh show", Reply::Ok(String::new()))
            .command("su -c cat /proc/net/arp", Reply::Ok(ARP.into())),
    );
    let poller = NeighborPoller::new(config(), reader.clone(), true);

    let set = poller.poll_once().await;
    assert_eq!(set.source(), SourceKind::ArpCache);
    assert_eq!(reader.calls(), vec!["su -c ip neigh show", "su -c cat /proc/net/arp"]);
}

#[tokio::test]
async fn all_sources_failing_yields_empty_set_and_last_error() {
    let reader = Arc::new(ScriptedReader::default());
    let poller = NeighborPoller::new(config(), reader, false);

    let set = poller.poll_once().await;
    assert!(set.is_empty());
    assert_eq!(set.source(), SourceKind::None);
    assert_eq!(poller.state().last_error, Some(ErrorKind::SourceUnavailable));
}

#[tokio::test]
async fn last_error_reports_the_final_failure() {
    let reader = Arc::new(
        ScriptedReader::default()
            .command("ip neigh show", Reply::Fail)
            .file("/proc/net/arp", Reply::Timeout),
    );
    let poller = NeighborPoller::new(config(), reader, false);

    poller.poll_once().await;
    assert_eq!(poller.state().last_error, Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn empty_but_readable_sources_are_not_an_error() {
    let reader = Arc::new(
        ScriptedReader::default()
            .command("ip neigh show", Reply::Ok(String::new()))
            .file("/proc/net/arp", Reply::Ok("IP address HW type Flags HW address Mask Device\n".into())),
    );
    let poller = NeighborPoller::new(config(), reader, false);

    assert!(poller.poll_once().await.is_empty());
    assert_eq!(poller.state().last_error, None);
}

#[tokio::test]
async fn repeated_cycles_are_identical() {
    let reader = Arc::new(ScriptedReader::default().command("ip neigh show", Reply::Ok(NEIGH.into())));
    let poller = NeighborPoller::new(config(), reader, false);

    let a = poller.poll_once().await;
    let b = poller.poll_once().await;
    assert_eq!(a, b);
    assert_eq!(a.devices(), b.devices());
}

#[tokio::test]
async fn start_publishes_periodically_and_stop_ends_it() {
    let reader = Arc::new(ScriptedReader::default().command("ip neigh show", Reply::Ok(NEIGH.into())));
    let poller = NeighborPoller::new(config(), reader, false);
    let published = Arc::new(AtomicUsize::new(0));
    let seen = published.clone();
    poller.subscribe(move |set| {
        assert_eq!(set.len(), 2);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    poller.start(Duration::from_millis(20));
    poller.start(Duration::from_millis(20));
    assert!(poller.state().running);
    assert_eq!(poller.state().interval_ms, 20);

    assert!(wait_until(|| published.load(Ordering::SeqCst) >= 3).await);
    poller.stop();
    assert!(!poller.state().running);

    let after_stop = published.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(published.load(Ordering::SeqCst), after_stop);
    poller.shutdown().await;
}

#[tokio::test]
async fn stop_during_in_flight_cycle_discards_result() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut reader = ScriptedReader::default().command("ip neigh show", Reply::Ok(NEIGH.into()));
    reader.hold = Some((entered.clone(), release.clone()));
    let poller = NeighborPoller::new(config(), Arc::new(reader), false);

    let published = Arc::new(AtomicUsize::new(0));
    let seen = published.clone();
    poller.subscribe(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    poller.start(Duration::from_millis(10));
    tokio::time::timeout(Duration::from_secs(2), entered.notified())
        .await
        .expect("cycle started");
    poller.stop();
    release.notify_one();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(published.load(Ordering::SeqCst), 0);
    assert_eq!(poller.state().last_error, None);
    poller.shutdown().await;
}

#[tokio::test]
async fn subscriber_may_stop_the_poller() {
    let reader = Arc::new(ScriptedReader::default().command("ip neigh show", Reply::Ok(NEIGH.into())));
    let poller = NeighborPoller::new(config(), reader, false);
    let published = Arc::new(AtomicUsize::new(0));
    let seen = published.clone();
    let handle = poller.clone();
    poller.subscribe(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        handle.stop();
    });

    poller.start(Duration::from_millis(10));
    assert!(wait_until(|| !poller.is_running()).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(published.load(Ordering::SeqCst), 1);
    poller.shutdown().await;
}

#[tokio::test]
async fn restart_after_stop_publishes_again() {
    let reader = Arc::new(ScriptedReader::default().command("ip neigh show", Reply::Ok(NEIGH.into())));
    let poller = NeighborPoller::new(config(), reader, false);
    let published = Arc::new(AtomicUsize::new(0));
    let seen = published.clone();
    poller.subscribe(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    poller.start(Duration::from_millis(10));
    assert!(wait_until(|| published.load(Ordering::SeqCst) >= 1).await);
    poller.stop();
    let before = published.load(Ordering::SeqCst);
    poller.start(Duration::from_millis(10));
    assert!(wait_until(|| published.load(Ordering::SeqCst) > before).await);
    poller.shutdown().await;
}

#[tokio::test]
async fn failed_cycles_are_still_published_empty() {
    let reader = Arc::new(ScriptedReader::default());
    let poller = NeighborPoller::new(config(), reader, false);
    let sets: Arc<Mutex<Vec<Arc<DeviceSet>>>> = Arc::default();
    let sink = sets.clone();
    poller.subscribe(move |set| sink.lock().unwrap().push(set));

    poller.start(Duration::from_millis(10));
    assert!(wait_until(|| !sets.lock().unwrap().is_empty()).await);
    poller.shutdown().await;

    assert!(sets.lock().unwrap()[0].is_empty());
    assert_eq!(poller.state().last_error, Some(ErrorKind::SourceUnavailable));
}

#[tokio::test]
async fn auto_privilege_is_probed_once() {
    let reader = Arc::new(
        ScriptedReader::default()
            .command("su -c id -u", Reply::Ok("0\n".into()))
            .command("su -c ip neigh show", Reply::Ok(NEIGH.into())),
    );
    let cfg = PollerConfig {
        privilege: Privilege::Auto,
        ..PollerConfig::default()
    };
    let poller = NeighborPoller::build(cfg, reader.clone()).await;
    assert!(poller.privileged());

    poller.poll_once().await;
    poller.poll_once().await;
    assert_eq!(
        reader.calls(),
        vec!["su -c id -u", "su -c ip neigh show", "su -c ip neigh show"]
    );
}

#[tokio::test]
async fn auto_privilege_unavailable_when_probe_fails() {
    let reader = Arc::new(ScriptedReader::default().command("su -c id -u", Reply::Ok("1000\n".into())));
    let cfg = PollerConfig {
        privilege: Privilege::Auto,
        ..PollerConfig::default()
    };
    assert!(!NeighborPoller::build(cfg, reader).await.privileged());

    let reader = Arc::new(ScriptedReader::default());
    let cfg = PollerConfig {
        privilege: Privilege::Never,
        ..PollerConfig::default()
    };
    let poller = NeighborPoller::build(cfg, reader.clone()).await;
    assert!(!poller.privileged());
    assert!(reader.calls().is_empty());
}

/// Sleeps inside every command and records how many calls overlap.
#[derive(Default)]
struct SlowReader {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl SourceReader for SlowReader {
    async fn run_command(&self, _argv: &[String], _timeout: Duration) -> Result<String, SourceError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(NEIGH.into())
    }

    async fn read_file(&self, path: &Path, _timeout: Duration) -> Result<String, SourceError> {
        Err(SourceError::Read {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_waits_for_the_previous_cycle() {
    let reader = Arc::new(SlowReader::default());
    let poller = NeighborPoller::new(config(), reader.clone(), false);
    let published = Arc::new(AtomicUsize::new(0));
    let seen = published.clone();
    poller.subscribe(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    poller.start(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(50)).await;
    poller.stop();
    poller.start(Duration::from_millis(10));

    assert!(wait_until(|| published.load(Ordering::SeqCst) >= 1).await);
    poller.shutdown().await;
    assert_eq!(reader.peak.load(Ordering::SeqCst), 1);
}

/// Fails every source until `healthy` is set.
#[derive(Default)]
struct FlakyReader {
    healthy: AtomicBool,
}

#[async_trait]
impl SourceReader for FlakyReader {
    async fn run_command(&self, argv: &[String], _timeout: Duration) -> Result<String, SourceError> {
        if self.healthy.load(Ordering::SeqCst) {
            return Ok(NEIGH.into());
        }
        Err(SourceError::Exit {
            command: argv.join(" "),
            status: "exit status: 1".into(),
            stderr: String::new(),
        })
    }

    async fn read_file(&self, path: &Path, _timeout: Duration) -> Result<String, SourceError> {
        Err(SourceError::Read {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

fn gaps(stamps: &[Instant]) -> Vec<Duration> {
    stamps.windows(2).map(|w| w[1] - w[0]).collect()
}

fn near(actual: Duration, expected_ms: u64) -> bool {
    let expected = Duration::from_millis(expected_ms);
    actual >= expected && actual < expected + Duration::from_millis(20)
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_grows_on_failure_and_resets() {
    let reader = Arc::new(FlakyReader::default());
    let cfg = PollerConfig {
        backoff: Backoff::Exponential { max_ms: 1_000 },
        ..config()
    };
    let poller = NeighborPoller::new(cfg, reader.clone(), false);
    let stamps: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let sink = stamps.clone();
    poller.subscribe(move |_| sink.lock().unwrap().push(Instant::now()));

    poller.start(Duration::from_millis(100));
    assert!(wait_until(|| stamps.lock().unwrap().len() >= 4).await);
    let failing = gaps(&stamps.lock().unwrap()[..4]);
    assert!(near(failing[0], 200), "{failing:?}");
    assert!(near(failing[1], 400), "{failing:?}");
    assert!(near(failing[2], 800), "{failing:?}");

    reader.healthy.store(true, Ordering::SeqCst);
    let before = stamps.lock().unwrap().len();
    assert!(wait_until(|| stamps.lock().unwrap().len() >= before + 3).await);
    poller.shutdown().await;

    let all = stamps.lock().unwrap().clone();
    let recovered = gaps(&all[before..before + 3]);
    assert!(recovered.iter().all(|g| near(*g, 100)), "{recovered:?}");
    assert_eq!(poller.state().last_error, None);
}

#[tokio::test]
async fn panicking_subscriber_leaves_poller_restartable() {
    let reader = Arc::new(ScriptedReader::default().command("ip neigh show", Reply::Ok(NEIGH.into())));
    let poller = NeighborPoller::new(config(), reader, false);
    let panicked = Arc::new(AtomicBool::new(false));
    let published = Arc::new(AtomicUsize::new(0));
    let (flag, seen) = (panicked.clone(), published.clone());
    poller.subscribe(move |_| {
        if !flag.swap(true, Ordering::SeqCst) {
            panic!("subscriber failure");
        }
        seen.fetch_add(1, Ordering::SeqCst);
    });

    poller.start(Duration::from_millis(10));
    assert!(wait_until(|| panicked.load(Ordering::SeqCst) && !poller.is_running()).await);

    poller.start(Duration::from_millis(10));
    assert!(poller.is_running());
    assert!(wait_until(|| published.load(Ordering::SeqCst) >= 1).await);
    poller.shutdown().await;
}

#[tokio::test]
async fn huge_interval_saturates_reported_millis() {
    let reader = Arc::new(ScriptedReader::default().command("ip neigh show", Reply::Ok(NEIGH.into())));
    let poller = NeighborPoller::new(config(), reader, false);

    poller.start(Duration::MAX);
    assert_eq!(poller.state().interval_ms, u64::MAX);
    poller.shutdown().await;
    assert!(!poller.state().running);
}
