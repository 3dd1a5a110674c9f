//! Admission pipeline: decides whether an accepted connection may proceed.
//!
//! Checks run in order and stop at the first decisive outcome:
//!
//! ```text
//! allow list ──hit──▶ admit
//! deny list  ──hit──▶ reject
//! concurrency ─full─▶ reject (no ban)
//! rate window ─over─▶ ban + reject
//! block lists ─hit──▶ reject (no ban)
//! country     ─hit──▶ reject (no ban)
//! ESC probe   ──────▶ admit | reject | ban + reject
//! ```
//!
//! The rate and ban checks fail closed. DNS failures and probe timeouts or
//! transport errors fail open.

pub mod probe;
pub mod rate_limit;

pub use probe::{run_probe, ProbeOutcome, ProbeSettings};
pub use rate_limit::AttemptTracker;

use crate::config::BlockingConfig;
use crate::reputation::{DnsblResolver, ReputationStore, UNKNOWN_COUNTRY};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Sent to every caller that is turned away.
pub const BUSY_TOKEN: &[u8] = b"BUSY\r\n";

/// Why a connection was let through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitReason {
    /// Source address is on the allow list.
    Allowed,
    /// Every check passed and no probe was configured.
    Passed,
    /// The caller pressed ESC twice.
    Escaped,
    /// The probe ran out of time without a decision.
    ProbeTimeout,
    /// A socket error interrupted the probe.
    TransportError(String),
}

/// Why a connection was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Source address is on the deny list.
    Denied,
    /// Too many connections inside the ban window; the address was banned.
    RateLimited { attempts: usize },
    /// Listed on a DNS block list.
    Blacklisted { server: String },
    /// Resolved to a banned country.
    GeoBanned { country: u16 },
    /// Typed a scanner word during the probe; the address was banned.
    ProbeBanned { word: String },
    /// Hung up during the probe.
    ProbeClosed,
    /// Too many callers already in admission on this listener.
    Saturated { limit: usize },
}

impl RejectReason {
    /// Whether this rejection added the address to the deny list.
    pub fn bans(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ProbeBanned { .. })
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied => write!(f, "on deny list"),
            Self::RateLimited { attempts } => write!(f, "auto-banned after {attempts} connections"),
            Self::Blacklisted { server } => write!(f, "listed on {server}"),
            Self::GeoBanned { country } => write!(f, "country {country} is blocked"),
            Self::ProbeBanned { word } => write!(f, "banned for sending '{word}'"),
            Self::ProbeClosed => write!(f, "disconnected during ESC prompt"),
            Self::Saturated { limit } => write!(f, "{limit} callers already connecting"),
        }
    }
}

/// Result of evaluating one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit(AdmitReason),
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit(_))
    }
}

/// Runs the admission checks for one listener.
///
/// The attempt map has its own lock, separate from the node pool.
pub struct AdmissionPipeline {
    config: BlockingConfig,
    reputation: Arc<ReputationStore>,
    resolver: DnsblResolver,
    attempts: Mutex<AttemptTracker>,
    in_admission: Arc<AtomicUsize>,
    probe: ProbeSettings,
}

impl AdmissionPipeline {
    pub fn new(
        config: BlockingConfig,
        reputation: Arc<ReputationStore>,
        resolver: DnsblResolver,
    ) -> Self {
        let attempts = Mutex::new(AttemptTracker::new(config.ban_window_secs));
        Self {
            config,
            reputation,
            resolver,
            attempts,
            in_admission: Arc::new(AtomicUsize::new(0)),
            probe: ProbeSettings::default(),
        }
    }

    /// Override probe timing.
    pub fn with_probe_settings(mut self, probe: ProbeSettings) -> Self {
        self.probe = probe;
        self
    }

    pub fn reputation(&self) -> &Arc<ReputationStore> {
        &self.reputation
    }

    /// Callers currently between the deny check and a verdict.
    pub fn in_admission(&self) -> usize {
        self.in_admission.load(Ordering::Acquire)
    }

    /// Evaluate a connection from `ip`. When `probe` is set and the static
    /// checks pass, the ESC probe runs on `stream`.
    ///
    /// Bans are recorded here; writing the busy token is left to the caller.
    pub async fn evaluate<S>(&self, stream: &mut S, ip: &str, probe: bool) -> Verdict
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.config.use_good_ip && self.reputation.is_allowed(ip) {
            debug!(ip, "allow-listed");
            return Verdict::Admit(AdmitReason::Allowed);
        }

        if self.config.use_bad_ip && self.reputation.is_denied(ip) {
            return Verdict::Reject(RejectReason::Denied);
        }

        let limit = self.config.max_concurrent as usize;
        let Some(_slot) = AdmissionSlot::acquire(&self.in_admission, limit) else {
            debug!(ip, limit, "admission saturated");
            return Verdict::Reject(RejectReason::Saturated { limit });
        };

        if let Some(attempts) = self.over_rate_limit(ip) {
            self.ban(ip);
            return Verdict::Reject(RejectReason::RateLimited { attempts });
        }

        if self.config.use_dnsrbl {
            if let Some(server) = self.resolver.listed_on(ip, &self.config.dnsrbl_servers).await {
                return Verdict::Reject(RejectReason::Blacklisted { server });
            }
        }

        if let Some(country) = self.banned_country(ip).await {
            return Verdict::Reject(RejectReason::GeoBanned { country });
        }

        if !probe {
            return Verdict::Admit(AdmitReason::Passed);
        }

        match run_probe(stream, &self.probe).await {
            ProbeOutcome::Escaped => Verdict::Admit(AdmitReason::Escaped),
            ProbeOutcome::TimedOut => Verdict::Admit(AdmitReason::ProbeTimeout),
            ProbeOutcome::TransportError(e) => {
                warn!(ip, error = %e, "transport error during probe, admitting");
                Verdict::Admit(AdmitReason::TransportError(e))
            }
            ProbeOutcome::Closed => Verdict::Reject(RejectReason::ProbeClosed),
            ProbeOutcome::Banned(word) => {
                self.ban(ip);
                Verdict::Reject(RejectReason::ProbeBanned { word })
            }
        }
    }

    /// Record this attempt; `Some(count)` when it exceeds the threshold.
    fn over_rate_limit(&self, ip: &str) -> Option<usize> {
        if !self.config.auto_ban
            || self.config.ban_window_secs == 0
            || self.config.ban_sessions == 0
        {
            return None;
        }
        let count = self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(ip);
        (count > self.config.ban_sessions as usize).then_some(count)
    }

    async fn banned_country(&self, ip: &str) -> Option<u16> {
        let server = self.config.dnscc_server.as_deref()?;
        if self.config.banned_countries.is_empty() {
            return None;
        }
        let country = self.resolver.country_code(ip, server).await;
        (country != UNKNOWN_COUNTRY && self.config.banned_countries.contains(&country))
            .then_some(country)
    }

    fn ban(&self, ip: &str) {
        if self.reputation.deny(ip) {
            info!(ip, "address added to deny list");
        } else {
            warn!(ip, "ban kept in memory only");
        }
    }
}

/// One caller's place in admission; released on drop.
struct AdmissionSlot(Arc<AtomicUsize>);

impl AdmissionSlot {
    /// Take a slot if fewer than `limit` are held. A zero limit always
    /// succeeds.
    fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (limit == 0 || held < limit).then_some(held + 1)
            })
            .ok()
            .map(|_| Self(counter.clone()))
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Send the busy token and close the write side. Errors are ignored: the
/// caller is being dropped either way.
pub async fn send_busy<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_all(BUSY_TOKEN).await {
        debug!(error = %e, "busy token not delivered");
        return;
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::probe::ESCAPE;
    use super::*;
    use crate::reputation::DnsLookup;
    use std::future::Future;
    use std::io;
    use std::net::Ipv4Addr;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    /// Answers every query with one fixed address, or fails for all.
    struct FixedLookup(Option<Ipv4Addr>);

    impl DnsLookup for FixedLookup {
        fn lookup_ipv4<'a>(
            &'a self,
            _name: &'a str,
        ) -> Pin<Box<dyn Future<Output = io::Result<Vec<Ipv4Addr>>> + Send + 'a>> {
            let answer = self.0;
            Box::pin(async move {
                answer
                    .map(|a| vec![a])
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "NXDOMAIN"))
            })
        }
    }

    fn blocking() -> BlockingConfig {
        BlockingConfig {
            use_dnsrbl: false,
            dnsrbl_servers: Vec::new(),
            ..BlockingConfig::default()
        }
    }

    fn pipeline(
        config: BlockingConfig,
        store: ReputationStore,
        dns: Option<Ipv4Addr>,
    ) -> AdmissionPipeline {
        AdmissionPipeline::new(
            config,
            Arc::new(store),
            DnsblResolver::new(Arc::new(FixedLookup(dns))),
        )
        .with_probe_settings(ProbeSettings {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
        })
    }

    async fn evaluate(p: &AdmissionPipeline, ip: &str, probe: bool) -> Verdict {
        let (mut server, _client) = duplex(4096);
        p.evaluate(&mut server, ip, probe).await
    }

    #[tokio::test]
    async fn test_allow_overrides_deny() {
        let store = ReputationStore::from_lists(["10.0.0.1"], ["10.0.0.1"], None);
        let config = BlockingConfig {
            auto_ban: true,
            ban_sessions: 1,
            ban_window_secs: 60,
            ..blocking()
        };
        let p = pipeline(config, store, Some(Ipv4Addr::new(127, 0, 0, 2)));
        for _ in 0..5 {
            assert_eq!(
                evaluate(&p, "10.0.0.1", true).await,
                Verdict::Admit(AdmitReason::Allowed)
            );
        }
    }

    #[tokio::test]
    async fn test_deny_list_rejects() {
        let store = ReputationStore::from_lists(Vec::<&str>::new(), ["6.6.6.6"], None);
        let p = pipeline(blocking(), store, None);
        assert_eq!(
            evaluate(&p, "6.6.6.6", false).await,
            Verdict::Reject(RejectReason::Denied)
        );
        assert!(evaluate(&p, "7.7.7.7", false).await.is_admit());
    }

    #[tokio::test]
    async fn test_lists_can_be_disabled() {
        let store = ReputationStore::from_lists(Vec::<&str>::new(), ["6.6.6.6"], None);
        let config = BlockingConfig {
            use_bad_ip: false,
            ..blocking()
        };
        let p = pipeline(config, store, None);
        assert!(evaluate(&p, "6.6.6.6", false).await.is_admit());
    }

    #[tokio::test]
    async fn test_rate_ban_on_fourth_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("BADIP.TXT");
        let store = ReputationStore::load(None, Some(&bad));
        let config = BlockingConfig {
            auto_ban: true,
            ban_sessions: 3,
            ban_window_secs: 60,
            ..blocking()
        };
        let p = pipeline(config, store, None);

        for _ in 0..3 {
            assert!(evaluate(&p, "1.2.3.4", false).await.is_admit());
        }
        let verdict = evaluate(&p, "1.2.3.4", false).await;
        assert_eq!(
            verdict,
            Verdict::Reject(RejectReason::RateLimited { attempts: 4 })
        );
        assert!(p.reputation().is_denied("1.2.3.4"));
        assert_eq!(std::fs::read_to_string(&bad).unwrap(), "1.2.3.4\n");

        // Later attempts hit the deny list directly.
        assert_eq!(
            evaluate(&p, "1.2.3.4", false).await,
            Verdict::Reject(RejectReason::Denied)
        );
        assert!(evaluate(&p, "4.3.2.1", false).await.is_admit());
    }

    #[tokio::test]
    async fn test_rate_ban_disabled_without_threshold() {
        let config = BlockingConfig {
            auto_ban: true,
            ban_sessions: 0,
            ban_window_secs: 60,
            ..blocking()
        };
        let p = pipeline(config, ReputationStore::empty(), None);
        for _ in 0..10 {
            assert!(evaluate(&p, "1.2.3.4", false).await.is_admit());
        }
    }

    #[tokio::test]
    async fn test_blacklist_rejects_without_ban() {
        let config = BlockingConfig {
            use_dnsrbl: true,
            dnsrbl_servers: vec!["bl.example".into()],
            ..blocking()
        };
        let p = pipeline(config, ReputationStore::empty(), Some(Ipv4Addr::new(127, 0, 0, 2)));
        let verdict = evaluate(&p, "1.2.3.4", false).await;
        assert_eq!(
            verdict,
            Verdict::Reject(RejectReason::Blacklisted {
                server: "bl.example".into()
            })
        );
        assert!(!p.reputation().is_denied("1.2.3.4"));
    }

    #[tokio::test]
    async fn test_blacklist_lookup_failure_admits() {
        let config = BlockingConfig {
            use_dnsrbl: true,
            dnsrbl_servers: vec!["bl.example".into()],
            ..blocking()
        };
        let p = pipeline(config, ReputationStore::empty(), None);
        assert!(evaluate(&p, "1.2.3.4", false).await.is_admit());
    }

    #[tokio::test]
    async fn test_geo_ban() {
        // 156 = 0x009c
        let config = BlockingConfig {
            dnscc_server: Some("cc.example".into()),
            banned_countries: vec![156],
            ..blocking()
        };
        let p = pipeline(
            config.clone(),
            ReputationStore::empty(),
            Some(Ipv4Addr::new(127, 0, 0, 156)),
        );
        assert_eq!(
            evaluate(&p, "1.2.3.4", false).await,
            Verdict::Reject(RejectReason::GeoBanned { country: 156 })
        );

        let other = pipeline(
            config,
            ReputationStore::empty(),
            Some(Ipv4Addr::new(127, 0, 3, 72)),
        );
        assert!(evaluate(&other, "1.2.3.4", false).await.is_admit());
    }

    #[tokio::test]
    async fn test_unknown_country_never_banned() {
        let config = BlockingConfig {
            dnscc_server: Some("cc.example".into()),
            banned_countries: vec![0, 156],
            ..blocking()
        };
        let p = pipeline(config, ReputationStore::empty(), None);
        assert!(evaluate(&p, "1.2.3.4", false).await.is_admit());
    }

    #[tokio::test]
    async fn test_probe_escape_admits() {
        let p = pipeline(blocking(), ReputationStore::empty(), None);
        let (mut server, mut client) = duplex(4096);
        client.write_all(&[ESCAPE, ESCAPE]).await.unwrap();
        assert_eq!(
            p.evaluate(&mut server, "1.2.3.4", true).await,
            Verdict::Admit(AdmitReason::Escaped)
        );
    }

    #[tokio::test]
    async fn test_probe_word_bans() {
        let p = pipeline(blocking(), ReputationStore::empty(), None);
        let (mut server, mut client) = duplex(4096);
        client.write_all(b"login: root").await.unwrap();
        let verdict = p.evaluate(&mut server, "1.2.3.4", true).await;
        assert_eq!(
            verdict,
            Verdict::Reject(RejectReason::ProbeBanned {
                word: "root".into()
            })
        );
        assert!(p.reputation().is_denied("1.2.3.4"));
        if let Verdict::Reject(reason) = verdict {
            assert!(reason.bans());
        }
    }

    #[tokio::test]
    async fn test_probe_timeout_admits() {
        let p = pipeline(blocking(), ReputationStore::empty(), None);
        assert_eq!(
            evaluate(&p, "1.2.3.4", true).await,
            Verdict::Admit(AdmitReason::ProbeTimeout)
        );
    }

    #[tokio::test]
    async fn test_saturated_admission_rejects_without_ban() {
        let config = BlockingConfig {
            max_concurrent: 1,
            ..blocking()
        };
        let p = Arc::new(pipeline(config, ReputationStore::empty(), None));

        let first = {
            let p = p.clone();
            tokio::spawn(async move { evaluate(&p, "1.1.1.1", true).await })
        };
        // Wait until the first caller sits in the ESC prompt.
        while p.in_admission() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let verdict = evaluate(&p, "2.2.2.2", true).await;
        assert_eq!(verdict, Verdict::Reject(RejectReason::Saturated { limit: 1 }));
        if let Verdict::Reject(reason) = &verdict {
            assert!(!reason.bans());
        }
        assert!(!p.reputation().is_denied("2.2.2.2"));

        assert_eq!(
            first.await.unwrap(),
            Verdict::Admit(AdmitReason::ProbeTimeout)
        );
        assert_eq!(p.in_admission(), 0);
        assert!(evaluate(&p, "2.2.2.2", false).await.is_admit());
    }

    #[tokio::test]
    async fn test_slot_released_on_rejection() {
        let config = BlockingConfig {
            max_concurrent: 1,
            use_dnsrbl: true,
            dnsrbl_servers: vec!["bl.example".into()],
            ..blocking()
        };
        let p = pipeline(
            config,
            ReputationStore::empty(),
            Some(Ipv4Addr::new(127, 0, 0, 2)),
        );
        for _ in 0..3 {
            assert!(matches!(
                evaluate(&p, "1.2.3.4", false).await,
                Verdict::Reject(RejectReason::Blacklisted { .. })
            ));
        }
        assert_eq!(p.in_admission(), 0);
    }

    #[tokio::test]
    async fn test_send_busy() {
        let (mut server, mut client) = duplex(64);
        send_busy(&mut server).await;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, BUSY_TOKEN);
    }
}
