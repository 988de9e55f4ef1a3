//! The common topology contract and tiered aggregation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::Result;

/// Anything that can be started, stopped and asked for its ports: a
/// single process, a replication group, a sentinel setup or a cluster.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Brings every member up. Returns once all members are ready.
    async fn start(&self) -> Result<()>;

    /// Brings every member down. Stopping a stopped topology is a no-op.
    async fn stop(&self) -> Result<()>;

    /// `true` only if every member is running.
    fn is_active(&self) -> bool;

    /// Every port the topology's processes listen on.
    fn ports(&self) -> Vec<u16>;
}

/// Runs all futures, then returns the first error (if any).
async fn settle<I>(futures: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<()>>,
{
    join_all(futures).await.into_iter().collect()
}

/// A named group of members handled concurrently.
#[derive(Clone)]
pub struct Tier {
    name: String,
    members: Vec<Arc<dyn Topology>>,
}

impl Tier {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[Arc<dyn Topology>] {
        &self.members
    }
}

impl fmt::Debug for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tier")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .finish()
    }
}

/// Ordered tiers of topologies.
///
/// Members of a tier start and stop concurrently. Tiers start in
/// declaration order and stop in reverse, so dependencies added first
/// come up first and go down last.
#[derive(Debug, Clone, Default)]
pub struct AggregateTopology {
    tiers: Vec<Tier>,
}

impl AggregateTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a tier.
    pub fn with_tier(mut self, name: impl Into<String>, members: Vec<Arc<dyn Topology>>) -> Self {
        self.tiers.push(Tier {
            name: name.into(),
            members,
        });
        self
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Every member across tiers, in tier order.
    pub fn members(&self) -> impl Iterator<Item = &Arc<dyn Topology>> {
        self.tiers.iter().flat_map(|t| t.members.iter())
    }

    /// `(tier, active, ports)` per member.
    pub fn status(&self) -> Vec<(String, bool, Vec<u16>)> {
        self.tiers
            .iter()
            .flat_map(|t| {
                t.members
                    .iter()
                    .map(|m| (t.name.clone(), m.is_active(), m.ports()))
            })
            .collect()
    }
}

#[async_trait]
impl Topology for AggregateTopology {
    /// Stops at the first tier with a failing member. Every member of that
    /// tier is still awaited, and earlier tiers are left running.
    async fn start(&self) -> Result<()> {
        for tier in &self.tiers {
            info!(tier = %tier.name, members = tier.members.len(), "starting tier");
            let starts: Vec<_> = tier.members.iter().map(|m| m.start()).collect();
            settle(starts).await?;
        }
        Ok(())
    }

    /// Attempts every member of every tier, then reports the first error.
    async fn stop(&self) -> Result<()> {
        let mut first_err = None;
        for tier in self.tiers.iter().rev() {
            info!(tier = %tier.name, members = tier.members.len(), "stopping tier");
            let stops: Vec<_> = tier.members.iter().map(|m| m.stop()).collect();
            if let Err(e) = settle(stops).await {
                warn!(tier = %tier.name, error = %e, "tier did not stop cleanly");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn is_active(&self) -> bool {
        self.members().all(|m| m.is_active())
    }

    fn ports(&self) -> Vec<u16> {
        self.members().flat_map(|m| m.ports()).collect()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{FakeTopology, Recorder, members};
    use super::*;

    fn tiered(recorder: &Arc<Recorder>) -> (AggregateTopology, Vec<Arc<FakeTopology>>) {
        let s1 = FakeTopology::new("sentinel-1", 26379, recorder);
        let s2 = FakeTopology::new("sentinel-2", 26380, recorder);
        let r1 = FakeTopology::new("server-1", 6379, recorder);
        let r2 = FakeTopology::new("server-2", 6380, recorder);
        let aggregate = AggregateTopology::new()
            .with_tier("sentinels", members(&[&s1, &s2]))
            .with_tier("servers", members(&[&r1, &r2]));
        (aggregate, vec![s1, s2, r1, r2])
    }

    #[tokio::test]
    async fn every_member_started_and_stopped_once() {
        let recorder = Arc::new(Recorder::default());
        let (aggregate, fakes) = tiered(&recorder);

        aggregate.start().await.unwrap();
        assert!(aggregate.is_active());
        aggregate.stop().await.unwrap();
        assert!(!aggregate.is_active());

        for m in &fakes {
            assert_eq!(m.starts.load(Ordering::SeqCst), 1, "{}", m.name);
            assert_eq!(m.stops.load(Ordering::SeqCst), 1, "{}", m.name);
        }
    }

    #[tokio::test]
    async fn tiers_start_in_order_and_stop_in_reverse() {
        let recorder = Arc::new(Recorder::default());
        let (aggregate, _) = tiered(&recorder);

        aggregate.start().await.unwrap();
        aggregate.stop().await.unwrap();

        let events = recorder.events();
        let pos = |e: &str| events.iter().position(|x| x == e).unwrap();
        assert!(pos("start sentinel-1") < pos("start server-1"));
        assert!(pos("start sentinel-2") < pos("start server-2"));
        assert!(pos("stop server-1") < pos("stop sentinel-1"));
        assert!(pos("stop server-2") < pos("stop sentinel-2"));
    }

    #[tokio::test]
    async fn ports_concatenate_in_tier_order() {
        let recorder = Arc::new(Recorder::default());
        let (aggregate, _) = tiered(&recorder);
        assert_eq!(aggregate.ports(), vec![26379, 26380, 6379, 6380]);
    }

    #[tokio::test]
    async fn failed_start_skips_later_tiers() {
        let recorder = Arc::new(Recorder::default());
        let bad = FakeTopology::failing("sentinel-bad", 26379, &recorder, true, false);
        let ok = FakeTopology::new("sentinel-ok", 26380, &recorder);
        let server = FakeTopology::new("server", 6379, &recorder);
        let aggregate = AggregateTopology::new()
            .with_tier("sentinels", members(&[&bad, &ok]))
            .with_tier("servers", members(&[&server]));

        assert!(aggregate.start().await.is_err());
        // The sibling in the failing tier still ran to completion.
        assert!(ok.is_active());
        assert_eq!(server.starts.load(Ordering::SeqCst), 0);
        assert!(!aggregate.is_active());
    }

    #[tokio::test]
    async fn stop_attempts_everything_and_reports_first_error() {
        let recorder = Arc::new(Recorder::default());
        let stuck = FakeTopology::failing("server-stuck", 6379, &recorder, false, true);
        let other = FakeTopology::new("server-ok", 6380, &recorder);
        let sentinel = FakeTopology::new("sentinel", 26379, &recorder);
        let aggregate = AggregateTopology::new()
            .with_tier("sentinels", members(&[&sentinel]))
            .with_tier("servers", members(&[&stuck, &other]));

        aggregate.start().await.unwrap();
        let err = aggregate.stop().await.unwrap_err();
        assert!(err.to_string().contains("server-stuck"));
        assert_eq!(other.stops.load(Ordering::SeqCst), 1);
        assert_eq!(sentinel.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_reports_every_member() {
        let recorder = Arc::new(Recorder::default());
        let (aggregate, _) = tiered(&recorder);
        aggregate.start().await.unwrap();

        let status = aggregate.status();
        assert_eq!(status.len(), 4);
        assert_eq!(status[0], ("sentinels".to_string(), true, vec![26379]));
        assert_eq!(status[3], ("servers".to_string(), true, vec![6380]));
    }
}
