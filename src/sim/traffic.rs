use super::{ClusterShared, RaftCluster, RecordedChanges};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Fires a freshly generated change id at the cluster on a fixed period,
/// the way a stream of independent clients would. Stops when dropped.
pub struct TrafficGenerator {
    task: JoinHandle<()>,
    generated: Arc<Mutex<Vec<Uuid>>>,
}

impl TrafficGenerator {
    pub fn start(cluster: &RaftCluster<RecordedChanges>, period: Duration) -> Self {
        let shared = cluster.shared.clone();
        let generated = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(generate(shared, generated.clone(), period));
        Self { task, generated }
    }

    /// Every change id generated so far, in generation order.
    pub fn generated(&self) -> Vec<Uuid> {
        self.generated.lock().unwrap().clone()
    }
}

impl Drop for TrafficGenerator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn generate(
    shared: Arc<ClusterShared<RecordedChanges>>,
    generated: Arc<Mutex<Vec<Uuid>>>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let change = Uuid::new_v4();
        generated.lock().unwrap().push(change);
        let shared = shared.clone();
        // Proposals can block on commit; each one runs on its own task so
        // the generator keeps its cadence.
        tokio::spawn(async move {
            shared.try_change(change).await;
        });
    }
}
