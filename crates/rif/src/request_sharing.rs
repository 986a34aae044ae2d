use {
    futures::{
        FutureExt,
        future::{BoxFuture, Shared, WeakShared},
    },
    prometheus::{
        IntCounterVec,
        core::{AtomicU64, GenericGauge},
    },
    std::{
        collections::HashMap,
        future::Future,
        hash::Hash,
        sync::Mutex,
    },
};

/// Lets callers asking for the same key while a computation for it is
/// running join that computation instead of starting their own.
///
/// Entries are weak: once the last caller stops awaiting, the computation is
/// dropped and a later caller starts a fresh one.
pub struct RequestSharing<Key, Fut: Future> {
    pending: Mutex<HashMap<Key, WeakShared<Fut>>>,
    label: String,
}

pub type BoxRequestSharing<Key, Output> = RequestSharing<Key, BoxFuture<'static, Output>>;

impl<Key, Fut: Future> RequestSharing<Key, Fut> {
    /// `label` tells the metrics of different users apart.
    pub fn labelled(label: String) -> Self {
        Self {
            pending: Default::default(),
            label,
        }
    }

    /// Tracked keys, finished ones included until [`Self::collect_garbage`]
    /// runs.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops keys whose computation has no awaiting caller left.
    pub fn collect_garbage(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, computation| computation.upgrade().is_some());
        Metrics::get().in_flight_requests.set(pending.len() as u64);
    }
}

impl<Key, Fut> RequestSharing<Key, Fut>
where
    Key: Eq + Hash,
    Fut: Future,
    Fut::Output: Clone,
{
    /// Joins the running computation for `key`, or starts one with `start`.
    pub fn shared_or_else<F>(&self, key: Key, start: F) -> Shared<Fut>
    where
        F: FnOnce(&Key) -> Fut,
    {
        let mut pending = self.pending.lock().unwrap();
        let metrics = Metrics::get();

        if let Some(running) = pending.get(&key).and_then(WeakShared::upgrade) {
            metrics.access(&self.label, "joined");
            return running;
        }
        metrics.access(&self.label, "started");

        let computation = start(&key).shared();
        // A future that was never polled always has a weak handle.
        if let Some(weak) = computation.downgrade() {
            pending.insert(key, weak);
        }
        metrics.in_flight_requests.set(pending.len() as u64);
        computation
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Calls that joined a running computation or started a new one.
    #[metric(labels("label", "result"))]
    request_sharing_access: IntCounterVec,

    /// Keys currently tracked for sharing.
    in_flight_requests: GenericGauge<AtomicU64>,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }

    fn access(&self, label: &str, result: &str) {
        self.request_sharing_access
            .with_label_values(&[label, result])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::identifier::{Identifier, Kind},
        std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    fn rif(number: u32) -> Identifier {
        Identifier::with_number(Kind::J, number).unwrap()
    }

    #[tokio::test]
    async fn callers_join_running_computation() {
        let sharing: BoxRequestSharing<Identifier, bool> = RequestSharing::labelled("test".into());
        let started = Arc::new(AtomicUsize::new(0));
        let start = |_: &Identifier| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                true
            }
            .boxed()
        };

        let first = sharing.shared_or_else(rif(1), start);
        let second = sharing.shared_or_else(rif(1), start);
        assert!(first.ptr_eq(&second));
        assert_eq!(sharing.len(), 1);

        assert!(first.await);
        // The second caller still holds the computation.
        sharing.collect_garbage();
        assert_eq!(sharing.len(), 1);

        assert!(second.await);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        sharing.collect_garbage();
        assert!(sharing.is_empty());
    }

    #[tokio::test]
    async fn abandoned_computation_is_restarted() {
        let sharing: BoxRequestSharing<Identifier, u32> = RequestSharing::labelled("test".into());

        drop(sharing.shared_or_else(rif(1), |_| futures::future::pending().boxed()));
        let fresh = sharing.shared_or_else(rif(1), |_| futures::future::ready(7).boxed());
        assert_eq!(fresh.await, 7);

        let other = sharing.shared_or_else(rif(2), |_| futures::future::ready(8).boxed());
        assert_eq!(other.await, 8);
    }
}
