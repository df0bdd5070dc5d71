//! Broadcast Collector
//!
//! A discovery session gathers the I-Am announcements that arrive while its
//! window is open. Announcements are deduplicated by device instance: a later
//! announcement for the same instance replaces the earlier one, so an address
//! change is reflected rather than duplicated. Sessions are independent; one
//! announcement may be folded into several open sessions.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::future::{Binding, Completer, ServiceFuture};
use crate::types::DeviceAnnouncement;

/// Inclusive instance range a session accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceRange {
    pub low: u32,
    pub high: u32,
}

impl InstanceRange {
    pub fn new(low: u32, high: u32) -> Self {
        Self {
            low: low.min(high),
            high: low.max(high),
        }
    }

    pub fn contains(&self, instance: u32) -> bool {
        (self.low..=self.high).contains(&instance)
    }
}

struct Session {
    deadline: Instant,
    range: Option<InstanceRange>,
    found: Vec<DeviceAnnouncement>,
    completer: Completer<Vec<DeviceAnnouncement>>,
    closer: Option<AbortHandle>,
}

impl Session {
    fn accepts(&self, announcement: &DeviceAnnouncement, now: Instant) -> bool {
        now < self.deadline
            && self
                .range
                .is_none_or(|range| range.contains(announcement.instance()))
    }

    fn fold(&mut self, announcement: &DeviceAnnouncement) {
        match self
            .found
            .iter_mut()
            .find(|known| known.instance() == announcement.instance())
        {
            Some(known) => *known = announcement.clone(),
            None => self.found.push(announcement.clone()),
        }
    }
}

/// Open discovery sessions
pub struct BroadcastCollector {
    sessions: Arc<DashMap<Uuid, Session>>,
    runtime: Handle,
}

impl BroadcastCollector {
    pub fn new(runtime: Handle) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            runtime,
        }
    }

    /// Open a session for `window`. The returned future resolves with the
    /// accumulated announcements once the window elapses or the session is
    /// stopped.
    pub fn start(&self, window: Duration, range: Option<InstanceRange>) -> ServiceFuture<Vec<DeviceAnnouncement>> {
        let id = Uuid::new_v4();
        let deadline = Instant::now() + window;
        let (future, completer) = ServiceFuture::pending();

        self.sessions.insert(
            id,
            Session {
                deadline,
                range,
                found: Vec::new(),
                completer,
                closer: None,
            },
        );

        let sessions = Arc::downgrade(&self.sessions);
        let closer = self
            .runtime
            .spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(sessions) = sessions.upgrade() {
                    close(&sessions, id, "window elapsed");
                }
            })
            .abort_handle();

        match self.sessions.get_mut(&id) {
            Some(mut session) => session.closer = Some(closer),
            None => closer.abort(),
        }

        debug!(session = %id, ?window, ?range, "Discovery session opened");
        future.bound(Binding::Discovery(id))
    }

    /// Fold `announcement` into every open session that accepts it.
    ///
    /// Returns `true` if at least one session took it.
    pub fn offer(&self, announcement: &DeviceAnnouncement) -> bool {
        let now = Instant::now();
        let mut taken = false;
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.accepts(announcement, now) {
                session.fold(announcement);
                taken = true;
            }
        }
        taken
    }

    /// Close a session early with what it has gathered so far
    pub fn stop(&self, id: Uuid) -> bool {
        close(&self.sessions, id, "stopped")
    }

    /// Close every open session
    pub fn stop_all(&self) {
        let ids: Vec<Uuid> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            close(&self.sessions, id, "shutdown");
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// Remove the session and deliver its set. The map shard is released before
/// the completer runs continuations.
fn close(sessions: &DashMap<Uuid, Session>, id: Uuid, why: &str) -> bool {
    let Some((_, mut session)) = sessions.remove(&id) else {
        return false;
    };
    if let Some(closer) = session.closer.take() {
        closer.abort();
    }
    info!(
        session = %id,
        devices = session.found.len(),
        "Discovery session closed ({})",
        why
    );
    session.completer.complete(Ok(session.found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureState;
    use crate::types::{DeviceAddress, IAm, ObjectId, Segmentation};

    fn announcement(instance: u32, port: u16) -> DeviceAnnouncement {
        DeviceAnnouncement::new(
            DeviceAddress::local(([10, 0, 0, 2], port).into()),
            IAm {
                device: ObjectId::device(instance),
                max_apdu: 1476,
                segmentation: Segmentation::None,
                vendor_id: 15,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_excludes_late_announcements() {
        let collector = BroadcastCollector::new(Handle::current());
        let session = collector.start(Duration::from_secs(2), None);

        for instance in [1, 2, 3] {
            assert!(collector.offer(&announcement(instance, 47808)));
        }
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(!collector.offer(&announcement(4, 47808)));

        let found = session.resolved().await.unwrap();
        let mut instances: Vec<u32> = found.iter().map(|a| a.instance()).collect();
        instances.sort();
        assert_eq!(instances, vec![1, 2, 3]);
        assert_eq!(collector.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_instance_keeps_latest_address() {
        let collector = BroadcastCollector::new(Handle::current());
        let session = collector.start(Duration::from_secs(2), None);

        collector.offer(&announcement(42, 47808));
        collector.offer(&announcement(42, 47809));

        let found = session.resolved().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address.link.port(), 47809);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_independent() {
        let collector = BroadcastCollector::new(Handle::current());
        let wide = collector.start(Duration::from_secs(5), None);
        let narrow = collector.start(Duration::from_secs(1), Some(InstanceRange::new(100, 200)));

        collector.offer(&announcement(7, 1));
        collector.offer(&announcement(150, 1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        collector.offer(&announcement(160, 1));

        let narrow = narrow.resolved().await.unwrap();
        assert_eq!(narrow.iter().map(|a| a.instance()).collect::<Vec<_>>(), vec![150]);
        assert_eq!(wide.state(), FutureState::Pending);

        let wide = wide.resolved().await.unwrap();
        assert_eq!(wide.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_delivers_partial_set() {
        let collector = BroadcastCollector::new(Handle::current());
        let session = collector.start(Duration::from_secs(60), None);
        collector.offer(&announcement(9, 1));

        let Some(Binding::Discovery(id)) = session.binding().cloned() else {
            panic!("session future must be bound");
        };
        assert!(collector.stop(id));
        assert!(!collector.stop(id));
        assert_eq!(session.try_result().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_range_is_normalised() {
        let range = InstanceRange::new(20, 10);
        assert!(range.contains(10) && range.contains(20));
        assert!(!range.contains(21));
    }
}
