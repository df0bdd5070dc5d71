//! Notification listeners
//!
//! Unsolicited change-of-value and event notifications are matched against
//! each listener's filter and delivered synchronously, in registration order,
//! on the thread that classified the frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{Notification, ObjectId, PropertyId};

/// Callback for matching notifications
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync + 'static>;

/// Handle returned by [`ListenerRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

/// Which notifications a listener wants. Unset fields match anything.
///
/// A property filter only matches notifications that carry that property,
/// so it never matches event notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFilter {
    pub device: Option<u32>,
    pub object: Option<ObjectId>,
    pub property: Option<PropertyId>,
}

impl NotificationFilter {
    /// Matches every notification
    pub fn any() -> Self {
        Self::default()
    }

    pub fn device(instance: u32) -> Self {
        Self {
            device: Some(instance),
            ..Self::default()
        }
    }

    pub fn object(instance: u32, object: ObjectId) -> Self {
        Self {
            device: Some(instance),
            object: Some(object),
            property: None,
        }
    }

    pub fn property(instance: u32, object: ObjectId, property: PropertyId) -> Self {
        Self {
            device: Some(instance),
            object: Some(object),
            property: Some(property),
        }
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        self.device.is_none_or(|d| d == notification.device_instance())
            && self.object.is_none_or(|o| o == notification.object())
            && self
                .property
                .is_none_or(|p| notification.properties().contains(&p))
    }
}

struct Listener {
    id: SubscriptionId,
    filter: NotificationFilter,
    handler: NotificationHandler,
}

/// Registered notification listeners
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, filter: NotificationFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Listener {
            id,
            filter,
            handler: Arc::new(handler),
        });
        id
    }

    /// Subscribe with a channel instead of a callback. The subscription stays
    /// registered until [`ListenerRegistry::unsubscribe`]; sends to a dropped
    /// receiver are ignored.
    pub fn subscribe_channel(
        &self,
        filter: NotificationFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(filter, move |notification| {
            let _ = tx.send(notification.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Deliver to every matching listener. Returns how many were invoked.
    ///
    /// Handlers run outside the registry lock and may subscribe or
    /// unsubscribe.
    pub fn notify(&self, notification: &Notification) -> usize {
        let matching: Vec<NotificationHandler> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.filter.matches(notification))
            .map(|l| Arc::clone(&l.handler))
            .collect();

        if matching.is_empty() {
            tracing::trace!(
                device = notification.device_instance(),
                object = %notification.object(),
                "No listener for notification"
            );
        }
        for handler in &matching {
            handler(notification);
        }
        matching.len()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CovNotification, DeviceAddress, EventNotification, ObjectType, PropertyReading,
        PropertyValue,
    };
    use parking_lot::Mutex;

    fn cov(device: u32, object: ObjectId) -> Notification {
        Notification::Cov {
            source: DeviceAddress::local(([10, 0, 0, 5], 47808).into()),
            notification: CovNotification {
                process_id: 1,
                initiating_device: ObjectId::device(device),
                monitored_object: object,
                time_remaining: 60,
                values: vec![PropertyReading {
                    property: PropertyId::PresentValue,
                    array_index: None,
                    value: PropertyValue::Real(21.5),
                }],
            },
        }
    }

    fn event(device: u32, object: ObjectId) -> Notification {
        Notification::Event {
            source: DeviceAddress::local(([10, 0, 0, 5], 47808).into()),
            notification: EventNotification {
                process_id: 1,
                initiating_device: ObjectId::device(device),
                event_object: object,
                notification_class: 1,
                priority: 100,
                event_type: 5,
                message: None,
                notify_type: 0,
                to_state: 3,
            },
        }
    }

    #[test]
    fn test_filters() {
        let ai1 = ObjectId::new(ObjectType::AnalogInput, 1);
        let ai2 = ObjectId::new(ObjectType::AnalogInput, 2);

        assert!(NotificationFilter::any().matches(&cov(10, ai1)));
        assert!(NotificationFilter::device(10).matches(&event(10, ai2)));
        assert!(!NotificationFilter::device(11).matches(&cov(10, ai1)));
        assert!(NotificationFilter::object(10, ai1).matches(&cov(10, ai1)));
        assert!(!NotificationFilter::object(10, ai1).matches(&cov(10, ai2)));

        let pv = NotificationFilter::property(10, ai1, PropertyId::PresentValue);
        assert!(pv.matches(&cov(10, ai1)));
        assert!(!pv.matches(&event(10, ai1)));
        assert!(!NotificationFilter::property(10, ai1, PropertyId::StatusFlags).matches(&cov(10, ai1)));
    }

    #[test]
    fn test_registration_order_and_unsubscribe() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let ai1 = ObjectId::new(ObjectType::AnalogInput, 1);

        let log = Arc::clone(&order);
        let first = registry.subscribe(NotificationFilter::any(), move |_| log.lock().push("first"));
        let log = Arc::clone(&order);
        registry.subscribe(NotificationFilter::device(10), move |_| log.lock().push("second"));
        let log = Arc::clone(&order);
        registry.subscribe(NotificationFilter::device(99), move |_| log.lock().push("never"));

        assert_eq!(registry.notify(&cov(10, ai1)), 2);
        assert_eq!(*order.lock(), vec!["first", "second"]);

        assert!(registry.unsubscribe(first));
        assert!(!registry.unsubscribe(first));
        assert_eq!(registry.notify(&cov(10, ai1)), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let registry = ListenerRegistry::new();
        let ai1 = ObjectId::new(ObjectType::AnalogInput, 1);
        let (_, mut rx) = registry.subscribe_channel(NotificationFilter::device(10));

        registry.notify(&cov(10, ai1));
        registry.notify(&cov(11, ai1));

        assert_eq!(rx.recv().await, Some(cov(10, ai1)));
        assert!(rx.try_recv().is_err());
    }
}
