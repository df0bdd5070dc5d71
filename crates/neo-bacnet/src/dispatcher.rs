//! Dispatcher
//!
//! Sends confirmed and unconfirmed service requests, correlates inbound
//! responses with the Pending-Request Table, drives the retry timers and
//! routes unsolicited messages.
//!
//! ## Locking
//!
//! The table lock is never held across a transport send or while a Service
//! Future is resolved. An entry is removed from the table before its future
//! is completed, so whichever of response, timeout or cancel removes it first
//! is the only one that resolves it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{reject_reason, Ack, Codec, ConfirmedRequest, Decoded, Response, UnconfirmedRequest};
use crate::collector::{BroadcastCollector, InstanceRange};
use crate::error::{ServiceError, ServiceResult, TransportError};
use crate::future::{Binding, ServiceFuture};
use crate::listener::ListenerRegistry;
use crate::local_device::LocalDevice;
use crate::pending::{PendingRequest, PendingTable};
use crate::policy::TimeoutPolicy;
use crate::transport::{LinkTarget, Transport};
use crate::types::{
    ConfirmedService, DeviceAddress, DeviceAnnouncement, Destination, Notification, ObjectType,
};

/// Receives I-Am announcements no discovery session took
pub type AnnouncementSink = Arc<dyn Fn(&DeviceAnnouncement) + Send + Sync + 'static>;

/// Service dispatch and correlation engine.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    table: Mutex<PendingTable>,
    collector: BroadcastCollector,
    listeners: ListenerRegistry,
    local: RwLock<Option<Arc<LocalDevice>>>,
    sinks: RwLock<Vec<AnnouncementSink>>,
    seq: AtomicU64,
    runtime: Handle,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher and register it as the transport's receive handler.
    ///
    /// Timers run on `runtime`, so dispatch calls may come from threads
    /// outside it.
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn Codec>, runtime: Handle) -> Self {
        let inner = Arc::new(Inner {
            transport,
            codec,
            table: Mutex::new(PendingTable::new()),
            collector: BroadcastCollector::new(runtime.clone()),
            listeners: ListenerRegistry::new(),
            local: RwLock::new(None),
            sinks: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
            runtime,
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.register_receive_handler(Arc::new(move |source: SocketAddr, frame: Bytes| {
            if let Some(inner) = weak.upgrade() {
                inner.on_frame_received(source, &frame);
            }
        }));

        Self { inner }
    }

    /// Answer Who-Is and device-object reads as `device`
    pub fn set_local_device(&self, device: Option<LocalDevice>) {
        *self.inner.local.write() = device.map(Arc::new);
    }

    pub fn local_device(&self) -> Option<Arc<LocalDevice>> {
        self.inner.local.read().clone()
    }

    /// Register a sink for announcements outside any discovery session
    pub fn add_announcement_sink(&self, sink: AnnouncementSink) {
        self.inner.sinks.write().push(sink);
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    pub fn collector(&self) -> &BroadcastCollector {
        &self.inner.collector
    }

    /// Send a confirmed request and return a future for its outcome
    pub fn dispatch_confirmed(
        &self,
        destination: &DeviceAddress,
        request: &ConfirmedRequest,
        policy: TimeoutPolicy,
    ) -> ServiceFuture<Ack> {
        self.inner.dispatch_confirmed(destination, request, policy)
    }

    /// Fire-and-forget. Only local send failures are reported.
    pub fn dispatch_unconfirmed(&self, destination: &Destination, message: &UnconfirmedRequest) -> ServiceResult<()> {
        self.inner.dispatch_unconfirmed(destination, message)
    }

    /// Broadcast Who-Is and collect I-Am responses for `window`
    pub fn discover(&self, window: Duration, range: Option<InstanceRange>) -> ServiceFuture<Vec<DeviceAnnouncement>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return ServiceFuture::ready(Err(ServiceError::Shutdown));
        }
        // Open the session first so no fast responder is missed
        let session = self.inner.collector.start(window, range);
        let who_is = UnconfirmedRequest::WhoIs {
            low: range.map(|r| r.low),
            high: range.map(|r| r.high),
        };
        if let Err(e) = self.inner.dispatch_unconfirmed(&Destination::Broadcast, &who_is) {
            warn!("Who-Is broadcast failed: {}", e);
        }
        session
    }

    /// Inbound frame entry point (also registered with the transport)
    pub fn on_frame_received(&self, source: SocketAddr, frame: &[u8]) {
        self.inner.on_frame_received(source, frame);
    }

    /// Cancel the exchange behind `future`. No-op once it is terminal.
    pub fn cancel<T>(&self, future: &ServiceFuture<T>)
    where
        T: Clone + Send + 'static,
    {
        if future.is_terminal() {
            return;
        }
        match future.binding() {
            Some(Binding::Request {
                destination,
                invoke_id,
                seq,
            }) => {
                let removed = self.inner.table.lock().remove_if_seq(destination, *invoke_id, *seq);
                if let Some(mut request) = removed {
                    request.disarm();
                    debug!(invoke_id, device = %destination, "Request cancelled");
                    request.completer.complete(Err(ServiceError::Cancelled));
                }
            }
            Some(Binding::Discovery(id)) => {
                self.inner.collector.stop(*id);
            }
            None => {}
        }
    }

    /// Number of confirmed requests in flight to `destination`
    pub fn outstanding(&self, destination: &DeviceAddress) -> usize {
        self.inner.table.lock().outstanding(destination)
    }

    /// Release the invoke-id pool of a destination with nothing in flight.
    /// Returns false if requests to it are still outstanding.
    pub fn forget(&self, destination: &DeviceAddress) -> bool {
        self.inner.table.lock().prune(destination)
    }

    #[cfg(test)]
    pub(crate) fn tracked_destinations(&self) -> usize {
        self.inner.table.lock().destination_count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Fail every pending request with `Cancelled`, close discovery sessions
    /// and close the transport. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = self.inner.table.lock().drain_all();
        debug!(pending = drained.len(), "Dispatcher shutting down");
        for mut request in drained {
            request.disarm();
            request.completer.complete(Err(ServiceError::Cancelled));
        }
        self.inner.collector.stop_all();
        self.inner.transport.close();
    }
}

impl Inner {
    fn dispatch_confirmed(
        self: &Arc<Self>,
        destination: &DeviceAddress,
        request: &ConfirmedRequest,
        policy: TimeoutPolicy,
    ) -> ServiceFuture<Ack> {
        if self.closed.load(Ordering::SeqCst) {
            return ServiceFuture::ready(Err(ServiceError::Shutdown));
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (future, completer) = ServiceFuture::pending();

        let (invoke_id, frame, deadline) = {
            let mut table = self.table.lock();
            let Some(invoke_id) = table.allocate(destination) else {
                warn!(device = %destination, "Invoke id space exhausted");
                return ServiceFuture::ready(Err(ServiceError::ExhaustedIdSpace(destination.clone())));
            };
            let frame = match self.codec.encode_request(destination.remote.as_ref(), invoke_id, request) {
                Ok(frame) => frame,
                Err(e) => return ServiceFuture::ready(Err(e.into())),
            };
            let deadline = Instant::now() + policy.timeout_for(1);
            table.insert(
                destination,
                invoke_id,
                PendingRequest {
                    seq,
                    service: request.service(),
                    frame: frame.clone(),
                    attempts: 1,
                    deadline,
                    policy,
                    completer,
                    timer: None,
                },
            );
            (invoke_id, frame, deadline)
        };

        let future = future.bound(Binding::Request {
            destination: destination.clone(),
            invoke_id,
            seq,
        });

        debug!(invoke_id, device = %destination, service = ?request.service(), "Dispatching confirmed request");

        if let Err(e) = self.transport.send(LinkTarget::Unicast(destination.link), frame) {
            let removed = self.table.lock().remove_if_seq(destination, invoke_id, seq);
            if let Some(request) = removed {
                request.completer.complete(Err(e.into()));
            }
            return future;
        }

        let timer = self
            .runtime
            .spawn(retry_timer(
                Arc::downgrade(self),
                destination.clone(),
                invoke_id,
                seq,
                deadline,
            ))
            .abort_handle();

        let mut table = self.table.lock();
        match table.get_mut(destination, invoke_id).filter(|r| r.seq == seq) {
            Some(pending) => pending.timer = Some(timer),
            // Resolved while we were sending
            None => timer.abort(),
        }
        future
    }

    fn dispatch_unconfirmed(&self, destination: &Destination, message: &UnconfirmedRequest) -> ServiceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServiceError::Shutdown);
        }
        let (route, target) = match destination {
            Destination::Device(addr) => (addr.remote.as_ref(), LinkTarget::Unicast(addr.link)),
            Destination::Broadcast => (None, LinkTarget::Broadcast),
        };
        let frame = self.codec.encode_unconfirmed(route, message)?;
        trace!(%destination, service = ?message.service(), "Sending unconfirmed request");
        self.transport.send(target, frame)?;
        Ok(())
    }

    /// Handle an expired deadline. Returns the next deadline if the request
    /// was retried, `None` once the timer has nothing left to do.
    fn on_deadline(&self, destination: &DeviceAddress, invoke_id: u8, seq: u64) -> Option<Instant> {
        let mut table = self.table.lock();
        let pending = table.get_mut(destination, invoke_id).filter(|r| r.seq == seq)?;

        if !pending.policy.may_retry(pending.attempts) {
            let attempts = pending.attempts;
            let mut request = table.remove(destination, invoke_id)?;
            drop(table);
            // This task is the timer; nothing to abort
            request.timer = None;
            warn!(invoke_id, device = %destination, attempts, "Request timed out");
            request.completer.complete(Err(ServiceError::Timeout));
            return None;
        }

        pending.attempts += 1;
        pending.deadline = Instant::now() + pending.policy.timeout_for(pending.attempts);
        let (frame, attempt, deadline) = (pending.frame.clone(), pending.attempts, pending.deadline);
        drop(table);

        debug!(invoke_id, device = %destination, attempt, "Retrying request");
        match self.transport.send(LinkTarget::Unicast(destination.link), frame) {
            Ok(()) => Some(deadline),
            Err(TransportError::Closed) => {
                let removed = self.table.lock().remove_if_seq(destination, invoke_id, seq);
                if let Some(mut request) = removed {
                    request.timer = None;
                    request.completer.complete(Err(TransportError::Closed.into()));
                }
                None
            }
            Err(e) => {
                // Counts as a lost attempt
                warn!(invoke_id, device = %destination, attempt, "Retry send failed: {}", e);
                Some(deadline)
            }
        }
    }

    fn on_frame_received(&self, source: SocketAddr, frame: &[u8]) {
        let decoded = match self.codec.decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(%source, "Discarding malformed frame: {}", e);
                return;
            }
        };
        let address = DeviceAddress {
            link: source,
            remote: decoded.source,
        };

        match decoded.message {
            Decoded::ConfirmedResponse {
                invoke_id,
                response: Response::Abort { server: false, reason },
            } => {
                // Peer abandoning its own transaction; its invoke id is not ours
                trace!(invoke_id, reason, device = %address, "Ignoring client-side abort");
            }
            Decoded::ConfirmedResponse { invoke_id, response } => self.resolve(&address, invoke_id, response),
            Decoded::Unconfirmed(message) => self.route_unconfirmed(address, message),
            Decoded::ConfirmedRequest { invoke_id, request } => {
                self.serve(&address, invoke_id, request.service(), |local| local.handle_request(&request));
            }
            Decoded::UnsupportedRequest { invoke_id, service } => {
                self.serve(&address, invoke_id, service, |local| local.handle_unsupported(service));
            }
            Decoded::Ignored(what) => trace!(%address, "Ignoring {}", what),
        }
    }

    fn resolve(&self, source: &DeviceAddress, invoke_id: u8, response: Response) {
        let Some(mut request) = self.table.lock().remove(source, invoke_id) else {
            trace!(invoke_id, device = %source, "Discarding unmatched response");
            return;
        };
        request.disarm();

        let outcome = match response {
            Response::Ack(ack) if ack_service(&ack) == request.service => Ok(ack),
            Response::Ack(ack) => Err(ServiceError::UnexpectedResponse(format!(
                "{:?} ack for {:?} request",
                ack_service(&ack),
                request.service
            ))),
            Response::Error { class, code, .. } => Err(ServiceError::ProtocolError { class, code }),
            Response::Reject { reason } => Err(ServiceError::ProtocolReject { reason }),
            Response::Abort { reason, server } => Err(ServiceError::ProtocolAbort { reason, server }),
        };

        match &outcome {
            Ok(_) => trace!(invoke_id, device = %source, attempts = request.attempts, "Request acknowledged"),
            Err(e) => warn!(invoke_id, device = %source, "Request failed: {}", e),
        }
        request.completer.complete(outcome);
    }

    fn route_unconfirmed(&self, source: DeviceAddress, message: UnconfirmedRequest) {
        match message {
            UnconfirmedRequest::IAm(identity) => {
                if identity.device.object_type != ObjectType::Device {
                    trace!(%source, "Ignoring I-Am for non-device object {}", identity.device);
                    return;
                }
                let local = self.local.read().clone();
                if local.is_some_and(|l| l.instance() == identity.device.instance) {
                    // Our own broadcast echoed back
                    return;
                }
                let announcement = DeviceAnnouncement::new(source, identity);
                if self.collector.offer(&announcement) {
                    return;
                }
                let sinks = self.sinks.read().clone();
                if sinks.is_empty() {
                    trace!(device = announcement.instance(), "Discarding unsolicited I-Am");
                }
                for sink in sinks {
                    sink(&announcement);
                }
            }
            UnconfirmedRequest::CovNotification(notification) => {
                self.listeners.notify(&Notification::Cov { source, notification });
            }
            UnconfirmedRequest::EventNotification(notification) => {
                self.listeners.notify(&Notification::Event { source, notification });
            }
            UnconfirmedRequest::WhoIs { low, high } => {
                let local = self.local.read().clone();
                let Some(reply) = local.and_then(|l| l.answer_who_is(low, high)) else {
                    return;
                };
                if let Err(e) = self.dispatch_unconfirmed(&Destination::Broadcast, &reply) {
                    warn!("Failed to answer Who-Is: {}", e);
                }
            }
        }
    }

    /// Answer a confirmed request addressed to us
    fn serve<F>(&self, source: &DeviceAddress, invoke_id: u8, service: ConfirmedService, answer: F)
    where
        F: FnOnce(&LocalDevice) -> Response,
    {
        let local = self.local.read().clone();
        let response = match local {
            Some(local) => answer(&local),
            None => Response::Reject {
                reason: reject_reason::UNRECOGNIZED_SERVICE,
            },
        };
        debug!(invoke_id, %source, ?service, "Answering confirmed request");

        let frame = match self.codec.encode_response(source.remote.as_ref(), invoke_id, &response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode response: {}", e);
                return;
            }
        };
        if let Err(e) = self.transport.send(LinkTarget::Unicast(source.link), frame) {
            warn!(%source, "Failed to send response: {}", e);
        }
    }
}

fn ack_service(ack: &Ack) -> ConfirmedService {
    match ack {
        Ack::Simple(service) => *service,
        Ack::ReadProperty { .. } => ConfirmedService::ReadProperty,
    }
}

async fn retry_timer(inner: Weak<Inner>, destination: DeviceAddress, invoke_id: u8, seq: u64, first: Instant) {
    let mut deadline = first;
    loop {
        tokio::time::sleep_until(deadline).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.on_deadline(&destination, invoke_id, seq) {
            Some(next) => deadline = next,
            None => return,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
