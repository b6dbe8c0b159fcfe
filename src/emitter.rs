//! Fire-and-forget PoE emission
//!
//! `Emitter::emit` builds the record on the caller's thread, then hands the
//! wire encoding and the send to a fresh background thread and races them
//! against a deadline on the shared timer. The deadline is advisory: when it wins, a warning is logged
//! and the send keeps running until it finishes on its own. Nothing that goes
//! wrong here is ever returned to the caller.

use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Config, SidecarConfig};
use crate::error::EmitError;
use crate::record::{self, FieldCase, Identity, PoeRecord};
use crate::timer::{Deadline, DeadlineTimer};
use crate::transport::{HttpTransport, Transport};

/// Terminal state of one emission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The sidecar answered; any status is accepted
    Sent { status: u16 },
    /// The sidecar could not be reached or the exchange broke off
    ConnectFailed { error: String },
    /// Input or output was not representable as JSON
    SerializeFailed { error: String },
    /// The send was still running when the deadline passed
    TimedOutObserved { deadline: Duration },
    /// Anything else during build or dispatch
    Unexpected { error: String },
}

impl Outcome {
    fn from_error(err: &EmitError) -> Self {
        match err {
            EmitError::Serialization { .. } => Outcome::SerializeFailed { error: err.to_string() },
            EmitError::Connection { .. } => Outcome::ConnectFailed { error: err.to_string() },
            EmitError::TimeoutObserved { deadline } => Outcome::TimedOutObserved { deadline: *deadline },
            EmitError::Unexpected(_) => Outcome::Unexpected { error: err.to_string() },
        }
    }
}

type Observer = Arc<dyn Fn(&str, &Outcome) + Send + Sync>;

/// Reports outcomes for one request id as log lines and to the observer
#[derive(Clone)]
struct Reporter {
    req_id: Arc<str>,
    observer: Option<Observer>,
}

impl Reporter {
    fn report(&self, outcome: &Outcome, late: bool) {
        let req_id = &*self.req_id;
        let after = if late { " (after deadline)" } else { "" };

        match outcome {
            Outcome::Sent { status } if (200..300).contains(status) => {
                log::debug!("PoE emitted for reqId {}: status {}{}", req_id, status, after);
            }
            Outcome::Sent { status } => {
                log::warn!("PoE sidecar answered status {} for reqId {}{}", status, req_id, after);
            }
            Outcome::ConnectFailed { error } => {
                log::error!("Failed to emit PoE for reqId {}{}: {}", req_id, after, error);
            }
            Outcome::SerializeFailed { error } => {
                log::error!("Failed to build PoE record for reqId {}: {}", req_id, error);
            }
            Outcome::TimedOutObserved { deadline } => {
                log::warn!(
                    "PoE emission for reqId {} still running after {:?}, leaving it to finish",
                    req_id,
                    deadline
                );
            }
            Outcome::Unexpected { error } => {
                log::error!("Unexpected failure emitting PoE for reqId {}: {}", req_id, error);
            }
        }

        if let Some(observer) = &self.observer {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(req_id, outcome))).is_err() {
                log::error!("PoE outcome observer panicked for reqId {}", req_id);
            }
        }
    }
}

/// Decrements the in-flight count when the send thread ends, however it ends
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Best-effort proof-of-execution emitter
pub struct Emitter {
    identity: Identity,
    url: String,
    field_case: FieldCase,
    deadline: Duration,
    transport: Arc<dyn Transport>,
    timer: Option<Arc<DeadlineTimer>>,
    observer: Option<Observer>,
    in_flight: Arc<AtomicUsize>,
}

impl Emitter {
    /// Emitter posting over HTTP with the process-wide timer
    pub fn new(sidecar: &SidecarConfig, identity: Identity) -> Self {
        let transport = HttpTransport::new(sidecar.connect_timeout(), sidecar.release_timeout());

        Self {
            identity,
            url: sidecar.url.clone(),
            field_case: sidecar.field_case,
            deadline: sidecar.deadline(),
            transport: Arc::new(transport),
            timer: DeadlineTimer::global(),
            observer: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.sidecar, config.identity.clone())
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_timer(mut self, timer: Arc<DeadlineTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Receive every terminal outcome in addition to the log line
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, &Outcome) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Background sends not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for background sends to finish. Returns true if none remain.
    pub fn drain(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.in_flight() > 0 {
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Emit a PoE record for a completed operation.
    ///
    /// Returns as soon as the send is handed off. Never fails and never panics
    /// because of serialization, network or timing problems.
    pub fn emit<I, O>(&self, req_id: &str, input: &I, output: &O)
    where
        I: Serialize + ?Sized,
        O: Serialize + ?Sized,
    {
        let reporter = Reporter {
            req_id: Arc::from(req_id),
            observer: self.observer.clone(),
        };

        let built = panic::catch_unwind(AssertUnwindSafe(|| record::build(req_id, input, output, &self.identity)));

        let record = match built {
            Ok(Ok(record)) => record,
            Ok(Err(err)) => {
                reporter.report(&Outcome::from_error(&err), false);
                return;
            }
            Err(payload) => {
                let error = format!("panic while building record: {}", panic_message(&*payload));
                reporter.report(&Outcome::Unexpected { error }, false);
                return;
            }
        };

        if let Err(err) = self.dispatch(reporter.clone(), record) {
            reporter.report(&Outcome::from_error(&err), false);
        }
    }

    fn dispatch(&self, reporter: Reporter, record: PoeRecord) -> Result<(), EmitError> {
        log::debug!("Dispatching PoE for reqId {} to {}", reporter.req_id, self.url);

        let deadline = self.arm_deadline(&reporter);

        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        let field_case = self.field_case;
        let send_deadline = deadline.clone();

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        let spawned = thread::Builder::new().name("poe-send".to_string()).spawn(move || {
            let _guard = guard;
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let body = record.to_wire(field_case)?;
                log::trace!("Sending {} bytes for reqId {}", body.len(), record.req_id);
                transport.send(&url, &body)
            }));
            let late = send_deadline.as_ref().is_some_and(|d| !d.cancel());

            let outcome = match result {
                Ok(Ok(delivery)) => Outcome::Sent {
                    status: delivery.status,
                },
                Ok(Err(err)) => Outcome::from_error(&err),
                Err(payload) => Outcome::Unexpected {
                    error: format!("panic while sending: {}", panic_message(&*payload)),
                },
            };
            reporter.report(&outcome, late);
        });

        if let Err(e) = spawned {
            // The closure (and the guard inside it) was dropped with the failed spawn
            if let Some(deadline) = deadline {
                deadline.cancel();
            }
            return Err(EmitError::Unexpected(format!("failed to spawn send thread: {}", e)));
        }

        Ok(())
    }

    fn arm_deadline(&self, reporter: &Reporter) -> Option<Deadline> {
        let timer = self.timer.as_ref()?;
        let limit = self.deadline;
        let on_timeout = reporter.clone();

        match timer.schedule(limit, move || {
            on_timeout.report(&Outcome::TimedOutObserved { deadline: limit }, false)
        }) {
            Ok(deadline) => Some(deadline),
            Err(e) => {
                log::error!(
                    "Could not arm PoE deadline for reqId {}, sending without it: {}",
                    reporter.req_id,
                    e
                );
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
