//! Accept loop, admission control and per-connection workers.
//!
//! A [`Dispatcher`] moves through `Idle -> Listening -> Draining -> Stopped`.
//! While listening it repeats the same cycle:
//!
//! 1. with a poll timeout configured, wait for a pending connection and go
//!    back to the active-flag check when none arrives in time;
//! 2. take a concurrency permit, blocking while every slot is busy;
//! 3. accept one connection and read its header and type code;
//! 4. hand the connection and the permit to a fresh worker thread.
//!
//! Clearing the active flag is the only way to stop the loop. It is observed
//! at the next iteration boundary, so without a poll timeout a loop blocked in
//! `accept` keeps waiting until one more client connects. Running workers are
//! never waited on or cancelled.

use std::any::Any;
use std::io;
use std::num::NonZeroU32;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use msgdispatch_config::{Config, DEFAULT_MAX_CONCURRENCY, ServiceEndpoint};

use crate::connection::{Connection, OpenFlags};
use crate::errors::DispatchError;
use crate::limiter::{ConcurrencyLimiter, Permit};
use crate::listener::{LocalListener, Readiness};
use crate::observer::{DispatchObserver, HandlerFailure, StructuredObserver};
use crate::protocol::{Preamble, TypeCode};
use crate::registry::{Handler, HandlerRegistry};

const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// What the accept loop does when `accept` itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptFailurePolicy {
    /// Terminate the loop with [`DispatchError::Accept`].
    #[default]
    Fatal,
    /// Report the first failure and every Nth one after it, back off briefly
    /// and keep accepting.
    LogEvery(NonZeroU32),
}

/// Tuning for one dispatcher instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    max_concurrency: usize,
    poll_timeout: Option<Duration>,
    worker_stack_size: Option<usize>,
    accept_failure: AcceptFailurePolicy,
    error_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_timeout: None,
            worker_stack_size: None,
            accept_failure: AcceptFailurePolicy::Fatal,
            error_backoff: ERROR_BACKOFF,
        }
    }
}

impl DispatcherConfig {
    /// Derives dispatcher settings from the layered configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let accept_failure = config
            .accept_failure_log_every()
            .and_then(NonZeroU32::new)
            .map_or(AcceptFailurePolicy::Fatal, AcceptFailurePolicy::LogEvery);
        Self {
            max_concurrency: config.max_concurrency(),
            poll_timeout: config.poll_timeout(),
            worker_stack_size: config.worker_stack_size(),
            accept_failure,
            ..Self::default()
        }
    }

    /// Caps the number of running handlers. Zero selects the default of 128.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            max_concurrency
        };
        self
    }

    /// Bounds each readiness wait so that shutdown requests are noticed.
    #[must_use]
    pub fn with_poll_timeout(mut self, poll_timeout: Option<Duration>) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Sets the stack size of worker threads.
    #[must_use]
    pub fn with_worker_stack_size(mut self, worker_stack_size: Option<usize>) -> Self {
        self.worker_stack_size = worker_stack_size;
        self
    }

    /// Chooses how accept failures are handled.
    #[must_use]
    pub fn with_accept_failure(mut self, accept_failure: AcceptFailurePolicy) -> Self {
        self.accept_failure = accept_failure;
        self
    }

    /// Sets the pause after a tolerated accept failure.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    /// Concurrency cap.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Readiness wait bound, if any.
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout
    }

    /// Worker stack size, if any.
    #[must_use]
    pub fn worker_stack_size(&self) -> Option<usize> {
        self.worker_stack_size
    }

    /// Accept failure policy.
    #[must_use]
    pub fn accept_failure(&self) -> AcceptFailurePolicy {
        self.accept_failure
    }
}

/// Lifecycle of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Constructed, not serving.
    Idle,
    /// The accept loop is running.
    Listening,
    /// Shutdown was requested; the loop exits at its next boundary.
    Draining,
    /// The loop exited and the listening socket is closed.
    Stopped,
}

/// Dispatch server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

struct Shared {
    registry: HandlerRegistry,
    config: DispatcherConfig,
    limiter: Arc<ConcurrencyLimiter>,
    observer: Arc<dyn DispatchObserver>,
    active: AtomicBool,
    state: Mutex<DispatcherState>,
}

impl Dispatcher {
    /// Builds a dispatcher reporting through [`StructuredObserver`].
    #[must_use]
    pub fn new(registry: HandlerRegistry, config: DispatcherConfig) -> Self {
        Self::with_observer(registry, config, Arc::new(StructuredObserver::new()))
    }

    /// Builds a dispatcher reporting through `observer`.
    #[must_use]
    pub fn with_observer(
        registry: HandlerRegistry,
        config: DispatcherConfig,
        observer: Arc<dyn DispatchObserver>,
    ) -> Self {
        let limiter = ConcurrencyLimiter::new(config.max_concurrency);
        Self {
            shared: Arc::new(Shared {
                registry,
                config,
                limiter,
                observer,
                active: AtomicBool::new(false),
                state: Mutex::new(DispatcherState::Idle),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        *self.shared.lock_state()
    }

    /// Returns true while the accept loop should keep running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Admission limiter shared with the workers.
    #[must_use]
    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.shared.limiter
    }

    /// Handler table.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    /// Clears the active flag. The loop exits at its next iteration
    /// boundary; running handlers are unaffected.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock_state();
        self.shared.active.store(false, Ordering::SeqCst);
        if *state == DispatcherState::Listening {
            *state = DispatcherState::Draining;
        }
    }

    /// Binds `endpoint` and runs the accept loop on the calling thread until
    /// shutdown or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AlreadyServing`] when the loop is running,
    /// a bind failure, or the error that terminated the loop.
    pub fn serve(&self, endpoint: &ServiceEndpoint) -> Result<(), DispatchError> {
        let listener = self.shared.begin(endpoint)?;
        self.shared.run(listener)
    }

    /// Binds `endpoint` on the calling thread, then runs the accept loop on a
    /// dedicated thread.
    ///
    /// The socket is accepting connections by the time this returns.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AlreadyServing`], a bind failure, or
    /// [`DispatchError::Spawn`].
    pub fn spawn(&self, endpoint: &ServiceEndpoint) -> Result<DispatcherHandle, DispatchError> {
        let listener = self.shared.begin(endpoint)?;
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("msgdispatch-accept".to_string())
            .spawn(move || shared.run(listener))
            .map_err(|source| {
                self.shared.finish(DispatcherState::Stopped);
                DispatchError::Spawn { source }
            })?;
        Ok(DispatcherHandle {
            dispatcher: self.clone(),
            endpoint: endpoint.clone(),
            thread: Some(thread),
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Dispatcher")
            .field("registry", &self.shared.registry)
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // The active flag is raised here, on the caller's thread, so that a
    // shutdown issued right after `spawn` returns is never lost.
    fn begin(&self, endpoint: &ServiceEndpoint) -> Result<LocalListener, DispatchError> {
        {
            let mut state = self.lock_state();
            if matches!(
                *state,
                DispatcherState::Listening | DispatcherState::Draining
            ) {
                return Err(DispatchError::AlreadyServing);
            }
            *state = DispatcherState::Listening;
            self.active.store(true, Ordering::SeqCst);
        }

        match LocalListener::bind(endpoint) {
            Ok(listener) => Ok(listener),
            Err(error) => {
                self.finish(DispatcherState::Stopped);
                let error = DispatchError::from(error);
                self.observer.failed(&error);
                Err(error)
            }
        }
    }

    // The flag and the state change together so that a concurrent `begin`
    // never observes one without the other.
    fn finish(&self, state: DispatcherState) {
        let mut current = self.lock_state();
        self.active.store(false, Ordering::SeqCst);
        *current = state;
    }

    fn run(&self, listener: LocalListener) -> Result<(), DispatchError> {
        self.observer
            .listening(listener.endpoint(), self.limiter.capacity());
        let result = self.accept_loop(&listener);

        let endpoint = listener.endpoint().clone();
        drop(listener);
        self.finish(DispatcherState::Stopped);
        match &result {
            Ok(()) => self.observer.stopped(&endpoint),
            Err(error) => self.observer.failed(error),
        }
        result
    }

    fn accept_loop(&self, listener: &LocalListener) -> Result<(), DispatchError> {
        let mut failures: u64 = 0;
        while self.active.load(Ordering::SeqCst) {
            if let Some(timeout) = self.config.poll_timeout {
                let readiness = listener
                    .wait_readable(timeout)
                    .map_err(|source| DispatchError::Poll { source })?;
                if readiness == Readiness::Idle {
                    continue;
                }
            }

            let permit = self.limiter.acquire();
            if !self.active.load(Ordering::SeqCst) {
                break;
            }

            let mut connection = match listener.accept() {
                Ok(connection) => connection,
                Err(source) => {
                    drop(permit);
                    failures += 1;
                    self.accept_failed(source, failures)?;
                    continue;
                }
            };

            let type_code = match Preamble::read(&mut connection) {
                Ok(preamble) => preamble.type_code,
                Err(error) if error.is_peer_abort() => {
                    self.observer.client_aborted(&error);
                    continue;
                }
                Err(source) => return Err(DispatchError::Preamble { source }),
            };

            let Some(handler) = self.registry.lookup(type_code) else {
                self.observer.unknown_type(type_code);
                continue;
            };

            self.spawn_worker(type_code, handler, connection, permit)?;
            self.observer.admitted(type_code);
        }
        Ok(())
    }

    fn accept_failed(&self, source: io::Error, failures: u64) -> Result<(), DispatchError> {
        match self.config.accept_failure {
            AcceptFailurePolicy::Fatal => Err(DispatchError::Accept { source }),
            AcceptFailurePolicy::LogEvery(every) => {
                if (failures - 1) % u64::from(every.get()) == 0 {
                    self.observer.accept_failed(&source, failures);
                }
                thread::sleep(self.config.error_backoff);
                Ok(())
            }
        }
    }

    fn spawn_worker(
        &self,
        type_code: TypeCode,
        handler: Arc<dyn Handler>,
        connection: Connection,
        permit: Permit,
    ) -> Result<(), DispatchError> {
        let observer = Arc::clone(&self.observer);
        let mut builder = thread::Builder::new().name(format!("msgdispatch-worker-{type_code}"));
        if let Some(stack_size) = self.config.worker_stack_size {
            builder = builder.stack_size(stack_size);
        }
        builder
            .spawn(move || run_worker(type_code, &*handler, connection, permit, &*observer))
            .map(drop)
            .map_err(|source| DispatchError::Spawn { source })
    }
}

fn run_worker(
    type_code: TypeCode,
    handler: &dyn Handler,
    mut connection: Connection,
    permit: Permit,
    observer: &dyn DispatchObserver,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.handle(type_code, &mut connection)
    }));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(HandlerFailure::Error(error)),
        Err(payload) => Some(HandlerFailure::Panic(panic_message(payload.as_ref()))),
    };
    if let Some(failure) = failure {
        observer.handler_failed(type_code, &failure);
    }
    drop(connection);
    drop(permit);
    observer.worker_finished(type_code);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to an accept loop running on its own thread.
///
/// Dropping the handle requests shutdown; call [`DispatcherHandle::detach`]
/// to leave the server running instead.
pub struct DispatcherHandle {
    dispatcher: Dispatcher,
    endpoint: ServiceEndpoint,
    thread: Option<thread::JoinHandle<Result<(), DispatchError>>>,
}

impl DispatcherHandle {
    /// Clears the active flag.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    /// Returns true while the accept loop should keep running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.dispatcher.is_active()
    }

    /// The dispatcher behind this handle.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Address the loop is listening on.
    #[must_use]
    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// Waits for the accept loop to exit.
    ///
    /// # Errors
    ///
    /// Returns the error that terminated the loop, or
    /// [`DispatchError::ThreadPanic`].
    pub fn join(mut self) -> Result<(), DispatchError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| DispatchError::ThreadPanic)?,
            None => Ok(()),
        }
    }

    /// Lets the accept loop outlive the handle.
    pub fn detach(mut self) {
        self.thread.take();
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DispatcherHandle")
            .field("endpoint", &self.endpoint)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.dispatcher.shutdown();
        }
    }
}

/// Listens on `service` and dispatches to `registry` with default tuning.
///
/// `host` must be absent or empty and `flags` must include
/// [`OpenFlags::LOCAL`]. With [`OpenFlags::NORETURN`] the accept loop runs
/// on the calling thread and this returns `Ok(None)` only after the loop
/// stops; otherwise the loop runs on its own thread and the handle is
/// returned.
///
/// # Errors
///
/// Returns [`DispatchError::InvalidService`] for bad arguments, and any error
/// from [`Dispatcher::serve`] or [`Dispatcher::spawn`].
pub fn listen(
    host: Option<&str>,
    service: &str,
    flags: OpenFlags,
    registry: HandlerRegistry,
) -> Result<Option<DispatcherHandle>, DispatchError> {
    if let Some(host) = host.filter(|host| !host.is_empty()) {
        return Err(DispatchError::InvalidService {
            message: format!("host '{host}' is not supported for local listeners"),
        });
    }
    if !flags.contains(OpenFlags::LOCAL) {
        return Err(DispatchError::InvalidService {
            message: "only local-domain listeners are supported".to_string(),
        });
    }
    let endpoint: ServiceEndpoint = service
        .parse()
        .map_err(|error| DispatchError::InvalidService {
            message: format!("{error}"),
        })?;

    let dispatcher = Dispatcher::new(registry, DispatcherConfig::default());
    if flags.contains(OpenFlags::NORETURN) {
        dispatcher.serve(&endpoint)?;
        Ok(None)
    } else {
        dispatcher.spawn(&endpoint).map(Some)
    }
}
