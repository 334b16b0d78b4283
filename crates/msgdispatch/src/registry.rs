//! Mapping from type code to handler.
//!
//! The registry is assembled once through [`HandlerRegistryBuilder`] and is
//! read-only afterwards, so the accept loop and every worker may share it
//! without locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::Connection;
use crate::errors::{HandlerError, RegistryError};
use crate::protocol::{TYPE_PING, TypeCode, is_reserved};

/// Application logic bound to one or more type codes.
///
/// A handler owns the rest of the exchange: it reads the request fields in
/// the agreed order, performs its effect and writes the response. It never
/// closes the connection or releases its concurrency slot; the dispatcher
/// does both once `handle` returns, whether it succeeded, failed or
/// panicked.
pub trait Handler: Send + Sync + 'static {
    /// Serves one connection whose preamble carried `type_code`.
    ///
    /// # Errors
    ///
    /// Any error is reported through the dispatch observer and otherwise
    /// ignored. Encoding application failures into the response is the
    /// handler's job.
    fn handle(&self, type_code: TypeCode, connection: &mut Connection) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(TypeCode, &mut Connection) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, type_code: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
        self(type_code, connection)
    }
}

/// Wraps a closure as a [`Handler`], fixing its argument types so that
/// closure parameters need no annotations.
pub fn handler_fn<F>(function: F) -> F
where
    F: Fn(TypeCode, &mut Connection) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    function
}

/// Answers a liveness probe with a single zero byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

impl Handler for PingHandler {
    fn handle(&self, _type_code: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
        connection.write_u8(0)?;
        Ok(())
    }
}

/// Immutable handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeCode, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Starts an empty registry.
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Resolves the handler for `type_code`.
    ///
    /// Matching is exact. [`TYPE_PING`] falls back to [`PingHandler`] unless
    /// the application registered its own.
    #[must_use]
    pub fn lookup(&self, type_code: TypeCode) -> Option<Arc<dyn Handler>> {
        match self.handlers.get(&type_code) {
            Some(handler) => Some(Arc::clone(handler)),
            None if type_code == TYPE_PING => Some(Arc::new(PingHandler)),
            None => None,
        }
    }

    /// Returns true when an application handler is registered for the code.
    #[must_use]
    pub fn contains(&self, type_code: TypeCode) -> bool {
        self.handlers.contains_key(&type_code)
    }

    /// Number of application handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true when no application handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered type codes in ascending order.
    #[must_use]
    pub fn type_codes(&self) -> Vec<TypeCode> {
        let mut codes: Vec<_> = self.handlers.keys().copied().collect();
        codes.sort_unstable();
        codes
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HandlerRegistry")
            .field("type_codes", &self.type_codes())
            .finish()
    }
}

/// Collects handlers and rejects conflicting registrations.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<TypeCode, Arc<dyn Handler>>,
}

impl fmt::Debug for HandlerRegistryBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.handlers.keys().copied().collect();
        codes.sort_unstable();
        formatter
            .debug_struct("HandlerRegistryBuilder")
            .field("type_codes", &codes)
            .finish()
    }
}

impl HandlerRegistryBuilder {
    /// Binds `handler` to `type_code`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Reserved`] for protocol-reserved codes and
    /// [`RegistryError::Duplicate`] when the code is already bound.
    pub fn register(
        mut self,
        type_code: TypeCode,
        handler: impl Handler,
    ) -> Result<Self, RegistryError> {
        self.insert(type_code, Arc::new(handler))?;
        Ok(self)
    }

    /// Binds one shared handler to several type codes.
    ///
    /// # Errors
    ///
    /// See [`HandlerRegistryBuilder::register`].
    pub fn register_all(
        mut self,
        type_codes: impl IntoIterator<Item = TypeCode>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, RegistryError> {
        for type_code in type_codes {
            self.insert(type_code, Arc::clone(&handler))?;
        }
        Ok(self)
    }

    /// Freezes the table.
    #[must_use]
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }

    fn insert(&mut self, type_code: TypeCode, handler: Arc<dyn Handler>) -> Result<(), RegistryError> {
        if is_reserved(type_code) {
            return Err(RegistryError::Reserved { type_code });
        }
        if self.handlers.contains_key(&type_code) {
            return Err(RegistryError::Duplicate { type_code });
        }
        self.handlers.insert(type_code, handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use rstest::rstest;

    use super::*;
    use crate::protocol::{TYPE_PANIC, TYPE_RESERVED};

    fn silent(_: TypeCode, _: &mut Connection) -> Result<(), HandlerError> {
        Ok(())
    }

    #[rstest]
    #[case(TYPE_RESERVED)]
    #[case(TYPE_PANIC)]
    fn reserved_codes_are_refused(#[case] type_code: TypeCode) {
        let error = HandlerRegistry::builder()
            .register(type_code, silent)
            .expect_err("code is reserved");
        assert_eq!(error, RegistryError::Reserved { type_code });
    }

    #[test]
    fn duplicates_are_refused() {
        let error = HandlerRegistry::builder()
            .register(7, silent)
            .and_then(|builder| builder.register(7, silent))
            .expect_err("code registered twice");
        assert_eq!(error, RegistryError::Duplicate { type_code: 7 });
    }

    #[test]
    fn lookup_is_exact() {
        let registry = HandlerRegistry::builder()
            .register(3, silent)
            .and_then(|builder| builder.register(1, silent))
            .expect("register handlers")
            .build();

        assert!(registry.lookup(3).is_some());
        assert!(registry.lookup(2).is_none());
        assert_eq!(registry.type_codes(), vec![1, 3]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn ping_has_a_builtin_answer() {
        let registry = HandlerRegistry::builder().build();
        assert!(registry.is_empty());
        assert!(!registry.contains(TYPE_PING));

        let handler = registry.lookup(TYPE_PING).expect("ping fallback");
        let (left, right) = UnixStream::pair().expect("socket pair");
        let mut server = Connection::from_stream(left);
        let mut client = Connection::from_stream(right);
        handler.handle(TYPE_PING, &mut server).expect("ping handler");
        assert_eq!(client.read_u8().expect("ping reply"), 0);
    }

    #[test]
    fn shared_handler_covers_several_codes() {
        let shared: Arc<dyn Handler> = Arc::new(PingHandler);
        let registry = HandlerRegistry::builder()
            .register_all([20, 21, 22], shared)
            .expect("register shared handler")
            .build();
        assert_eq!(registry.type_codes(), vec![20, 21, 22]);
    }
}
