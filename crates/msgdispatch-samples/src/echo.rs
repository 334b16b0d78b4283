//! Echo service: every reply ends with a `u16` status of zero.

use msgdispatch::{Connection, HandlerError, HandlerRegistry, RegistryError, TypeCode};

/// String in, same string out.
pub const ECHO_STRING: TypeCode = 2;
/// `i32` in, same `i32` out.
pub const ECHO_INT: TypeCode = 3;
/// No request fields; replies with [`GREETING`].
pub const ECHO_HELLO: TypeCode = 4;

/// Text returned by [`ECHO_HELLO`].
pub const GREETING: &str = "Hello, World";

const STATUS_OK: u16 = 0;

/// Handler table for the echo service.
///
/// # Errors
///
/// Never fails in practice; the codes are distinct and unreserved.
pub fn registry() -> Result<HandlerRegistry, RegistryError> {
    Ok(HandlerRegistry::builder()
        .register(ECHO_STRING, echo_string)?
        .register(ECHO_INT, echo_int)?
        .register(ECHO_HELLO, echo_hello)?
        .build())
}

fn echo_string(_: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
    let text = connection.read_string()?;
    connection.write_string(&text)?;
    connection.write_u16(STATUS_OK)?;
    Ok(())
}

fn echo_int(_: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
    let value = connection.read_i32()?;
    connection.write_i32(value)?;
    connection.write_u16(STATUS_OK)?;
    Ok(())
}

fn echo_hello(_: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
    connection.write_string(GREETING)?;
    connection.write_u16(STATUS_OK)?;
    Ok(())
}
