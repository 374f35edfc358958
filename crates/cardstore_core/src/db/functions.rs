//! Scalar SQL functions registered on every connection.
//!
//! Compiled `pattern`/`regexp` keywords call `regexp(pattern, text)`.

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Error};

/// Registers `regexp(pattern, text)` backed by the `regex` crate.
///
/// The compiled pattern is cached per statement as auxiliary data, so a
/// pattern is compiled once per query rather than once per row. A NULL or
/// blob subject yields NULL.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            if ctx.len() != 2 {
                return Err(Error::UserFunctionError(
                    "regexp() expects exactly 2 arguments".into(),
                ));
            }
            let pattern = ctx.get_or_create_aux(0, |value| -> Result<Regex, Error> {
                let source = value
                    .as_str()
                    .map_err(|err| Error::UserFunctionError(err.into()))?;
                Regex::new(source).map_err(|err| Error::UserFunctionError(err.into()))
            })?;
            let subject = match ctx.get_raw(1) {
                ValueRef::Null | ValueRef::Blob(_) => return Ok(None),
                ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                ValueRef::Integer(value) => value.to_string(),
                ValueRef::Real(value) => value.to_string(),
            };
            Ok(Some(pattern.is_match(&subject)))
        },
    )
}
