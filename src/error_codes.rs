//! Well-known server error numbers (`errorNum` in the error envelope)

pub const NO_ERROR: i64 = 0;
pub const FAILED: i64 = 1;
pub const HTTP_BAD_PARAMETER: i64 = 400;
pub const HTTP_UNAUTHORIZED: i64 = 401;
pub const HTTP_FORBIDDEN: i64 = 403;
pub const HTTP_NOT_FOUND: i64 = 404;
pub const ARANGO_DOCUMENT_NOT_FOUND: i64 = 1202;
pub const ARANGO_DATA_SOURCE_NOT_FOUND: i64 = 1203;
pub const ARANGO_DATABASE_NOT_FOUND: i64 = 1228;
pub const QUERY_PARSE: i64 = 1501;
pub const CURSOR_NOT_FOUND: i64 = 1600;
pub const CURSOR_BUSY: i64 = 1601;
pub const TRANSACTION_NOT_FOUND: i64 = 1655;
