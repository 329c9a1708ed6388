// src/error.rs
//! Error taxonomy for the engine
//!
//! Every failure carries the numeric code the emulated server would report,
//! so driver-facing layers can rebuild their own exception types from
//! `code()` and the display message.

use thiserror::Error;

/// Server error codes used across the engine
pub mod codes {
    pub const BAD_VALUE: i32 = 2;
    pub const FAILED_TO_PARSE: i32 = 9;
    pub const TYPE_MISMATCH: i32 = 14;
    pub const PATH_NOT_VIABLE: i32 = 28;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const INDEX_NOT_FOUND: i32 = 27;
    pub const INVALID_OPTIONS: i32 = 72;
    pub const IMMUTABLE_FIELD: i32 = 66;
    pub const INDEX_OPTIONS_CONFLICT: i32 = 85;
    pub const CANNOT_INDEX_PARALLEL_ARRAYS: i32 = 171;
    pub const DUPLICATE_KEY: i32 = 11000;
    pub const DATE_OPERAND_REQUIRED: i32 = 16006;
    pub const WRONG_OPERAND_COUNT: i32 = 16020;
    pub const PROJECT_REQUIRES_FIELDS: i32 = 16435;
    pub const NON_NUMERIC_OPERAND: i32 = 16554;
    pub const DIVIDE_BY_ZERO: i32 = 16608;
    pub const MOD_BY_ZERO: i32 = 16610;
    pub const STRING_COERCION: i32 = 16007;
    pub const COND_MISSING_PARAMETER: i32 = 17080;
    pub const UNDEFINED_VARIABLE: i32 = 17276;
    pub const EXPRESSION_ONE_FIELD: i32 = 15983;
    pub const CONCAT_REQUIRES_STRINGS: i32 = 16702;
    pub const OUT_MUST_BE_LAST: i32 = 16991;
    pub const GROUP_REQUIRES_ID: i32 = 15955;
    pub const LIMIT_MUST_BE_POSITIVE: i32 = 15958;
    pub const SORT_KEY_INVALID: i32 = 15975;
    pub const SORT_REQUIRES_KEY: i32 = 15976;
    pub const UNKNOWN_EXPRESSION: i32 = 15999;
    pub const TEXT_INDEX_REQUIRED: i32 = 17007;
    pub const SIZE_REQUIRES_ARRAY: i32 = 17124;
    pub const STAGE_ONE_FIELD: i32 = 40323;
    pub const UNKNOWN_STAGE: i32 = 40324;
    pub const UNKNOWN_GROUP_OPERATOR: i32 = 15952;
    pub const GROUP_FIELD_NOT_OBJECT: i32 = 40234;
    pub const SKIP_MUST_BE_NON_NEGATIVE: i32 = 15956;
    pub const UNWIND_PATH_INVALID: i32 = 28818;
    pub const LOOKUP_ARGUMENT_INVALID: i32 = 4572;
    pub const OUT_REQUIRES_STRING: i32 = 16990;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShadowDbError {
    /// Malformed filter specification (unknown operator, wrong operand type)
    #[error("Match error: {0}")]
    MatchError(String),

    /// Projection mixing inclusion and exclusion, or malformed projection operator
    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    /// Unique index violation
    #[error("E11000 duplicate key error index: {index} dup key: {{ : {key} }}")]
    DuplicateKey { index: String, key: String },

    /// Aggregation / command failure with a server error code
    #[error("Command failed with error {code}: {message}")]
    CommandFailure { code: i32, message: String },

    /// Index redeclared with incompatible options
    #[error("Index conflict: {0}")]
    IndexConflict(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ShadowDbError {
    /// Build a command failure with the given server code
    pub fn command(code: i32, message: impl Into<String>) -> Self {
        ShadowDbError::CommandFailure {
            code,
            message: message.into(),
        }
    }

    /// Numeric code as reported by the emulated server
    pub fn code(&self) -> i32 {
        match self {
            ShadowDbError::MatchError(_) => codes::BAD_VALUE,
            ShadowDbError::InvalidProjection(_) => codes::BAD_VALUE,
            ShadowDbError::DuplicateKey { .. } => codes::DUPLICATE_KEY,
            ShadowDbError::CommandFailure { code, .. } => *code,
            ShadowDbError::IndexConflict(_) => codes::INDEX_OPTIONS_CONFLICT,
            ShadowDbError::CollectionNotFound(_) => codes::NAMESPACE_NOT_FOUND,
            ShadowDbError::Serialization(_) => codes::FAILED_TO_PARSE,
            ShadowDbError::InvalidArgument(_) => codes::BAD_VALUE,
        }
    }
}

impl From<serde_json::Error> for ShadowDbError {
    fn from(err: serde_json::Error) -> Self {
        ShadowDbError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShadowDbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ShadowDbError::MatchError("x".into()).code(), 2);
        assert_eq!(
            ShadowDbError::command(codes::WRONG_OPERAND_COUNT, "bad").code(),
            16020
        );
        assert_eq!(
            ShadowDbError::DuplicateKey {
                index: "test.users.$a_1".into(),
                key: "1".into()
            }
            .code(),
            11000
        );
        assert_eq!(ShadowDbError::IndexConflict("a_1".into()).code(), 85);
    }

    #[test]
    fn test_duplicate_key_message() {
        let err = ShadowDbError::DuplicateKey {
            index: "db.users.$email_1".into(),
            key: "\"a@b.c\"".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("E11000 duplicate key error"));
        assert!(msg.contains("db.users.$email_1"));
        assert!(msg.contains("\"a@b.c\""));
    }

    #[test]
    fn test_from_serde_error() {
        let err: ShadowDbError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, ShadowDbError::Serialization(_)));
        assert_eq!(err.code(), 9);
    }
}
