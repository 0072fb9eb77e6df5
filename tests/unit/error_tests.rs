//! Unit tests for `AppError` display format and classification.

use agent_session_runtime::AppError;

#[test]
fn display_uses_lower_case_kind_prefix() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Db("bad".into()), "db: bad"),
        (
            AppError::StoreUnavailable("gone".into()),
            "store unavailable: gone",
        ),
        (AppError::NotFound("s1".into()), "not found: s1"),
        (
            AppError::NoPendingApproval("s1".into()),
            "no pending approval: s1",
        ),
        (AppError::AlreadyDecided("a1".into()), "already decided: a1"),
        (
            AppError::InvalidTransition("x".into()),
            "invalid transition: x",
        ),
        (
            AppError::ExecutionFailed("boom".into()),
            "execution failed: boom",
        ),
        (AppError::Io("disk".into()), "io: disk"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn messages_have_no_trailing_period() {
    let err = AppError::NotFound("session abc not found".into());
    let s = err.to_string();
    assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
}

#[test]
fn caller_errors_are_classified() {
    assert!(AppError::NotFound(String::new()).is_caller_error());
    assert!(AppError::NoPendingApproval(String::new()).is_caller_error());
    assert!(AppError::AlreadyDecided(String::new()).is_caller_error());
    assert!(!AppError::StoreUnavailable(String::new()).is_caller_error());
    assert!(!AppError::ExecutionFailed(String::new()).is_caller_error());
}

#[test]
fn pool_closed_maps_to_store_unavailable() {
    let err = AppError::from(sqlx::Error::PoolClosed);
    assert!(matches!(err, AppError::StoreUnavailable(_)));
}

#[test]
fn row_not_found_maps_to_db() {
    let err = AppError::from(sqlx::Error::RowNotFound);
    assert!(matches!(err, AppError::Db(_)));
}

#[test]
fn invalid_toml_maps_to_config() {
    let err = toml::from_str::<toml::Value>("= nope").map_err(AppError::from);
    assert!(matches!(err, Err(AppError::Config(_))));
}

#[test]
fn implements_std_error() {
    fn assert_error<E: std::error::Error>(_: &E) {}
    let err = AppError::Io("test".into());
    assert_error(&err);
    assert!(!format!("{err:?}").is_empty());
}
