//! Unit tests for the application error type.

use file_courier::AppError;

/// Each variant renders with its domain prefix.
#[test]
fn display_prefixes_name_the_failure_domain() {
    let cases = [
        (AppError::Config("bad field".into()), "config: bad field"),
        (AppError::Spawn("no binary".into()), "spawn: no binary"),
        (AppError::Transmit("broken pipe".into()), "transmit: broken pipe"),
        (AppError::Protocol("bad frame".into()), "protocol: bad frame"),
        (AppError::Task("missing source".into()), "task: missing source"),
        (AppError::Io("disk full".into()), "io: disk full"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

/// `std::io::Error` converts into the `Io` variant.
#[test]
fn io_error_converts_to_io_variant() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: AppError = io_err.into();
    assert!(matches!(err, AppError::Io(_)));
    assert!(err.to_string().starts_with("io: "));
}

/// The type implements `std::error::Error` and can be boxed.
#[test]
fn implements_std_error() {
    let err: Box<dyn std::error::Error> = Box::new(AppError::Task("oops".into()));
    assert_eq!(err.to_string(), "task: oops");
}
