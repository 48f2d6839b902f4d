use fieldgate::error::FieldgateError;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(
        FieldgateError::config("x"),
        FieldgateError::Config { .. }
    ));
    assert!(matches!(
        FieldgateError::transport("x"),
        FieldgateError::Transport { .. }
    ));
    assert!(matches!(
        FieldgateError::decode("x"),
        FieldgateError::Decode { .. }
    ));
    assert!(matches!(
        FieldgateError::delivery("x"),
        FieldgateError::Delivery { .. }
    ));
}

#[test]
fn error_constructors_group_2() {
    let ser = FieldgateError::Serialization {
        message: "s".into(),
    };
    assert!(matches!(ser, FieldgateError::Serialization { .. }));
    assert!(matches!(FieldgateError::io("x"), FieldgateError::Io { .. }));
    assert!(matches!(
        FieldgateError::database("x"),
        FieldgateError::Database { .. }
    ));
    assert!(matches!(
        FieldgateError::file_server("x"),
        FieldgateError::FileServer { .. }
    ));
}

#[test]
fn error_constructors_group_3() {
    assert!(matches!(
        FieldgateError::validation("f", "m"),
        FieldgateError::Validation { .. }
    ));
    assert!(matches!(
        FieldgateError::timeout("x"),
        FieldgateError::Timeout { .. }
    ));
    assert!(matches!(
        FieldgateError::generic("x"),
        FieldgateError::Generic { .. }
    ));
}

#[test]
fn display_messages() {
    let e = FieldgateError::validation("field", "bad");
    let s = format!("{}", e);
    assert!(s.contains("Validation error"));

    let e = FieldgateError::file_server("mount gone");
    assert_eq!(e.to_string(), "File server error: mount gone");
}

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let e: FieldgateError = io.into();
    assert!(matches!(e, FieldgateError::Io { .. }));
    assert!(!e.is_connection_error());
}
