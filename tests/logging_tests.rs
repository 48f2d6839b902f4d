use fieldgate::config::LoggingConfig;
use fieldgate::logging::{LogContext, get_logger_with_context, init_logging, parse_log_level};
use tracing::Level;

#[test]
fn parse_level_accepts_python_style_names() {
    assert_eq!(parse_log_level("WARNING").unwrap(), Level::WARN);
    assert_eq!(parse_log_level(" trace ").unwrap(), Level::TRACE);
    assert!(parse_log_level("verbose").is_err());
}

#[test]
fn device_context_is_kept_on_logger() {
    let logger = get_logger_with_context(
        LogContext::new("node")
            .with_device("BMS")
            .with_field("port", "rs485".to_string()),
    );
    assert_eq!(logger.context().component, "node");
    assert_eq!(logger.context().device.as_deref(), Some("BMS"));
    logger.info("context smoke test");
}

#[test]
fn init_logging_rejects_bad_level() {
    let config = LoggingConfig {
        level: "LOUD".to_string(),
        ..Default::default()
    };
    // Initialization runs once per process; the first result is sticky
    assert!(init_logging(&config).is_err());
    assert!(init_logging(&LoggingConfig::default()).is_err());
}
