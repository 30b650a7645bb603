use super::*;

#[test]
fn auth_failure_displays_message_verbatim() {
    let failure = AuthFailure::new("Invalid login credentials");
    assert_eq!(failure.to_string(), "Invalid login credentials");
}

#[test]
fn auth_failure_equality_is_by_message() {
    assert_eq!(AuthFailure::new("a"), AuthFailure { message: "a".into() });
    assert_ne!(AuthFailure::new("a"), AuthFailure::new("b"));
}

struct Always;

impl std::fmt::Display for Always {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("always")
    }
}

impl ErrorCode for Always {
    fn error_code(&self) -> &'static str {
        "E_ALWAYS"
    }
}

#[test]
fn error_code_defaults_to_not_retryable() {
    assert_eq!(Always.error_code(), "E_ALWAYS");
    assert!(!Always.retryable());
}
