//! Maps raw downstream failure text onto the short labels stored in run
//! metadata. Drivers and HTTP APIs do not expose structured error kinds across
//! the integration boundary, so classification is pattern matching over the
//! message; the raw text is always preserved verbatim alongside the label.

use lazy_regex::regex_is_match;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    #[strum(serialize = "No connection")]
    NoConnection,

    #[strum(serialize = "Incorrect password")]
    IncorrectPassword,

    #[strum(serialize = "Missing permission")]
    MissingPermission,

    #[strum(serialize = "Error")]
    Generic,
}

pub fn classify(message: &str) -> ErrorKind {
    if regex_is_match!(
        r"could not translate host name|Connection refused|connection timed out|failed to lookup address|could not reach",
        message
    ) {
        return ErrorKind::NoConnection;
    }

    if regex_is_match!(
        r"password authentication failed|Incorrect username or password|401 Unauthorized|invalid OAuth access token",
        message
    ) {
        return ErrorKind::IncorrectPassword;
    }

    if regex_is_match!(
        r#"database ".*" does not exist|permission denied|403 Forbidden|relation ".*" does not exist"#,
        message
    ) {
        return ErrorKind::MissingPermission;
    }

    ErrorKind::Generic
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::dns_bsd(
        "could not translate host name \"a\" to address: nodename nor servname provided, or not known\n",
        ErrorKind::NoConnection
    )]
    #[case::dns_glibc(
        "could not translate host name \"a\" to address: Temporary failure in name resolution\n",
        ErrorKind::NoConnection
    )]
    #[case::refused("Connection refused (os error 111)", ErrorKind::NoConnection)]
    #[case::unreachable(
        "could not reach a:5432; failed to lookup address information: Name or service not known",
        ErrorKind::NoConnection
    )]
    #[case::bad_password(
        "FATAL:  password authentication failed for user \"analytics\"\n",
        ErrorKind::IncorrectPassword
    )]
    #[case::http_auth("HTTP status client error (401 Unauthorized) for url", ErrorKind::IncorrectPassword)]
    #[case::missing_db(
        "FATAL:  database \"wrong\" does not exist\n",
        ErrorKind::MissingPermission
    )]
    #[case::denied("ERROR:  permission denied for table orders", ErrorKind::MissingPermission)]
    #[case::unknown("something exploded in an unforeseen way", ErrorKind::Generic)]
    fn classify_known_patterns(#[case] message: &str, #[case] expected: ErrorKind) {
        assert_eq!(classify(message), expected);
    }

    #[test]
    fn labels_render_for_metadata() {
        assert_eq!(ErrorKind::NoConnection.to_string(), "No connection");
        assert_eq!(ErrorKind::IncorrectPassword.to_string(), "Incorrect password");
        assert_eq!(ErrorKind::MissingPermission.to_string(), "Missing permission");
        assert_eq!(ErrorKind::Generic.to_string(), "Error");
    }
}
