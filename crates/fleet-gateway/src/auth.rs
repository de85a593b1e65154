use fleet_core::config::GatewayConfig;

/// Check a request's credentials against the configured token.
///
/// A Bearer header takes precedence over `?token=`. With no token configured
/// every request passes, except one carrying a Bearer header, which is
/// rejected since it cannot match anything.
pub fn validate_auth(
    config: &GatewayConfig,
    bearer: Option<&str>,
    query_token: Option<&str>,
) -> bool {
    match (&config.token, bearer) {
        (Some(expected), Some(given)) => given == expected,
        (None, Some(_)) => false,
        (Some(expected), None) => query_token == Some(expected.as_str()),
        (None, None) => true,
    }
}

/// Extract token from the query string (?token=...).
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    for pair in query.split('&') {
        if let Some(val) = pair.strip_prefix("token=") {
            return Some(val);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(token: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1:18790".to_string(),
            token: token.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_no_token_is_open() {
        let config = gateway(None);
        assert!(validate_auth(&config, None, None));
        assert!(validate_auth(&config, None, Some("anything")));
        assert!(!validate_auth(&config, Some("anything"), None)); // Bearer with no match
    }

    #[test]
    fn test_bearer_token() {
        let config = gateway(Some("secret"));
        assert!(validate_auth(&config, Some("secret"), None));
        assert!(!validate_auth(&config, Some("wrong"), None));
        assert!(!validate_auth(&config, None, None));
        // Header wins over the query string
        assert!(!validate_auth(&config, Some("wrong"), Some("secret")));
    }

    #[test]
    fn test_query_token() {
        let config = gateway(Some("secret"));
        assert!(validate_auth(&config, None, Some("secret")));
        assert!(!validate_auth(&config, None, Some("nope")));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token_from_query("token=abc"), Some("abc"));
        assert_eq!(extract_token_from_query("wait=true&token=abc"), Some("abc"));
        assert_eq!(extract_token_from_query("wait=true"), None);
    }
}
