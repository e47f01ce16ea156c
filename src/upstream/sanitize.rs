use super::ProxyError;

const QUERY_VALUE_DENYLIST: [char; 7] = ['<', '>', '"', '\'', '`', ';', '\\'];

fn invalid(what: &'static str, reason: impl Into<String>) -> ProxyError {
    ProxyError::InvalidArgument {
        what,
        reason: reason.into(),
    }
}

/// Rules for a path appended to a validated base URL.
pub fn validate_relative_path(path: &str) -> Result<(), ProxyError> {
    if !path.starts_with('/') {
        return Err(invalid("path", "must start with '/'"));
    }
    if path.starts_with("//") {
        return Err(invalid("path", "must not start with '//'"));
    }
    if path.contains("://") {
        return Err(invalid("path", "must not contain '://'"));
    }
    if let Some(bad) = path.chars().find(|c| !is_path_char(*c)) {
        return Err(invalid("path", format!("character {bad:?} is not allowed")));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(invalid("path", "must not contain '..' segments"));
    }
    Ok(())
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.' | '?' | '&' | '=' | '%')
}

pub fn validate_resource_id(id: &str) -> Result<(), ProxyError> {
    if id.is_empty() {
        return Err(invalid("resource id", "must not be empty"));
    }
    if !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("resource id", "must contain only digits"));
    }
    Ok(())
}

pub fn validate_query_key(key: &str) -> Result<(), ProxyError> {
    if key.is_empty() {
        return Err(invalid("query key", "must not be empty"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(invalid("query key", format!("'{key}' contains disallowed characters")));
    }
    Ok(())
}

pub fn validate_query_value(value: &str) -> Result<(), ProxyError> {
    match value.chars().find(|c| QUERY_VALUE_DENYLIST.contains(c)) {
        Some(bad) => Err(invalid("query value", format!("character {bad:?} is not allowed"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(result: Result<(), ProxyError>) -> bool {
        matches!(result, Err(ProxyError::InvalidArgument { .. }))
    }

    #[test]
    fn identifiers_must_be_digits() {
        assert!(validate_resource_id("123").is_ok());
        assert!(validate_resource_id("0").is_ok());
        for id in ["12a", "-1", "", " 1", "1.5", "１２", "1/../2"] {
            assert!(rejected(validate_resource_id(id)), "id {id:?}");
        }
    }

    #[test]
    fn paths_must_stay_relative_to_the_base() {
        for path in [
            "api/v3/system/status",
            "//evil.example.com/api",
            "/redirect?to=http://evil.example.com",
            "http://evil.example.com",
            "",
            "/api/v3/../../admin",
            "/api v3",
            "/api/#frag",
            "/api/@evil",
            "/api/\\evil",
        ] {
            assert!(rejected(validate_relative_path(path)), "path {path:?}");
        }
    }

    #[test]
    fn ordinary_paths_pass() {
        for path in [
            "/",
            "/graphql",
            "/api/v3/system/status",
            "/api/v2.0/indexers/all/results",
            "/api?mode=queue&output=json",
            "/plugins/dynamix.docker.manager/include/DockerClient.php",
            "/search/term%20one",
        ] {
            assert!(validate_relative_path(path).is_ok(), "path {path:?}");
        }
    }

    #[test]
    fn query_values_reject_markup_and_shell_characters() {
        assert!(validate_query_value("the office").is_ok());
        assert!(validate_query_value("2024-01-01T00:00:00Z").is_ok());
        assert!(validate_query_value("").is_ok());
        for value in ["<script>", "a\"b", "it's", "`id`", "a;b", "c:\\temp", "x>y"] {
            assert!(rejected(validate_query_value(value)), "value {value:?}");
        }
    }

    #[test]
    fn query_keys_are_plain_tokens() {
        assert!(validate_query_key("term").is_ok());
        assert!(validate_query_key("page_size").is_ok());
        assert!(validate_query_key("sort.key-2").is_ok());
        for key in ["", "a b", "a&b", "a=b", "q[]"] {
            assert!(rejected(validate_query_key(key)), "key {key:?}");
        }
    }
}
