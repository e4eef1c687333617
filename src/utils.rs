use base64::Engine;

#[derive(Debug)]
pub struct Query {
    pub key: String,
    pub val: String,
}

/// Splits the query string off a request path, if any
pub fn path_only(path: &str) -> &str {
    match path.find('?') {
        Some(i) => &path[..i],
        None => path,
    }
}

pub fn get_queries(path: &str) -> Vec<Query> {
    let mut queries = Vec::new();
    if let Some(i) = path.find('?') {
        for query in path[i + 1..].split('&') {
            if let Some((key, val)) = query.replace('+', " ").split_once('=') {
                let key = urlencoding::decode(key);
                let val = urlencoding::decode(val);
                if let (Ok(key), Ok(val)) = (key, val) {
                    queries.push(Query {
                        key: key.to_string(),
                        val: val.to_string(),
                    });
                }
            }
        }
    }

    queries
}

pub fn query_val<'a>(key: &str, queries: &'a [Query]) -> Option<&'a str> {
    queries
        .iter()
        .find(|query| query.key == key)
        .map(|query| query.val.as_str())
}

pub fn get_header<'a>(key: &str, headers: &'a [(String, Vec<u8>)]) -> Option<&'a [u8]> {
    let key = key.to_lowercase();
    for (name, value) in headers {
        if name.to_lowercase() == key {
            return Some(value);
        }
    }
    None
}

/// The opaque credential part of an `Authorization: Basic <token>` header
pub fn basic_auth_token(headers: &[(String, Vec<u8>)]) -> Option<String> {
    let auth = get_header("Authorization", headers)?;
    let auth = std::str::from_utf8(auth).ok()?;
    auth.strip_prefix("Basic ").map(|token| token.trim().to_string())
}

pub fn basic_auth(user: &str, pass: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_only_strips_query() {
        assert_eq!(path_only("/stream?token=abc"), "/stream");
        assert_eq!(path_only("/stream"), "/stream");
    }

    #[test]
    fn queries_are_decoded() {
        let queries = get_queries("/admin/metadata?mode=updinfo&song=Hello%20World&x=a+b");
        assert_eq!(query_val("mode", &queries), Some("updinfo"));
        assert_eq!(query_val("song", &queries), Some("Hello World"));
        assert_eq!(query_val("x", &queries), Some("a b"));
        assert_eq!(query_val("missing", &queries), None);
    }

    #[test]
    fn no_query_string_yields_nothing() {
        assert!(get_queries("/stream").is_empty());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let headers = vec![("Icy-MetaData".to_string(), b"1".to_vec())];
        assert_eq!(get_header("icy-metadata", &headers), Some(&b"1"[..]));
        assert_eq!(get_header("ICY-METADATA", &headers), Some(&b"1"[..]));
        assert_eq!(get_header("icy-br", &headers), None);
    }

    #[test]
    fn basic_auth_token_extraction() {
        let token = basic_auth("source", "hackme");
        let headers = vec![(
            "Authorization".to_string(),
            format!("Basic {}", token).into_bytes(),
        )];
        assert_eq!(basic_auth_token(&headers), Some(token));

        let headers = vec![("Authorization".to_string(), b"Token abc".to_vec())];
        assert_eq!(basic_auth_token(&headers), None);
    }
}
