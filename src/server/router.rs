use hyper::Method;

/// Every route the calendar serves.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Informational front page: GET /
    Info,

    /// Submit a digest into the open round: POST /digest
    Submit,

    /// Best known proof for a digest: GET /timestamp/{hex}
    Timestamp { digest_hex: String },

    /// Latest commitment and its attestation: GET /tip
    Tip,

    /// Raw journal stream for replication: GET /backup/{offset}
    Backup { offset: u64 },

    /// Anything else.
    NotFound,
}

impl Route {
    pub fn from_request(method: &Method, path: &str) -> Self {
        if method == Method::POST {
            if path == "/digest" {
                return Route::Submit;
            }
            return Route::NotFound;
        }

        if !matches!(*method, Method::GET | Method::HEAD) {
            return Route::NotFound;
        }

        if path == "/" {
            return Route::Info;
        }
        if path == "/tip" {
            return Route::Tip;
        }
        if let Some(digest_hex) = path.strip_prefix("/timestamp/") {
            return Route::Timestamp { digest_hex: digest_hex.to_string() };
        }
        if let Some(offset) = path.strip_prefix("/backup/") {
            if let Ok(offset) = offset.parse::<u64>() {
                return Route::Backup { offset };
            }
        }
        Route::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_dispatch_by_method_and_path() {
        assert_eq!(Route::from_request(&Method::POST, "/digest"), Route::Submit);
        assert_eq!(Route::from_request(&Method::GET, "/digest"), Route::NotFound);
        assert_eq!(Route::from_request(&Method::GET, "/"), Route::Info);
        assert_eq!(Route::from_request(&Method::HEAD, "/"), Route::Info);
        assert_eq!(Route::from_request(&Method::GET, "/tip"), Route::Tip);
        assert_eq!(
            Route::from_request(&Method::GET, "/timestamp/abcd"),
            Route::Timestamp { digest_hex: "abcd".into() }
        );
        assert_eq!(Route::from_request(&Method::GET, "/backup/128"), Route::Backup { offset: 128 });
        assert_eq!(Route::from_request(&Method::GET, "/backup/xyz"), Route::NotFound);
        assert_eq!(Route::from_request(&Method::PUT, "/digest"), Route::NotFound);
    }
}
