use std::time::Duration;

pub use uri::{InvalidUriError, Uri};

/// Timeout applied to every DPS request unless configured otherwise
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(59_000);

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use thiserror::Error;

    #[derive(Debug, Error)]
    pub struct InvalidUriError(String);

    impl Display for InvalidUriError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        pub fn new(uri: http::Uri) -> Self {
            Self(uri)
        }

        pub fn host(&self) -> Option<&str> {
            self.0.host()
        }

        /// Build an `https://` URI for a bare host name such as the one found
        /// in a connection string.
        pub fn from_host(host: &str) -> Result<Self, InvalidUriError> {
            format!("https://{host}").parse()
        }

        /// Replace the path and query of `base_uri`.
        pub fn from_parts(
            base_uri: Uri,
            path: &str,
            query: Option<&str>,
        ) -> Result<Self, InvalidUriError> {
            let path_and_query = if let Some(qs) = query {
                http::uri::PathAndQuery::from_maybe_shared(format!("{path}?{qs}",))?
            } else {
                http::uri::PathAndQuery::from_str(path)?
            };
            let mut parts = base_uri.0.into_parts();
            parts.path_and_query = Some(path_and_query);

            Ok(http::Uri::from_parts(parts).map(Self::new)?)
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let uri = http::Uri::from_str(s)?;
            if uri.scheme().is_none() || uri.host().is_none() {
                return Err(InvalidUriError(format!(
                    "expected an absolute URI with a scheme and host, got '{s}'"
                )));
            }
            Ok(Self(uri))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn replaces_path_and_query() {
            let base: Uri = "https://global.azure-devices-provisioning.net"
                .parse()
                .unwrap();
            let uri = Uri::from_parts(
                base,
                "/0ne000/registrations/edge-01/register",
                Some("api-version=2019-03-31"),
            )
            .unwrap();
            assert_eq!(
                uri.to_string(),
                "https://global.azure-devices-provisioning.net/0ne000/registrations/edge-01/register?api-version=2019-03-31"
            );
        }

        #[test]
        fn keeps_port_of_base_uri() {
            let base: Uri = "http://127.0.0.1:1234".parse().unwrap();
            let uri = Uri::from_parts(base, "/enrollments/a", None).unwrap();
            assert_eq!(uri.to_string(), "http://127.0.0.1:1234/enrollments/a");
        }

        #[test]
        fn builds_https_uri_from_host() {
            let uri = Uri::from_host("my-dps.azure-devices-provisioning.net").unwrap();
            assert_eq!(uri.host(), Some("my-dps.azure-devices-provisioning.net"));
            assert_eq!(
                uri.to_string(),
                "https://my-dps.azure-devices-provisioning.net/"
            );
        }

        #[test]
        fn rejects_relative_uris() {
            assert!("/just/a/path".parse::<Uri>().is_err());
            assert!("not a uri".parse::<Uri>().is_err());
        }
    }
}
