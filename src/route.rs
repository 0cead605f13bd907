use std::{
    fmt,
    hash::{Hash, Hasher},
    io,
    net::{SocketAddr, ToSocketAddrs},
};

use http::{uri::Scheme, Uri};

use crate::error::RouteError;

/// Origin a pooled connection is bound to. Connections are shared between
/// pipelines only when their routes compare equal.
#[derive(Clone, Debug)]
pub struct Route {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Route {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        let mut host = host.into();
        host.make_ascii_lowercase();
        Self { scheme, host, port }
    }

    #[inline]
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    fn default_port(scheme: &Scheme) -> Option<u16> {
        if scheme == &Scheme::HTTP {
            Some(80)
        } else if scheme == &Scheme::HTTPS {
            Some(443)
        } else {
            None
        }
    }

    /// Value for the `Host` header: the port is omitted when it matches the
    /// scheme default.
    pub fn authority(&self) -> String {
        match Self::default_port(&self.scheme) {
            Some(default) if default == self.port => self.host.clone(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme && self.host == other.host && self.port == other.port
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scheme.as_str().hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl TryFrom<&Uri> for Route {
    type Error = RouteError;

    fn try_from(uri: &Uri) -> Result<Self, Self::Error> {
        let host = match uri.host() {
            Some(h) => h,
            None => return Err(RouteError::NoAuthority),
        };

        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        let default_port = match Self::default_port(&scheme) {
            Some(p) => p,
            None => return Err(RouteError::UnsupportedScheme),
        };
        let port = uri.port_u16().unwrap_or(default_port);

        Ok(Self::new(scheme, host, port))
    }
}

impl TryFrom<Uri> for Route {
    type Error = RouteError;

    fn try_from(uri: Uri) -> Result<Self, Self::Error> {
        Self::try_from(&uri)
    }
}

impl ToSocketAddrs for Route {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_uri_with_default_ports() {
        let r: Route = (&"http://example.com/get".parse::<Uri>().unwrap())
            .try_into()
            .unwrap();
        assert_eq!(r.host(), "example.com");
        assert_eq!(r.port(), 80);
        assert_eq!(r.authority(), "example.com");

        let r: Route = (&"https://example.com".parse::<Uri>().unwrap())
            .try_into()
            .unwrap();
        assert_eq!(r.port(), 443);
    }

    #[test]
    fn from_uri_with_explicit_port() {
        let r: Route = (&"http://example.com:8080/get".parse::<Uri>().unwrap())
            .try_into()
            .unwrap();
        assert_eq!(r.port(), 8080);
        assert_eq!(r.authority(), "example.com:8080");
    }

    #[test]
    fn host_is_case_insensitive() {
        let a: Route = (&"http://Example.COM/".parse::<Uri>().unwrap())
            .try_into()
            .unwrap();
        let b: Route = (&"http://example.com/".parse::<Uri>().unwrap())
            .try_into()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_relative_and_exotic_uris() {
        let err = Route::try_from(&"/relative/path".parse::<Uri>().unwrap()).unwrap_err();
        assert!(matches!(err, RouteError::NoAuthority));

        let err = Route::try_from(&"ftp://example.com/".parse::<Uri>().unwrap()).unwrap_err();
        assert!(matches!(err, RouteError::UnsupportedScheme));
    }

    #[test]
    fn distinct_ports_are_distinct_routes() {
        let a = Route::new(Scheme::HTTP, "example.com", 80);
        let b = Route::new(Scheme::HTTP, "example.com", 8080);
        assert_ne!(a, b);
    }
}
