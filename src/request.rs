//! The request a command is trying to satisfy.

use url::Url;

/// Which protocol family a request is driven through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolHint {
    /// Request/response file transfer (HTTP/FTP over TCP).
    RequestResponse,
    /// Peer-swarm wire protocol.
    Swarm,
}

/// A URL target plus protocol hint, a try-count, and optional proxy
/// directives. Mutated only by the owning command; reset on peer-initiated
/// disconnection so the next attempt restarts from the original URL.
#[derive(Clone, Debug)]
pub struct Request {
    original_url: Url,
    url: Url,
    pub protocol: ProtocolHint,
    try_count: u32,
}

impl Request {
    pub fn new(url: Url, protocol: ProtocolHint) -> Self {
        Self {
            original_url: url.clone(),
            url,
            protocol,
            try_count: 0,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    /// Resets the working URL back to the one the request was created with.
    /// Used on redirects being abandoned and on peer-initiated disconnects.
    pub fn reset_url(&mut self) {
        self.url = self.original_url.clone();
    }

    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    pub fn add_try_count(&mut self) {
        self.try_count += 1;
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    pub fn path(&self) -> &str {
        let p = self.url.path();
        if p.is_empty() {
            "/"
        } else {
            p
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_url_restores_original() {
        let mut req = Request::new(
            Url::parse("http://example.com/a").unwrap(),
            ProtocolHint::RequestResponse,
        );
        req.set_url(Url::parse("http://example.com/b").unwrap());
        assert_eq!(req.url().path(), "/b");
        req.reset_url();
        assert_eq!(req.url().path(), "/a");
    }

    #[test]
    fn try_count_increments() {
        let mut req = Request::new(
            Url::parse("http://example.com/a").unwrap(),
            ProtocolHint::RequestResponse,
        );
        assert_eq!(req.try_count(), 0);
        req.add_try_count();
        req.add_try_count();
        assert_eq!(req.try_count(), 2);
    }
}
