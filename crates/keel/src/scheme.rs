use crate::ServerError;

/// Wire transport of a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Unix,
    /// TCP wrapped in TLS.
    Ssl,
}

impl Transport {
    pub fn label(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Unix => "unix",
            Self::Ssl => "ssl",
        }
    }
}

/// Parsed form of a `scheme://address` listen string.
#[derive(Clone, Debug)]
pub struct ListenTarget {
    pub transport: Transport,
    /// Set when the scheme named an application codec rather than a
    /// transport; resolved against the codec registry at startup.
    pub codec_scheme: Option<String>,
    pub address: String,
}

/// The one place deciding what a scheme means.
///
/// `tcp`, `udp`, `unix` and `ssl` are transports (only `ssl` forces TLS);
/// every other scheme is an application codec carried over TCP.
pub fn parse_listen(listen: &str) -> Result<ListenTarget, ServerError> {
    let (scheme, address) = listen
        .split_once("://")
        .ok_or_else(|| ServerError::Config(format!("listen string `{listen}` has no scheme")))?;
    if address.is_empty() {
        return Err(ServerError::Config(format!("listen string `{listen}` has no address")));
    }

    let (transport, codec_scheme) = match scheme {
        "tcp" => (Transport::Tcp, None),
        "udp" => (Transport::Udp, None),
        "unix" => (Transport::Unix, None),
        "ssl" => (Transport::Ssl, None),
        codec => (Transport::Tcp, Some(codec.to_string())),
    };

    Ok(ListenTarget { transport, codec_scheme, address: address.to_string() })
}

impl ListenTarget {
    /// The display form shown in dumps and process titles.
    pub fn display(&self) -> String {
        match &self.codec_scheme {
            Some(scheme) => format!("{scheme}://{}", self.address),
            None => format!("{}://{}", self.transport.label(), self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transports_parse_as_themselves() {
        let t = parse_listen("tcp://0.0.0.0:80").expect("tcp");
        assert_eq!(t.transport, Transport::Tcp);
        assert!(t.codec_scheme.is_none());

        let u = parse_listen("udp://127.0.0.1:6789").expect("udp");
        assert_eq!(u.transport, Transport::Udp);

        let s = parse_listen("ssl://0.0.0.0:443").expect("ssl");
        assert_eq!(s.transport, Transport::Ssl);

        let x = parse_listen("unix:///tmp/app.sock").expect("unix");
        assert_eq!(x.transport, Transport::Unix);
        assert_eq!(x.address, "/tmp/app.sock");
    }

    #[test]
    fn unknown_scheme_is_a_codec_over_tcp() {
        let t = parse_listen("text://127.0.0.1:8080").expect("codec scheme");
        assert_eq!(t.transport, Transport::Tcp);
        assert_eq!(t.codec_scheme.as_deref(), Some("text"));
        assert_eq!(t.display(), "text://127.0.0.1:8080");
    }

    #[test]
    fn malformed_strings_fail_fast() {
        assert!(parse_listen("no-scheme-here").is_err());
        assert!(parse_listen("tcp://").is_err());
    }
}
