use url::{Host, Url};

use crate::error::{ClientError, Result};

/// Port SeedLink servers listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 18000;

/// Where to connect, parsed from `host[:port]` or a
/// `slink://host[:port]` / `slinkv3://host[:port]` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServerAddr {
    /// `host:port` in the form `TcpStream::connect` accepts.
    pub target: String,
    /// Set by the `slinkv3` scheme: skip v4 negotiation.
    pub force_v3: bool,
}

impl ServerAddr {
    pub fn parse(input: &str) -> Result<Self> {
        if !input.contains("://") {
            let target = if input.contains(':') {
                input.to_owned()
            } else {
                format!("{input}:{DEFAULT_PORT}")
            };
            return Ok(Self {
                target,
                force_v3: false,
            });
        }

        let invalid = |reason: &str| ClientError::InvalidAddress(format!("{input}: {reason}"));
        let url = Url::parse(input).map_err(|e| invalid(&e.to_string()))?;
        let force_v3 = match url.scheme() {
            "slink" => false,
            "slinkv3" => true,
            other => return Err(invalid(&format!("unsupported scheme {other:?}"))),
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let target = match url.host() {
            Some(Host::Domain(name)) if !name.is_empty() => format!("{name}:{port}"),
            Some(Host::Ipv4(v4)) => format!("{v4}:{port}"),
            Some(Host::Ipv6(v6)) => format!("[{v6}]:{port}"),
            _ => return Err(invalid("missing host")),
        };
        Ok(Self { target, force_v3 })
    }
}
