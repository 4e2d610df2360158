//! TCP channel to the VM-side bridge: endpoint resolution, connect, and the
//! nonblocking fill path into the receive ring.

use std::io;

use tokio::io::AsyncWriteExt;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::RingBuffer;
use crate::error::{BuslinkError, Result};
use crate::protocol::DEFAULT_PORT;

/// Environment variable consulted when no explicit target is given.
pub const TARGET_ENV: &str = "BUSLINK_VM";

/// A resolved `host:port` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Resolve a target string, falling back to the `BUSLINK_VM` environment
    /// variable. A missing port defaults to 4800.
    pub fn resolve(target: Option<&str>) -> Result<Self> {
        let target = match target {
            Some(t) => t.to_owned(),
            None => std::env::var(TARGET_ENV).map_err(|_| {
                BuslinkError::InvalidArgument(format!(
                    "no target given and {TARGET_ENV} is not set"
                ))
            })?,
        };
        Self::parse(&target)
    }

    /// Parse `host` or `host:port`.
    pub fn parse(target: &str) -> Result<Self> {
        if target.is_empty() {
            return Err(BuslinkError::InvalidArgument("empty target".into()));
        }
        match target.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(BuslinkError::InvalidArgument(format!(
                        "malformed target {target:?}"
                    )));
                }
                let port = port.parse::<u16>().map_err(|_| {
                    BuslinkError::InvalidArgument(format!("bad port in target {target:?}"))
                })?;
                Ok(Self {
                    host: host.to_owned(),
                    port,
                })
            }
            None => Ok(Self {
                host: target.to_owned(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

/// One connected socket plus its receive ring.
pub struct Channel {
    stream: TcpStream,
    pub(crate) rx: RingBuffer,
}

impl Channel {
    /// Connect to the endpoint. Nagle is disabled; frames are latency-bound.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        debug!(host = %endpoint.host, port = endpoint.port, "channel connected");
        Ok(Self {
            stream,
            rx: RingBuffer::new(),
        })
    }

    /// Wrap an already-connected stream (loopback peers in tests).
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            rx: RingBuffer::new(),
        })
    }

    /// Drain whatever the socket has ready into the receive ring without
    /// blocking. Returns the number of bytes pulled in.
    pub fn fill(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let span = self.rx.write_span();
            if span.is_empty() {
                break;
            }
            match self.stream.try_read(span) {
                Ok(0) => return Err(BuslinkError::ConnectionReset),
                Ok(n) => {
                    self.rx.commit(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if total > 0 {
            trace!(bytes = total, "filled receive ring");
        }
        Ok(total)
    }

    /// Send raw frame bytes, waiting for socket writability as needed.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Wait until the socket has bytes to read.
    pub async fn readable(&self) -> Result<()> {
        self.stream.ready(Interest::READABLE).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_only_gets_default_port() {
        let ep = Endpoint::parse("vmhost").unwrap();
        assert_eq!(ep.host, "vmhost");
        assert_eq!(ep.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_host_and_port() {
        let ep = Endpoint::parse("10.0.0.7:9000").unwrap();
        assert_eq!(ep.host, "10.0.0.7");
        assert_eq!(ep.port, 9000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Endpoint::parse(""),
            Err(BuslinkError::InvalidArgument(_))
        ));
        assert!(matches!(
            Endpoint::parse("host:notaport"),
            Err(BuslinkError::InvalidArgument(_))
        ));
        assert!(matches!(
            Endpoint::parse(":4800"),
            Err(BuslinkError::InvalidArgument(_))
        ));
    }
}
