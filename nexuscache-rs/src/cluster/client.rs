//! Provides the RESP client used to reach the owner of a key on another node.
//!
//! A [RemoteNode](RemoteNode) dials the peer freshly for every call, writes a single
//! command and reads a single reply. The request is rendered with the very same
//! [Response](crate::response::Response) builder the server uses (a RESP request is just an
//! array of bulk strings) and the reply parser below understands the handful of reply
//! shapes a NexusCache node produces.
//!
//! Every call is wrapped in a hard 2 second deadline. A missed deadline surfaces as
//! [CacheError::PeerTimeout] - which is the signal the calling layer uses to eject the
//! peer from the ring.
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::cluster::peers::PeerClient;
use crate::errors::CacheError;
use crate::response::Response;

/// Contains the deadline applied to each peer roundtrip (connect, write and read).
pub const PEER_DEADLINE: Duration = Duration::from_secs(2);

/// A single reply as produced by a NexusCache node.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    /// A simple string like `+OK`.
    Simple(String),
    /// A bulk string carrying arbitrary bytes.
    Bulk(Vec<u8>),
    /// An error reply like `-SERVER: ...`.
    Error(String),
    /// An integer reply.
    Integer(i64),
    /// The RESP nil bulk string (`$-1`).
    Nil,
}

/// Tries to parse a single RESP reply from the given buffer.
///
/// Returns an empty optional if only a partial reply is present so far.
fn parse_reply(buffer: &BytesMut) -> anyhow::Result<Option<Reply>> {
    fn find_crlf(data: &[u8]) -> Option<usize> {
        data.windows(2).position(|window| window == b"\r\n")
    }

    if buffer.len() < 3 {
        return Ok(None);
    }

    let line_end = match find_crlf(&buffer[1..]) {
        Some(position) => position + 1,
        None => return Ok(None),
    };
    let line = std::str::from_utf8(&buffer[1..line_end])?;

    match buffer[0] {
        b'+' => Ok(Some(Reply::Simple(line.to_owned()))),
        b'-' => Ok(Some(Reply::Error(line.to_owned()))),
        b':' => Ok(Some(Reply::Integer(line.parse()?))),
        b'$' => {
            let length: i64 = line.parse()?;
            if length < 0 {
                return Ok(Some(Reply::Nil));
            }

            let data_start = line_end + 2;
            let data_end = data_start + length as usize;
            if buffer.len() < data_end + 2 {
                return Ok(None);
            }

            Ok(Some(Reply::Bulk(buffer[data_start..data_end].to_vec())))
        }
        marker => Err(anyhow::anyhow!(
            "Unexpected reply marker: {}",
            marker as char
        )),
    }
}

/// A cache peer reachable via its RESP endpoint.
pub struct RemoteNode {
    name: String,
    address: String,
}

impl RemoteNode {
    /// Creates a client for the peer with the given name, dialable at the given address.
    pub fn new(name: &str, address: &str) -> Self {
        RemoteNode {
            name: name.to_owned(),
            address: address.to_owned(),
        }
    }

    /// Returns the name of the peer this client talks to.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn transport_error(&self, message: impl Into<String>) -> CacheError {
        CacheError::Peer {
            peer: self.name.clone(),
            message: message.into(),
        }
    }

    /// Performs one request/reply roundtrip under the peer deadline.
    async fn exchange(&self, payload: &[u8]) -> Result<Reply, CacheError> {
        match tokio::time::timeout(PEER_DEADLINE, self.exchange_inner(payload)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::PeerTimeout {
                peer: self.name.clone(),
            }),
        }
    }

    async fn exchange_inner(&self, payload: &[u8]) -> Result<Reply, CacheError> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .map_err(|error| self.transport_error(format!("connect failed: {}", error)))?;
        let _ = stream.set_nodelay(true);

        stream
            .write_all(payload)
            .await
            .map_err(|error| self.transport_error(format!("write failed: {}", error)))?;

        let mut buffer = BytesMut::with_capacity(8192);
        loop {
            let bytes_read = stream
                .read_buf(&mut buffer)
                .await
                .map_err(|error| self.transport_error(format!("read failed: {}", error)))?;

            if let Some(reply) =
                parse_reply(&buffer).map_err(|error| self.transport_error(error.to_string()))?
            {
                return Ok(reply);
            }

            if bytes_read == 0 {
                return Err(
                    self.transport_error("connection closed before a full reply arrived")
                );
            }
        }
    }
}

/// Renders a `CACHE.GET` request for the wire.
fn encode_get(group: &str, key: &str) -> anyhow::Result<BytesMut> {
    let mut request = Response::new();
    request.array(3)?;
    request.bulk("CACHE.GET")?;
    request.bulk(group)?;
    request.bulk(key)?;
    Ok(request.complete()?)
}

/// Renders a `CACHE.SET` request for the wire.
fn encode_set(
    group: &str,
    key: &str,
    value: &[u8],
    expire_unix_seconds: i64,
    is_hot: bool,
) -> anyhow::Result<BytesMut> {
    let mut request = Response::new();
    request.array(6)?;
    request.bulk("CACHE.SET")?;
    request.bulk(group)?;
    request.bulk(key)?;
    request.bulk_bytes(value)?;
    request.bulk(expire_unix_seconds.to_string())?;
    request.bulk(if is_hot { "1" } else { "0" })?;
    Ok(request.complete()?)
}

#[async_trait::async_trait]
impl PeerClient for RemoteNode {
    async fn fetch(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError> {
        let payload = encode_get(group, key)
            .map_err(|error| self.transport_error(error.to_string()))?;

        match self.exchange(&payload).await? {
            Reply::Bulk(value) => Ok(value),
            Reply::Simple(value) => Ok(value.into_bytes()),
            Reply::Error(message) => Err(CacheError::Peer {
                peer: self.name.clone(),
                message,
            }),
            reply => Err(self.transport_error(format!("unexpected reply: {:?}", reply))),
        }
    }

    async fn store(
        &self,
        group: &str,
        key: &str,
        value: &[u8],
        expire_unix_seconds: i64,
        is_hot: bool,
    ) -> Result<(), CacheError> {
        let payload = encode_set(group, key, value, expire_unix_seconds, is_hot)
            .map_err(|error| self.transport_error(error.to_string()))?;

        match self.exchange(&payload).await? {
            Reply::Simple(reply) if reply == "OK" => Ok(()),
            Reply::Error(message) => Err(CacheError::SetRejected {
                peer: self.name.clone(),
                message,
            }),
            reply => Err(self.transport_error(format!("unexpected reply: {:?}", reply))),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::client::{encode_get, encode_set, parse_reply, Reply};
    use bytes::BytesMut;

    #[test]
    fn requests_are_rendered_as_resp_arrays() {
        let request = encode_get("scores", "Tom").unwrap();
        assert_eq!(
            &request[..],
            b"*3\r\n$9\r\nCACHE.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n"
        );

        let request = encode_set("scores", "Tom", b"630", 1735689600, false).unwrap();
        let expected: &[u8] =
            b"*6\r\n$9\r\nCACHE.SET\r\n$6\r\nscores\r\n$3\r\nTom\r\n$3\r\n630\r\n$10\r\n1735689600\r\n$1\r\n0\r\n";
        assert_eq!(&request[..], expected);
    }

    #[test]
    fn replies_are_parsed() {
        assert_eq!(
            parse_reply(&BytesMut::from("+OK\r\n")).unwrap().unwrap(),
            Reply::Simple("OK".to_owned())
        );
        assert_eq!(
            parse_reply(&BytesMut::from("$3\r\n630\r\n"))
                .unwrap()
                .unwrap(),
            Reply::Bulk(b"630".to_vec())
        );
        assert_eq!(
            parse_reply(&BytesMut::from("-SERVER: broken\r\n"))
                .unwrap()
                .unwrap(),
            Reply::Error("SERVER: broken".to_owned())
        );
        assert_eq!(
            parse_reply(&BytesMut::from(":42\r\n")).unwrap().unwrap(),
            Reply::Integer(42)
        );
        assert_eq!(
            parse_reply(&BytesMut::from("$-1\r\n")).unwrap().unwrap(),
            Reply::Nil
        );
    }

    #[test]
    fn partial_replies_are_detected() {
        for partial in ["", "+", "+OK", "+OK\r", "$3\r\n63", "$3\r\n630\r"] {
            assert_eq!(parse_reply(&BytesMut::from(partial)).unwrap().is_none(), true);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_reply(&BytesMut::from("?what\r\n")).is_err(), true);
        assert_eq!(parse_reply(&BytesMut::from("$no\r\n")).is_err(), true);
    }
}
