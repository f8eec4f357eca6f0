//! ALPN protocol selection.
//!
//! Given the server's advertised protocol list (ordered by preference) and
//! the client's wire-format length-prefixed list, picks the first
//! server-preferred protocol the client also offers. A malformed client
//! list yields "no acknowledgement" rather than an error -- ALPN mismatch
//! is not fatal to the handshake.

/// Parses a `[len][bytes]...` protocol list. Returns `None` if any length
/// prefix runs past the end of the buffer.
fn parse_protocol_list(mut data: &[u8]) -> Option<Vec<&[u8]>> {
    let mut protocols = Vec::new();
    while !data.is_empty() {
        let len = data[0] as usize;
        data = &data[1..];
        if len > data.len() {
            return None;
        }
        let (proto, rest) = data.split_at(len);
        protocols.push(proto);
        data = rest;
    }
    Some(protocols)
}

/// Selects the earliest server-preferred protocol present in the client's
/// list. `server_protocols` is ordered by server preference; `client_list`
/// is the raw length-prefixed wire format. Returns `None` ("no
/// acknowledgement") on no match or a malformed client list.
pub fn select<'a>(server_protocols: &[&'a [u8]], client_list: &[u8]) -> Option<&'a [u8]> {
    let client_protocols = parse_protocol_list(client_list)?;
    server_protocols
        .iter()
        .find(|server_proto| client_protocols.iter().any(|c| c == *server_proto))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(protocols: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in protocols {
            out.push(p.len() as u8);
            out.extend_from_slice(p);
        }
        out
    }

    #[test]
    fn picks_earliest_server_preference() {
        let server = [b"h2".as_slice(), b"http/1.1".as_slice()];
        let client = encode(&[b"http/1.1", b"h2"]);
        assert_eq!(select(&server, &client), Some(b"h2".as_slice()));
    }

    #[test]
    fn no_overlap_is_no_acknowledgement() {
        let server = [b"h2".as_slice()];
        let client = encode(&[b"spdy/3"]);
        assert_eq!(select(&server, &client), None);
    }

    #[test]
    fn malformed_client_list_is_no_acknowledgement() {
        let server = [b"h2".as_slice()];
        let client = vec![10u8, b'h', b'2']; // length prefix exceeds remaining bytes
        assert_eq!(select(&server, &client), None);
    }

    #[test]
    fn selection_is_deterministic() {
        let server = [b"a".as_slice(), b"b".as_slice(), b"c".as_slice()];
        let client = encode(&[b"c", b"b", b"a"]);
        for _ in 0..5 {
            assert_eq!(select(&server, &client), Some(b"a".as_slice()));
        }
    }
}
