//! Best-effort TLS Client Hello inspection.
//!
//! Record layout walked here:
//!
//! ```text
//! record:    type(1)=0x16 | version(2) | length(2)
//! handshake: type(1)=0x01 | length(3) | version(2) | random(32)
//!            | session_id(1+N) | cipher_suites(2+N) | compression(1+N)
//!            | extensions_len(2) | { ext_type(2) | ext_len(2) | data(N) }*
//! ```

/// TLS record header size.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext fragment a TLS record may carry.
pub const MAX_RECORD_PAYLOAD: usize = 16384;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;

/// Returns true if `data` starts like a TLS handshake record.
pub fn is_handshake_record(data: &[u8]) -> bool {
    data.len() >= RECORD_HEADER_LEN && data[0] == CONTENT_TYPE_HANDSHAKE && data[1] == 0x03
}

/// Offset of the server_name extension inside a Client Hello record.
///
/// The offset points at the extension's type field so that the whole
/// extension, hostname included, lands after the split boundary. Returns
/// `None` for anything that is not a Client Hello or is too short to reach
/// the extension.
pub fn find_sni_offset(data: &[u8]) -> Option<usize> {
    if !is_handshake_record(data) {
        return None;
    }
    if *data.get(RECORD_HEADER_LEN)? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }

    // record(5) + handshake header(4) + client_version(2) + random(32)
    let mut pos = RECORD_HEADER_LEN + 4 + 2 + 32;

    let session_id_len = *data.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len = read_u16(data, pos)? as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *data.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(data, pos)? as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(data.len());

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(data, pos)?;
        let ext_len = read_u16(data, pos + 2)? as usize;
        if ext_type == EXT_SERVER_NAME {
            return Some(pos);
        }
        pos += 4 + ext_len;
    }

    None
}

/// Re-frame a single handshake record into several records whose payloads
/// are at most `max_payload` bytes.
///
/// Returns the new bytes together with `offset` translated into the new
/// layout. `None` if `data` is not exactly one complete handshake record.
pub fn split_handshake_record(
    data: &[u8],
    max_payload: usize,
    offset: Option<usize>,
) -> Option<(Vec<u8>, Option<usize>)> {
    if max_payload == 0 || !is_handshake_record(data) {
        return None;
    }
    let record_len = read_u16(data, 3)? as usize;
    if record_len + RECORD_HEADER_LEN != data.len() {
        return None;
    }

    let payload = &data[RECORD_HEADER_LEN..];
    let records = (payload.len() + max_payload - 1) / max_payload;
    let mut out = Vec::with_capacity(payload.len() + records * RECORD_HEADER_LEN);

    for chunk in payload.chunks(max_payload) {
        out.push(CONTENT_TYPE_HANDSHAKE);
        out.extend_from_slice(&data[1..3]);
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }

    // Every record boundary before the offset adds one header
    let mapped = offset.map(|o| {
        let inner = o.saturating_sub(RECORD_HEADER_LEN);
        o + (inner / max_payload) * RECORD_HEADER_LEN
    });

    Some((out, mapped))
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]))
}

/// Build a minimal Client Hello carrying `hostname` in its SNI extension.
#[cfg(test)]
pub(crate) fn sample_client_hello(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();

    let mut sni = Vec::new();
    sni.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    sni.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(0x00);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    // supported_versions ahead of SNI so the scan has to skip one extension
    let mut extensions = vec![0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04];
    extensions.extend_from_slice(&sni);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x11; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_sni() {
        let hello = sample_client_hello("blocked.example");
        let offset = find_sni_offset(&hello).unwrap();

        assert_eq!(&hello[offset..offset + 2], &[0x00, 0x00]);
        let name_start = offset + 9;
        assert_eq!(
            &hello[name_start..name_start + "blocked.example".len()],
            b"blocked.example"
        );
    }

    #[test]
    fn test_find_sni_rejects_non_tls() {
        assert_eq!(find_sni_offset(b"GET / HTTP/1.1\r\n\r\n"), None);
        assert_eq!(find_sni_offset(&[0x16, 0x03, 0x01]), None);
    }

    #[test]
    fn test_find_sni_truncated() {
        let hello = sample_client_hello("blocked.example");
        // Cut inside the fixed fields
        assert_eq!(find_sni_offset(&hello[..40]), None);
    }

    #[test]
    fn test_split_records() {
        let hello = sample_client_hello("blocked.example");
        let offset = find_sni_offset(&hello);
        let (split, mapped) = split_handshake_record(&hello, 16, offset).unwrap();

        // Strip headers back off and compare handshake bytes
        let mut pos = 0;
        let mut payload = Vec::new();
        while pos < split.len() {
            assert_eq!(split[pos], 0x16);
            let len = u16::from_be_bytes([split[pos + 3], split[pos + 4]]) as usize;
            assert!(len <= 16);
            payload.extend_from_slice(&split[pos + 5..pos + 5 + len]);
            pos += 5 + len;
        }
        assert_eq!(payload, &hello[5..]);

        let mapped = mapped.unwrap();
        assert_eq!(&split[mapped..mapped + 2], &[0x00, 0x00]);
    }

    #[test]
    fn test_split_requires_complete_record() {
        let hello = sample_client_hello("a.example");
        assert!(split_handshake_record(&hello[..hello.len() - 1], 16, None).is_none());
        assert!(split_handshake_record(&hello, 0, None).is_none());
    }
}
