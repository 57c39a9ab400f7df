//! DNS query construction and answer extraction on top of hickory-proto.

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::error::{Error, Result};

/// Record types asked for every lookup, in answer order.
pub const LOOKUP_TYPES: [RecordType; 2] = [RecordType::A, RecordType::AAAA];

/// Encode a recursive query for `host`.
pub fn build_query(id: u16, host: &str, record_type: RecordType) -> Result<Vec<u8>> {
    let name = Name::from_ascii(host).map_err(|e| Error::resolve(host, e))?;

    let mut msg = Message::default();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, record_type));

    msg.to_vec().map_err(|e| Error::dns(e.to_string()))
}

/// Decoded answer.
pub struct Answer {
    /// Addresses found in the answer section
    pub addrs: Vec<IpAddr>,
    /// Server set the TC bit
    pub truncated: bool,
}

/// Decode a response and pull A/AAAA records out of it.
///
/// NXDOMAIN and other error codes become errors; an empty but successful
/// answer is returned as such.
pub fn parse_answer(host: &str, expected_id: u16, data: &[u8]) -> Result<Answer> {
    let msg = Message::from_vec(data).map_err(|e| Error::dns(e.to_string()))?;

    if msg.id() != expected_id {
        return Err(Error::dns(format!(
            "response id {} does not match query id {}",
            msg.id(),
            expected_id
        )));
    }
    if msg.response_code() != ResponseCode::NoError {
        return Err(Error::resolve(host, msg.response_code()));
    }

    let addrs = msg
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();

    Ok(Answer {
        addrs,
        truncated: msg.truncated(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::IpAddr;

    use hickory_proto::op::{Message, MessageType, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{RData, Record, RecordType};

    /// Answer `query` with the given addresses of the queried type.
    pub fn answer_query(query: &[u8], addrs: &[IpAddr]) -> Vec<u8> {
        let request = Message::from_vec(query).unwrap();
        let question = request.queries()[0].clone();
        let name = question.name().clone();
        let rtype = question.query_type();

        let mut response = Message::default();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_response_code(ResponseCode::NoError);
        response.add_query(question);

        for addr in addrs {
            let rdata = match (addr, rtype) {
                (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
                (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(name.clone(), 60, rdata));
        }

        response.to_vec().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::answer_query;
    use super::*;

    #[test]
    fn test_query_answer() {
        let query = build_query(7, "example.test", RecordType::A).unwrap();
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        let response = answer_query(&query, &[addr]);

        let answer = parse_answer("example.test", 7, &response).unwrap();
        assert_eq!(answer.addrs, vec![addr]);
        assert!(!answer.truncated);
    }

    #[test]
    fn test_mismatched_id() {
        let query = build_query(7, "example.test", RecordType::A).unwrap();
        let response = answer_query(&query, &[]);
        assert!(parse_answer("example.test", 8, &response).is_err());
    }

    #[test]
    fn test_invalid_name() {
        let long_label = "a".repeat(70);
        assert!(build_query(1, &long_label, RecordType::A).is_err());
    }
}
