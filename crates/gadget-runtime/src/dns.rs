//! DNS events and their latency enrichment.
//!
//! Packets arrive already decoded. Queries are remembered in the tracer's
//! correlator; responses pick up the elapsed time before being published.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gadget_common::types::TraceName;
use gadget_core::clock::wall_time_from_boot_time;
use gadget_ebpf::latency::{CorrelationKey, LatencyCorrelator};

use crate::sink::{EventSink, publish_json};

/// Direction of a DNS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsPacketType {
    /// Query.
    #[serde(rename = "Q")]
    Query,
    /// Response.
    #[serde(rename = "R")]
    Response,
}

/// RCODE of a DNS response header (RFC 1035, section 4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsResponseCode {
    /// No error condition.
    NoError,
    /// The server could not interpret the query.
    FormErr,
    /// The server failed to process the query.
    ServFail,
    /// The queried name does not exist.
    #[serde(rename = "NXDomain")]
    NxDomain,
    /// The query kind is not supported.
    NotImp,
    /// The server refused to answer.
    Refused,
}

impl DnsResponseCode {
    /// Decodes a header RCODE; codes outside RFC 1035 yield `None`.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NoError),
            1 => Some(Self::FormErr),
            2 => Some(Self::ServFail),
            3 => Some(Self::NxDomain),
            4 => Some(Self::NotImp),
            5 => Some(Self::Refused),
            _ => None,
        }
    }
}

impl fmt::Display for DnsResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "NoError",
            Self::FormErr => "FormErr",
            Self::ServFail => "ServFail",
            Self::NxDomain => "NXDomain",
            Self::NotImp => "NotImp",
            Self::Refused => "Refused",
        };
        f.write_str(name)
    }
}

/// A decoded DNS packet as reported by the probe.
///
/// Decoders outside this crate hand packets over as camelCase JSON, one per
/// line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsPacket {
    /// Boot-relative capture time in nanoseconds.
    pub timestamp_ns: u64,
    /// Address of the client: source of a query, destination of a response.
    pub client: IpAddr,
    /// Address of the name server.
    pub nameserver: IpAddr,
    /// Header ID.
    pub id: u16,
    /// Query or response.
    pub qr: DnsPacketType,
    /// Kernel packet type (`HOST`, `OUTGOING`, ...).
    pub pkt_type: String,
    /// Query type (`A`, `AAAA`, ...).
    pub qtype: String,
    /// Queried name.
    pub name: String,
    /// Raw RCODE; meaningful for responses only.
    #[serde(default)]
    pub rcode: u8,
}

/// Event published for every DNS packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsEvent {
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Header ID as four hex digits.
    pub id: String,
    /// Query or response.
    pub qr: DnsPacketType,
    /// Name server address.
    pub nameserver: String,
    /// Kernel packet type.
    pub pkt_type: String,
    /// Query type.
    pub qtype: String,
    /// Queried name.
    pub name: String,
    /// Response code, for responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<DnsResponseCode>,
    /// Time since the matching query, for answered responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ns: Option<u64>,
}

/// Turns decoded packets into published events, attaching query latency to
/// responses.
pub struct DnsEnricher {
    trace: TraceName,
    correlator: Arc<LatencyCorrelator>,
    sink: Arc<dyn EventSink>,
}

impl DnsEnricher {
    /// Creates an enricher publishing events of `trace` to `sink`.
    pub fn new(trace: TraceName, correlator: Arc<LatencyCorrelator>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            trace,
            correlator,
            sink,
        }
    }

    /// Builds the event for `packet` without publishing it.
    #[must_use]
    pub fn enrich(&self, packet: &DnsPacket) -> DnsEvent {
        let key = CorrelationKey::from_ip(packet.client, packet.id);
        let (response_code, latency_ns) = match packet.qr {
            DnsPacketType::Query => {
                self.correlator.record_request(key, packet.timestamp_ns);
                (None, None)
            }
            DnsPacketType::Response => {
                let latency = self.correlator.resolve_response(key, packet.timestamp_ns);
                let latency_ns = u64::try_from(latency.as_nanos()).ok().filter(|ns| *ns > 0);
                (DnsResponseCode::from_code(packet.rcode), latency_ns)
            }
        };

        DnsEvent {
            timestamp: wall_time_from_boot_time(packet.timestamp_ns),
            id: format!("{:04x}", packet.id),
            qr: packet.qr,
            nameserver: packet.nameserver.to_string(),
            pkt_type: packet.pkt_type.clone(),
            qtype: packet.qtype.clone(),
            name: packet.name.clone(),
            response_code,
            latency_ns,
        }
    }

    /// Enriches and publishes `packet`.
    pub fn handle(&self, packet: &DnsPacket) {
        let event = self.enrich(packet);
        publish_json(self.sink.as_ref(), &self.trace, &event);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl EventSink for Collect {
        fn publish(&self, _trace: &TraceName, event: &str) {
            self.0.lock().unwrap().push(event.to_owned());
        }
    }

    fn packet(qr: DnsPacketType, timestamp_ns: u64) -> DnsPacket {
        DnsPacket {
            timestamp_ns,
            client: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            nameserver: IpAddr::V4(Ipv4Addr::new(10, 96, 0, 10)),
            id: 0x1a2b,
            qr,
            pkt_type: "OUTGOING".into(),
            qtype: "A".into(),
            name: "example.com.".into(),
            rcode: 3,
        }
    }

    #[test]
    fn response_carries_latency() {
        let correlator = Arc::new(LatencyCorrelator::default());
        let sink = Arc::new(Collect::default());
        let enricher = DnsEnricher::new(
            TraceName::new("default", "dns"),
            Arc::clone(&correlator),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );

        enricher.handle(&packet(DnsPacketType::Query, 1_000));
        assert_eq!(correlator.outstanding_count(), 1);
        enricher.handle(&packet(DnsPacketType::Response, 4_000));
        assert_eq!(correlator.outstanding_count(), 0);

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        let query: serde_json::Value = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(query["qr"], "Q");
        assert_eq!(query["id"], "1a2b");
        assert!(query.get("latencyNs").is_none());

        let response: serde_json::Value = serde_json::from_str(&events[1]).unwrap();
        assert_eq!(response["qr"], "R");
        assert_eq!(response["responseCode"], "NXDomain");
        assert_eq!(response["latencyNs"], 3_000);
        assert_eq!(response["nameserver"], "10.96.0.10");
    }

    #[test]
    fn unmatched_response_has_no_latency() {
        let enricher = DnsEnricher::new(
            TraceName::new("default", "dns"),
            Arc::new(LatencyCorrelator::default()),
            Arc::new(Collect::default()),
        );
        let event = enricher.enrich(&packet(DnsPacketType::Response, 4_000));
        assert_eq!(event.latency_ns, None);
        assert_eq!(event.response_code, Some(DnsResponseCode::NxDomain));
    }

    #[test]
    fn packet_decodes_from_json_line() {
        let line = r#"{"timestampNs":42,"client":"10.0.0.5","nameserver":"fd00::a","id":7,"qr":"Q","pktType":"OUTGOING","qtype":"A","name":"example.com."}"#;
        let packet: DnsPacket = serde_json::from_str(line).unwrap();
        assert_eq!(packet.timestamp_ns, 42);
        assert_eq!(packet.qr, DnsPacketType::Query);
        assert_eq!(packet.nameserver.to_string(), "fd00::a");
        assert_eq!(packet.rcode, 0);
    }

    #[test]
    fn response_code_names() {
        assert_eq!(DnsResponseCode::from_code(0).unwrap().to_string(), "NoError");
        assert_eq!(DnsResponseCode::from_code(5).unwrap().to_string(), "Refused");
        assert_eq!(DnsResponseCode::from_code(9), None);
        assert_eq!(
            serde_json::to_string(&DnsResponseCode::ServFail).unwrap(),
            "\"ServFail\""
        );
    }
}
