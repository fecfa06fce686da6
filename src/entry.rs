use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, PTR, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use rustc_hash::FxHashMap;
use tracing::warn;

pub const DEFAULT_LOCAL_TTL: u32 = 86_400;

/// Identity of a DNS record request: query type plus fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub rtype: RecordType,
    pub name: Name,
}

impl RecordKey {
    pub fn new(rtype: RecordType, name: &Name) -> Self {
        Self {
            rtype,
            name: canonical_name(name),
        }
    }
}

/// Canonical form used for every key comparison: fully-qualified, lowercased.
pub fn canonical_name(name: &Name) -> Name {
    let mut name = name.to_lowercase();
    name.set_fqdn(true);
    name
}

/// Authoritative overrides, seeded once at startup and read-only afterwards.
/// Entries always win over the cache and recursion, and never expire (the TTL
/// is kept only for wire encoding). Multiple types may share one name.
#[derive(Debug, Clone, Default)]
pub struct LocalEntries {
    entries: FxHashMap<RecordKey, Record>,
}

impl LocalEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register with the default TTL (86400s) and the Internet class.
    pub fn register(&mut self, rtype: RecordType, domain: &str, spec: &str) -> bool {
        self.register_full(rtype, domain, spec, DEFAULT_LOCAL_TTL, DNSClass::IN)
    }

    /// Register an authoritative record. A malformed domain or record spec is
    /// logged and reported as a failed registration; startup continues.
    pub fn register_full(
        &mut self,
        rtype: RecordType,
        domain: &str,
        spec: &str,
        ttl: u32,
        class: DNSClass,
    ) -> bool {
        let name = match Name::from_str(domain) {
            Ok(name) => canonical_name(&name),
            Err(err) => {
                warn!(event = "local_entry_rejected", domain = %domain, error = %err, "unparseable domain");
                return false;
            }
        };
        let rdata = match parse_rdata(rtype, spec) {
            Ok(rdata) => rdata,
            Err(err) => {
                warn!(event = "local_entry_rejected", domain = %domain, qtype = %rtype, error = %err, "unparseable record spec");
                return false;
            }
        };
        let mut record = Record::from_rdata(name.clone(), ttl, rdata);
        record.set_dns_class(class);
        self.entries.insert(RecordKey { rtype, name }, record);
        true
    }

    pub fn find(&self, key: &RecordKey) -> Option<&Record> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_rdata(rtype: RecordType, spec: &str) -> anyhow::Result<RData> {
    let spec = spec.trim();
    match rtype {
        RecordType::A => Ok(RData::A(A(spec.parse::<Ipv4Addr>()?))),
        RecordType::AAAA => Ok(RData::AAAA(AAAA(spec.parse::<Ipv6Addr>()?))),
        RecordType::CNAME => Ok(RData::CNAME(CNAME(canonical_name(&Name::from_str(spec)?)))),
        RecordType::NS => Ok(RData::NS(NS(canonical_name(&Name::from_str(spec)?)))),
        RecordType::PTR => Ok(RData::PTR(PTR(canonical_name(&Name::from_str(spec)?)))),
        RecordType::TXT => Ok(RData::TXT(TXT::new(vec![spec.to_string()]))),
        other => anyhow::bail!("unsupported record type {other}"),
    }
}
