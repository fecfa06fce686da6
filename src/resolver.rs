use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::{debug, warn};

use crate::cache::ResolveCache;
use crate::entry::{RecordKey, canonical_name};

/// Answer from one upstream query: the records plus any alias targets the
/// upstream reported while chasing the name.
pub struct UpstreamAnswer {
    pub records: Vec<Record>,
    pub aliases: Vec<Name>,
}

/// Where non-local lookups go. Production uses the system recursive
/// infrastructure; tests substitute a counting stub.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn query(&self, name: &Name, rtype: RecordType) -> anyhow::Result<UpstreamAnswer>;
}

/// Upstream resolution through the system resolver configuration, with a
/// public-DNS fallback when resolv.conf is unusable.
pub struct SystemUpstream {
    resolver: TokioAsyncResolver,
}

impl SystemUpstream {
    pub fn from_system_conf() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(err) => {
                warn!(event = "resolver_fallback", error = %err, "system resolver config unusable, using public defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self { resolver }
    }
}

#[async_trait]
impl Upstream for SystemUpstream {
    async fn query(&self, name: &Name, rtype: RecordType) -> anyhow::Result<UpstreamAnswer> {
        let lookup = self.resolver.lookup(name.clone(), rtype).await?;
        let records: Vec<Record> = lookup.record_iter().cloned().collect();
        let aliases = records
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::CNAME(cname)) => Some(canonical_name(&cname.0)),
                _ => None,
            })
            .collect();
        Ok(UpstreamAnswer { records, aliases })
    }
}

/// Cache-aware recursive resolution for keys absent from the local table.
pub struct RecursiveResolver {
    cache: Arc<ResolveCache>,
    upstream: Arc<dyn Upstream>,
}

impl RecursiveResolver {
    pub fn new(cache: Arc<ResolveCache>, upstream: Arc<dyn Upstream>) -> Self {
        Self { cache, upstream }
    }

    /// Resolve `key`, consulting the cache first. `None` means upstream
    /// resolution failed outright; failures are neither retried nor cached.
    pub async fn resolve(&self, key: &RecordKey) -> Option<Vec<Record>> {
        if let Some(records) = self.cache.lookup(key) {
            debug!(event = "cache_hit", qname = %key.name, qtype = %key.rtype);
            return Some(records);
        }
        self.resolve_upstream(key).await
    }

    async fn resolve_upstream(&self, key: &RecordKey) -> Option<Vec<Record>> {
        let answer = match self.upstream.query(&key.name, key.rtype).await {
            Ok(answer) => answer,
            Err(err) => {
                debug!(event = "upstream_miss", qname = %key.name, qtype = %key.rtype, error = %err);
                return None;
            }
        };

        let mut records = answer.records;
        if !answer.aliases.is_empty() {
            // Expand every alias target in parallel so a chain of aliases
            // yields one fully expanded answer list.
            let tasks: Vec<_> = answer
                .aliases
                .into_iter()
                .map(|alias| {
                    let upstream = Arc::clone(&self.upstream);
                    tokio::spawn(
                        async move { upstream.query(&alias, RecordType::CNAME).await },
                    )
                })
                .collect();
            for task in tasks {
                if let Ok(Ok(mut extra)) = task.await {
                    records.append(&mut extra.records);
                }
            }
        }

        // Cache population is fire-and-forget; the caller's response is
        // never delayed by the cache write.
        let cache = Arc::clone(&self.cache);
        let stored_key = key.clone();
        let stored = records.clone();
        tokio::spawn(async move { cache.store(&stored_key, &stored) });

        Some(records)
    }
}
