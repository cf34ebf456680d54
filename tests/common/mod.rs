//! Shared fixtures for the behavioural tests.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use hostlink::{
    AssemblerConfig,
    CacheConfig,
    CommandFamily,
    CompletionRule,
    ResponseAssembler,
    ResponseCache,
    ScriptedTransport,
    StaticCatalog,
};

pub type TestCache = ResponseCache<Arc<ScriptedTransport>, StaticCatalog>;

/// Catalog with the host card's `status` family: CR LF terminated, capped at
/// 256 bytes.
#[must_use]
pub fn status_catalog() -> StaticCatalog {
    StaticCatalog::new().with_family(
        "status",
        CommandFamily::new(
            "status",
            CompletionRule::Terminator(b"\r\n".to_vec()),
            NonZeroUsize::new(256).expect("non-zero"),
        ),
    )
}

/// Cache over a scripted transport with a short refresh deadline so failing
/// refreshes resolve quickly under paused time.
#[must_use]
pub fn cache_over(transport: Arc<ScriptedTransport>) -> TestCache {
    let assembler = ResponseAssembler::new(
        Arc::clone(&transport),
        status_catalog(),
        AssemblerConfig::default(),
    );
    ResponseCache::new(
        assembler,
        CacheConfig {
            default_ttl: Duration::from_secs(300),
            refresh_deadline: Duration::from_millis(500),
        },
    )
}

/// One scripted `STATUS=OK` reply split across two fragments, the way the
/// card actually answers.
#[must_use]
pub fn ok_reply() -> Vec<(Duration, Vec<u8>)> {
    vec![
        (Duration::ZERO, b"STAT".to_vec()),
        (Duration::from_millis(50), b"US=OK\r\n".to_vec()),
    ]
}
