//! Query handling: forward, match, track, filter
//!
//! Shared by the UDP and TCP listeners. Each inbound query is forwarded to
//! the upstream resolver; when the question's name matches the current
//! ruleset the resolved addresses are fed into the tracker before the
//! response is released to the client. With IPv6 disabled, AAAA answers for
//! matched names are stripped so clients cannot bypass the v4 redirect.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, Record, RecordType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::upstream::Upstream;
use crate::rules::DomainMatcher;
use crate::tracker::Tracker;

/// Shared per-query processing for both listeners
pub struct QueryHandler {
    matcher: Arc<DomainMatcher>,
    tracker: Arc<Tracker>,
    upstream: Arc<dyn Upstream>,
    ipv6: bool,
}

impl QueryHandler {
    /// Create a handler over the given matcher, tracker, and upstream
    #[must_use]
    pub fn new(
        matcher: Arc<DomainMatcher>,
        tracker: Arc<Tracker>,
        upstream: Arc<dyn Upstream>,
        ipv6: bool,
    ) -> Self {
        Self {
            matcher,
            tracker,
            upstream,
            ipv6,
        }
    }

    /// The handler's matcher, for reconciler wiring
    #[must_use]
    pub fn matcher(&self) -> &Arc<DomainMatcher> {
        &self.matcher
    }

    /// The handler's tracker, for reconciler wiring
    #[must_use]
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Process one wire-format query and produce the wire-format response.
    ///
    /// Returns `None` when the packet should be dropped silently: malformed
    /// messages and messages with an empty question section.
    pub async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Option<Vec<u8>> {
        let query = match Message::from_vec(payload) {
            Ok(query) => query,
            Err(e) => {
                debug!(error = %e, "dropping unparseable query");
                return None;
            }
        };

        if query.queries().is_empty() {
            trace!(id = query.id(), "dropping query with empty question section");
            return None;
        }

        let mut response = match self.upstream.exchange(cancel, &query).await {
            Ok(response) => response,
            Err(e) => {
                debug!(id = query.id(), error = %e, "upstream exchange failed");
                return servfail(&query).to_vec().ok();
            }
        };

        // Multi-question packets are forwarded untouched, without
        // inspection.
        if query.queries().len() == 1 {
            let qname = normalize_qname(&query.queries()[0].name().to_string());
            if self.matcher.matches(&qname) {
                self.process_matched(cancel, &qname, &mut response).await;
            }
        }

        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(id = query.id(), error = %e, "failed to encode response");
                None
            }
        }
    }

    /// Track resolved addresses for a matched name; strip AAAA answers when
    /// IPv6 is disabled.
    async fn process_matched(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        response: &mut Message,
    ) {
        if self.ipv6 {
            for record in response.answers() {
                if let Some(addr) = record_addr(record) {
                    self.tracker
                        .track(cancel, domain, &addr.to_string())
                        .await;
                }
            }
            return;
        }

        // IPv6 disabled: track and keep A answers, drop AAAA answers,
        // forward everything else.
        let answers = response.take_answers();
        let mut kept = Vec::with_capacity(answers.len());
        for record in answers {
            match record.record_type() {
                RecordType::A => {
                    if let Some(addr) = record_addr(&record) {
                        self.tracker
                            .track(cancel, domain, &addr.to_string())
                            .await;
                    }
                    kept.push(record);
                }
                RecordType::AAAA => {
                    trace!(domain, "stripping AAAA answer, ipv6 disabled");
                }
                _ => kept.push(record),
            }
        }
        response.insert_answers(kept);
    }
}

impl std::fmt::Debug for QueryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandler")
            .field("ipv6", &self.ipv6)
            .finish_non_exhaustive()
    }
}

/// Lowercase and strip the trailing dot from a wire-format query name
fn normalize_qname(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// The address carried by an A or AAAA record, if any
fn record_addr(record: &Record) -> Option<IpAddr> {
    match record.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

/// Synthesise a SERVFAIL response preserving the request id, question, and
/// RD flag, with RA set.
fn servfail(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_response_code(ResponseCode::ServFail);
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.add_queries(query.queries().to_vec());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::error::{DnsError, DnsResult};
    use crate::netfilter::testutil::MockAddrSet;
    use crate::store::Selector;
    use async_trait::async_trait;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    /// Upstream returning a canned answer set, or failing
    struct CannedUpstream {
        records: Vec<(RecordType, IpAddr)>,
        fail: bool,
    }

    #[async_trait]
    impl Upstream for CannedUpstream {
        async fn exchange(
            &self,
            _cancel: &CancellationToken,
            query: &Message,
        ) -> DnsResult<Message> {
            if self.fail {
                return Err(DnsError::timeout(
                    "canned upstream",
                    std::time::Duration::from_secs(5),
                ));
            }
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            response.set_recursion_desired(query.recursion_desired());
            response.set_recursion_available(true);
            response.add_queries(query.queries().to_vec());
            let name = query.queries()[0].name().clone();
            for (rtype, addr) in &self.records {
                let rdata = match (rtype, addr) {
                    (RecordType::A, IpAddr::V4(v4)) => RData::A(A(*v4)),
                    (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA(*v6)),
                    _ => continue,
                };
                response.add_answer(Record::from_rdata(name.clone(), 300, rdata));
            }
            Ok(response)
        }
    }

    struct Fixture {
        handler: QueryHandler,
        set4: Arc<MockAddrSet>,
        set6: Arc<MockAddrSet>,
    }

    fn fixture(selectors: &[&str], ipv6: bool, records: Vec<(RecordType, IpAddr)>, fail: bool) -> Fixture {
        let matcher = Arc::new(DomainMatcher::new());
        matcher.update(
            &selectors
                .iter()
                .map(|v| Selector::new(v))
                .collect::<Vec<_>>(),
        );
        let set4 = MockAddrSet::new("bypass");
        let set6 = MockAddrSet::new("bypass6");
        let tracker = Arc::new(Tracker::new(
            set4.clone(),
            ipv6.then(|| set6.clone() as Arc<dyn crate::netfilter::AddrSet>),
        ));
        let upstream = Arc::new(CannedUpstream { records, fail });
        Fixture {
            handler: QueryHandler::new(matcher, tracker, upstream, ipv6),
            set4,
            set6,
        }
    }

    fn query_bytes(domain: &str, id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        message.to_vec().unwrap()
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    // ==================== Matched responses ====================

    #[tokio::test]
    async fn test_matched_a_answer_is_tracked() {
        let fx = fixture(
            &["example.com"],
            false,
            vec![(RecordType::A, "93.184.216.34".parse().unwrap())],
            false,
        );

        let response = fx
            .handler
            .handle(&cancel(), &query_bytes("example.com.", 0x1234))
            .await
            .unwrap();
        let message = Message::from_vec(&response).unwrap();

        assert_eq!(message.id(), 0x1234);
        assert_eq!(message.answers().len(), 1);
        assert!(fx.set4.contains("93.184.216.34"));
        assert_eq!(
            fx.handler.tracker().addresses_for("example.com"),
            vec!["93.184.216.34"]
        );
    }

    #[tokio::test]
    async fn test_unmatched_name_not_tracked() {
        let fx = fixture(
            &["example.com"],
            false,
            vec![(RecordType::A, "198.51.100.1".parse().unwrap())],
            false,
        );

        let response = fx
            .handler
            .handle(&cancel(), &query_bytes("unrelated.org.", 1))
            .await
            .unwrap();
        let message = Message::from_vec(&response).unwrap();

        assert_eq!(message.answers().len(), 1);
        assert_eq!(fx.set4.len(), 0);
        assert_eq!(fx.handler.tracker().count(), (0, 0));
    }

    #[tokio::test]
    async fn test_qname_case_and_trailing_dot_normalised() {
        let fx = fixture(
            &["example.com"],
            false,
            vec![(RecordType::A, "93.184.216.34".parse().unwrap())],
            false,
        );

        fx.handler
            .handle(&cancel(), &query_bytes("WWW.Example.COM.", 2))
            .await
            .unwrap();
        assert_eq!(
            fx.handler.tracker().addresses_for("www.example.com"),
            vec!["93.184.216.34"]
        );
    }

    // ==================== AAAA handling ====================

    #[tokio::test]
    async fn test_aaaa_stripped_when_ipv6_disabled() {
        let fx = fixture(
            &["matched.example"],
            false,
            vec![
                (RecordType::A, "203.0.113.7".parse().unwrap()),
                (RecordType::AAAA, "2001:db8::7".parse().unwrap()),
            ],
            false,
        );

        let response = fx
            .handler
            .handle(&cancel(), &query_bytes("matched.example.", 3))
            .await
            .unwrap();
        let message = Message::from_vec(&response).unwrap();

        // Only the A record survives.
        assert_eq!(message.answers().len(), 1);
        assert_eq!(message.answers()[0].record_type(), RecordType::A);

        assert!(fx.set4.contains("203.0.113.7"));
        assert_eq!(fx.set6.len(), 0);
        assert_eq!(
            fx.handler.tracker().addresses_for("matched.example"),
            vec!["203.0.113.7"]
        );
    }

    #[tokio::test]
    async fn test_aaaa_tracked_and_forwarded_when_ipv6_enabled() {
        let fx = fixture(
            &["matched.example"],
            true,
            vec![
                (RecordType::A, "203.0.113.7".parse().unwrap()),
                (RecordType::AAAA, "2001:db8::7".parse().unwrap()),
            ],
            false,
        );

        let response = fx
            .handler
            .handle(&cancel(), &query_bytes("matched.example.", 4))
            .await
            .unwrap();
        let message = Message::from_vec(&response).unwrap();

        assert_eq!(message.answers().len(), 2);
        assert!(fx.set4.contains("203.0.113.7"));
        assert!(fx.set6.contains("2001:db8::7"));
    }

    #[tokio::test]
    async fn test_aaaa_untouched_for_unmatched_name() {
        let fx = fixture(
            &["matched.example"],
            false,
            vec![(RecordType::AAAA, "2001:db8::9".parse().unwrap())],
            false,
        );

        let response = fx
            .handler
            .handle(&cancel(), &query_bytes("other.example.", 5))
            .await
            .unwrap();
        let message = Message::from_vec(&response).unwrap();

        // Unmatched responses pass through unfiltered.
        assert_eq!(message.answers().len(), 1);
        assert_eq!(message.answers()[0].record_type(), RecordType::AAAA);
    }

    // ==================== Failure paths ====================

    #[tokio::test]
    async fn test_upstream_failure_yields_servfail() {
        let fx = fixture(&["example.com"], false, vec![], true);

        let response = fx
            .handler
            .handle(&cancel(), &query_bytes("example.com.", 0xBEEF))
            .await
            .unwrap();
        let message = Message::from_vec(&response).unwrap();

        assert_eq!(message.id(), 0xBEEF);
        assert_eq!(message.response_code(), ResponseCode::ServFail);
        assert!(message.recursion_available());
        assert!(message.recursion_desired());
        assert_eq!(message.queries().len(), 1);
        // Nothing tracked on failure.
        assert_eq!(fx.handler.tracker().count(), (0, 0));
    }

    #[tokio::test]
    async fn test_empty_question_ignored() {
        let fx = fixture(&["example.com"], false, vec![], false);

        let mut message = Message::new();
        message.set_id(9);
        let payload = message.to_vec().unwrap();

        assert!(fx.handler.handle(&cancel(), &payload).await.is_none());
        assert_eq!(fx.handler.tracker().count(), (0, 0));
    }

    #[tokio::test]
    async fn test_garbage_ignored() {
        let fx = fixture(&["example.com"], false, vec![], false);
        assert!(fx.handler.handle(&cancel(), &[0x01, 0x02]).await.is_none());
    }
}
