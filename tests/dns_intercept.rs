//! DNS interception scenarios over real sockets
//!
//! Drives the full interceptor (UDP + TCP listeners, upstream exchange,
//! matcher, tracker) against a canned local upstream resolver.

mod common;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use bypass_router::dns::{Interceptor, QueryHandler, Resolver, Upstream};
use bypass_router::netfilter::AddrSet;
use bypass_router::rules::DomainMatcher;
use bypass_router::store::Selector;
use bypass_router::tracker::Tracker;

use common::FakeAddrSet;

/// Canned upstream answering every query with the given records
async fn spawn_upstream(records: Vec<(RecordType, String)>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let query = Message::from_vec(&buf[..len]).unwrap();
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            response.set_recursion_desired(query.recursion_desired());
            response.set_recursion_available(true);
            response.set_response_code(ResponseCode::NoError);
            response.add_queries(query.queries().to_vec());
            let qname = query.queries()[0].name().clone();
            for (rtype, value) in &records {
                let rdata = match rtype {
                    RecordType::A => RData::A(A(Ipv4Addr::from_str(value).unwrap())),
                    RecordType::AAAA => RData::AAAA(AAAA(Ipv6Addr::from_str(value).unwrap())),
                    _ => continue,
                };
                response.add_answer(Record::from_rdata(qname.clone(), 300, rdata));
            }
            socket
                .send_to(&response.to_vec().unwrap(), src)
                .await
                .unwrap();
        }
    });
    addr
}

struct World {
    interceptor: Interceptor,
    tracker: Arc<Tracker>,
    set4: Arc<FakeAddrSet>,
    set6: Arc<FakeAddrSet>,
}

async fn world(
    selectors: &[&str],
    ipv6: bool,
    records: Vec<(RecordType, String)>,
) -> World {
    let upstream_addr = spawn_upstream(records).await;

    let matcher = Arc::new(DomainMatcher::new());
    matcher.update(
        &selectors
            .iter()
            .map(|v| Selector::new(v))
            .collect::<Vec<_>>(),
    );

    let set4 = FakeAddrSet::new("bypass");
    let set6 = FakeAddrSet::new("bypass6");
    let tracker = Arc::new(Tracker::new(
        set4.clone() as Arc<dyn AddrSet>,
        ipv6.then(|| set6.clone() as Arc<dyn AddrSet>),
    ));

    let upstream: Arc<dyn Upstream> = Arc::new(Resolver::new(upstream_addr));
    let handler = Arc::new(QueryHandler::new(
        matcher,
        Arc::clone(&tracker),
        upstream,
        ipv6,
    ));

    let interceptor = Interceptor::start(
        "127.0.0.1:0".parse().unwrap(),
        handler,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    World {
        interceptor,
        tracker,
        set4,
        set6,
    }
}

async fn query_udp(server: SocketAddr, domain: &str, rtype: RecordType, id: u16) -> Message {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut query = Message::new();
    query.set_id(id);
    query.set_recursion_desired(true);
    query.add_query(Query::query(Name::from_str(domain).unwrap(), rtype));
    client
        .send_to(&query.to_vec().unwrap(), server)
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("query timed out")
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

/// Matched A answer populates the v4 set and the tracker.
#[tokio::test]
async fn matched_answer_harvested() {
    let w = world(
        &["example.com"],
        false,
        vec![(RecordType::A, "93.184.216.34".into())],
    )
    .await;

    let response = query_udp(
        w.interceptor.local_addr(),
        "example.com.",
        RecordType::A,
        0x1111,
    )
    .await;

    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert!(w.set4.contains("93.184.216.34"));
    assert_eq!(
        w.tracker.addresses_for("example.com"),
        vec!["93.184.216.34"]
    );

    w.interceptor.stop().await;
}

/// With IPv6 disabled, AAAA answers for matched names are absent from the
/// forwarded response, only the A record is tracked, and the v6 set stays
/// untouched.
#[tokio::test]
async fn ipv6_disabled_strips_aaaa() {
    let w = world(
        &["matched.example"],
        false,
        vec![
            (RecordType::A, "203.0.113.7".into()),
            (RecordType::AAAA, "2001:db8::7".into()),
        ],
    )
    .await;

    let response = query_udp(
        w.interceptor.local_addr(),
        "matched.example.",
        RecordType::A,
        0x2222,
    )
    .await;

    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].record_type(), RecordType::A);
    assert_eq!(
        w.tracker.addresses_for("matched.example"),
        vec!["203.0.113.7"]
    );
    assert!(w.set4.contains("203.0.113.7"));
    assert!(w.set6.members().is_empty());

    w.interceptor.stop().await;
}

/// With IPv6 enabled, both families are tracked and forwarded.
#[tokio::test]
async fn ipv6_enabled_tracks_both() {
    let w = world(
        &["matched.example"],
        true,
        vec![
            (RecordType::A, "203.0.113.7".into()),
            (RecordType::AAAA, "2001:db8::7".into()),
        ],
    )
    .await;

    let response = query_udp(
        w.interceptor.local_addr(),
        "matched.example.",
        RecordType::A,
        0x3333,
    )
    .await;

    assert_eq!(response.answers().len(), 2);
    assert!(w.set4.contains("203.0.113.7"));
    assert!(w.set6.contains("2001:db8::7"));

    w.interceptor.stop().await;
}

/// Unmatched names pass through untouched and untracked.
#[tokio::test]
async fn unmatched_passthrough() {
    let w = world(
        &["example.com"],
        false,
        vec![(RecordType::A, "198.51.100.1".into())],
    )
    .await;

    let response = query_udp(
        w.interceptor.local_addr(),
        "unrelated.org.",
        RecordType::A,
        0x4444,
    )
    .await;

    assert_eq!(response.answers().len(), 1);
    assert!(w.set4.members().is_empty());
    assert_eq!(w.tracker.count(), (0, 0));

    w.interceptor.stop().await;
}

/// A dead upstream yields SERVFAIL with the request id preserved and
/// nothing tracked.
#[tokio::test]
async fn dead_upstream_servfail() {
    let matcher = Arc::new(DomainMatcher::new());
    matcher.update(&[Selector::new("example.com")]);
    let set4 = FakeAddrSet::new("bypass");
    let tracker = Arc::new(Tracker::new(set4.clone() as Arc<dyn AddrSet>, None));
    // Port 1 on loopback: nothing answers, the exchange times out.
    let upstream: Arc<dyn Upstream> = Arc::new(
        Resolver::new("127.0.0.1:1".parse().unwrap())
            .with_timeout(Duration::from_millis(100)),
    );
    let handler = Arc::new(QueryHandler::new(matcher, Arc::clone(&tracker), upstream, false));
    let interceptor = Interceptor::start(
        "127.0.0.1:0".parse().unwrap(),
        handler,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let response = query_udp(
        interceptor.local_addr(),
        "example.com.",
        RecordType::A,
        0x5555,
    )
    .await;

    assert_eq!(response.id(), 0x5555);
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    assert!(response.recursion_available());
    assert_eq!(tracker.count(), (0, 0));
    assert!(set4.members().is_empty());

    interceptor.stop().await;
}
