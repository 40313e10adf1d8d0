//! Trusted DNS resolution.
//!
//! Queries an explicit list of DNS servers directly over UDP, bypassing the
//! system resolver, for the small set of hostnames configured as trusted-DNS
//! targets. Used to defeat a poisoned ambient resolver.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::hosts::PatternSet;

/// Maximum DNS message size over UDP.
pub const MAX_UDP_DNS_SIZE: usize = 512;

/// Default per-server query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Source of authoritative overrides that take precedence over the host table.
pub trait DnsOverride: Send + Sync + 'static {
    /// Resolve `host`, returning `None` when no trusted answer is available.
    fn resolve(&self, host: &str) -> impl Future<Output = Option<IpAddr>> + Send;
}

/// Resolver that asks each trusted server in turn for an `A` record.
#[derive(Debug, Clone)]
pub struct TrustedResolver {
    servers: Vec<SocketAddr>,
    targets: PatternSet,
    timeout: Duration,
}

impl TrustedResolver {
    /// Create a resolver for hosts matching `targets`.
    pub fn new(servers: Vec<SocketAddr>, targets: PatternSet) -> Self {
        Self {
            servers,
            targets,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A resolver that never answers.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), PatternSet::default())
    }

    /// Returns true if `host` would be sent to the trusted servers.
    pub fn is_target(&self, host: &str) -> bool {
        !self.servers.is_empty() && self.targets.matches(host)
    }

    async fn query(&self, server: SocketAddr, query: &Message) -> Result<Message> {
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let exchange = async {
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(server).await?;
            socket.send(&query.to_bytes()?).await?;

            let mut response_buf = [0u8; MAX_UDP_DNS_SIZE];
            loop {
                let len = socket.recv(&mut response_buf).await?;
                let response = Message::from_bytes(&response_buf[..len])?;
                // ignore stray or spoofed datagrams
                if answers_query(&response, query) {
                    return Ok::<_, Error>(response);
                }
            }
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::DnsTimeout(server))?
    }
}

impl DnsOverride for TrustedResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if !self.is_target(host) {
            return None;
        }

        let query = match build_query(host) {
            Ok(query) => query,
            Err(err) => {
                tracing::debug!(host, error = %err, "not a valid DNS name");
                return None;
            }
        };

        for server in &self.servers {
            match self.query(*server, &query).await {
                Ok(response) => {
                    if let Some(ip) = first_address(&response) {
                        tracing::debug!(host, %server, %ip, "trusted DNS answer");
                        return Some(ip);
                    }
                    tracing::debug!(
                        host,
                        %server,
                        code = ?response.response_code(),
                        "trusted DNS returned no address"
                    );
                }
                Err(err) => {
                    tracing::warn!(host, %server, error = %err, "trusted DNS query failed");
                }
            }
        }

        None
    }
}

fn build_query(host: &str) -> Result<Message> {
    let name = Name::from_str(host)?;

    let mut message = Message::new();
    message
        .set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name, RecordType::A));
    Ok(message)
}

/// Returns true if `response` is a reply to exactly the question in `query`.
fn answers_query(response: &Message, query: &Message) -> bool {
    response.id() == query.id()
        && response.message_type() == MessageType::Response
        && response.queries().len() == query.queries().len()
        && response
            .queries()
            .iter()
            .zip(query.queries())
            .all(|(got, sent)| {
                got.query_type() == sent.query_type()
                    && got.query_class() == sent.query_class()
                    && same_name(got.name(), sent.name())
            })
}

fn same_name(a: &Name, b: &Name) -> bool {
    a.to_ascii()
        .trim_end_matches('.')
        .eq_ignore_ascii_case(b.to_ascii().trim_end_matches('.'))
}

fn first_address(response: &Message) -> Option<IpAddr> {
    if response.response_code() != ResponseCode::NoError {
        return None;
    }

    response.answers().iter().find_map(|record| match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        _ => None,
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use hickory_proto::rr::Record;
    use hickory_proto::rr::rdata::A;

    /// How a fake DNS server answers.
    #[derive(Clone, Copy)]
    pub enum Behaviour {
        Answer(Ipv4Addr),
        NxDomain,
        Silent,
        /// Answers, but for a different question.
        WrongQuestion(Ipv4Addr),
        /// Answers with the query flag instead of the response flag.
        NotResponse(Ipv4Addr),
    }

    /// Spawn a UDP DNS server on localhost behaving as requested.
    pub async fn spawn_dns_server(behaviour: Behaviour) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_UDP_DNS_SIZE];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = Message::from_bytes(&buf[..len]) else {
                    continue;
                };

                let mut response = Message::new();
                response
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query);
                if let Behaviour::WrongQuestion(_) = behaviour {
                    response.add_query(Query::query(
                        Name::from_str("other.example.").unwrap(),
                        RecordType::A,
                    ));
                } else {
                    for q in query.queries() {
                        response.add_query(q.clone());
                    }
                }

                match behaviour {
                    Behaviour::Silent => continue,
                    Behaviour::NxDomain => {
                        response.set_response_code(ResponseCode::NXDomain);
                    }
                    Behaviour::Answer(ip)
                    | Behaviour::WrongQuestion(ip)
                    | Behaviour::NotResponse(ip) => {
                        response.set_response_code(ResponseCode::NoError);
                        if let Behaviour::NotResponse(_) = behaviour {
                            response.set_message_type(MessageType::Query);
                        }
                        if let Some(q) = response.queries().first().cloned() {
                            response.add_answer(Record::from_rdata(
                                q.name().clone(),
                                300,
                                RData::A(A(ip)),
                            ));
                        }
                    }
                }

                let _ = socket.send_to(&response.to_bytes().unwrap(), peer).await;
            }
        });

        addr
    }

    fn all_hosts() -> PatternSet {
        PatternSet::compile(["*"]).unwrap()
    }

    #[tokio::test]
    async fn should_return_address_from_trusted_server() {
        let server = spawn_dns_server(Behaviour::Answer(Ipv4Addr::new(8, 8, 4, 4))).await;
        let resolver = TrustedResolver::new(vec![server], all_hosts());

        let ip = resolver.resolve("example.com").await;

        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4))));
    }

    #[tokio::test]
    async fn should_skip_hosts_outside_target_list() {
        let server = spawn_dns_server(Behaviour::Answer(Ipv4Addr::new(1, 1, 1, 1))).await;
        let targets = PatternSet::compile(["*.google.com"]).unwrap();
        let resolver = TrustedResolver::new(vec![server], targets);

        assert!(resolver.is_target("www.google.com"));
        assert!(!resolver.is_target("example.com"));
        assert_eq!(resolver.resolve("example.com").await, None);
    }

    #[tokio::test]
    async fn should_try_next_server_after_timeout() {
        let silent = spawn_dns_server(Behaviour::Silent).await;
        let good = spawn_dns_server(Behaviour::Answer(Ipv4Addr::new(2, 2, 2, 2))).await;
        let resolver = TrustedResolver::new(vec![silent, good], all_hosts())
            .with_timeout(Duration::from_millis(200));

        let ip = resolver.resolve("example.com").await;

        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2))));
    }

    #[tokio::test]
    async fn should_try_next_server_after_nxdomain() {
        let nx = spawn_dns_server(Behaviour::NxDomain).await;
        let good = spawn_dns_server(Behaviour::Answer(Ipv4Addr::new(3, 3, 3, 3))).await;
        let resolver = TrustedResolver::new(vec![nx, good], all_hosts());

        assert_eq!(
            resolver.resolve("example.com").await,
            Some(IpAddr::V4(Ipv4Addr::new(3, 3, 3, 3)))
        );
    }

    #[tokio::test]
    async fn should_return_none_when_all_servers_fail() {
        let silent = spawn_dns_server(Behaviour::Silent).await;
        let nx = spawn_dns_server(Behaviour::NxDomain).await;
        let resolver = TrustedResolver::new(vec![silent, nx], all_hosts())
            .with_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        assert_eq!(resolver.resolve("example.com").await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn should_return_none_without_servers() {
        let resolver = TrustedResolver::disabled();
        assert!(!resolver.is_target("example.com"));
        assert_eq!(resolver.resolve("example.com").await, None);
    }

    #[test]
    fn should_build_recursive_a_query() {
        let query = build_query("example.com").unwrap();

        assert!(query.recursion_desired());
        assert_eq!(query.queries().len(), 1);
        assert_eq!(query.queries()[0].query_type(), RecordType::A);
    }

    #[test]
    fn should_use_unpredictable_query_ids() {
        let ids: std::collections::HashSet<u16> = (0..16)
            .map(|_| build_query("example.com").unwrap().id())
            .collect();

        // sixteen sequential or constant ids would collapse to a run
        assert!(ids.len() > 8);
        let mut sorted: Vec<_> = ids.into_iter().collect();
        sorted.sort_unstable();
        assert!(sorted.windows(2).any(|w| w[1] - w[0] > 1));
    }

    #[tokio::test]
    async fn should_reject_answer_for_another_question() {
        let spoofed = spawn_dns_server(Behaviour::WrongQuestion(Ipv4Addr::new(6, 6, 6, 6))).await;
        let resolver = TrustedResolver::new(vec![spoofed], all_hosts())
            .with_timeout(Duration::from_millis(200));

        assert_eq!(resolver.resolve("example.com").await, None);
    }

    #[tokio::test]
    async fn should_reject_datagram_without_response_flag() {
        let spoofed = spawn_dns_server(Behaviour::NotResponse(Ipv4Addr::new(6, 6, 6, 6))).await;
        let good = spawn_dns_server(Behaviour::Answer(Ipv4Addr::new(4, 4, 4, 4))).await;
        let resolver = TrustedResolver::new(vec![spoofed, good], all_hosts())
            .with_timeout(Duration::from_millis(200));

        assert_eq!(
            resolver.resolve("example.com").await,
            Some(IpAddr::V4(Ipv4Addr::new(4, 4, 4, 4)))
        );
    }

    #[test]
    fn should_match_response_to_sent_question() {
        let query = build_query("Example.COM").unwrap();
        let mut response = query.clone();
        response.set_message_type(MessageType::Response);
        assert!(answers_query(&response, &query));

        let mut other_id = response.clone();
        other_id.set_id(query.id().wrapping_add(1));
        assert!(!answers_query(&other_id, &query));

        assert!(!answers_query(&query, &query));
    }

    #[test]
    fn should_ignore_answers_of_failed_responses() {
        let mut response = Message::new();
        response.set_response_code(ResponseCode::ServFail);
        response.add_answer(Record::from_rdata(
            Name::from_str("example.com").unwrap(),
            60,
            RData::A(A(Ipv4Addr::new(9, 9, 9, 9))),
        ));

        assert_eq!(first_address(&response), None);
    }
}
