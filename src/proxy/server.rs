use super::{
    locator::{aor_from_uri, Locator},
    registrar::{Registrar, RegistrarOption},
};
use crate::{
    header_pop,
    rsip_ext::RsipHeadersExt,
    transaction::random_text,
    transport::{SipAddr, SipConnection, TransportEvent, TransportLayer},
    Result,
};
use futures::future::join_all;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, Param, Request, Response, SipMessage, StatusCode,
};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Marker a request carries while it travels between nodes that share
/// responsibility for a domain. Seeing our own value back means the
/// request looped.
const LOOP_TAG_HEADER: &str = "Loop-Tag";

/// Prefix-matched rewrite rule for phone-number targets. Authenticated
/// rules only apply when the From address is locally owned.
#[derive(Clone, Debug)]
pub struct ForwardingRule {
    pub prefix: String,
    pub next_hop: SipAddr,
    pub authenticated: bool,
}

/// Next hop for requests whose target host is not ours.
#[derive(Clone, Debug)]
pub struct DomainRule {
    pub domain: String,
    pub next_hop: SipAddr,
}

#[derive(Clone, Debug)]
pub struct ProxyOption {
    pub user_agent: String,
    /// Domains this node is responsible for, in addition to its own
    /// listen addresses.
    pub domains: Vec<String>,
    /// Stay on the path of dialogs established through us.
    pub record_route: bool,
    pub forwarding_rules: Vec<ForwardingRule>,
    pub domain_rules: Vec<DomainRule>,
    pub registrar: RegistrarOption,
}

impl Default for ProxyOption {
    fn default() -> Self {
        ProxyOption {
            user_agent: "sipline-proxy".to_string(),
            domains: Vec::new(),
            record_route: true,
            forwarding_rules: Vec::new(),
            domain_rules: Vec::new(),
            registrar: RegistrarOption::default(),
        }
    }
}

enum Routing {
    /// Request-URI plus an explicit next hop when routing decided one.
    Forward(Vec<(rsip::Uri, Option<SipAddr>)>),
    Reply(StatusCode),
}

pub struct ProxyServerInner {
    pub option: ProxyOption,
    pub locator: Arc<dyn Locator>,
    pub registrar: Registrar,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    loop_tag: String,
}

pub type ProxyServerInnerRef = Arc<ProxyServerInner>;

/// Stateless forwarding server: registrar, location-service fan-out,
/// Via/Route/Record-Route bookkeeping and loop protection. It consumes
/// the transport layer's event stream directly; no transactions are
/// created for proxied traffic.
pub struct ProxyServer {
    pub inner: ProxyServerInnerRef,
}

impl ProxyServer {
    /// Transports must be registered on `transport_layer` before the
    /// server is built; the loop marker is derived from them.
    pub fn new(
        transport_layer: TransportLayer,
        locator: Arc<dyn Locator>,
        option: ProxyOption,
        cancel_token: CancellationToken,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        option.user_agent.hash(&mut hasher);
        for addr in transport_layer.get_addrs() {
            addr.to_string().hash(&mut hasher);
        }
        let loop_tag = format!("{:x}", hasher.finish());

        let registrar = Registrar::new(
            locator.clone(),
            option.registrar.clone(),
            &option.user_agent,
        );
        ProxyServer {
            inner: Arc::new(ProxyServerInner {
                option,
                locator,
                registrar,
                transport_layer,
                cancel_token,
                loop_tag,
            }),
        }
    }

    pub async fn serve(&self) -> Result<()> {
        let inner = self.inner.clone();
        inner.transport_layer.serve_listens().await?;
        let mut receiver = inner.transport_layer.inner.take_receiver()?;
        info!(
            addrs = ?inner.transport_layer.get_addrs(),
            domains = ?inner.option.domains,
            "proxy server started"
        );
        loop {
            select! {
                _ = inner.cancel_token.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(TransportEvent::Incoming(msg, connection, source)) => {
                        if let Err(e) = inner.on_message(msg, connection, &source).await {
                            warn!(%source, "proxy error: {}", e);
                        }
                    }
                    Some(TransportEvent::New(_)) | Some(TransportEvent::Closed(_)) => {}
                    None => break,
                },
            }
        }
        info!("proxy server stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }
}

impl ProxyServerInner {
    async fn on_message(
        &self,
        msg: SipMessage,
        connection: SipConnection,
        _source: &SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(req) => self.on_request(req, connection).await,
            SipMessage::Response(resp) => self.on_response(resp).await,
        }
    }

    async fn on_request(&self, mut req: Request, connection: SipConnection) -> Result<()> {
        if req.method == Method::Register && self.is_local_uri(&req.uri) {
            let resp = self.registrar.handle_register(&req)?;
            return connection.send(resp.into(), None).await;
        }

        let inbound_tag = loop_tag(&req.headers);
        if inbound_tag.as_deref() == Some(self.loop_tag.as_str()) {
            warn!(method = %req.method, uri = %req.uri, "loop detected");
            return self
                .reply(&req, StatusCode::LoopDetected, &connection)
                .await;
        }

        if !self.check_max_forwards(&mut req) {
            info!(method = %req.method, uri = %req.uri, "max-forwards exhausted");
            return self.reply(&req, StatusCode::TooManyHops, &connection).await;
        }

        self.pop_own_route(&mut req);

        let targets = match self.select_targets(&mut req)? {
            Routing::Forward(targets) => targets,
            Routing::Reply(status) => {
                debug!(method = %req.method, uri = %req.uri, "no route: {}", status);
                return self.reply(&req, status, &connection).await;
            }
        };

        let sends = targets.into_iter().map(|(uri, destination)| {
            self.forward_request(&req, uri, destination, inbound_tag.as_deref())
        });
        for result in join_all(sends).await {
            if let Err(e) = result {
                warn!("forward failed: {}", e);
            }
        }
        Ok(())
    }

    /// Proxied responses only need Via bookkeeping: shed our Via and pass
    /// what remains towards the previous hop. The top Via is removed even
    /// when it is not ours, so a misbehaving peer cannot wedge a
    /// response in a forwarding cycle.
    async fn on_response(&self, mut resp: Response) -> Result<()> {
        header_pop!(resp.headers, Header::Via);
        let via = match resp.via_header() {
            Ok(via) => via.clone(),
            Err(_) => {
                debug!(code = %resp.status_code, "response without next via dropped");
                return Ok(());
            }
        };
        let (transport, target) = SipConnection::parse_target_from_via(&via)?;
        let destination = SipAddr::new(transport, target);
        let connection = self.transport_layer.lookup(&destination).await?;
        debug!(code = %resp.status_code, dest = %destination, "forwarding response");
        connection.send(resp.into(), Some(&destination)).await
    }

    /// One outbound copy: own Request-URI, loop marker, Record-Route and
    /// a fresh Via on top. The connection comes from the transport
    /// layer's lookup, never from the one the request arrived on.
    async fn forward_request(
        &self,
        req: &Request,
        uri: rsip::Uri,
        destination: Option<SipAddr>,
        inbound_tag: Option<&str>,
    ) -> Result<()> {
        let mut out = req.clone();
        out.uri = uri;
        let destination = match destination {
            Some(destination) => destination,
            None => SipAddr::try_from(&out.uri)?,
        };
        let connection = self.transport_layer.lookup(&destination).await?;

        strip_loop_tag(&mut out.headers);
        if self.is_local_host(&destination.addr) || self.is_local_uri(&out.uri) {
            out.headers
                .push(Header::Other(LOOP_TAG_HEADER.into(), self.loop_tag.clone()));
        }

        let local_addr = connection.get_addr().clone();
        if self.option.record_route && out.method == Method::Invite && !self.already_on_route(&out)
        {
            out.headers.push_front(Header::RecordRoute(
                rsip::headers::RecordRoute::new(format!("<sip:{};lr>", local_addr.addr)),
            ));
        }

        let via = rsip::typed::Via {
            version: rsip::Version::V2,
            transport: local_addr
                .r#type
                .unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: local_addr.addr.clone(),
                ..Default::default()
            },
            params: vec![
                Param::Branch(rsip::param::Branch::new(self.make_branch(inbound_tag))),
                Param::Other(rsip::param::OtherParam::new("rport"), None),
            ],
        };
        out.headers.push_front(Header::Via(via.into()));

        debug!(method = %out.method, uri = %out.uri, dest = %destination, "forwarding request");
        connection.send(out.into(), Some(&destination)).await
    }

    /// Where the request goes next, in precedence order: remaining Route
    /// entries, registered contacts of a local target, phone-number
    /// forwarding rules, domain rules, plain Request-URI relay.
    fn select_targets(&self, req: &mut Request) -> Result<Routing> {
        if let Some(route_uri) = first_route_uri(&req.headers) {
            if uri_is_loose(&route_uri) {
                let destination = SipAddr::try_from(&route_uri)?;
                return Ok(Routing::Forward(vec![(req.uri.clone(), Some(destination))]));
            }
            // RFC 2543 peer on-route: the next hop goes into the
            // Request-URI and the old target to the end of the route set.
            let old_target = std::mem::replace(&mut req.uri, route_uri);
            pop_first_route_entry(&mut req.headers);
            req.headers.push(Header::Route(rsip::headers::Route::new(
                format!("<{}>", old_target),
            )));
            let destination = SipAddr::try_from(&req.uri)?;
            return Ok(Routing::Forward(vec![(req.uri.clone(), Some(destination))]));
        }

        if self.is_local_uri(&req.uri) {
            let aor = match aor_from_uri(&req.uri) {
                Ok(aor) => aor,
                Err(_) => return Ok(Routing::Reply(StatusCode::NotFound)),
            };
            let contacts = self.locator.get_user_contacts(&aor);
            if !contacts.is_empty() {
                return Ok(Routing::Forward(
                    contacts.into_iter().map(|b| (b.uri, None)).collect(),
                ));
            }

            let user = req
                .uri
                .auth
                .as_ref()
                .map(|auth| auth.user.clone())
                .unwrap_or_default();
            if is_phone_number(&user) {
                let from_local = req
                    .from_header()
                    .ok()
                    .and_then(|from| from.typed().ok())
                    .map(|from| self.is_local_uri(&from.uri))
                    .unwrap_or(false);
                for authenticated in [true, false] {
                    if authenticated && !from_local {
                        continue;
                    }
                    for rule in &self.option.forwarding_rules {
                        if rule.authenticated == authenticated && user.starts_with(&rule.prefix) {
                            return Ok(Routing::Forward(vec![(
                                req.uri.clone(),
                                Some(rule.next_hop.clone()),
                            )]));
                        }
                    }
                }
            }
            return Ok(Routing::Reply(StatusCode::NotFound));
        }

        let host = req.uri.host_with_port.host.to_string();
        for rule in &self.option.domain_rules {
            if rule.domain.eq_ignore_ascii_case(&host) {
                return Ok(Routing::Forward(vec![(
                    req.uri.clone(),
                    Some(rule.next_hop.clone()),
                )]));
            }
        }
        Ok(Routing::Forward(vec![(req.uri.clone(), None)]))
    }

    /// Decrement Max-Forwards, or seed it at 70 when absent. False means
    /// the request has no hops left.
    fn check_max_forwards(&self, req: &mut Request) -> bool {
        let current = req.headers.iter().find_map(|h| match h {
            Header::MaxForwards(mf) => mf.value().trim().parse::<u32>().ok(),
            _ => None,
        });
        match current {
            None => {
                req.headers.unique_push(Header::MaxForwards(70.into()));
                true
            }
            Some(0) => false,
            Some(n) => {
                req.headers.unique_push(Header::MaxForwards((n - 1).into()));
                true
            }
        }
    }

    fn pop_own_route(&self, req: &mut Request) {
        if let Some(uri) = first_route_uri(&req.headers) {
            if self.is_local_host(&uri.host_with_port) {
                pop_first_route_entry(&mut req.headers);
            }
        }
    }

    fn already_on_route(&self, req: &Request) -> bool {
        req.headers
            .iter()
            .find_map(|h| match h {
                Header::RecordRoute(rr) => rr
                    .typed()
                    .ok()
                    .and_then(|rr| rr.uris().first().map(|u| self.is_local_host(&u.uri.host_with_port))),
                _ => None,
            })
            .unwrap_or(false)
    }

    fn make_branch(&self, inbound_tag: Option<&str>) -> String {
        let mut branch = format!(
            "z9hG4bK{}",
            random_text(crate::transaction::BRANCH_LEN)
        );
        if let Some(tag) = inbound_tag {
            branch.push('.');
            branch.push_str(tag);
        }
        branch
    }

    async fn reply(
        &self,
        req: &Request,
        status: StatusCode,
        connection: &SipConnection,
    ) -> Result<()> {
        // ACK takes no answer, errors included.
        if req.method == Method::Ack {
            return Ok(());
        }
        let resp = self.registrar.make_response(req, status);
        connection.send(resp.into(), None).await
    }

    fn is_local_uri(&self, uri: &rsip::Uri) -> bool {
        self.is_local_host(&uri.host_with_port)
    }

    /// A host is ours when it names a configured domain or one of our
    /// listen addresses. Unset ports compare as 5060.
    fn is_local_host(&self, host_with_port: &rsip::HostWithPort) -> bool {
        let host = host_with_port.host.to_string();
        if self
            .option
            .domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&host))
        {
            return true;
        }
        let port = host_with_port.port.as_ref().map_or(5060, |p| *p.value());
        self.transport_layer.get_addrs().iter().any(|addr| {
            addr.addr.host.to_string().eq_ignore_ascii_case(&host)
                && addr.addr.port.as_ref().map_or(5060, |p| *p.value()) == port
        })
    }
}

fn loop_tag(headers: &rsip::Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::Other(name, value) if name.eq_ignore_ascii_case(LOOP_TAG_HEADER) => {
            Some(value.clone())
        }
        _ => None,
    })
}

fn strip_loop_tag(headers: &mut rsip::Headers) {
    headers.retain(|h| !matches!(h, Header::Other(name, _) if name.eq_ignore_ascii_case(LOOP_TAG_HEADER)));
}

fn first_route_uri(headers: &rsip::Headers) -> Option<rsip::Uri> {
    headers.iter().find_map(|h| match h {
        Header::Route(route) => route
            .typed()
            .ok()
            .and_then(|route| route.uris().first().map(|u| u.uri.clone())),
        _ => None,
    })
}

/// Remove the first Route entry. A header listing several URIs keeps its
/// tail; a single-URI header goes away entirely.
fn pop_first_route_entry(headers: &mut rsip::Headers) {
    let mut list: Vec<Header> = headers.iter().cloned().collect();
    if let Some(pos) = list.iter().position(|h| matches!(h, Header::Route(_))) {
        let value = match &list[pos] {
            Header::Route(route) => route.value().to_string(),
            _ => unreachable!(),
        };
        match value.split_once(',') {
            Some((_, rest)) => {
                list[pos] = Header::Route(rsip::headers::Route::new(rest.trim().to_string()));
            }
            None => {
                list.remove(pos);
            }
        }
        *headers = list.into();
    }
}

fn uri_is_loose(uri: &rsip::Uri) -> bool {
    uri.params.iter().any(|p| match p {
        Param::Lr => true,
        Param::Other(name, _) => name.value().eq_ignore_ascii_case("lr"),
        _ => false,
    })
}

fn is_phone_number(user: &str) -> bool {
    !user.is_empty()
        && user
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '*' | '#'))
}
