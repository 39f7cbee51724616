use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_until},
    character::complete::{char, multispace0},
    combinator::{map, opt, rest},
    multi::separated_list0,
    sequence::{delimited, preceded},
    IResult, Parser,
};
use rsip::prelude::ToTypedHeader;
use rsip::{
    message::HasHeaders,
    prelude::{HeadersExt, UntypedHeader},
};

/// Helpers over `rsip::Response` for fields the stack reads on every
/// response path.
pub trait RsipResponseExt {
    /// Reason text attached to a failure response, either as a `Reason`
    /// extension header or an `Error-Info` header.
    fn reason_phrase(&self) -> Option<&str>;
    /// Public address learned from the top Via's `received`/`rport`
    /// parameters, if the peer stamped them.
    fn via_received(&self) -> Option<rsip::HostWithPort>;
    /// Remote target from the Contact header. When the contact carries an
    /// `ob` (outbound) parameter the flow address wins over the contact
    /// host, so the caller passes the transport-level destination.
    fn remote_uri(&self, destination: Option<&SipAddr>) -> Result<rsip::Uri>;
}

impl RsipResponseExt for rsip::Response {
    fn reason_phrase(&self) -> Option<&str> {
        for header in self.headers().iter() {
            if let rsip::Header::Other(name, value) = header {
                if name.eq_ignore_ascii_case("reason") {
                    return Some(value);
                }
            }
            if let rsip::Header::ErrorInfo(reason) = header {
                return Some(reason.value());
            }
        }
        None
    }

    fn via_received(&self) -> Option<rsip::HostWithPort> {
        let via = self.via_header().ok()?;
        SipConnection::parse_target_from_via(via)
            .map(|(_, host_with_port)| host_with_port)
            .ok()
    }

    fn remote_uri(&self, destination: Option<&SipAddr>) -> Result<rsip::Uri> {
        let contact = self.contact_header()?;
        let mut contact_uri = if let Ok(typed_contact) = contact.typed() {
            typed_contact.uri
        } else {
            let mut uri = extract_uri_from_contact(contact.value())?;
            uri.headers.clear();
            uri
        };

        for param in contact_uri.params.iter() {
            if let rsip::Param::Other(name, _) = param {
                if !name.to_string().eq_ignore_ascii_case("ob") {
                    continue;
                }
                contact_uri.params.clear();
                if let Some(dest) = destination {
                    contact_uri.host_with_port = dest.addr.clone();
                    dest.r#type
                        .as_ref()
                        .map(|t| contact_uri.params.push(rsip::Param::Transport(t.clone())));
                }
                break;
            }
        }
        Ok(contact_uri)
    }
}

pub trait RsipHeadersExt {
    fn push_front(&mut self, header: rsip::Header);
}

impl RsipHeadersExt for rsip::Headers {
    fn push_front(&mut self, header: rsip::Header) {
        let mut headers = self.iter().cloned().collect::<Vec<_>>();
        headers.insert(0, header);
        *self = headers.into();
    }
}

/// Remove the first header matching the given variant, keeping the rest.
#[macro_export]
macro_rules! header_pop {
    ($iter:expr, $header:path) => {
        let mut first = true;
        $iter.retain(|h| {
            if first && matches!(h, $header(_)) {
                first = false;
                false
            } else {
                true
            }
        });
    };
}

/// True when the named list header (`Supported`, `Require`, ...) carries
/// the given option token. Comparison is case-insensitive per RFC 3261.
pub fn header_contains_token(headers: &rsip::Headers, name: &str, token: &str) -> bool {
    headers.iter().any(|header| {
        let value = match header {
            rsip::Header::Supported(h) if name.eq_ignore_ascii_case("supported") => {
                h.value().to_string()
            }
            rsip::Header::Require(h) if name.eq_ignore_ascii_case("require") => {
                h.value().to_string()
            }
            rsip::Header::Other(n, v) if n.eq_ignore_ascii_case(name) => v.clone(),
            _ => return false,
        };
        value
            .split(',')
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    })
}

/// RSeq value of a reliable provisional response.
pub fn parse_rseq_header(headers: &rsip::Headers) -> Option<u32> {
    headers.iter().find_map(|header| match header {
        rsip::Header::Other(name, value) if name.eq_ignore_ascii_case("rseq") => {
            value.trim().parse::<u32>().ok()
        }
        _ => None,
    })
}

/// RAck triple `(rseq, cseq, method)` of a PRACK request.
pub fn parse_rack_header(headers: &rsip::Headers) -> Option<(u32, u32, rsip::Method)> {
    headers.iter().find_map(|header| match header {
        rsip::Header::Other(name, value) if name.eq_ignore_ascii_case("rack") => {
            let mut parts = value.split_whitespace();
            let rseq = parts.next()?.parse::<u32>().ok()?;
            let cseq = parts.next()?.parse::<u32>().ok()?;
            let method = parts.next().and_then(|token| {
                rsip::Method::all()
                    .into_iter()
                    .find(|m| m.to_string().eq_ignore_ascii_case(token))
            })?;
            Some((rseq, cseq, method))
        }
        _ => None,
    })
}

/// Next-hop address for a request: the first Route entry wins, otherwise
/// the Request-URI.
pub fn destination_from_request(request: &rsip::Request) -> Option<SipAddr> {
    request
        .headers
        .iter()
        .find_map(|header| match header {
            rsip::Header::Route(route) => route
                .typed()
                .ok()
                .map(|r| {
                    r.uris()
                        .first()
                        .map(|u| SipAddr::try_from(&u.uri).ok())
                        .flatten()
                })
                .flatten(),
            _ => None,
        })
        .or_else(|| SipAddr::try_from(&request.uri).ok())
}

/// Pull the URI out of a Contact line, tolerating the malformed forms
/// real devices emit (unbracketed params, stray display names, embedded
/// `transport=udp`). Falls back to a hand-rolled tokenizer when the rsip
/// parser rejects the line.
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    if let Ok(uri) = rsip::headers::Contact::from(line).uri() {
        return Ok(uri);
    }

    let tokenizer = ContactLineTokenizer::from_str(line)?;
    let mut uri = rsip::Uri::try_from(tokenizer.uri()).map_err(Error::from)?;
    apply_tokenizer_params(&mut uri, &tokenizer);
    Ok(uri)
}

fn apply_tokenizer_params(uri: &mut rsip::Uri, tokenizer: &ContactLineTokenizer) {
    for (name, value) in tokenizer.params.iter().map(|p| (p.name, p.value)) {
        // the rsip parse above already carries transport as a typed param
        if name.eq_ignore_ascii_case("transport") {
            continue;
        }
        let mut updated = false;
        for param in uri.params.iter_mut() {
            if let rsip::Param::Other(key, existing_value) = param {
                if key.value().eq_ignore_ascii_case(name) {
                    *existing_value =
                        value.map(|v| rsip::param::OtherParamValue::new(v.to_string()));
                    updated = true;
                    break;
                }
            }
        }
        if !updated {
            uri.params.push(rsip::Param::Other(
                rsip::param::OtherParam::new(name),
                value.map(|v| rsip::param::OtherParamValue::new(v.to_string())),
            ));
        }
    }
}

#[derive(Debug)]
struct ContactLineTokenizer<'a> {
    uri: &'a str,
    params: Vec<ContactParamToken<'a>>,
}

#[derive(Debug)]
struct ContactParamToken<'a> {
    name: &'a str,
    value: Option<&'a str>,
}

impl<'a> ContactLineTokenizer<'a> {
    fn from_str(input: &'a str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::Error("empty contact header".into()));
        }

        match contact_line_tokenize(trimmed) {
            Ok((_rem, tokenizer)) => Ok(tokenizer),
            Err(_) => Ok(Self::from_plain(trimmed)),
        }
    }

    fn from_plain(uri: &'a str) -> Self {
        Self {
            uri,
            params: contact_line_params(uri),
        }
    }

    fn uri(&self) -> &'a str {
        self.uri
    }
}

fn contact_line_tokenize<'a>(input: &'a str) -> IResult<&'a str, ContactLineTokenizer<'a>> {
    alt((contact_with_brackets, contact_without_brackets)).parse(input)
}

fn contact_with_brackets<'a>(input: &'a str) -> IResult<&'a str, ContactLineTokenizer<'a>> {
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(take_until("<")).parse(input)?;
    let (input, _) = char('<').parse(input)?;
    let (input, uri) = take_until(">").parse(input)?;
    let (input, _) = char('>').parse(input)?;

    let uri = uri.trim();
    let params = contact_line_params(uri);

    Ok((input, ContactLineTokenizer { uri, params }))
}

fn contact_without_brackets<'a>(input: &'a str) -> IResult<&'a str, ContactLineTokenizer<'a>> {
    let (input, uri) = map(rest, |s: &str| s.trim()).parse(input)?;
    let params = contact_line_params(uri);
    Ok((input, ContactLineTokenizer { uri, params }))
}

fn contact_line_params<'a>(uri: &'a str) -> Vec<ContactParamToken<'a>> {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    if let Some(idx) = path.find(';') {
        let params_str = &path[idx + 1..];
        if params_str.is_empty() {
            return Vec::new();
        }

        match separated_list0(char(';'), contact_line_param).parse(params_str) {
            Ok((_, params)) => params.into_iter().filter(|p| !p.name.is_empty()).collect(),
            Err(_) => Vec::new(),
        }
    } else {
        Vec::new()
    }
}

fn contact_line_param<'a>(input: &'a str) -> IResult<&'a str, ContactParamToken<'a>> {
    let (input, _) = multispace0(input)?;
    let (input, name) = map(is_not("=; \t\r\n?"), |v: &str| v.trim()).parse(input)?;
    let (input, value) = opt(preceded(
        char('='),
        alt((
            delimited(char('"'), take_until("\""), char('"')),
            map(is_not("; \t\r\n?"), |v: &str| v.trim()),
        )),
    ))
    .parse(input)?;

    Ok((input, ContactParamToken { name, value }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::{Header, Headers};

    #[test]
    fn test_headers_push_front_and_pop() {
        let mut headers: Headers = vec![
            Header::Via("SIP/2.0/TCP".into()),
            Header::Via("SIP/2.0/UDP".into()),
        ]
        .into();
        headers.push_front(Header::Via("SIP/2.0/TLS".into()));
        assert_eq!(headers.iter().count(), 3);

        header_pop!(headers, Header::Via);
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                &Header::Via("SIP/2.0/TCP".into()),
                &Header::Via("SIP/2.0/UDP".into())
            ]
        );
    }

    #[test]
    fn test_extract_uri_from_contact() {
        let line = "<sip:ivy@lab.internal;transport=udp>;expires=600;+sip.instance=\"<urn:uuid:9a1b-44ce>\"";
        let uri = extract_uri_from_contact(line).expect("failed to parse contact");
        assert_eq!(uri.to_string(), "sip:ivy@lab.internal;transport=UDP");

        let uri = extract_uri_from_contact("\"Lab\" <sip:lab@10.0.0.3:5060>")
            .expect("display name");
        assert_eq!(uri.to_string(), "sip:lab@10.0.0.3:5060");

        let uri = extract_uri_from_contact("sip:carol@example.com").expect("plain");
        assert_eq!(uri.to_string(), "sip:carol@example.com");
    }

    #[test]
    fn test_header_contains_token() {
        let headers: Headers = vec![
            Header::Supported(rsip::headers::Supported::new("replaces, 100rel")),
            Header::Other("Require".into(), "timer".into()),
        ]
        .into();
        assert!(header_contains_token(&headers, "Supported", "100rel"));
        assert!(header_contains_token(&headers, "supported", "REPLACES"));
        assert!(header_contains_token(&headers, "Require", "timer"));
        assert!(!header_contains_token(&headers, "Require", "100rel"));
    }

    #[test]
    fn test_parse_rseq_and_rack() {
        let headers: Headers = vec![Header::Other("RSeq".into(), "9022".into())].into();
        assert_eq!(parse_rseq_header(&headers), Some(9022));

        let headers: Headers = vec![Header::Other("RAck".into(), "9022 101 INVITE".into())].into();
        assert_eq!(
            parse_rack_header(&headers),
            Some((9022, 101, rsip::Method::Invite))
        );

        let headers: Headers = vec![Header::Other("RAck".into(), "garbage".into())].into();
        assert_eq!(parse_rack_header(&headers), None);
    }
}
