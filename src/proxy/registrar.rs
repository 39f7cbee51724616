use super::locator::{aor_from_uri, ContactBinding, Locator};
use crate::{rsip_ext::extract_uri_from_contact, transaction::make_tag, Result};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Request, Response, StatusCode,
};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct RegistrarOption {
    /// Granted lifetime when the request names none.
    pub default_expires: u32,
    pub min_expires: u32,
    pub max_expires: u32,
    /// When set, a REGISTER for an unknown address-of-record creates the
    /// user; otherwise it is answered 404.
    pub register_new_users: bool,
}

impl Default for RegistrarOption {
    fn default() -> Self {
        RegistrarOption {
            default_expires: 3600,
            min_expires: 60,
            max_expires: 86400,
            register_new_users: true,
        }
    }
}

/// Stateless REGISTER processing over a [`Locator`]. Every request gets
/// exactly one response; the caller puts it on the wire.
pub struct Registrar {
    pub locator: Arc<dyn Locator>,
    pub option: RegistrarOption,
    server: String,
}

impl Registrar {
    pub fn new(locator: Arc<dyn Locator>, option: RegistrarOption, server: &str) -> Self {
        Registrar {
            locator,
            option,
            server: server.to_string(),
        }
    }

    /// Requested lifetimes are clamped into `[min_expires, max_expires]`.
    /// Zero is not clamped; it means removal.
    fn clamp_expires(&self, requested: u32) -> u32 {
        requested.clamp(self.option.min_expires, self.option.max_expires)
    }

    pub fn handle_register(&self, req: &Request) -> Result<Response> {
        let to_uri = match req.to_header().ok().and_then(|t| t.typed().ok()) {
            Some(to) => to.uri,
            None => return Ok(self.make_response(req, StatusCode::BadRequest)),
        };
        let aor = match aor_from_uri(&to_uri) {
            Ok(aor) => aor,
            Err(_) => return Ok(self.make_response(req, StatusCode::BadRequest)),
        };
        let call_id = match req.call_id_header() {
            Ok(call_id) => call_id.value().to_string(),
            Err(_) => return Ok(self.make_response(req, StatusCode::BadRequest)),
        };
        let cseq = match req.cseq_header().ok().and_then(|c| c.typed().ok()) {
            Some(cseq) => cseq.seq,
            None => return Ok(self.make_response(req, StatusCode::BadRequest)),
        };

        let contacts: Vec<&rsip::headers::Contact> = req
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::Contact(c) => Some(c),
                _ => None,
            })
            .collect();
        let expires_header = req.headers.iter().find_map(|h| match h {
            Header::Expires(e) => e.value().trim().parse::<u32>().ok(),
            _ => None,
        });

        // Contact: * with Expires: 0 drops every binding; any other use
        // of the wildcard is malformed.
        if contacts.iter().any(|c| c.value().trim() == "*") {
            if contacts.len() != 1 || expires_header != Some(0) {
                return Ok(self.make_response(req, StatusCode::BadRequest));
            }
            self.locator.remove_user_contacts(&aor);
            info!(aor, "all bindings removed");
            return Ok(self.ok_with_bindings(req, &aor));
        }

        if !self.locator.has_user(&aor) {
            if !self.option.register_new_users {
                debug!(aor, "unknown user");
                return Ok(self.make_response(req, StatusCode::NotFound));
            }
            self.locator.add_user(&aor);
            info!(aor, "new user registered");
        }

        for contact in contacts {
            let (uri, contact_expires) = match contact.typed() {
                Ok(typed) => {
                    let expires = typed
                        .expires()
                        .and_then(|e| e.seconds().ok());
                    (typed.uri, expires)
                }
                Err(_) => match extract_uri_from_contact(contact.value()) {
                    Ok(uri) => (uri, None),
                    Err(_) => return Ok(self.make_response(req, StatusCode::BadRequest)),
                },
            };
            let requested = contact_expires
                .or(expires_header)
                .unwrap_or(self.option.default_expires);
            if requested == 0 {
                self.locator.remove_user_contact(&aor, &uri);
                info!(aor, contact = %uri, "binding removed");
                continue;
            }
            let granted = self.clamp_expires(requested);
            info!(aor, contact = %uri, requested, granted, "binding refreshed");
            self.locator.add_user_contact(
                &aor,
                ContactBinding::new(uri, granted, call_id.clone(), cseq),
            );
        }

        Ok(self.ok_with_bindings(req, &aor))
    }

    fn ok_with_bindings(&self, req: &Request, aor: &str) -> Response {
        let mut resp = self.make_response(req, StatusCode::OK);
        for binding in self.locator.get_user_contacts(aor) {
            resp.headers.push(Header::Contact(
                format!("<{}>;expires={}", binding.uri, binding.remaining()).into(),
            ));
        }
        resp
    }

    /// Stateless reply: echo Via/From/To/Call-ID/CSeq, add a To-tag when
    /// the request carried none.
    pub(super) fn make_response(&self, request: &Request, status: StatusCode) -> Response {
        let mut headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(v) => headers.push(Header::Via(v.clone())),
                Header::From(v) => headers.push(Header::From(v.clone())),
                Header::To(v) => match v.tag() {
                    Ok(Some(_)) => headers.push(Header::To(v.clone())),
                    _ => {
                        if let Ok(typed) = v.typed() {
                            headers.push(Header::To(typed.with_tag(make_tag()).into()));
                        } else {
                            headers.push(Header::To(v.clone()));
                        }
                    }
                },
                Header::CallId(v) => headers.push(Header::CallId(v.clone())),
                Header::CSeq(v) => headers.push(Header::CSeq(v.clone())),
                _ => {}
            }
        }
        headers.push(Header::UserAgent(self.server.clone().into()));
        headers.push(Header::ContentLength(0.into()));

        Response {
            status_code: status,
            headers,
            body: Default::default(),
            version: rsip::Version::V2,
        }
    }
}
