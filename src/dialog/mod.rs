use crate::{Error, Result};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Request, Response,
};

pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod registration;
pub mod server_dialog;

#[cfg(test)]
mod tests;

/// RFC 3261 dialog identifier: Call-ID plus the two party tags, held
/// from the owning side's point of view. `local_tag` is ours,
/// `remote_tag` is the peer's and stays empty until the dialog-forming
/// request or response carries one.
///
/// The same wire messages yield different ids on each side, so the
/// constructors come in UAC/UAS pairs that swap which tag counts as
/// local.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

/// Call-ID and party tags pulled off a message in wire orientation,
/// before deciding which side is local.
struct PartyTags {
    call_id: String,
    from: Option<String>,
    to: Option<String>,
}

fn party_tags<M: HeadersExt>(msg: &M) -> Result<PartyTags> {
    let tag_text = |t: Option<rsip::param::Tag>| t.map(|t| t.value().to_string());
    Ok(PartyTags {
        call_id: msg.call_id_header()?.value().to_string(),
        from: tag_text(msg.from_header()?.tag()?),
        to: tag_text(msg.to_header()?.tag()?),
    })
}

fn required_tag(tag: Option<String>, header: &str) -> Result<String> {
    tag.ok_or_else(|| Error::Error(format!("{} tag not found", header.to_lowercase())))
}

impl DialogId {
    /// Id of a request we are sending: From tag is local, To tag (if
    /// any yet) is remote.
    pub fn from_uac_request(request: &Request) -> Result<Self> {
        let tags = party_tags(request)?;
        Ok(DialogId {
            call_id: tags.call_id,
            local_tag: required_tag(tags.from, "From")?,
            remote_tag: tags.to.unwrap_or_default(),
        })
    }

    /// Id of a request we received: To tag (if any yet) is local, From
    /// tag is remote.
    pub fn from_uas_request(request: &Request) -> Result<Self> {
        let tags = party_tags(request)?;
        Ok(DialogId {
            call_id: tags.call_id,
            local_tag: tags.to.unwrap_or_default(),
            remote_tag: required_tag(tags.from, "From")?,
        })
    }

    /// Id of a response we received for our own request. Both tags must
    /// be present by now.
    pub fn from_uac_response(resp: &Response) -> Result<Self> {
        let tags = party_tags(resp)?;
        Ok(DialogId {
            call_id: tags.call_id,
            local_tag: required_tag(tags.from, "From")?,
            remote_tag: required_tag(tags.to, "To")?,
        })
    }

    /// Id of a response we are sending. Both tags must be present by
    /// now.
    pub fn from_uas_response(resp: &Response) -> Result<Self> {
        let tags = party_tags(resp)?;
        Ok(DialogId {
            call_id: tags.call_id,
            local_tag: required_tag(tags.to, "To")?,
            remote_tag: required_tag(tags.from, "From")?,
        })
    }
}

impl TryFrom<&Request> for DialogId {
    type Error = crate::Error;

    /// Defaults to the UAS perspective, the common case for requests
    /// arriving over a server transaction.
    fn try_from(request: &Request) -> Result<Self> {
        Self::from_uas_request(request)
    }
}

impl TryFrom<&Response> for DialogId {
    type Error = crate::Error;

    /// Defaults to the UAC perspective, the common case for responses
    /// to our own requests.
    fn try_from(resp: &Response) -> Result<Self> {
        Self::from_uac_response(resp)
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.call_id, self.local_tag)?;
        if !self.remote_tag.is_empty() {
            write!(f, "-{}", self.remote_tag)?;
        }
        Ok(())
    }
}
