//! EPP framing and message construction
//!
//! EPP frames are a 4-byte big-endian unsigned length, counting the header
//! itself, followed by a UTF-8 XML document. Outbound commands are built from
//! XML templates with a fresh client transaction id (clTRID) substituted per
//! message so replies can be matched to requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, DecodeResult};

/// Length of the frame header in bytes, included in the declared length.
pub const HEADER_LENGTH: usize = 4;

/// Upper bound on a single frame; anything larger is treated as garbage.
const MAX_FRAME_BYTES: usize = 1 << 20;

/// Longest domain label we derive from a clTRID.
const MAX_DOMAIN_PART_LENGTH: usize = 50;

static CLIENT_TRID_SUFFIX: AtomicU64 = AtomicU64::new(0);

/// Wrap an XML document in an EPP frame.
pub fn encode(xml: &str) -> Bytes {
    let total = HEADER_LENGTH + xml.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_slice(xml.as_bytes());
    buf.freeze()
}

/// Decode at most one frame from `buf`, consuming it only when complete.
///
/// Partial frames stay buffered until `declared_length` bytes have
/// accumulated. A declared length shorter than the header is a protocol
/// error: no amount of further bytes can make the frame valid.
pub fn decode(buf: &mut BytesMut) -> DecodeResult<EppReply> {
    if buf.len() < HEADER_LENGTH {
        return Ok(None);
    }

    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if (declared as usize) < HEADER_LENGTH {
        return Err(CodecError::BadFrameLength(declared));
    }
    if declared as usize > MAX_FRAME_BYTES {
        return Err(CodecError::MessageTooLarge(declared as usize));
    }

    if buf.len() < declared as usize {
        return Ok(None);
    }

    let frame = buf.split_to(declared as usize);
    let body = std::str::from_utf8(&frame[HEADER_LENGTH..]).map_err(CodecError::InvalidUtf8)?;

    Ok(Some(EppReply::parse(body)))
}

/// A decoded EPP response document with the fields the prober inspects.
#[derive(Debug, Clone)]
pub struct EppReply {
    /// The full XML body
    pub xml: String,

    /// Result code of the first `<result>` element, if any
    pub result_code: Option<u16>,

    /// Echoed client transaction id, if any
    pub cl_trid: Option<String>,
}

impl EppReply {
    pub fn parse(xml: &str) -> Self {
        Self {
            xml: xml.to_string(),
            result_code: extract_result_code(xml),
            cl_trid: extract_element(xml, "clTRID"),
        }
    }

    /// Greetings carry no `<result>`; they announce the server on connect.
    pub fn is_greeting(&self) -> bool {
        self.xml.contains("<greeting")
    }
}

fn extract_result_code(xml: &str) -> Option<u16> {
    let rest = &xml[xml.find("<result code=\"")? + "<result code=\"".len()..];
    let end = rest.find('"')?;
    rest[..end].parse().ok()
}

fn extract_element(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}

/// An outbound EPP command together with the clTRID it carries.
#[derive(Debug, Clone)]
pub struct EppRequest {
    pub cl_trid: String,
    pub bytes: Bytes,
}

/// Return a unique string usable as an EPP client transaction ID.
///
/// The timestamp sits in the third dash-separated position; downstream
/// cleanup tooling splits on dashes to find it.
pub fn new_client_trid() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix = CLIENT_TRID_SUFFIX.fetch_add(1, Ordering::Relaxed);
    format!("prober-localhost-{millis}-{suffix}")
}

/// Derive a fully qualified probe domain under `tld` from a clTRID.
pub fn probe_domain(cl_trid: &str, tld: &str) -> String {
    let sld = if cl_trid.len() > MAX_DOMAIN_PART_LENGTH {
        &cl_trid[cl_trid.len() - MAX_DOMAIN_PART_LENGTH..]
    } else {
        cl_trid
    };
    format!("{sld}.{tld}")
}

const LOGIN_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<epp xmlns="urn:ietf:params:xml:ns:epp-1.0">
  <command>
    <login>
      <clID>%USER%</clID>
      <pw>%PW%</pw>
      <options>
        <version>1.0</version>
        <lang>en</lang>
      </options>
      <svcs>
        <objURI>urn:ietf:params:xml:ns:domain-1.0</objURI>
        <objURI>urn:ietf:params:xml:ns:contact-1.0</objURI>
        <objURI>urn:ietf:params:xml:ns:host-1.0</objURI>
      </svcs>
    </login>
    <clTRID>%TRID%</clTRID>
  </command>
</epp>"#;

const CHECK_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<epp xmlns="urn:ietf:params:xml:ns:epp-1.0">
  <command>
    <check>
      <domain:check xmlns:domain="urn:ietf:params:xml:ns:domain-1.0">
        <domain:name>%DOMAIN%</domain:name>
      </domain:check>
    </check>
    <clTRID>%TRID%</clTRID>
  </command>
</epp>"#;

const CREATE_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<epp xmlns="urn:ietf:params:xml:ns:epp-1.0">
  <command>
    <create>
      <domain:create xmlns:domain="urn:ietf:params:xml:ns:domain-1.0">
        <domain:name>%DOMAIN%</domain:name>
        <domain:period unit="y">1</domain:period>
        <domain:authInfo>
          <domain:pw>2fooBAR</domain:pw>
        </domain:authInfo>
      </domain:create>
    </create>
    <clTRID>%TRID%</clTRID>
  </command>
</epp>"#;

const DELETE_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<epp xmlns="urn:ietf:params:xml:ns:epp-1.0">
  <command>
    <delete>
      <domain:delete xmlns:domain="urn:ietf:params:xml:ns:domain-1.0">
        <domain:name>%DOMAIN%</domain:name>
      </domain:delete>
    </delete>
    <clTRID>%TRID%</clTRID>
  </command>
</epp>"#;

const LOGOUT_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<epp xmlns="urn:ietf:params:xml:ns:epp-1.0">
  <command>
    <logout/>
    <clTRID>%TRID%</clTRID>
  </command>
</epp>"#;

/// Build a login command for the configured registrar account.
pub fn login_request(client_id: &str, password: &str) -> EppRequest {
    let cl_trid = new_client_trid();
    let xml = LOGIN_TEMPLATE
        .replace("%USER%", client_id)
        .replace("%PW%", password)
        .replace("%TRID%", &cl_trid);
    EppRequest {
        bytes: encode(&xml),
        cl_trid,
    }
}

/// Build an availability check command for `domain`.
pub fn check_request(domain: &str) -> EppRequest {
    let cl_trid = new_client_trid();
    let xml = CHECK_TEMPLATE
        .replace("%DOMAIN%", domain)
        .replace("%TRID%", &cl_trid);
    EppRequest {
        bytes: encode(&xml),
        cl_trid,
    }
}

/// Build a create command registering `domain` for one year.
pub fn create_request(domain: &str) -> EppRequest {
    let cl_trid = new_client_trid();
    let xml = CREATE_TEMPLATE
        .replace("%DOMAIN%", domain)
        .replace("%TRID%", &cl_trid);
    EppRequest {
        bytes: encode(&xml),
        cl_trid,
    }
}

/// Build a delete command removing `domain` again.
pub fn delete_request(domain: &str) -> EppRequest {
    let cl_trid = new_client_trid();
    let xml = DELETE_TEMPLATE
        .replace("%DOMAIN%", domain)
        .replace("%TRID%", &cl_trid);
    EppRequest {
        bytes: encode(&xml),
        cl_trid,
    }
}

/// Build a logout command.
pub fn logout_request() -> EppRequest {
    let cl_trid = new_client_trid();
    let xml = LOGOUT_TEMPLATE.replace("%TRID%", &cl_trid);
    EppRequest {
        bytes: encode(&xml),
        cl_trid,
    }
}
