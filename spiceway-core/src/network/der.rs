//! Just enough DER to read the subject and public key of a certificate.
//!
//! ```text
//! Certificate ::= SEQUENCE {
//!     tbsCertificate SEQUENCE {
//!         [0] version            OPTIONAL
//!         serialNumber           INTEGER
//!         signature              AlgorithmIdentifier
//!         issuer                 Name
//!         validity               SEQUENCE
//!         subject                Name
//!         subjectPublicKeyInfo   SEQUENCE
//!         ...
//!     }
//!     ...
//! }
//! ```

use crate::error::SpiceError;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_OID: u8 = 0x06;
const TAG_VERSION: u8 = 0xa0;

const TAG_UTF8_STRING: u8 = 0x0c;
const TAG_PRINTABLE_STRING: u8 = 0x13;
const TAG_T61_STRING: u8 = 0x14;
const TAG_IA5_STRING: u8 = 0x16;
const TAG_UNIVERSAL_STRING: u8 = 0x1c;
const TAG_BMP_STRING: u8 = 0x1e;

/// One decoded TLV.
#[derive(Debug, Clone, Copy)]
struct Tlv<'a> {
    tag: u8,
    body: &'a [u8],
    /// Tag, length and body together.
    raw: &'a [u8],
}

fn malformed(reason: &str) -> SpiceError {
    SpiceError::Tls(format!("malformed certificate: {reason}"))
}

fn read_tlv<'a>(input: &mut &'a [u8]) -> Result<Tlv<'a>, SpiceError> {
    let data = *input;
    if data.len() < 2 {
        return Err(malformed("truncated header"));
    }
    let tag = data[0];
    let (len, header) = match data[1] {
        n if n < 0x80 => (n as usize, 2),
        n @ 0x81..=0x84 => {
            let count = (n & 0x7f) as usize;
            let bytes = data
                .get(2..2 + count)
                .ok_or_else(|| malformed("truncated length"))?;
            let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
            (len, 2 + count)
        }
        _ => return Err(malformed("unsupported length form")),
    };
    let end = header
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| malformed("body out of range"))?;
    *input = &data[end..];
    Ok(Tlv {
        tag,
        body: &data[header..end],
        raw: &data[..end],
    })
}

fn expect<'a>(input: &mut &'a [u8], tag: u8, what: &str) -> Result<Tlv<'a>, SpiceError> {
    let tlv = read_tlv(input)?;
    if tlv.tag != tag {
        return Err(malformed(&format!("expected {what}")));
    }
    Ok(tlv)
}

// ── Certificate ──────────────────────────────────────────────────

/// The parts of an X.509 certificate the verifier looks at.
#[derive(Debug, Clone, Copy)]
pub struct CertificateInfo<'a> {
    /// Body of the subject `Name` sequence.
    pub subject: &'a [u8],
    /// The complete DER `SubjectPublicKeyInfo`.
    pub spki: &'a [u8],
}

impl<'a> CertificateInfo<'a> {
    pub fn parse(der: &'a [u8]) -> Result<Self, SpiceError> {
        let mut input = der;
        let cert = expect(&mut input, TAG_SEQUENCE, "certificate")?;
        let mut cert_body = cert.body;
        let tbs = expect(&mut cert_body, TAG_SEQUENCE, "tbsCertificate")?;

        let mut fields = tbs.body;
        if fields.first() == Some(&TAG_VERSION) {
            read_tlv(&mut fields)?;
        }
        read_tlv(&mut fields)?; // serialNumber
        expect(&mut fields, TAG_SEQUENCE, "signature algorithm")?;
        expect(&mut fields, TAG_SEQUENCE, "issuer")?;
        expect(&mut fields, TAG_SEQUENCE, "validity")?;
        let subject = expect(&mut fields, TAG_SEQUENCE, "subject")?;
        let spki = expect(&mut fields, TAG_SEQUENCE, "subjectPublicKeyInfo")?;

        Ok(Self {
            subject: subject.body,
            spki: spki.raw,
        })
    }

    /// Subject rendered as `K=V` pairs joined by `,`, in certificate order.
    pub fn subject_string(&self) -> Result<String, SpiceError> {
        Ok(subject_components(self.subject)?
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","))
    }
}

fn attribute_name(oid: &[u8]) -> Option<&'static str> {
    match oid {
        [0x55, 0x04, 3] => Some("CN"),
        [0x55, 0x04, 6] => Some("C"),
        [0x55, 0x04, 7] => Some("L"),
        [0x55, 0x04, 8] => Some("ST"),
        [0x55, 0x04, 10] => Some("O"),
        [0x55, 0x04, 11] => Some("OU"),
        _ => None,
    }
}

/// Text of a directory string, decoded according to its tag.
fn directory_string(value: &Tlv<'_>) -> Result<String, SpiceError> {
    match value.tag {
        TAG_UTF8_STRING | TAG_PRINTABLE_STRING | TAG_IA5_STRING => {
            String::from_utf8(value.body.to_vec()).map_err(|_| malformed("invalid UTF-8 string"))
        }
        // Latin-1 is the practical reading of TeletexString.
        TAG_T61_STRING => Ok(value.body.iter().map(|b| char::from(*b)).collect()),
        TAG_BMP_STRING => {
            if value.body.len() % 2 != 0 {
                return Err(malformed("odd BMPString length"));
            }
            let units = value
                .body
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]));
            char::decode_utf16(units)
                .collect::<Result<String, _>>()
                .map_err(|_| malformed("invalid BMPString"))
        }
        TAG_UNIVERSAL_STRING => {
            if value.body.len() % 4 != 0 {
                return Err(malformed("bad UniversalString length"));
            }
            value
                .body
                .chunks_exact(4)
                .map(|c| char::from_u32(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
                .collect::<Option<String>>()
                .ok_or_else(|| malformed("invalid UniversalString"))
        }
        _ => Err(malformed("unsupported attribute value type")),
    }
}

/// Attribute/value pairs of a `Name`; unknown attribute types are skipped.
fn subject_components(name: &[u8]) -> Result<Vec<(&'static str, String)>, SpiceError> {
    let mut out = Vec::new();
    let mut rdns = name;
    while !rdns.is_empty() {
        let set = expect(&mut rdns, TAG_SET, "relative distinguished name")?;
        let mut atvs = set.body;
        while !atvs.is_empty() {
            let atv = expect(&mut atvs, TAG_SEQUENCE, "attribute")?;
            let mut parts = atv.body;
            let oid = expect(&mut parts, TAG_OID, "attribute type")?;
            let value = read_tlv(&mut parts)?;
            if let Some(key) = attribute_name(oid.body) {
                out.push((key, directory_string(&value)?));
            }
        }
    }
    Ok(out)
}

// ── Subject matching ─────────────────────────────────────────────

/// Split a configured subject on unescaped `,` and trim each part.
///
/// `\,` keeps a literal comma inside a value.
pub fn split_subject(subject: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = subject.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// `true` if the certificate subject equals the configured one, component
/// by component and in order.
pub fn subject_matches(cert: &CertificateInfo<'_>, wanted: &str) -> Result<bool, SpiceError> {
    let have: Vec<String> = subject_components(cert.subject)?
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    let wanted: Vec<String> = split_subject(wanted)
        .into_iter()
        .map(|part| match part.split_once('=') {
            Some((k, v)) => format!("{}={}", k.trim(), v.trim()),
            None => part,
        })
        .collect();
    Ok(!wanted.is_empty() && have == wanted)
}
