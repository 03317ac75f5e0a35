//! Macaroon codec and request binding.
//!
//! Only the parts a relying party needs are implemented: reading and writing
//! the V1 binary format, inspecting caveats, and binding a discharge macaroon
//! to its root before it is sent with a request. Verification of caveats is
//! the store's job.
//!
//! Minting (`Macaroon::new` and the caveat builders) follows the same HMAC
//! chain as the issuing services so fixtures produce real signatures.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Size of an HMAC-SHA256 signature.
pub const SIGNATURE_LEN: usize = 32;

/// Packet header: four lowercase hex digits holding the packet length.
const PACKET_PREFIX_LEN: usize = 4;

/// Largest length expressible in the packet header.
const MAX_PACKET_LEN: usize = 0xffff;

/// Key used to derive the signing key from a root secret.
const KEY_GENERATOR: &[u8] = b"macaroons-key-generator";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacaroonError {
    #[error("Invalid base64 encoding")]
    Encoding,

    #[error("Malformed packet: {0}")]
    Packet(String),

    #[error("Missing {0} field")]
    MissingField(&'static str),

    #[error("Unexpected field: {0}")]
    UnexpectedField(String),

    #[error("Invalid signature length: {0} bytes")]
    SignatureLength(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caveat {
    pub caveat_id: Vec<u8>,
    pub verification_id: Option<Vec<u8>>,
    pub location: Option<String>,
}

impl Caveat {
    pub fn is_third_party(&self) -> bool {
        self.verification_id.is_some()
    }

    pub fn caveat_id_str(&self) -> String {
        String::from_utf8_lossy(&self.caveat_id).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macaroon {
    location: String,
    identifier: Vec<u8>,
    caveats: Vec<Caveat>,
    signature: [u8; SIGNATURE_LEN],
}

fn hmac_digest(key: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// HMAC of the concatenated HMACs of two inputs under the same key.
fn hmac_concat(key: &[u8], first: &[u8], second: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut combined = Vec::with_capacity(SIGNATURE_LEN * 2);
    combined.extend_from_slice(&hmac_digest(key, first));
    combined.extend_from_slice(&hmac_digest(key, second));
    hmac_digest(key, &combined)
}

impl Macaroon {
    /// Mint a macaroon from a root secret.
    pub fn new(location: &str, identifier: &str, key: &[u8]) -> Result<Self, MacaroonError> {
        check_packet("location", location.as_bytes())?;
        check_packet("identifier", identifier.as_bytes())?;
        let derived = hmac_digest(KEY_GENERATOR, key);
        Ok(Self {
            location: location.to_string(),
            identifier: identifier.as_bytes().to_vec(),
            caveats: Vec::new(),
            signature: hmac_digest(&derived, identifier.as_bytes()),
        })
    }

    pub fn add_first_party_caveat(&mut self, predicate: &str) -> Result<(), MacaroonError> {
        check_packet("cid", predicate.as_bytes())?;
        self.signature = hmac_digest(&self.signature, predicate.as_bytes());
        self.caveats.push(Caveat {
            caveat_id: predicate.as_bytes().to_vec(),
            verification_id: None,
            location: None,
        });
        Ok(())
    }

    /// Append a third-party caveat whose verification id has already been
    /// sealed for the discharging service.
    pub fn add_third_party_caveat(
        &mut self,
        location: &str,
        verification_id: &[u8],
        caveat_id: &str,
    ) -> Result<(), MacaroonError> {
        check_packet("cid", caveat_id.as_bytes())?;
        check_packet("vid", verification_id)?;
        check_packet("cl", location.as_bytes())?;
        self.signature = hmac_concat(&self.signature, verification_id, caveat_id.as_bytes());
        self.caveats.push(Caveat {
            caveat_id: caveat_id.as_bytes().to_vec(),
            verification_id: Some(verification_id.to_vec()),
            location: Some(location.to_string()),
        });
        Ok(())
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    pub fn signature_hex(&self) -> String {
        hex::encode(self.signature)
    }

    pub fn third_party_caveats(&self) -> impl Iterator<Item = &Caveat> {
        self.caveats.iter().filter(|c| c.is_third_party())
    }

    /// Caveat id of the single third-party caveat addressed to `location`.
    pub fn caveat_id_for(&self, location: &str) -> Option<String> {
        let mut matching = self
            .third_party_caveats()
            .filter(|c| c.location.as_deref() == Some(location));
        match (matching.next(), matching.next()) {
            (Some(caveat), None) => Some(caveat.caveat_id_str()),
            _ => None,
        }
    }

    /// Bind a discharge macaroon to this root so it is only usable in the
    /// same request.
    pub fn prepare_for_request(&self, discharge: &Macaroon) -> Macaroon {
        let mut bound = discharge.clone();
        bound.signature = hmac_concat(&[0u8; SIGNATURE_LEN], &self.signature, &discharge.signature);
        bound
    }

    /// Serialize in the V1 binary format, base64 URL-safe without padding.
    pub fn serialize(&self) -> String {
        let mut packets = Vec::new();
        write_packet(&mut packets, "location", self.location.as_bytes());
        write_packet(&mut packets, "identifier", &self.identifier);
        for caveat in &self.caveats {
            write_packet(&mut packets, "cid", &caveat.caveat_id);
            if let Some(ref vid) = caveat.verification_id {
                write_packet(&mut packets, "vid", vid);
            }
            if let Some(ref cl) = caveat.location {
                write_packet(&mut packets, "cl", cl.as_bytes());
            }
        }
        write_packet(&mut packets, "signature", &self.signature);
        URL_SAFE_NO_PAD.encode(packets)
    }

    pub fn deserialize(token: &str) -> Result<Self, MacaroonError> {
        let raw = decode_base64(token)?;

        let mut location = None;
        let mut identifier = None;
        let mut signature = None;
        let mut caveats: Vec<Caveat> = Vec::new();

        let mut rest = raw.as_slice();
        while !rest.is_empty() {
            let (key, value, remaining) = read_packet(rest)?;
            rest = remaining;

            if signature.is_some() {
                return Err(MacaroonError::Packet("data after signature".to_string()));
            }

            match key {
                "location" => location = Some(String::from_utf8_lossy(value).into_owned()),
                "identifier" => identifier = Some(value.to_vec()),
                "cid" => caveats.push(Caveat {
                    caveat_id: value.to_vec(),
                    verification_id: None,
                    location: None,
                }),
                "vid" => {
                    let caveat = caveats
                        .last_mut()
                        .ok_or_else(|| MacaroonError::UnexpectedField("vid".to_string()))?;
                    caveat.verification_id = Some(value.to_vec());
                }
                "cl" => {
                    let caveat = caveats
                        .last_mut()
                        .ok_or_else(|| MacaroonError::UnexpectedField("cl".to_string()))?;
                    caveat.location = Some(String::from_utf8_lossy(value).into_owned());
                }
                "signature" => {
                    let bytes: [u8; SIGNATURE_LEN] = value
                        .try_into()
                        .map_err(|_| MacaroonError::SignatureLength(value.len()))?;
                    signature = Some(bytes);
                }
                other => return Err(MacaroonError::UnexpectedField(other.to_string())),
            }
        }

        Ok(Self {
            location: location.ok_or(MacaroonError::MissingField("location"))?,
            identifier: identifier.ok_or(MacaroonError::MissingField("identifier"))?,
            caveats,
            signature: signature.ok_or(MacaroonError::MissingField("signature"))?,
        })
    }
}

fn decode_base64(token: &str) -> Result<Vec<u8>, MacaroonError> {
    let trimmed = token.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return Err(MacaroonError::Encoding);
    }
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|_| MacaroonError::Encoding)
}

fn packet_len(key: &str, value: &[u8]) -> usize {
    PACKET_PREFIX_LEN + key.len() + 1 + value.len() + 1
}

/// Packets longer than the 4-hex-digit header can describe cannot be read back.
fn check_packet(key: &str, value: &[u8]) -> Result<(), MacaroonError> {
    let len = packet_len(key, value);
    if len > MAX_PACKET_LEN {
        return Err(MacaroonError::Packet(format!("{} packet of {} bytes is too long", key, len)));
    }
    Ok(())
}

/// Callers go through `check_packet` first; every field of a `Macaroon` fits.
fn write_packet(out: &mut Vec<u8>, key: &str, value: &[u8]) {
    let len = packet_len(key, value);
    debug_assert!(len <= MAX_PACKET_LEN);
    out.extend_from_slice(format!("{:04x}", len).as_bytes());
    out.extend_from_slice(key.as_bytes());
    out.push(b' ');
    out.extend_from_slice(value);
    out.push(b'\n');
}

fn read_packet(data: &[u8]) -> Result<(&str, &[u8], &[u8]), MacaroonError> {
    if data.len() < PACKET_PREFIX_LEN {
        return Err(MacaroonError::Packet("truncated header".to_string()));
    }
    let header = std::str::from_utf8(&data[..PACKET_PREFIX_LEN])
        .map_err(|_| MacaroonError::Packet("non-ascii header".to_string()))?;
    let len = usize::from_str_radix(header, 16)
        .map_err(|_| MacaroonError::Packet(format!("bad length {:?}", header)))?;
    if len <= PACKET_PREFIX_LEN || len > data.len() {
        return Err(MacaroonError::Packet(format!("length {} out of range", len)));
    }

    let payload = &data[PACKET_PREFIX_LEN..len];
    let payload = payload
        .strip_suffix(b"\n")
        .ok_or_else(|| MacaroonError::Packet("missing newline".to_string()))?;
    let split = payload
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| MacaroonError::Packet("missing separator".to_string()))?;
    let key = std::str::from_utf8(&payload[..split])
        .map_err(|_| MacaroonError::Packet("non-utf8 key".to_string()))?;

    Ok((key, &payload[split + 1..], &data[len..]))
}
