use crate::constants::{
    DESTINATION_LENGTH, ENCRYPTED_PACKET_MAX_CONTENT, LINK_PACKET_MAX_CONTENT, LXM_URI_PREFIX,
    SIGNATURE_LENGTH,
};
use crate::error::LxmfError;
use crate::message::fields::MessageFields;
use crate::message::types::{DeliveryMethod, Representation};
use base64::Engine;
use rns_contract::{DestinationHash, Identity, PrivateIdentity};
use sha2::{Digest, Sha256};

/// Decoded LXMF wire form.
///
/// Packed layout:
/// `dest(16) || src(16) || sig(64) || msgpack([ts_f64, title, content, fields, stamp?])`.
/// The optional trailing stamp slot carries a 32-byte proof-of-work stamp or
/// a 16-byte reply ticket token; it is excluded from the signed data.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub destination: DestinationHash,
    pub source: DestinationHash,
    pub signature: Option<[u8; SIGNATURE_LENGTH]>,
    pub timestamp: f64,
    pub title: Vec<u8>,
    pub content: Vec<u8>,
    pub fields: MessageFields,
    pub stamp: Option<Vec<u8>>,
}

impl WireMessage {
    pub fn new(
        destination: DestinationHash,
        source: DestinationHash,
        timestamp: f64,
        title: Vec<u8>,
        content: Vec<u8>,
        fields: MessageFields,
    ) -> Self {
        Self {
            destination,
            source,
            signature: None,
            timestamp,
            title,
            content,
            fields,
            stamp: None,
        }
    }

    fn payload_value(&self, with_stamp: bool) -> rmpv::Value {
        let mut elements = vec![
            rmpv::Value::F64(self.timestamp),
            rmpv::Value::Binary(self.title.clone()),
            rmpv::Value::Binary(self.content.clone()),
            self.fields.to_rmpv(),
        ];
        if with_stamp {
            if let Some(stamp) = &self.stamp {
                elements.push(rmpv::Value::Binary(stamp.clone()));
            }
        }
        rmpv::Value::Array(elements)
    }

    fn encode_value(value: &rmpv::Value) -> Result<Vec<u8>, LxmfError> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, value)
            .map_err(|err| LxmfError::Encode(err.to_string()))?;
        Ok(out)
    }

    /// Payload msgpack without the stamp slot; the signed form.
    pub fn payload_core_msgpack(&self) -> Result<Vec<u8>, LxmfError> {
        Self::encode_value(&self.payload_value(false))
    }

    /// Payload msgpack as emitted on the wire, stamp slot included.
    pub fn payload_msgpack(&self) -> Result<Vec<u8>, LxmfError> {
        Self::encode_value(&self.payload_value(true))
    }

    fn signed_data(&self) -> Result<Vec<u8>, LxmfError> {
        let payload = self.payload_core_msgpack()?;
        let mut data =
            Vec::with_capacity(2 * DESTINATION_LENGTH + payload.len());
        data.extend_from_slice(self.destination.as_slice());
        data.extend_from_slice(self.source.as_slice());
        data.extend_from_slice(&payload);
        Ok(data)
    }

    /// Deterministic message identifier over the signed form; the stamp
    /// workblock material.
    pub fn message_id(&self) -> Result<[u8; 32], LxmfError> {
        let digest = Sha256::digest(self.signed_data()?);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    pub fn sign(&mut self, signer: &PrivateIdentity) -> Result<(), LxmfError> {
        let data = self.signed_data()?;
        self.signature = Some(signer.sign(&data));
        Ok(())
    }

    pub fn verify(&self, identity: &Identity) -> Result<bool, LxmfError> {
        let Some(signature) = &self.signature else {
            return Ok(false);
        };
        let data = self.signed_data()?;
        Ok(identity.verify(&data, signature))
    }

    pub fn pack(&self) -> Result<Vec<u8>, LxmfError> {
        let signature = self
            .signature
            .ok_or_else(|| LxmfError::Encode("missing signature".into()))?;
        let payload = self.payload_msgpack()?;
        let mut out =
            Vec::with_capacity(2 * DESTINATION_LENGTH + SIGNATURE_LENGTH + payload.len());
        out.extend_from_slice(self.destination.as_slice());
        out.extend_from_slice(self.source.as_slice());
        out.extend_from_slice(&signature);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, LxmfError> {
        let min_len = 2 * DESTINATION_LENGTH + SIGNATURE_LENGTH;
        if bytes.len() <= min_len {
            return Err(LxmfError::Decode("wire message too short".into()));
        }

        let destination = DestinationHash::from_slice(&bytes[..DESTINATION_LENGTH])
            .map_err(|e| LxmfError::Decode(e.to_string()))?;
        let source =
            DestinationHash::from_slice(&bytes[DESTINATION_LENGTH..2 * DESTINATION_LENGTH])
                .map_err(|e| LxmfError::Decode(e.to_string()))?;
        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature.copy_from_slice(&bytes[2 * DESTINATION_LENGTH..min_len]);

        let mut payload_bytes = &bytes[min_len..];
        let payload = rmpv::decode::read_value(&mut payload_bytes)
            .map_err(|err| LxmfError::Decode(err.to_string()))?;
        let rmpv::Value::Array(elements) = payload else {
            return Err(LxmfError::Decode("payload must be an array".into()));
        };
        if elements.len() != 4 && elements.len() != 5 {
            return Err(LxmfError::Decode(format!(
                "payload must have 4 or 5 elements, got {}",
                elements.len()
            )));
        }

        let timestamp = decode_timestamp(&elements[0])?;
        let title = decode_bytes(&elements[1], "title")?;
        let content = decode_bytes(&elements[2], "content")?;
        let fields = MessageFields::from_rmpv(&elements[3])?;
        let stamp = match elements.get(4) {
            None | Some(rmpv::Value::Nil) => None,
            Some(value) => Some(decode_bytes(value, "stamp")?),
        };

        Ok(Self {
            destination,
            source,
            signature: Some(signature),
            timestamp,
            title,
            content,
            fields,
            stamp,
        })
    }

    /// Transient identifier of a packed message: SHA-256 over the full wire
    /// bytes.
    pub fn transient_id(packed: &[u8]) -> [u8; 32] {
        let digest = Sha256::digest(packed);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    /// Wire representation class for a packed message sent by `method`.
    pub fn representation_for(packed_len: usize, method: DeliveryMethod) -> Representation {
        match method {
            DeliveryMethod::Opportunistic => {
                // The destination hash travels in the packet header, not in
                // the payload.
                if packed_len - DESTINATION_LENGTH <= ENCRYPTED_PACKET_MAX_CONTENT {
                    Representation::Packet
                } else {
                    Representation::Resource
                }
            }
            DeliveryMethod::Direct => {
                if packed_len <= LINK_PACKET_MAX_CONTENT {
                    Representation::Packet
                } else {
                    Representation::Resource
                }
            }
            DeliveryMethod::Propagated => Representation::Resource,
            DeliveryMethod::Paper => Representation::Packet,
        }
    }

    pub fn encode_lxm_uri(packed: &[u8]) -> String {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(packed);
        format!("{LXM_URI_PREFIX}{encoded}")
    }

    /// Decode an `lxm://` URI. Padding may be absent; the payload is
    /// re-padded to a multiple of four before decoding.
    pub fn decode_lxm_uri(uri: &str) -> Result<Vec<u8>, LxmfError> {
        let encoded = uri
            .strip_prefix(LXM_URI_PREFIX)
            .ok_or_else(|| LxmfError::Decode("invalid lxm uri prefix".into()))?;
        let trimmed = encoded.trim_end_matches('=');
        let mut padded = trimmed.to_string();
        while padded.len() % 4 != 0 {
            padded.push('=');
        }

        base64::engine::general_purpose::URL_SAFE
            .decode(padded)
            .map_err(|err| LxmfError::Decode(format!("invalid lxm uri payload: {err}")))
    }
}

fn decode_timestamp(value: &rmpv::Value) -> Result<f64, LxmfError> {
    match value {
        rmpv::Value::F64(ts) => Ok(*ts),
        rmpv::Value::F32(ts) => Ok(*ts as f64),
        rmpv::Value::Integer(ts) => ts
            .as_f64()
            .ok_or_else(|| LxmfError::Decode("timestamp out of range".into())),
        _ => Err(LxmfError::Decode("timestamp must be numeric".into())),
    }
}

fn decode_bytes(value: &rmpv::Value, what: &str) -> Result<Vec<u8>, LxmfError> {
    value
        .as_slice()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| LxmfError::Decode(format!("{what} must be binary")))
}
