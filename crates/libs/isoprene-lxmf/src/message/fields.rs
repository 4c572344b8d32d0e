use crate::constants::{FIELD_TICKET, TICKET_LENGTH};
use crate::error::LxmfError;
use std::collections::BTreeMap;

/// Integer-keyed typed payload map carried in every LXMF message.
///
/// Keys are the wire field identifiers (`FIELD_*` constants); values are
/// arbitrary msgpack structures. Keys outside the u8 range are ignored on
/// decode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFields {
    entries: BTreeMap<u8, rmpv::Value>,
}

impl MessageFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, field_id: u8, value: rmpv::Value) -> &mut Self {
        self.entries.insert(field_id, value);
        self
    }

    pub fn get(&self, field_id: u8) -> Option<&rmpv::Value> {
        self.entries.get(&field_id)
    }

    pub fn remove(&mut self, field_id: u8) -> Option<rmpv::Value> {
        self.entries.remove(&field_id)
    }

    /// Embed a reply ticket: `FIELD_TICKET = [expires_epoch_s, token]`.
    pub fn set_ticket(&mut self, expires_epoch_s: i64, token: [u8; TICKET_LENGTH]) -> &mut Self {
        let entry = rmpv::Value::Array(vec![
            rmpv::Value::Integer(expires_epoch_s.into()),
            rmpv::Value::Binary(token.to_vec()),
        ]);
        self.entries.insert(FIELD_TICKET, entry);
        self
    }

    /// Extract an embedded reply ticket, if present and well formed.
    pub fn ticket(&self) -> Option<(i64, [u8; TICKET_LENGTH])> {
        let entry = self.entries.get(&FIELD_TICKET)?.as_array()?;
        if entry.len() != 2 {
            return None;
        }
        let expires = entry[0].as_i64()?;
        let token: [u8; TICKET_LENGTH] = entry[1].as_slice()?.try_into().ok()?;
        Some((expires, token))
    }

    pub fn to_rmpv(&self) -> rmpv::Value {
        let entries = self
            .entries
            .iter()
            .map(|(field_id, value)| {
                (
                    rmpv::Value::Integer((*field_id as i64).into()),
                    value.clone(),
                )
            })
            .collect();
        rmpv::Value::Map(entries)
    }

    pub fn from_rmpv(value: &rmpv::Value) -> Result<Self, LxmfError> {
        let rmpv::Value::Map(entries) = value else {
            return Err(LxmfError::Decode("fields must be a map".into()));
        };

        let mut out = Self::new();
        for (key, value) in entries {
            let Some(field_id) = key.as_u64().and_then(|k| u8::try_from(k).ok()) else {
                continue;
            };
            out.entries.insert(field_id, value.clone());
        }
        Ok(out)
    }

    pub fn encode_msgpack(&self) -> Result<Vec<u8>, LxmfError> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &self.to_rmpv())
            .map_err(|err| LxmfError::Encode(err.to_string()))?;
        Ok(out)
    }
}
