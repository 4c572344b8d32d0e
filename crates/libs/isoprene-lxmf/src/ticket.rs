//! Reply tickets: pre-authorized proof-of-work bypass tokens.

use crate::constants::{
    TICKET_EXPIRY_S, TICKET_GRACE_S, TICKET_INTERVAL_S, TICKET_LENGTH, TICKET_RENEW_S,
};
use rand_core::{OsRng, RngCore};
use rns_contract::DestinationHash;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, HashMap};

/// One issued or received ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub expires_epoch_s: i64,
    pub token: [u8; TICKET_LENGTH],
}

impl Ticket {
    pub fn is_valid(&self, now_epoch_s: i64) -> bool {
        now_epoch_s < self.expires_epoch_s
    }

    pub fn is_valid_with_grace(&self, now_epoch_s: i64) -> bool {
        now_epoch_s < self.expires_epoch_s + TICKET_GRACE_S as i64
    }
}

/// Durable snapshot of the ticket state, msgpack-persisted with 16-byte
/// binary keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TicketSnapshot {
    pub outbound: BTreeMap<ByteBuf, (i64, ByteBuf)>,
    pub inbound: BTreeMap<ByteBuf, BTreeMap<ByteBuf, i64>>,
    pub last_deliveries: BTreeMap<ByteBuf, i64>,
}

/// Ticket bookkeeping: tokens we issued (inbound side), tokens issued to us
/// (outbound side) and per-destination issuance pacing.
#[derive(Debug, Default)]
pub struct TicketStore {
    /// Tokens granted to us by remote peers, usable on our sends to them.
    outbound: HashMap<DestinationHash, Ticket>,
    /// Tokens we issued, keyed by the peer they were issued to. A peer may
    /// hold several unexpired tokens (renewals).
    inbound: HashMap<DestinationHash, HashMap<[u8; TICKET_LENGTH], i64>>,
    /// Last issuance time per peer, enforcing the issuance interval.
    last_issued: HashMap<DestinationHash, i64>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket usable for our next send to `destination`, if unexpired.
    pub fn outbound_ticket(
        &self,
        destination: &DestinationHash,
        now_epoch_s: i64,
    ) -> Option<Ticket> {
        self.outbound
            .get(destination)
            .filter(|ticket| ticket.is_valid(now_epoch_s))
            .copied()
    }

    /// Record a ticket a peer granted us. Keeps the later expiry when one is
    /// already held.
    pub fn store_outbound(
        &mut self,
        source: DestinationHash,
        expires_epoch_s: i64,
        token: [u8; TICKET_LENGTH],
        now_epoch_s: i64,
    ) -> bool {
        if now_epoch_s >= expires_epoch_s {
            return false;
        }
        match self.outbound.get(&source) {
            Some(existing) if existing.expires_epoch_s >= expires_epoch_s => false,
            _ => {
                self.outbound.insert(
                    source,
                    Ticket {
                        expires_epoch_s,
                        token,
                    },
                );
                true
            }
        }
    }

    /// Issue (or renew) a ticket for `destination`.
    ///
    /// At most one issuance per [`TICKET_INTERVAL_S`]; an existing token with
    /// more than [`TICKET_RENEW_S`] of life left is reused instead of minting
    /// a fresh one.
    pub fn issue(&mut self, destination: DestinationHash, now_epoch_s: i64) -> Option<Ticket> {
        if let Some(last) = self.last_issued.get(&destination) {
            if now_epoch_s - last < TICKET_INTERVAL_S as i64 {
                return None;
            }
        }

        let existing = self.inbound.get(&destination).and_then(|tokens| {
            tokens
                .iter()
                .max_by_key(|(_, expires)| **expires)
                .map(|(token, expires)| Ticket {
                    expires_epoch_s: *expires,
                    token: *token,
                })
        });

        let ticket = match existing {
            Some(ticket)
                if ticket.expires_epoch_s - now_epoch_s > TICKET_RENEW_S as i64 =>
            {
                ticket
            }
            _ => {
                let mut token = [0u8; TICKET_LENGTH];
                OsRng.fill_bytes(&mut token);
                let ticket = Ticket {
                    expires_epoch_s: now_epoch_s + TICKET_EXPIRY_S as i64,
                    token,
                };
                self.inbound
                    .entry(destination)
                    .or_default()
                    .insert(ticket.token, ticket.expires_epoch_s);
                ticket
            }
        };

        self.last_issued.insert(destination, now_epoch_s);
        Some(ticket)
    }

    /// Whether `token`, presented by `source`, matches a token we issued and
    /// is still unexpired. The grace window only delays cleanup, it does not
    /// extend acceptance.
    pub fn validate(
        &self,
        source: &DestinationHash,
        token: &[u8],
        now_epoch_s: i64,
    ) -> bool {
        let Ok(token) = <[u8; TICKET_LENGTH]>::try_from(token) else {
            return false;
        };
        self.inbound
            .get(source)
            .and_then(|tokens| tokens.get(&token))
            .map(|expires| now_epoch_s < *expires)
            .unwrap_or(false)
    }

    /// Drop expired outbound tickets, graced-out inbound tokens and empty
    /// per-peer maps.
    pub fn sweep(&mut self, now_epoch_s: i64) {
        self.outbound
            .retain(|_, ticket| ticket.is_valid(now_epoch_s));
        for tokens in self.inbound.values_mut() {
            tokens.retain(|_, expires| now_epoch_s < *expires + TICKET_GRACE_S as i64);
        }
        self.inbound.retain(|_, tokens| !tokens.is_empty());
    }

    pub fn snapshot(&self) -> TicketSnapshot {
        let outbound = self
            .outbound
            .iter()
            .map(|(dest, ticket)| {
                (
                    ByteBuf::from(dest.as_slice().to_vec()),
                    (
                        ticket.expires_epoch_s,
                        ByteBuf::from(ticket.token.to_vec()),
                    ),
                )
            })
            .collect();
        let inbound = self
            .inbound
            .iter()
            .map(|(source, tokens)| {
                (
                    ByteBuf::from(source.as_slice().to_vec()),
                    tokens
                        .iter()
                        .map(|(token, expires)| (ByteBuf::from(token.to_vec()), *expires))
                        .collect(),
                )
            })
            .collect();
        let last_deliveries = self
            .last_issued
            .iter()
            .map(|(dest, ts)| (ByteBuf::from(dest.as_slice().to_vec()), *ts))
            .collect();

        TicketSnapshot {
            outbound,
            inbound,
            last_deliveries,
        }
    }

    pub fn restore(snapshot: TicketSnapshot) -> Self {
        let mut store = Self::new();
        for (dest, (expires, token)) in snapshot.outbound {
            let (Ok(dest), Ok(token)) = (
                DestinationHash::from_slice(&dest),
                <[u8; TICKET_LENGTH]>::try_from(token.as_slice()),
            ) else {
                continue;
            };
            store.outbound.insert(
                dest,
                Ticket {
                    expires_epoch_s: expires,
                    token,
                },
            );
        }
        for (source, tokens) in snapshot.inbound {
            let Ok(source) = DestinationHash::from_slice(&source) else {
                continue;
            };
            let entry = store.inbound.entry(source).or_default();
            for (token, expires) in tokens {
                if let Ok(token) = <[u8; TICKET_LENGTH]>::try_from(token.as_slice()) {
                    entry.insert(token, expires);
                }
            }
        }
        for (dest, ts) in snapshot.last_deliveries {
            if let Ok(dest) = DestinationHash::from_slice(&dest) {
                store.last_issued.insert(dest, ts);
            }
        }
        store
    }
}
