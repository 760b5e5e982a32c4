//! Sub-packet demultiplexer.
//!
//! Splits a container into validated, type-grouped sub-packets. Validation
//! is per sub-packet: a malformed one is reported and the rest of the
//! container is still processed.

use crate::container::{EventPacketContainer, RawSubPacket, SubPacketHeader};
use crate::decoder::DecodeError;
use crate::types::EventType;
use std::collections::BTreeMap;

/// A sub-packet whose header has been checked against its payload.
#[derive(Debug, Clone)]
pub struct TypedSubPacket {
    header: SubPacketHeader,
    packet: RawSubPacket,
}

impl TypedSubPacket {
    pub fn header(&self) -> &SubPacketHeader {
        &self.header
    }

    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    /// Declared number of records.
    pub fn event_count(&self) -> usize {
        self.header.event_count as usize
    }

    /// Iterates over exactly `event_count` fixed-stride records.
    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        let stride = self.header.event_size.max(1) as usize;
        self.packet
            .payload()
            .chunks_exact(stride)
            .take(self.event_count())
    }

    pub fn into_raw(self) -> RawSubPacket {
        self.packet
    }

    pub(crate) fn malformed(&self, reason: String) -> DecodeError {
        DecodeError::MalformedPacket {
            event_type: self.header.event_type,
            declared_count: self.header.event_count,
            reason,
        }
    }
}

/// Output of [`demux`]: accepted sub-packets by type plus the rejected ones.
#[derive(Debug, Default)]
pub struct Demultiplexed {
    groups: BTreeMap<EventType, Vec<TypedSubPacket>>,
    rejected: Vec<DecodeError>,
    empty_slots: usize,
}

impl Demultiplexed {
    /// Accepted sub-packets of `event_type`, in container order.
    pub fn get(&self, event_type: EventType) -> &[TypedSubPacket] {
        self.groups
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Sum of declared counts over accepted sub-packets of `event_type`.
    pub fn declared_count(&self, event_type: EventType) -> usize {
        self.get(event_type).iter().map(|p| p.event_count()).sum()
    }

    pub fn groups(&self) -> &BTreeMap<EventType, Vec<TypedSubPacket>> {
        &self.groups
    }

    pub fn rejected(&self) -> &[DecodeError] {
        &self.rejected
    }

    /// Number of empty slots skipped.
    pub fn empty_slots(&self) -> usize {
        self.empty_slots
    }

    pub fn into_parts(self) -> (BTreeMap<EventType, Vec<TypedSubPacket>>, Vec<DecodeError>) {
        (self.groups, self.rejected)
    }
}

/// Checks a sub-packet's header against its payload.
///
/// The declared count must fit in the payload at the declared stride, and
/// the stride must be large enough for the record layout of known types.
/// A zero count is always accepted.
pub fn validate(packet: RawSubPacket) -> Result<TypedSubPacket, DecodeError> {
    let header = packet.header().ok_or(DecodeError::TruncatedHeader {
        length: packet.as_bytes().len(),
    })?;

    let malformed = |reason: String| DecodeError::MalformedPacket {
        event_type: header.event_type,
        declared_count: header.event_count,
        reason,
    };

    if header.event_count < 0 {
        return Err(malformed("negative event count".to_string()));
    }
    if header.event_valid < 0 || header.event_valid > header.event_count {
        return Err(malformed(format!(
            "valid count {} outside 0..={}",
            header.event_valid, header.event_count
        )));
    }
    if header.event_count == 0 {
        return Ok(TypedSubPacket { header, packet });
    }

    if header.event_size <= 0 {
        return Err(malformed(format!(
            "non-positive event size {}",
            header.event_size
        )));
    }
    if let Some(min) = header.event_type.min_record_size() {
        if (header.event_size as usize) < min {
            return Err(malformed(format!(
                "event size {} below the {} byte record layout",
                header.event_size, min
            )));
        }
    }

    let needed = (header.event_count as usize).checked_mul(header.event_size as usize);
    let available = packet.payload().len();
    match needed {
        Some(needed) if needed <= available => Ok(TypedSubPacket { header, packet }),
        _ => Err(malformed(format!(
            "payload of {} bytes cannot hold {} records of {} bytes",
            available, header.event_count, header.event_size
        ))),
    }
}

/// Groups the sub-packets of a container by event type.
///
/// Empty slots are skipped. Unknown types land in [`EventType::Other`].
/// Never stops early: every slot is inspected.
pub fn demux(container: EventPacketContainer) -> Demultiplexed {
    let mut out = Demultiplexed::default();

    for slot in container {
        let Some(packet) = slot else {
            out.empty_slots += 1;
            continue;
        };

        match validate(packet) {
            Ok(typed) => out
                .groups
                .entry(typed.event_type())
                .or_default()
                .push(typed),
            Err(err) => out.rejected.push(err),
        }
    }

    out
}
