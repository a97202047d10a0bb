//! Ethernet framing for the cluster protocol: one reserved EtherType, a
//! 1-byte message-type tag after the usual 14-byte header, and one encoder
//! per message type. All multi-byte fields are big-endian on the wire.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::net::rr::RemoteRef;

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const ETHERTYPE_CLUSTER: u16 = 0x88B5;

/// Payload split size: a page is carried in three parts so each fits inside
/// an Ethernet MTU alongside the header.
pub const PAGE_PARTS: usize = 3;
pub const PART_SIZE: usize = 4096 / PAGE_PARTS + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// This node's MAC with the last byte overwritten by its node number,
    /// per the wire format's addressing convention.
    pub fn for_node(node: u8) -> Self {
        Self([0x52, 0x54, 0x00, 0x00, 0x00, node])
    }

    pub fn node(&self) -> u8 {
        self.0[5]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Migrq = 1,
    Migrp = 2,
    Pullrq = 3,
    Pullrp = 4,
    Sendrq = 5,
    Sendrp = 6,
    Recvrq = 7,
    Recvrp = 8,
    Fetchrq = 9,
    Fetchrp = 10,
}

impl MessageTag {
    fn from_u8(v: u8) -> KernelResult<Self> {
        Ok(match v {
            1 => Self::Migrq,
            2 => Self::Migrp,
            3 => Self::Pullrq,
            4 => Self::Pullrp,
            5 => Self::Sendrq,
            6 => Self::Sendrp,
            7 => Self::Recvrq,
            8 => Self::Recvrp,
            9 => Self::Fetchrq,
            10 => Self::Fetchrp,
            _ => return Err(KernelError::MalformedFrame),
        })
    }
}

/// A parsed frame: header fields plus a reference into the original buffer
/// for the body, so dispatch never copies before it knows it wants to.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub tag: MessageTag,
    pub body: &'a [u8],
}

/// Minimum frame size: header + ethertype + tag + one reserved pad byte.
const MIN_FRAME_LEN: usize = ETHERNET_HEADER_SIZE + 2;

pub fn parse(data: &[u8]) -> KernelResult<Frame<'_>> {
    if data.len() < MIN_FRAME_LEN {
        return Err(KernelError::MalformedFrame);
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&data[0..6]);
    src.copy_from_slice(&data[6..12]);
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    if ethertype != ETHERTYPE_CLUSTER {
        return Err(KernelError::MalformedFrame);
    }
    let tag = MessageTag::from_u8(data[14])?;
    // data[15] is the reserved padding byte; body starts at 16.
    Ok(Frame {
        dst: MacAddress(dst),
        src: MacAddress(src),
        tag,
        body: &data[16..],
    })
}

/// Assemble a frame from a header and an already-encoded body.
pub fn build(dst: MacAddress, src: MacAddress, tag: MessageTag, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_FRAME_LEN + body.len());
    out.extend_from_slice(&dst.0);
    out.extend_from_slice(&src.0);
    out.extend_from_slice(&ETHERTYPE_CLUSTER.to_be_bytes());
    out.push(tag as u8);
    out.push(0);
    out.extend_from_slice(body);
    out
}

pub fn put_rr(out: &mut Vec<u8>, rr: RemoteRef) {
    out.extend_from_slice(&rr.raw().to_be_bytes());
}

pub fn get_rr(data: &[u8], off: usize) -> KernelResult<RemoteRef> {
    let bytes: [u8; 8] = data
        .get(off..off + 8)
        .ok_or(KernelError::MalformedFrame)?
        .try_into()
        .map_err(|_| KernelError::MalformedFrame)?;
    Ok(RemoteRef::from_raw(u64::from_be_bytes(bytes)))
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn get_u64(data: &[u8], off: usize) -> KernelResult<u64> {
    let bytes: [u8; 8] = data
        .get(off..off + 8)
        .ok_or(KernelError::MalformedFrame)?
        .try_into()
        .map_err(|_| KernelError::MalformedFrame)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Byte range of part `part` (0..PAGE_PARTS) when `total` bytes are split
/// evenly across `PAGE_PARTS` parts, earlier parts absorbing the remainder.
pub fn part_bounds(total: usize, part: usize) -> (usize, usize) {
    let base = total / PAGE_PARTS;
    let rem = total % PAGE_PARTS;
    let mut start = 0;
    for i in 0..part {
        start += base + usize::from(i < rem);
    }
    let len = base + usize::from(part < rem);
    (start, start + len)
}

/// Validate that a node-number field lies in the valid cluster range.
pub fn check_node(node: u8, node_count: u8) -> KernelResult<()> {
    if node == 0 || node > node_count {
        return Err(KernelError::NetUnreachable { node });
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_roundtrips_header_and_tag() {
        let dst = MacAddress::for_node(2);
        let src = MacAddress::for_node(1);
        let mut body = Vec::new();
        put_rr(&mut body, RemoteRef::new(1, 0x1000, 0x3));
        let frame = build(dst, src, MessageTag::Migrq, &body);

        let parsed = parse(&frame).unwrap();
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.tag, MessageTag::Migrq);
        assert_eq!(get_rr(parsed.body, 0).unwrap(), RemoteRef::new(1, 0x1000, 0x3));
    }

    #[test]
    fn short_frame_is_malformed() {
        let short = [0u8; 8];
        assert_eq!(parse(&short).unwrap_err(), KernelError::MalformedFrame);
    }

    #[test]
    fn wrong_ethertype_is_malformed() {
        let mut frame = build(MacAddress::for_node(2), MacAddress::for_node(1), MessageTag::Migrp, &[]);
        frame[12] = 0;
        frame[13] = 0;
        assert_eq!(parse(&frame).unwrap_err(), KernelError::MalformedFrame);
    }

    #[test]
    fn node_range_is_checked() {
        assert!(check_node(1, 4).is_ok());
        assert!(check_node(0, 4).is_err());
        assert!(check_node(5, 4).is_err());
    }
}
