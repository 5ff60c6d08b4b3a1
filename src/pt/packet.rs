use byteorder::{ByteOrder, LittleEndian};

use crate::error::DecodeError;

/// The 16-byte PSB pattern. The only packet a decoder can restart from
/// without prior context, and therefore the only place the splitter may
/// cut a window.
pub const PSB_PATTERN: [u8; 16] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];

/// Finds the next PSB at or after `from`.
pub fn sync_forward(buf: &[u8], from: usize) -> Option<usize> {
    if from > buf.len() {
        return None;
    }
    memchr::memmem::find(&buf[from..], &PSB_PATTERN).map(|i| from + i)
}

/// A compressed instruction pointer as carried by TIP/FUP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPayload {
    /// The IPBytes field from the packet header (0, 1, 2, 3, 4 or 6).
    pub compression: u8,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Pad,
    Psb,
    Psbend,
    TntShort,
    TntLong,
    Tip(IpPayload),
    TipPge(IpPayload),
    TipPgd(IpPayload),
    Fup(IpPayload),
    /// Lower 7 bytes of the timestamp counter.
    Tsc(u64),
    Mtc(u8),
    Tma { ctc: u16, fast_counter: u16 },
    Cbr(u8),
    Cyc,
    Mode(u8),
    Pip,
    Vmcs,
    Ovf,
    TraceStop,
    Mnt,
    Exstop,
    Mwait,
    Pwre,
    Pwrx,
    Ptw,
}

fn ip_len(compression: u8) -> Option<usize> {
    match compression {
        0b000 => Some(0),
        0b001 => Some(2),
        0b010 => Some(4),
        0b011 | 0b100 => Some(6),
        0b110 => Some(8),
        _ => None,
    }
}

fn parse_ip(buf: &[u8], pos: usize, header: u8) -> Result<(IpPayload, usize), DecodeError> {
    let compression = header >> 5;
    let len = ip_len(compression).ok_or(DecodeError::BadPacket(pos))?;
    if buf.len() - pos < 1 + len {
        return Err(DecodeError::BadPacket(pos));
    }
    let bytes = if len == 0 {
        0
    } else {
        LittleEndian::read_uint(&buf[pos + 1..pos + 1 + len], len)
    };
    Ok((IpPayload { compression, bytes }, 1 + len))
}

/// Parses one packet at `pos`, returning it and its encoded length.
pub fn parse(buf: &[u8], pos: usize) -> Result<(Packet, usize), DecodeError> {
    let avail = buf.len() - pos;
    let need = |n: usize| {
        if avail < n {
            Err(DecodeError::BadPacket(pos))
        } else {
            Ok(())
        }
    };
    let b0 = buf[pos];
    match b0 {
        0x00 => Ok((Packet::Pad, 1)),
        0x02 => {
            need(2)?;
            match buf[pos + 1] {
                0x82 => {
                    need(16)?;
                    if buf[pos..pos + 16] != PSB_PATTERN {
                        return Err(DecodeError::BadPacket(pos));
                    }
                    Ok((Packet::Psb, 16))
                }
                0x23 => Ok((Packet::Psbend, 2)),
                0x03 => {
                    need(4)?;
                    Ok((Packet::Cbr(buf[pos + 2]), 4))
                }
                0x73 => {
                    need(7)?;
                    let ctc = LittleEndian::read_u16(&buf[pos + 2..pos + 4]);
                    let fast_counter = LittleEndian::read_u16(&buf[pos + 5..pos + 7]) & 0x1ff;
                    Ok((Packet::Tma { ctc, fast_counter }, 7))
                }
                0x43 => {
                    need(8)?;
                    Ok((Packet::Pip, 8))
                }
                0xc8 => {
                    need(7)?;
                    Ok((Packet::Vmcs, 7))
                }
                0xf3 => Ok((Packet::Ovf, 2)),
                0x83 => Ok((Packet::TraceStop, 2)),
                0xa3 => {
                    need(8)?;
                    Ok((Packet::TntLong, 8))
                }
                0xc3 => {
                    need(11)?;
                    if buf[pos + 2] != 0x88 {
                        return Err(DecodeError::BadPacket(pos));
                    }
                    Ok((Packet::Mnt, 11))
                }
                0x62 | 0xe2 => Ok((Packet::Exstop, 2)),
                0xc2 => {
                    need(10)?;
                    Ok((Packet::Mwait, 10))
                }
                0x22 => {
                    need(4)?;
                    Ok((Packet::Pwre, 4))
                }
                0xa2 => {
                    need(7)?;
                    Ok((Packet::Pwrx, 7))
                }
                b1 if b1 & 0x1f == 0x12 => {
                    let payload = if b1 & 0x20 != 0 { 8 } else { 4 };
                    need(2 + payload)?;
                    Ok((Packet::Ptw, 2 + payload))
                }
                _ => Err(DecodeError::BadPacket(pos)),
            }
        }
        0x19 => {
            need(8)?;
            let tsc = LittleEndian::read_uint(&buf[pos + 1..pos + 8], 7);
            Ok((Packet::Tsc(tsc), 8))
        }
        0x59 => {
            need(2)?;
            Ok((Packet::Mtc(buf[pos + 1]), 2))
        }
        0x99 => {
            need(2)?;
            Ok((Packet::Mode(buf[pos + 1]), 2))
        }
        b0 if b0 & 0x03 == 0x03 => {
            // CYC: a leader byte with an extension bit, then continuation
            // bytes while their low bit stays set.
            let mut len = 1;
            let mut more = b0 & 0x04 != 0;
            while more {
                need(len + 1)?;
                more = buf[pos + len] & 0x01 != 0;
                len += 1;
            }
            Ok((Packet::Cyc, len))
        }
        b0 if b0 & 0x01 == 0 => Ok((Packet::TntShort, 1)),
        b0 => {
            let (payload, len) = match b0 & 0x1f {
                0x0d => parse_ip(buf, pos, b0).map(|(p, l)| (Packet::Tip(p), l))?,
                0x11 => parse_ip(buf, pos, b0).map(|(p, l)| (Packet::TipPge(p), l))?,
                0x01 => parse_ip(buf, pos, b0).map(|(p, l)| (Packet::TipPgd(p), l))?,
                0x1d => parse_ip(buf, pos, b0).map(|(p, l)| (Packet::Fup(p), l))?,
                _ => return Err(DecodeError::BadPacket(pos)),
            };
            Ok((payload, len))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_psb_past_garbage() {
        let mut buf = vec![0x55u8, 0xaa, 0x19]; // garbage
        buf.extend_from_slice(&PSB_PATTERN);
        buf.push(0x00);
        assert_eq!(sync_forward(&buf, 0), Some(3));
        assert_eq!(sync_forward(&buf, 4), None);
    }

    #[test]
    fn parses_core_packets() {
        assert_eq!(parse(&[0x00], 0).unwrap(), (Packet::Pad, 1));
        assert_eq!(parse(&[0x02, 0x23], 0).unwrap(), (Packet::Psbend, 2));
        assert_eq!(parse(&[0x02, 0xf3], 0).unwrap(), (Packet::Ovf, 2));
        let mut tsc = vec![0x19];
        tsc.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        assert_eq!(
            parse(&tsc, 0).unwrap(),
            (Packet::Tsc(0x07_0605_0403_0201), 8)
        );
        assert_eq!(parse(&PSB_PATTERN, 0).unwrap(), (Packet::Psb, 16));
    }

    #[test]
    fn parses_tip_with_full_ip() {
        let mut buf = vec![0xcd]; // TIP, IPBytes 0b110
        buf.extend_from_slice(&0x7f12_3456_789a_bcdeu64.to_le_bytes());
        let (packet, len) = parse(&buf, 0).unwrap();
        assert_eq!(len, 9);
        assert_eq!(
            packet,
            Packet::Tip(IpPayload {
                compression: 0b110,
                bytes: 0x7f12_3456_789a_bcde
            })
        );
    }

    #[test]
    fn rejects_reserved_ip_compression() {
        let buf = [0xbd, 0, 0, 0, 0, 0, 0, 0, 0]; // FUP with IPBytes 0b101
        assert!(matches!(parse(&buf, 0), Err(DecodeError::BadPacket(0))));
    }

    #[test]
    fn rejects_unknown_extended_opcode() {
        assert!(matches!(
            parse(&[0x02, 0x55], 0),
            Err(DecodeError::BadPacket(0))
        ));
    }
}
