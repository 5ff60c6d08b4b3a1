use super::packet::{self, IpPayload, Packet};
use crate::capture::TraceHeader;
use crate::error::DecodeError;

/// Static PT decode parameters from the capture header.
#[derive(Debug, Clone, Copy)]
pub struct PtConfig {
    pub cpuid_0x15_eax: u32,
    pub cpuid_0x15_ebx: u32,
    pub mtc_freq: u8,
    pub nom_freq: u8,
    /// The IP filter range the trace was collected with.
    pub filter: Option<(u64, u64)>,
}

impl PtConfig {
    pub fn from_header(header: &TraceHeader) -> Self {
        let filter = (header.addr0_b > header.addr0_a).then_some((header.addr0_a, header.addr0_b));
        PtConfig {
            cpuid_0x15_eax: header.cpuid_0x15_eax,
            cpuid_0x15_ebx: header.cpuid_0x15_ebx,
            mtc_freq: header.mtc_freq,
            nom_freq: header.nom_freq,
            filter,
        }
    }
}

/// What the packet stream tells the per-CPU decoder: branch-target IPs,
/// time bounds, and data loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtEvent {
    Ip(u64),
    Tsc(u64),
    Loss,
}

/// Packet-level decoder over one PSB-aligned window.
///
/// Timing is taken from TSC packets alone; MTC/CYC refinement is skipped,
/// which bounds event time tightly enough to order context switches.
pub struct PacketDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
    last_ip: u64,
}

impl<'a> PacketDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        PacketDecoder {
            buf,
            pos: 0,
            last_ip: 0,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn apply_ip(&mut self, payload: IpPayload) -> Option<u64> {
        let bytes = payload.bytes;
        match payload.compression {
            // Suppressed: no IP, last-IP unchanged.
            0b000 => return None,
            0b001 => self.last_ip = (self.last_ip & !0xffff) | bytes,
            0b010 => self.last_ip = (self.last_ip & !0xffff_ffff) | bytes,
            0b011 => {
                let value = bytes & 0xffff_ffff_ffff;
                self.last_ip = if value & (1 << 47) != 0 {
                    value | 0xffff_0000_0000_0000
                } else {
                    value
                };
            }
            0b100 => self.last_ip = (self.last_ip & !0xffff_ffff_ffff) | bytes,
            0b110 => self.last_ip = bytes,
            _ => unreachable!("reserved compressions rejected by the packet parser"),
        }
        Some(self.last_ip)
    }

    /// Steps to the next IP, time, or loss event. `None` at end of window.
    pub fn next_event(&mut self) -> Option<Result<PtEvent, DecodeError>> {
        while self.pos < self.buf.len() {
            let (packet, len) = match packet::parse(self.buf, self.pos) {
                Ok(parsed) => parsed,
                Err(err) => return Some(Err(err)),
            };
            self.pos += len;
            match packet {
                Packet::Tip(payload) | Packet::TipPge(payload) | Packet::Fup(payload) => {
                    if let Some(ip) = self.apply_ip(payload) {
                        return Some(Ok(PtEvent::Ip(ip)));
                    }
                }
                // Tracing stops here; the target IP only updates last-IP.
                Packet::TipPgd(payload) => {
                    self.apply_ip(payload);
                }
                Packet::Tsc(tsc) => return Some(Ok(PtEvent::Tsc(tsc))),
                Packet::Ovf => return Some(Ok(PtEvent::Loss)),
                _ => {}
            }
        }
        None
    }
}
