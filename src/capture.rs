use std::fs::File;
use std::path::Path;

use log::debug;
use memmap2::Mmap;

use crate::error::DecodeError;
use crate::raw::RawCursor;
use crate::sideband::reader::SidebandConfig;
use crate::sideband::time::TscConverter;

/// The capture file's fixed prefix: CPU identification, PT clock
/// parameters, sideband time conversion, and the perf sample format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub header_size: u64,
    /// 0 unknown, 1 Intel.
    pub vendor: u64,
    pub family: u16,
    pub model: u8,
    pub stepping: u8,
    pub nr_cpus: i32,
    pub mtc_freq: u8,
    pub nom_freq: u8,
    pub time_shift: u16,
    pub cpuid_0x15_eax: u32,
    pub cpuid_0x15_ebx: u32,
    pub time_mult: u32,
    pub addr0_a: u64,
    pub addr0_b: u64,
    pub time_zero: u64,
    pub sample_type: u64,
}

impl TraceHeader {
    pub const ENCODED_SIZE: usize = 76;

    pub fn parse(cur: &mut RawCursor) -> Result<TraceHeader, DecodeError> {
        let header = TraceHeader {
            header_size: cur.read_u64()?,
            vendor: cur.read_u64()?,
            family: cur.read_u16()?,
            model: cur.read_u8()?,
            stepping: cur.read_u8()?,
            nr_cpus: cur.read_i32()?,
            mtc_freq: cur.read_u8()?,
            nom_freq: cur.read_u8()?,
            time_shift: cur.read_u16()?,
            cpuid_0x15_eax: cur.read_u32()?,
            cpuid_0x15_ebx: cur.read_u32()?,
            time_mult: {
                let time_mult = cur.read_u32()?;
                cur.skip(4)?;
                time_mult
            },
            addr0_a: cur.read_u64()?,
            addr0_b: cur.read_u64()?,
            time_zero: cur.read_u64()?,
            sample_type: cur.read_u64()?,
        };
        Ok(header)
    }

    /// Startup checks: anything wrong here is fatal.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.header_size != Self::ENCODED_SIZE as u64 {
            return Err(DecodeError::Config("trace header size mismatch"));
        }
        if self.vendor != 1 {
            return Err(DecodeError::Config("unsupported cpu vendor"));
        }
        if self.nr_cpus <= 0 {
            return Err(DecodeError::Config("capture reports no cpus"));
        }
        if self.time_mult == 0 {
            return Err(DecodeError::BadConfig);
        }
        Ok(())
    }

    pub fn converter(&self) -> TscConverter {
        TscConverter::new(self.time_shift, self.time_mult, self.time_zero)
    }

    pub fn sideband_config(&self) -> SidebandConfig {
        SidebandConfig {
            converter: self.converter(),
            sample_type: self.sample_type,
        }
    }

    #[cfg(test)]
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        use byteorder::{LittleEndian, WriteBytesExt};
        buf.write_u64::<LittleEndian>(self.header_size).unwrap();
        buf.write_u64::<LittleEndian>(self.vendor).unwrap();
        buf.write_u16::<LittleEndian>(self.family).unwrap();
        buf.write_u8(self.model).unwrap();
        buf.write_u8(self.stepping).unwrap();
        buf.write_i32::<LittleEndian>(self.nr_cpus).unwrap();
        buf.write_u8(self.mtc_freq).unwrap();
        buf.write_u8(self.nom_freq).unwrap();
        buf.write_u16::<LittleEndian>(self.time_shift).unwrap();
        buf.write_u32::<LittleEndian>(self.cpuid_0x15_eax).unwrap();
        buf.write_u32::<LittleEndian>(self.cpuid_0x15_ebx).unwrap();
        buf.write_u32::<LittleEndian>(self.time_mult).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(self.addr0_a).unwrap();
        buf.write_u64::<LittleEndian>(self.addr0_b).unwrap();
        buf.write_u64::<LittleEndian>(self.time_zero).unwrap();
        buf.write_u64::<LittleEndian>(self.sample_type).unwrap();
    }
}

/// Per-CPU segment lists from the capture directory. Offsets are
/// file-absolute, lengths byte-exact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuDirectory {
    pub cpu: u32,
    pub pt_segments: Vec<(u64, u64)>,
    pub sideband_segments: Vec<(u64, u64)>,
}

/// A memory-mapped capture file plus its parsed header and directory.
pub struct Capture {
    data: CaptureStorage,
    pub header: TraceHeader,
    pub cpus: Vec<CpuDirectory>,
}

enum CaptureStorage {
    Mapped(Mmap),
    #[cfg(test)]
    Owned(Vec<u8>),
}

impl CaptureStorage {
    fn bytes(&self) -> &[u8] {
        match self {
            CaptureStorage::Mapped(map) => map,
            #[cfg(test)]
            CaptureStorage::Owned(vec) => vec,
        }
    }
}

impl Capture {
    pub fn open(path: &Path) -> Result<Capture, DecodeError> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        debug!("mapped {} ({} bytes)", path.display(), map.len());
        Self::from_storage(CaptureStorage::Mapped(map))
    }

    #[cfg(test)]
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Capture, DecodeError> {
        Self::from_storage(CaptureStorage::Owned(bytes))
    }

    fn from_storage(data: CaptureStorage) -> Result<Capture, DecodeError> {
        let bytes = data.bytes();
        let mut cur = RawCursor::new(bytes);
        let header = TraceHeader::parse(&mut cur)?;
        header.validate()?;
        let mut cpus = Vec::with_capacity(header.nr_cpus as usize);
        for _ in 0..header.nr_cpus {
            let cpu = cur.read_u32()?;
            let mut directory = CpuDirectory {
                cpu,
                ..Default::default()
            };
            let pt_count = cur.read_u32()?;
            for _ in 0..pt_count {
                directory.pt_segments.push((cur.read_u64()?, cur.read_u64()?));
            }
            let sideband_count = cur.read_u32()?;
            for _ in 0..sideband_count {
                directory
                    .sideband_segments
                    .push((cur.read_u64()?, cur.read_u64()?));
            }
            cpus.push(directory);
        }
        let capture = Capture { data, header, cpus };
        for directory in &capture.cpus {
            capture.check_segments(&directory.pt_segments)?;
            capture.check_segments(&directory.sideband_segments)?;
        }
        Ok(capture)
    }

    fn check_segments(&self, segments: &[(u64, u64)]) -> Result<(), DecodeError> {
        let len = self.data.bytes().len() as u64;
        for &(offset, length) in segments {
            if offset.checked_add(length).is_none_or(|end| end > len) {
                return Err(DecodeError::Format(
                    offset as usize,
                    "capture segment out of bounds",
                ));
            }
        }
        Ok(())
    }

    fn concat(&self, segments: &[(u64, u64)]) -> Vec<u8> {
        let total: u64 = segments.iter().map(|&(_, length)| length).sum();
        let mut out = Vec::with_capacity(total as usize);
        for &(offset, length) in segments {
            out.extend_from_slice(
                &self.data.bytes()[offset as usize..(offset + length) as usize],
            );
        }
        out
    }

    /// This CPU's PT stream, segments logically concatenated.
    pub fn pt_bytes(&self, cpu_index: usize) -> Vec<u8> {
        self.concat(&self.cpus[cpu_index].pt_segments)
    }

    /// This CPU's full sideband, segments logically concatenated.
    pub fn sideband_bytes(&self, cpu_index: usize) -> Vec<u8> {
        self.concat(&self.cpus[cpu_index].sideband_segments)
    }
}
