pub mod reader;
pub mod records;
pub mod schedule;
pub mod time;

#[cfg(test)]
pub mod testutil {
    //! Builders for synthetic sideband streams used across the test suite.
    //! All records carry TID and TIME sample fields, and tests use an
    //! identity TSC conversion (shift 0, mult 1, zero 0).

    use byteorder::{LittleEndian, WriteBytesExt};

    use super::records::*;

    pub struct SideBuilder {
        buf: Vec<u8>,
    }

    impl SideBuilder {
        pub fn new() -> Self {
            SideBuilder { buf: Vec::new() }
        }

        pub fn push(&mut self, record: Vec<u8>) {
            self.buf.extend_from_slice(&record);
        }

        pub fn finish(self) -> Vec<u8> {
            self.buf
        }
    }

    fn header(kind: u32, misc: u16, size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(size);
        buf.write_u32::<LittleEndian>(kind).unwrap();
        buf.write_u16::<LittleEndian>(misc).unwrap();
        buf.write_u16::<LittleEndian>(size as u16).unwrap();
        buf
    }

    fn push_sample(buf: &mut Vec<u8>, tid: u32, time: u64) {
        buf.write_u32::<LittleEndian>(tid).unwrap(); // pid
        buf.write_u32::<LittleEndian>(tid).unwrap();
        buf.write_u64::<LittleEndian>(time).unwrap();
    }

    pub fn switch_record(tid: u32, time: u64, switch_out: bool) -> Vec<u8> {
        let misc = if switch_out {
            PERF_RECORD_MISC_SWITCH_OUT
        } else {
            0
        };
        let mut buf = header(PERF_RECORD_SWITCH, misc, 8 + 16);
        push_sample(&mut buf, tid, time);
        buf
    }

    pub fn lost_record(tid: u32, time: u64) -> Vec<u8> {
        let mut buf = header(PERF_RECORD_LOST, 0, 8 + 16 + 16);
        buf.write_u64::<LittleEndian>(0).unwrap(); // id
        buf.write_u64::<LittleEndian>(1).unwrap(); // count
        push_sample(&mut buf, tid, time);
        buf
    }

    pub fn comm_record(tid: u32, time: u64, name: &[u8], terminated: bool) -> Vec<u8> {
        let mut string = name.to_vec();
        let pad = if terminated { 0 } else { 1 };
        if terminated {
            string.push(0);
        }
        while string.len() % 8 != 0 {
            string.push(pad);
        }
        let mut buf = header(PERF_RECORD_COMM, 0, 8 + 8 + string.len() + 16);
        buf.write_u32::<LittleEndian>(tid).unwrap();
        buf.write_u32::<LittleEndian>(tid).unwrap();
        buf.extend_from_slice(&string);
        push_sample(&mut buf, tid, time);
        buf
    }
}
