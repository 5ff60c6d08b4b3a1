use crate::error::DecodeError;

/// Converts between perf clock values and TSC, using the conversion
/// constants published in the capture header (time_shift, time_mult,
/// time_zero from the perf mmap page).
#[derive(Debug, Clone, Copy)]
pub struct TscConverter {
    time_shift: u16,
    time_mult: u32,
    time_zero: u64,
}

impl TscConverter {
    pub fn new(time_shift: u16, time_mult: u32, time_zero: u64) -> Self {
        TscConverter {
            time_shift,
            time_mult,
            time_zero,
        }
    }

    pub fn time_to_tsc(&self, time: u64) -> Result<u64, DecodeError> {
        if self.time_mult == 0 {
            return Err(DecodeError::BadConfig);
        }
        let time = time.wrapping_sub(self.time_zero);
        let mult = self.time_mult as u64;
        let quot = time / mult;
        let rem = time % mult;
        Ok((quot << self.time_shift) + ((rem << self.time_shift) / mult))
    }

    pub fn tsc_to_time(&self, tsc: u64) -> Result<u64, DecodeError> {
        if self.time_mult == 0 {
            return Err(DecodeError::BadConfig);
        }
        let mult = self.time_mult as u64;
        let quot = tsc >> self.time_shift;
        let rem = tsc & ((1u64 << self.time_shift) - 1);
        Ok(self.time_zero + quot * mult + ((rem * mult) >> self.time_shift))
    }
}

#[cfg(test)]
mod tests {
    use super::TscConverter;
    use crate::error::DecodeError;

    #[test]
    fn round_trips_through_tsc() {
        // Constants in the shape the kernel reports them.
        let converter = TscConverter::new(31, 642_857_205, 0x1234_5678);
        for &time in &[0x1234_5678u64, 0x1_0000_0000, 0xdead_beef_cafe] {
            let tsc = converter.time_to_tsc(time).unwrap();
            let back = converter.tsc_to_time(tsc).unwrap();
            // The shift/mult pipeline rounds down by at most one unit.
            assert!(back <= time && time - back <= 1, "{time} -> {tsc} -> {back}");
        }
    }

    #[test]
    fn zero_mult_is_bad_config() {
        let converter = TscConverter::new(10, 0, 0);
        assert!(matches!(
            converter.time_to_tsc(123),
            Err(DecodeError::BadConfig)
        ));
        assert!(matches!(
            converter.tsc_to_time(123),
            Err(DecodeError::BadConfig)
        ));
    }
}
