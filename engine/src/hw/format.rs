use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;

/// Linear PCM encodings the engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    FloatLe,
    S32Le,
    S32Be,
    /// 24 bit packed in 3 bytes.
    S24_3Le,
    S24_3Be,
    /// 24 bit in the low bits of a 32 bit word.
    S24Le,
    S24Be,
    S16Le,
    S16Be,
}

impl SampleFormat {
    /// Negotiation order: highest fidelity and native alignment first.
    pub const PREFERENCE: [SampleFormat; 9] = [
        SampleFormat::FloatLe,
        SampleFormat::S32Le,
        SampleFormat::S32Be,
        SampleFormat::S24_3Le,
        SampleFormat::S24_3Be,
        SampleFormat::S24Le,
        SampleFormat::S24Be,
        SampleFormat::S16Le,
        SampleFormat::S16Be,
    ];

    pub fn bytes(self) -> usize {
        match self {
            Self::FloatLe | Self::S32Le | Self::S32Be | Self::S24Le | Self::S24Be => 4,
            Self::S24_3Le | Self::S24_3Be => 3,
            Self::S16Le | Self::S16Be => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FloatLe => "FLOAT_LE",
            Self::S32Le => "S32_LE",
            Self::S32Be => "S32_BE",
            Self::S24_3Le => "S24_3LE",
            Self::S24_3Be => "S24_3BE",
            Self::S24Le => "S24_LE",
            Self::S24Be => "S24_BE",
            Self::S16Le => "S16_LE",
            Self::S16Be => "S16_BE",
        }
    }

    /// Reads one sample from `src` (at least `bytes()` long) as -1.0..1.0.
    pub fn decode(self, src: &[u8]) -> f32 {
        match self {
            Self::FloatLe => LittleEndian::read_f32(src),
            Self::S32Le => LittleEndian::read_i32(src) as f32 / 2_147_483_648.0,
            Self::S32Be => BigEndian::read_i32(src) as f32 / 2_147_483_648.0,
            Self::S24_3Le => LittleEndian::read_i24(src) as f32 / 8_388_608.0,
            Self::S24_3Be => BigEndian::read_i24(src) as f32 / 8_388_608.0,
            Self::S24Le => sign_extend_24(LittleEndian::read_i32(src)) as f32 / 8_388_608.0,
            Self::S24Be => sign_extend_24(BigEndian::read_i32(src)) as f32 / 8_388_608.0,
            Self::S16Le => LittleEndian::read_i16(src) as f32 / 32_768.0,
            Self::S16Be => BigEndian::read_i16(src) as f32 / 32_768.0,
        }
    }

    /// Writes `value` (clamped to -1.0..1.0) into `dst`.
    pub fn encode(self, value: f32, dst: &mut [u8]) {
        let v = value.clamp(-1.0, 1.0);
        match self {
            Self::FloatLe => LittleEndian::write_f32(dst, v),
            Self::S32Le => LittleEndian::write_i32(dst, (v as f64 * 2_147_483_647.0) as i32),
            Self::S32Be => BigEndian::write_i32(dst, (v as f64 * 2_147_483_647.0) as i32),
            Self::S24_3Le => LittleEndian::write_i24(dst, (v * 8_388_607.0) as i32),
            Self::S24_3Be => BigEndian::write_i24(dst, (v * 8_388_607.0) as i32),
            Self::S24Le => LittleEndian::write_i32(dst, (v * 8_388_607.0) as i32 & 0x00ff_ffff),
            Self::S24Be => BigEndian::write_i32(dst, (v * 8_388_607.0) as i32 & 0x00ff_ffff),
            Self::S16Le => LittleEndian::write_i16(dst, (v * 32_767.0) as i16),
            Self::S16Be => BigEndian::write_i16(dst, (v * 32_767.0) as i16),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn sign_extend_24(raw: i32) -> i32 {
    (raw << 8) >> 8
}

/// Direct memory access transfer modes, least strict last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    MmapNonInterleaved,
    MmapInterleaved,
    MmapComplex,
}

impl AccessMode {
    pub const PREFERENCE: [AccessMode; 3] = [
        AccessMode::MmapNonInterleaved,
        AccessMode::MmapInterleaved,
        AccessMode::MmapComplex,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::MmapNonInterleaved => "MMAP_NONINTERLEAVED",
            Self::MmapInterleaved => "MMAP_INTERLEAVED",
            Self::MmapComplex => "MMAP_COMPLEX",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_widths() {
        assert_eq!(SampleFormat::FloatLe.bytes(), 4);
        assert_eq!(SampleFormat::S24Be.bytes(), 4);
        assert_eq!(SampleFormat::S24_3Le.bytes(), 3);
        assert_eq!(SampleFormat::S16Be.bytes(), 2);
    }

    #[test]
    fn preference_starts_with_float_and_ends_with_16_bit() {
        assert_eq!(SampleFormat::PREFERENCE[0], SampleFormat::FloatLe);
        assert_eq!(SampleFormat::PREFERENCE[3], SampleFormat::S24_3Le);
        assert_eq!(SampleFormat::PREFERENCE[8], SampleFormat::S16Be);
    }

    #[test]
    fn packed_24_bit_negative_full_scale() {
        let buf = [0x00, 0x00, 0x80];
        assert_eq!(SampleFormat::S24_3Le.decode(&buf), -1.0);
        let buf = [0x80, 0x00, 0x00];
        assert_eq!(SampleFormat::S24_3Be.decode(&buf), -1.0);
    }

    #[test]
    fn s24_in_32_ignores_padding_byte() {
        let buf = [0x00, 0x00, 0x40, 0xaa];
        assert_eq!(SampleFormat::S24Le.decode(&buf), 0.5);
    }

    #[test]
    fn encode_clamps_and_writes_big_endian() {
        let mut buf = [0_u8; 2];
        SampleFormat::S16Be.encode(4.0, &mut buf);
        assert_eq!(buf, [0x7f, 0xff]);
        let mut buf = [0xff_u8; 4];
        SampleFormat::S32Le.encode(0.0, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
    }
}
