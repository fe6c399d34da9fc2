//! NAL unit header parsing and EBSP/RBSP conversion.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NalError {
    #[error("NAL unit is empty")]
    Empty,
    #[error("forbidden_zero_bit is set")]
    ForbiddenBitSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalUnitType {
    Unspecified,
    NonIdrSlice,
    SliceDataPartitionA,
    SliceDataPartitionB,
    SliceDataPartitionC,
    IdrSlice,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    FillerData,
    SpsExtension,
    Prefix,
    SubsetSps,
    DepthParameterSet,
    Reserved(u8),
    UnspecifiedExt(u8),
}

impl From<u8> for NalUnitType {
    fn from(v: u8) -> Self {
        match v {
            0 => NalUnitType::Unspecified,
            1 => NalUnitType::NonIdrSlice,
            2 => NalUnitType::SliceDataPartitionA,
            3 => NalUnitType::SliceDataPartitionB,
            4 => NalUnitType::SliceDataPartitionC,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::AccessUnitDelimiter,
            10 => NalUnitType::EndOfSequence,
            11 => NalUnitType::EndOfStream,
            12 => NalUnitType::FillerData,
            13 => NalUnitType::SpsExtension,
            14 => NalUnitType::Prefix,
            15 => NalUnitType::SubsetSps,
            16 => NalUnitType::DepthParameterSet,
            17..=23 => NalUnitType::Reserved(v),
            _ => NalUnitType::UnspecifiedExt(v),
        }
    }
}

impl NalUnitType {
    pub fn as_u8(self) -> u8 {
        match self {
            NalUnitType::Unspecified => 0,
            NalUnitType::NonIdrSlice => 1,
            NalUnitType::SliceDataPartitionA => 2,
            NalUnitType::SliceDataPartitionB => 3,
            NalUnitType::SliceDataPartitionC => 4,
            NalUnitType::IdrSlice => 5,
            NalUnitType::Sei => 6,
            NalUnitType::Sps => 7,
            NalUnitType::Pps => 8,
            NalUnitType::AccessUnitDelimiter => 9,
            NalUnitType::EndOfSequence => 10,
            NalUnitType::EndOfStream => 11,
            NalUnitType::FillerData => 12,
            NalUnitType::SpsExtension => 13,
            NalUnitType::Prefix => 14,
            NalUnitType::SubsetSps => 15,
            NalUnitType::DepthParameterSet => 16,
            NalUnitType::Reserved(v) | NalUnitType::UnspecifiedExt(v) => v,
        }
    }

    pub fn is_slice(self) -> bool {
        matches!(self, NalUnitType::NonIdrSlice | NalUnitType::IdrSlice)
    }

    pub fn is_vcl(self) -> bool {
        self.is_slice()
            || matches!(
                self,
                NalUnitType::SliceDataPartitionA
                    | NalUnitType::SliceDataPartitionB
                    | NalUnitType::SliceDataPartitionC
            )
    }
}

/// A parsed NAL unit header plus its owned EBSP payload (the header byte is
/// excluded from `ebsp`, payload still contains emulation-prevention bytes).
#[derive(Debug, Clone)]
pub struct Nal {
    pub ref_idc: u8,
    pub nal_type: NalUnitType,
    pub ebsp: Vec<u8>,
}

impl Nal {
    /// Parse a NAL's payload (without its start code). `data[0]` is the NAL
    /// header byte.
    pub fn parse(data: &[u8]) -> Result<Self, NalError> {
        let header = *data.first().ok_or(NalError::Empty)?;
        if header & 0x80 != 0 {
            return Err(NalError::ForbiddenBitSet);
        }
        let ref_idc = (header >> 5) & 0x03;
        let nal_type = NalUnitType::from(header & 0x1f);
        Ok(Nal {
            ref_idc,
            nal_type,
            ebsp: data[1..].to_vec(),
        })
    }

    /// Strip emulation-prevention bytes to produce the RBSP.
    pub fn to_rbsp(&self) -> Vec<u8> {
        ebsp_to_rbsp(&self.ebsp)
    }
}

/// Strip `00 00 03` emulation-prevention sequences from an EBSP payload.
pub fn ebsp_to_rbsp(ebsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ebsp.len());
    let mut zero_run = 0;
    for &byte in ebsp {
        if zero_run >= 2 && byte == 0x03 {
            zero_run = 0;
            continue;
        }
        out.push(byte);
        if byte == 0 {
            zero_run += 1;
        } else {
            zero_run = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_forbidden_bit() {
        let data = [0x80];
        assert_eq!(Nal::parse(&data), Err(NalError::ForbiddenBitSet));
    }

    #[test]
    fn parse_sps_header() {
        // 0x67 = 0110_0111: forbidden=0, ref_idc=3, type=7 (SPS)
        let data = [0x67, 0x42, 0x00, 0x1e];
        let nal = Nal::parse(&data).unwrap();
        assert_eq!(nal.ref_idc, 3);
        assert_eq!(nal.nal_type.as_u8(), 7);
        assert_eq!(nal.ebsp, vec![0x42, 0x00, 0x1e]);
    }

    #[test]
    fn ebsp_to_rbsp_strips_emulation_bytes() {
        let ebsp = [0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x01];
        assert_eq!(ebsp_to_rbsp(&ebsp), vec![0x00, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn ebsp_to_rbsp_no_emulation_bytes_unchanged() {
        let ebsp = [0x11, 0x22, 0x33];
        assert_eq!(ebsp_to_rbsp(&ebsp), vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn nal_type_conversion_roundtrip() {
        for v in 0u8..=31 {
            let t = NalUnitType::from(v);
            assert_eq!(t.as_u8(), v);
        }
    }
}
