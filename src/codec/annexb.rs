//! Incremental Annex-B NAL unit splitter.
//!
//! Both the demuxer output and the encoder output arrive as an H.264 byte
//! stream over a pipe; this splits the stream at start codes so each unit can
//! be queued, classified, and timestamped individually. Units keep their
//! start-code prefix so concatenation reproduces the original stream.

use crate::frame::EncodedAccessUnit;

/// H.264 NAL unit types we care about.
pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Splits a byte stream into Annex-B NAL units as data arrives.
#[derive(Debug, Default)]
pub struct AnnexBSplitter {
    buf: Vec<u8>,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete unit it closed off. A unit is
    /// complete once the next start code is seen, so the final unit of the
    /// stream is only returned by [`AnnexBSplitter::finish`].
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);

        // Unit boundaries: position of each start code, where a four-byte
        // code owns its leading zero.
        let mut boundaries = Vec::new();
        let mut i = 0usize;
        while let Some(pos) = find_start_code(&self.buf[i..]) {
            let mut b = i + pos;
            if b > 0 && self.buf[b - 1] == 0 {
                b -= 1;
            }
            boundaries.push(b);
            i += pos + 3;
        }

        let Some(&first) = boundaries.first() else {
            // No start code yet. Anything further back than two bytes can
            // never complete one, so cap the buffer.
            if self.buf.len() > 2 {
                self.buf.drain(..self.buf.len() - 2);
            }
            return Vec::new();
        };

        let mut units = Vec::new();
        for w in boundaries.windows(2) {
            units.push(self.buf[w[0]..w[1]].to_vec());
        }
        let last = *boundaries.last().unwrap_or(&first);
        self.buf.drain(..last);
        units
    }

    /// Flush the trailing unit after the stream ends.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let buf = std::mem::take(&mut self.buf);
        let start = find_start_code(&buf)?;
        // A start code with no header byte after it is not a unit.
        if buf.len() > start + 3 {
            Some(buf)
        } else {
            None
        }
    }
}

/// Offset of the first `00 00 01` sequence, if any.
fn find_start_code(buf: &[u8]) -> Option<usize> {
    buf.windows(3).position(|w| w == [0, 0, 1])
}

/// NAL unit type of an Annex-B unit (low 5 bits of the header byte).
pub fn nal_unit_type(unit: &[u8]) -> Option<u8> {
    let start = find_start_code(unit)?;
    unit.get(start + 3).map(|b| b & 0x1f)
}

/// Classify one encoder-output unit for the muxer.
pub fn classify_unit(data: Vec<u8>) -> EncodedAccessUnit {
    let nal = nal_unit_type(&data).unwrap_or(0);
    EncodedAccessUnit {
        data,
        is_config: nal == NAL_SPS || nal == NAL_PPS,
        is_keyframe: nal == NAL_IDR,
        is_frame: nal == NAL_SLICE || nal == NAL_IDR,
        eos: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(nal_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1, nal_type & 0x1f];
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn splits_units_across_chunk_boundaries() {
        let a = unit(NAL_SPS, &[1, 2, 3]);
        let b = unit(NAL_IDR, &[4, 5, 6, 7]);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut splitter = AnnexBSplitter::new();
        let mut out = Vec::new();
        // Feed two bytes at a time to exercise partial start codes.
        for chunk in stream.chunks(2) {
            out.extend(splitter.push(chunk));
        }
        out.extend(splitter.finish());

        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn three_byte_start_codes_are_preserved() {
        let stream = [0, 0, 1, 0x65, 9, 9, 0, 0, 1, 0x41, 8];
        let mut splitter = AnnexBSplitter::new();
        let mut out = splitter.push(&stream);
        out.extend(splitter.finish());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], vec![0, 0, 1, 0x65, 9, 9]);
        assert_eq!(out[1], vec![0, 0, 1, 0x41, 8]);
    }

    #[test]
    fn four_byte_codes_keep_their_leading_zero() {
        let a = unit(NAL_SPS, &[1]);
        let b = unit(NAL_PPS, &[2]);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut splitter = AnnexBSplitter::new();
        let mut out = splitter.push(&stream);
        out.extend(splitter.finish());
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn classification_flags() {
        let sps = classify_unit(unit(NAL_SPS, &[0]));
        assert!(sps.is_config && !sps.is_frame);

        let idr = classify_unit(unit(NAL_IDR, &[0]));
        assert!(idr.is_keyframe && idr.is_frame && !idr.is_config);

        let slice = classify_unit(unit(NAL_SLICE, &[0]));
        assert!(slice.is_frame && !slice.is_keyframe);
    }

    #[test]
    fn finish_drops_incomplete_fragments() {
        let mut splitter = AnnexBSplitter::new();
        assert!(splitter.push(&[0, 0]).is_empty());
        assert!(splitter.finish().is_none());
    }
}
