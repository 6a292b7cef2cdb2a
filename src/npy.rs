//! NumPy `.npy` reader for the token embedding matrix.
//!
//! Supports v1 and v2 headers, little-endian `<f2` / `<f4` payloads, 2-D
//! arrays only. Three entry points: materialize as f32, materialize as
//! fp16 bits, or map an fp16 file in place so the OS pages rows in on
//! demand.

use crate::error::{Error, Result};
use crate::fp16::{f16_to_f32, f32_to_f16};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDtype {
    F16,
    F32,
}

#[derive(Debug, Clone, Copy)]
pub struct NpyHeader {
    pub dtype: NpyDtype,
    pub rows: usize,
    pub cols: usize,
    /// Byte offset of the raw array data from the start of the file.
    pub data_offset: usize,
}

impl NpyHeader {
    fn item_size(&self) -> usize {
        match self.dtype {
            NpyDtype::F16 => 2,
            NpyDtype::F32 => 4,
        }
    }

    fn data_len(&self) -> usize {
        self.rows * self.cols * self.item_size()
    }
}

/// Parse an NPY header from the first bytes of a file.
pub fn parse_header(bytes: &[u8]) -> Result<NpyHeader> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(Error::Config("not an NPY file (bad magic)".into()));
    }

    let major = bytes[6];
    let (header_len, data_offset) = match major {
        1 => {
            let len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
            (len, 10 + len)
        }
        _ => {
            // v2+: 4-byte header length at offset 8.
            if bytes.len() < 12 {
                return Err(Error::Config("truncated NPY v2 header".into()));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
            (len, 12 + len)
        }
    };

    if bytes.len() < data_offset {
        return Err(Error::Config("truncated NPY header".into()));
    }
    let header = std::str::from_utf8(&bytes[data_offset - header_len..data_offset])
        .map_err(|_| Error::Config("NPY header is not valid UTF-8".into()))?;

    let dtype = if header.contains("'<f2'") || header.contains("\"<f2\"") {
        NpyDtype::F16
    } else if header.contains("'<f4'") || header.contains("\"<f4\"") {
        NpyDtype::F32
    } else {
        return Err(Error::Config(format!(
            "unsupported NPY dtype in header: {}",
            header.trim()
        )));
    };

    let (rows, cols) = parse_shape(header)?;

    Ok(NpyHeader {
        dtype,
        rows,
        cols,
        data_offset,
    })
}

/// Extract the `(rows, cols)` pair following the literal `shape` key.
/// Anything other than a 2-D shape is rejected.
fn parse_shape(header: &str) -> Result<(usize, usize)> {
    fn read_dim(s: &str) -> Option<(usize, &str)> {
        let s = s.trim_start();
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if end == 0 {
            return None;
        }
        let n = s[..end].parse().ok()?;
        Some((n, &s[end..]))
    }

    let rest = header
        .find("shape")
        .and_then(|i| header[i..].find('(').map(|j| &header[i + j + 1..]))
        .ok_or_else(|| Error::Config("NPY header has no shape".into()))?;

    let (rows, rest) =
        read_dim(rest).ok_or_else(|| Error::Config("bad NPY shape".into()))?;
    let rest = rest
        .trim_start()
        .strip_prefix(',')
        .ok_or_else(|| Error::Config("NPY array is not 2-D".into()))?;
    let (cols, rest) =
        read_dim(rest).ok_or_else(|| Error::Config("NPY array is not 2-D".into()))?;
    if !rest.trim_start().starts_with(')') {
        return Err(Error::Config("NPY array is not 2-D".into()));
    }
    if rows == 0 || cols == 0 {
        return Err(Error::Config("NPY array has a zero dimension".into()));
    }

    Ok((rows, cols))
}

fn check_payload(header: &NpyHeader, file_len: usize, path: &Path) -> Result<()> {
    if file_len < header.data_offset + header.data_len() {
        return Err(Error::Config(format!(
            "{}: NPY payload shorter than declared shape {}x{}",
            path.display(),
            header.rows,
            header.cols
        )));
    }
    Ok(())
}

/// Load a 2-D `<f2` or `<f4` array, materialized as f32.
pub fn load_f32(path: &Path) -> Result<(Vec<f32>, usize, usize)> {
    let bytes = std::fs::read(path)?;
    let header = parse_header(&bytes)?;
    check_payload(&header, bytes.len(), path)?;

    let data = &bytes[header.data_offset..header.data_offset + header.data_len()];
    let out: Vec<f32> = match header.dtype {
        NpyDtype::F16 => data
            .chunks_exact(2)
            .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        NpyDtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    };
    Ok((out, header.rows, header.cols))
}

/// Load a 2-D array, materialized as fp16 bit patterns. An `<f4` file is
/// down-converted with round-to-nearest-even.
pub fn load_f16(path: &Path) -> Result<(Vec<u16>, usize, usize)> {
    let bytes = std::fs::read(path)?;
    let header = parse_header(&bytes)?;
    check_payload(&header, bytes.len(), path)?;

    let data = &bytes[header.data_offset..header.data_offset + header.data_len()];
    let out: Vec<u16> = match header.dtype {
        NpyDtype::F16 => data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect(),
        NpyDtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32_to_f16(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
    };
    Ok((out, header.rows, header.cols))
}

/// A 2-D fp16 array mapped read-only in place. The map is retained for the
/// lifetime of the value; row accesses touch only the pages they read.
pub struct MappedNpyF16 {
    mmap: Mmap,
    header: NpyHeader,
}

impl MappedNpyF16 {
    /// Map `path` read-only. Refuses anything but an `<f2` payload: the
    /// in-place path never copies, so there is nowhere to convert.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Config(format!("cannot open {} for mmap: {e}", path.display()))
        })?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let header = parse_header(&mmap)?;
        if header.dtype != NpyDtype::F16 {
            return Err(Error::Config(format!(
                "{}: in-place mapping requires fp16 data, got fp32",
                path.display()
            )));
        }
        check_payload(&header, mmap.len(), path)?;

        log::debug!(
            "mapped {} ({} bytes, data at offset {}, {}x{} fp16)",
            path.display(),
            mmap.len(),
            header.data_offset,
            header.rows,
            header.cols
        );

        Ok(Self { mmap, header })
    }

    pub fn rows(&self) -> usize {
        self.header.rows
    }

    pub fn cols(&self) -> usize {
        self.header.cols
    }

    /// Raw little-endian bytes of one row.
    pub fn row_bytes(&self, row: usize) -> &[u8] {
        let stride = self.header.cols * 2;
        let start = self.header.data_offset + row * stride;
        &self.mmap[start..start + stride]
    }

    /// fp16 bit patterns of one row.
    pub fn row_bits(&self, row: usize) -> impl Iterator<Item = u16> + '_ {
        self.row_bytes(row)
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    /// Build an NPY file byte-for-byte: v1 or v2 header, given dtype
    /// descriptor and payload.
    pub(crate) fn write_npy(
        name: &str,
        major: u8,
        descr: &str,
        rows: usize,
        cols: usize,
        payload: &[u8],
    ) -> PathBuf {
        let dict = format!(
            "{{'descr': '{descr}', 'fortran_order': False, 'shape': ({rows}, {cols}), }}"
        );
        let preamble = if major == 1 { 10 } else { 12 };
        // Pad the header with spaces to a 64-byte boundary, newline last.
        let unpadded = preamble + dict.len() + 1;
        let padding = (64 - unpadded % 64) % 64;
        let header_len = dict.len() + padding + 1;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x93NUMPY");
        bytes.push(major);
        bytes.push(0);
        if major == 1 {
            bytes.extend_from_slice(&(header_len as u16).to_le_bytes());
        } else {
            bytes.extend_from_slice(&(header_len as u32).to_le_bytes());
        }
        bytes.extend_from_slice(dict.as_bytes());
        bytes.extend(std::iter::repeat_n(b' ', padding));
        bytes.push(b'\n');
        bytes.extend_from_slice(payload);

        let path = std::env::temp_dir().join(format!("qwen_asr_test_{}_{name}", std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(&bytes).unwrap();
        path
    }

    fn f16_payload(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f32_payload(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn parses_v1_and_v2_f16() {
        let vals: Vec<u16> = (0..6).map(|i| 0x3C00 + i).collect();
        for major in [1u8, 2] {
            let path = write_npy(
                &format!("v{major}_f16.npy"),
                major,
                "<f2",
                2,
                3,
                &f16_payload(&vals),
            );
            let (data, rows, cols) = load_f16(&path).unwrap();
            assert_eq!((rows, cols), (2, 3));
            assert_eq!(data.first(), Some(&0x3C00));
            assert_eq!(data.last(), Some(&0x3C05));
            std::fs::remove_file(&path).ok();
        }
    }

    #[test]
    fn parses_v1_and_v2_f32() {
        let vals = [1.0f32, -2.5, 0.25, 1024.0];
        for major in [1u8, 2] {
            let path = write_npy(
                &format!("v{major}_f32.npy"),
                major,
                "<f4",
                2,
                2,
                &f32_payload(&vals),
            );
            let (data, rows, cols) = load_f32(&path).unwrap();
            assert_eq!((rows, cols), (2, 2));
            assert_eq!(data[0], 1.0);
            assert_eq!(data[3], 1024.0);
            std::fs::remove_file(&path).ok();
        }
    }

    #[test]
    fn f16_file_loads_as_f32() {
        let path = write_npy("f16_as_f32.npy", 1, "<f2", 1, 2, &f16_payload(&[0x3800, 0xC000]));
        let (data, _, _) = load_f32(&path).unwrap();
        assert_eq!(data, vec![0.5, -2.0]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn f32_file_down_converts_to_f16() {
        let path = write_npy("f32_as_f16.npy", 1, "<f4", 1, 2, &f32_payload(&[1.0, -0.5]));
        let (data, _, _) = load_f16(&path).unwrap();
        assert_eq!(data, vec![0x3C00, 0xB800]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn mmap_refuses_f32() {
        let path = write_npy("mmap_f32.npy", 1, "<f4", 1, 1, &f32_payload(&[1.0]));
        assert!(matches!(
            MappedNpyF16::open(&path),
            Err(Error::Config(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn mmap_row_access() {
        let vals: Vec<u16> = (0..8).collect();
        let path = write_npy("mmap_rows.npy", 2, "<f2", 4, 2, &f16_payload(&vals));
        let mapped = MappedNpyF16::open(&path).unwrap();
        assert_eq!(mapped.rows(), 4);
        assert_eq!(mapped.cols(), 2);
        let row2: Vec<u16> = mapped.row_bits(2).collect();
        assert_eq!(row2, vec![4, 5]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_non_2d() {
        let dict = "{'descr': '<f2', 'fortran_order': False, 'shape': (4,), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x93NUMPY\x01\x00");
        bytes.extend_from_slice(&(dict.len() as u16 + 1).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(parse_header(&bytes), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(parse_header(b"\x93NUMPZ\x01\x00\x00\x00").is_err());
    }

    #[test]
    fn rejects_short_payload() {
        let path = write_npy("short.npy", 1, "<f2", 64, 64, &[0u8; 16]);
        assert!(load_f16(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
