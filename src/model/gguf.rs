//! Minimal GGUF container reader.
//!
//! Only reads enough to drive dequantization: the tensor table (name,
//! shape, ggml type, data offset) and the handful of metadata keys that
//! affect layout (`general.alignment`). Metadata values whose content we
//! don't need are parsed just far enough to skip over them correctly.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

const GGUF_MAGIC: u32 = 0x4655_4747; // "GGUF" little-endian
const DEFAULT_ALIGNMENT: u64 = 32;

#[derive(Error, Debug)]
pub enum GgufError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a GGUF file (bad magic)")]
    BadMagic,

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown ggml tensor type id {0}")]
    UnknownGgmlType(u32),

    #[error("malformed string (invalid utf-8)")]
    BadString,
}

/// The subset of ggml tensor element types this pipeline knows how to
/// dequantize. `MXFP4`'s numeric id tracks the value used by recent llama.cpp
/// releases; unrecognized ids surface as [`GgufError::UnknownGgmlType`]
/// rather than silently misreading tensor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q5_0,
    Q8_0,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Bf16,
    Mxfp4,
}

impl GgmlType {
    fn from_id(id: u32) -> Result<Self, GgufError> {
        Ok(match id {
            0 => GgmlType::F32,
            1 => GgmlType::F16,
            2 => GgmlType::Q4_0,
            6 => GgmlType::Q5_0,
            8 => GgmlType::Q8_0,
            10 => GgmlType::Q2K,
            11 => GgmlType::Q3K,
            12 => GgmlType::Q4K,
            13 => GgmlType::Q5K,
            14 => GgmlType::Q6K,
            30 => GgmlType::Bf16,
            39 => GgmlType::Mxfp4,
            other => return Err(GgufError::UnknownGgmlType(other)),
        })
    }

    /// Number of elements per quantization block (1 for non-block formats).
    pub fn block_size(self) -> usize {
        match self {
            GgmlType::F32 | GgmlType::F16 | GgmlType::Bf16 => 1,
            GgmlType::Q4_0 | GgmlType::Q5_0 | GgmlType::Q8_0 | GgmlType::Mxfp4 => 32,
            GgmlType::Q2K | GgmlType::Q3K | GgmlType::Q4K | GgmlType::Q5K | GgmlType::Q6K => 256,
        }
    }

    /// Size in bytes of one encoded block (or one element, for block_size 1).
    pub fn type_size(self) -> usize {
        match self {
            GgmlType::F32 => 4,
            GgmlType::F16 | GgmlType::Bf16 => 2,
            GgmlType::Q4_0 => 2 + 16,        // f16 scale + 32 nibbles
            GgmlType::Q5_0 => 2 + 4 + 16,    // f16 scale + high bits + 32 nibbles
            GgmlType::Q8_0 => 2 + 32,        // f16 scale + 32 int8
            GgmlType::Mxfp4 => 1 + 16,       // e8m0 scale + 32 nibbles
            GgmlType::Q2K => 256 / 4 + 256 / 16 + 2 + 2,
            GgmlType::Q3K => 256 / 8 + 256 / 4 + 12 + 2,
            GgmlType::Q4K => 256 / 2 + 12 + 2 + 2,
            GgmlType::Q5K => 256 / 2 + 256 / 8 + 12 + 2 + 2,
            GgmlType::Q6K => 256 / 2 + 256 / 4 + 256 / 16 + 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub ggml_type: GgmlType,
    /// Byte offset relative to the start of the tensor data section.
    pub relative_offset: u64,
}

impl TensorInfo {
    pub fn element_count(&self) -> u64 {
        self.dims.iter().product::<u64>().max(1)
    }

    /// Size in bytes of this tensor's encoded (quantized) representation.
    pub fn encoded_size(&self) -> u64 {
        let blocks = (self.element_count() as usize).div_ceil(self.ggml_type.block_size());
        (blocks * self.ggml_type.type_size()) as u64
    }
}

pub struct GgufFile {
    pub tensors: Vec<TensorInfo>,
    /// Absolute file offset where the tensor data section begins.
    pub data_section_offset: u64,
    path: std::path::PathBuf,
}

impl GgufFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GgufError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);

        let magic = read_u32(&mut reader)?;
        if magic != GGUF_MAGIC {
            return Err(GgufError::BadMagic);
        }
        let version = read_u32(&mut reader)?;
        if version != 2 && version != 3 {
            return Err(GgufError::UnsupportedVersion(version));
        }

        let tensor_count = read_u64(&mut reader)?;
        let metadata_kv_count = read_u64(&mut reader)?;

        let mut alignment = DEFAULT_ALIGNMENT;
        for _ in 0..metadata_kv_count {
            let key = read_gguf_string(&mut reader)?;
            let value_type = read_u32(&mut reader)?;
            if key == "general.alignment" {
                alignment = read_scalar_as_u64(&mut reader, value_type)?;
            } else {
                skip_value(&mut reader, value_type)?;
            }
        }

        let mut tensors = Vec::with_capacity(tensor_count as usize);
        for _ in 0..tensor_count {
            let name = read_gguf_string(&mut reader)?;
            let n_dims = read_u32(&mut reader)?;
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(read_u64(&mut reader)?);
            }
            let type_id = read_u32(&mut reader)?;
            let relative_offset = read_u64(&mut reader)?;
            tensors.push(TensorInfo {
                name,
                dims,
                ggml_type: GgmlType::from_id(type_id)?,
                relative_offset,
            });
        }

        let header_end = reader.stream_position()?;
        let data_section_offset = align_up(header_end, alignment);

        Ok(Self {
            tensors,
            data_section_offset,
            path,
        })
    }

    /// Read the raw encoded bytes of one tensor.
    pub fn read_tensor_bytes(&self, info: &TensorInfo) -> Result<Vec<u8>, GgufError> {
        let mut file = File::open(&self.path)?;
        let offset = self.data_section_offset + info.relative_offset;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; info.encoded_size() as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_gguf_string(r: &mut impl Read) -> Result<String, GgufError> {
    let len = read_u64(r)?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| GgufError::BadString)
}

/// GGUF metadata value type tags (gguf_type in llama.cpp's reference reader).
mod value_type {
    pub const UINT8: u32 = 0;
    pub const INT8: u32 = 1;
    pub const UINT16: u32 = 2;
    pub const INT16: u32 = 3;
    pub const UINT32: u32 = 4;
    pub const INT32: u32 = 5;
    pub const FLOAT32: u32 = 6;
    pub const BOOL: u32 = 7;
    pub const STRING: u32 = 8;
    pub const ARRAY: u32 = 9;
    pub const UINT64: u32 = 10;
    pub const INT64: u32 = 11;
    pub const FLOAT64: u32 = 12;
}

/// Reads a scalar integer-ish metadata value for keys we actually care
/// about (currently just `general.alignment`, always an unsigned type).
fn read_scalar_as_u64(r: &mut impl Read, value_type: u32) -> Result<u64, GgufError> {
    use value_type as vt;
    Ok(match value_type {
        vt::UINT8 | vt::BOOL | vt::INT8 => {
            let mut b = [0u8; 1];
            r.read_exact(&mut b)?;
            b[0] as u64
        }
        vt::UINT16 | vt::INT16 => {
            let mut b = [0u8; 2];
            r.read_exact(&mut b)?;
            u16::from_le_bytes(b) as u64
        }
        vt::UINT32 | vt::INT32 => read_u32(r)? as u64,
        vt::UINT64 => read_u64(r)?,
        vt::INT64 => read_i64(r)? as u64,
        _ => {
            skip_value(r, value_type)?;
            DEFAULT_ALIGNMENT
        }
    })
}

fn skip_value(r: &mut (impl Read + Seek), value_type: u32) -> Result<(), GgufError> {
    use value_type as vt;
    match value_type {
        vt::UINT8 | vt::INT8 | vt::BOOL => {
            r.seek(SeekFrom::Current(1))?;
        }
        vt::UINT16 | vt::INT16 => {
            r.seek(SeekFrom::Current(2))?;
        }
        vt::UINT32 | vt::INT32 | vt::FLOAT32 => {
            r.seek(SeekFrom::Current(4))?;
        }
        vt::UINT64 | vt::INT64 | vt::FLOAT64 => {
            r.seek(SeekFrom::Current(8))?;
        }
        vt::STRING => {
            read_gguf_string(r)?;
        }
        vt::ARRAY => {
            let elem_type = read_u32(r)?;
            let count = read_u64(r)?;
            for _ in 0..count {
                skip_value(r, elem_type)?;
            }
        }
        other => return Err(GgufError::UnknownGgmlType(other)),
    }
    Ok(())
}

/// Metadata extracted alongside the tensor table, for callers that want
/// architecture-identifying keys (`general.architecture`, `<arch>.context_length`,
/// ...) without a full generic KV map. String and scalar-numeric value types
/// are both returned as their string form; array/unknown-typed values among
/// `wanted_keys` are skipped rather than surfaced.
pub fn read_string_metadata(
    path: impl AsRef<Path>,
    wanted_keys: &[&str],
) -> Result<HashMap<String, String>, GgufError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let magic = read_u32(&mut reader)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic);
    }
    let _version = read_u32(&mut reader)?;
    let _tensor_count = read_u64(&mut reader)?;
    let metadata_kv_count = read_u64(&mut reader)?;

    let mut found = HashMap::new();
    for _ in 0..metadata_kv_count {
        let key = read_gguf_string(&mut reader)?;
        let value_type = read_u32(&mut reader)?;
        if wanted_keys.contains(&key.as_str()) {
            if let Some(value) = read_scalar_as_string(&mut reader, value_type)? {
                found.insert(key, value);
            }
        } else {
            skip_value(&mut reader, value_type)?;
        }
    }
    Ok(found)
}

/// Reads a string or scalar-numeric metadata value as its string form.
/// `None` for array-typed or unrecognized values, which are skipped in place.
fn read_scalar_as_string(
    r: &mut (impl Read + Seek),
    value_type: u32,
) -> Result<Option<String>, GgufError> {
    use value_type as vt;
    Ok(match value_type {
        vt::STRING => Some(read_gguf_string(r)?),
        vt::UINT8 | vt::BOOL | vt::INT8 => {
            let mut b = [0u8; 1];
            r.read_exact(&mut b)?;
            Some(b[0].to_string())
        }
        vt::UINT16 | vt::INT16 => {
            let mut b = [0u8; 2];
            r.read_exact(&mut b)?;
            Some(u16::from_le_bytes(b).to_string())
        }
        vt::UINT32 | vt::INT32 => Some(read_u32(r)?.to_string()),
        vt::UINT64 => Some(read_u64(r)?.to_string()),
        vt::INT64 => Some(read_i64(r)?.to_string()),
        vt::FLOAT32 => {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            Some(f32::from_le_bytes(b).to_string())
        }
        _ => {
            skip_value(r, value_type)?;
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_and_type_size_are_consistent_with_element_counts() {
        assert_eq!(GgmlType::Q4_0.block_size(), 32);
        assert_eq!(GgmlType::Q8_0.block_size(), 32);
        assert_eq!(GgmlType::Q6K.block_size(), 256);
        assert_eq!(GgmlType::F32.block_size(), 1);
    }

    #[test]
    fn test_tensor_encoded_size_rounds_up_to_whole_blocks() {
        let info = TensorInfo {
            name: "blk.0.attn_q.weight".to_string(),
            dims: vec![33], // not a multiple of the Q4_0 block size
            ggml_type: GgmlType::Q4_0,
            relative_offset: 0,
        };
        let blocks = (33usize).div_ceil(32);
        assert_eq!(info.encoded_size(), (blocks * GgmlType::Q4_0.type_size()) as u64);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(10, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
    }

    fn write_gguf_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn test_read_string_metadata_extracts_string_and_numeric_scalars() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes()); // version
        buf.extend_from_slice(&0u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&2u64.to_le_bytes()); // metadata_kv_count

        write_gguf_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&value_type::STRING.to_le_bytes());
        write_gguf_string(&mut buf, "llama");

        write_gguf_string(&mut buf, "llama.context_length");
        buf.extend_from_slice(&value_type::UINT32.to_le_bytes());
        buf.extend_from_slice(&4096u32.to_le_bytes());

        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), &buf).unwrap();

        let found =
            read_string_metadata(tmp.path(), &["general.architecture", "llama.context_length"])
                .unwrap();
        assert_eq!(found.get("general.architecture").unwrap(), "llama");
        assert_eq!(found.get("llama.context_length").unwrap(), "4096");
    }

    #[test]
    fn test_read_string_metadata_ignores_unwanted_keys() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());

        write_gguf_string(&mut buf, "general.name");
        buf.extend_from_slice(&value_type::STRING.to_le_bytes());
        write_gguf_string(&mut buf, "some-model");

        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), &buf).unwrap();

        let found = read_string_metadata(tmp.path(), &["general.architecture"]).unwrap();
        assert!(found.is_empty());
    }
}
