//! Per-format dequantization rules.
//!
//! Block layouts follow the GGML quantization scheme: `Q4_0`/`Q5_0`/`Q8_0`/
//! `MXFP4` pack 32 elements under one scale; the K-quants (`Q2_K`..`Q6_K`)
//! pack 256 elements under a hierarchy of sub-block scales and mins.

use half::f16;

use crate::model::gguf::GgmlType;

/// Dequantize `raw` (the tensor's encoded bytes) into `element_count` F32
/// values. Returns `None` for formats this pipeline doesn't know how to
/// widen (surfaced by the caller as `UnsupportedFormat`).
pub fn dequantize(ty: GgmlType, raw: &[u8], element_count: usize) -> Option<Vec<f32>> {
    match ty {
        GgmlType::F32 => Some(dequantize_f32(raw, element_count)),
        GgmlType::F16 => Some(dequantize_f16(raw, element_count)),
        GgmlType::Bf16 => Some(dequantize_bf16(raw, element_count)),
        GgmlType::Q4_0 => Some(dequantize_q4_0(raw, element_count)),
        GgmlType::Q5_0 => Some(dequantize_q5_0(raw, element_count)),
        GgmlType::Q8_0 => Some(dequantize_q8_0(raw, element_count)),
        GgmlType::Mxfp4 => Some(dequantize_mxfp4(raw, element_count)),
        GgmlType::Q2K => Some(dequantize_q2_k(raw, element_count)),
        GgmlType::Q3K => Some(dequantize_q3_k(raw, element_count)),
        GgmlType::Q4K => Some(dequantize_q4_k(raw, element_count)),
        GgmlType::Q5K => Some(dequantize_q5_k(raw, element_count)),
        GgmlType::Q6K => Some(dequantize_q6_k(raw, element_count)),
    }
}

fn dequantize_f32(raw: &[u8], element_count: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; element_count];
    let src: &[f32] = bytemuck::cast_slice(&raw[..element_count * 4]);
    out.copy_from_slice(src);
    out
}

fn dequantize_f16(raw: &[u8], element_count: usize) -> Vec<f32> {
    (0..element_count)
        .map(|i| {
            let bits = u16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
            f16::from_bits(bits).to_f32()
        })
        .collect()
}

fn dequantize_bf16(raw: &[u8], element_count: usize) -> Vec<f32> {
    (0..element_count)
        .map(|i| {
            let lo = raw[i * 2] as u32;
            let hi = raw[i * 2 + 1] as u32;
            // bf16 is the top 16 bits of an f32; widen by shifting into place.
            f32::from_bits((hi << 24) | (lo << 16))
        })
        .collect()
}

const Q4_0_BLOCK: usize = 32;

fn dequantize_q4_0(raw: &[u8], element_count: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(element_count);
    for block in raw.chunks(2 + 16) {
        let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
        let packed = &block[2..18];
        for &byte in packed {
            let lo = (byte & 0x0F) as i32 - 8;
            let hi = ((byte >> 4) & 0x0F) as i32 - 8;
            out.push(lo as f32 * scale);
            out.push(hi as f32 * scale);
        }
    }
    out.truncate(element_count);
    out
}

fn dequantize_q5_0(raw: &[u8], element_count: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(element_count);
    for block in raw.chunks(2 + 4 + 16) {
        let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
        let high_bits = u32::from_le_bytes([block[2], block[3], block[4], block[5]]);
        let packed = &block[6..22];
        for (i, &byte) in packed.iter().enumerate() {
            let lo_idx = i * 2;
            let hi_idx = i * 2 + 1;
            let lo_high = ((high_bits >> lo_idx) & 1) as i32;
            let hi_high = ((high_bits >> hi_idx) & 1) as i32;
            let lo = ((byte & 0x0F) as i32 | (lo_high << 4)) - 16;
            let hi = (((byte >> 4) & 0x0F) as i32 | (hi_high << 4)) - 16;
            out.push(lo as f32 * scale);
            out.push(hi as f32 * scale);
        }
    }
    out.truncate(element_count);
    out
}

fn dequantize_q8_0(raw: &[u8], element_count: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(element_count);
    for block in raw.chunks(2 + Q4_0_BLOCK) {
        let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
        for &byte in &block[2..2 + Q4_0_BLOCK] {
            out.push(byte as i8 as f32 * scale);
        }
    }
    out.truncate(element_count);
    out
}

/// e2m1 4-bit float lookup table, indexed by the 4-bit code (sign + 2-bit
/// exponent + 1-bit mantissa), per the OCP Microscaling MXFP4 spec.
const MXFP4_LUT: [f32; 16] = [
    0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0, -0.0, -0.5, -1.0, -1.5, -2.0, -3.0, -4.0, -6.0,
];

fn dequantize_mxfp4(raw: &[u8], element_count: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(element_count);
    for block in raw.chunks(1 + 16) {
        // e8m0: unsigned power-of-two exponent, bias 127.
        let scale = 2f32.powi(block[0] as i32 - 127);
        let packed = &block[1..17];
        for &byte in packed {
            let lo = MXFP4_LUT[(byte & 0x0F) as usize];
            let hi = MXFP4_LUT[((byte >> 4) & 0x0F) as usize];
            out.push(lo * scale);
            out.push(hi * scale);
        }
    }
    out.truncate(element_count);
    out
}

/// Unpack `count` values of `bits` width from a little-endian bitstream
/// starting at bit offset `start_bit`, used by the K-quant sub-block scale
/// tables (6-bit and 4-bit packed scales/mins).
fn unpack_bits(data: &[u8], start_bit: usize, bits: usize, count: usize) -> Vec<u32> {
    let mut out = Vec::with_capacity(count);
    let mut bit = start_bit;
    for _ in 0..count {
        let mut value = 0u32;
        for b in 0..bits {
            let byte_idx = (bit + b) / 8;
            let bit_idx = (bit + b) % 8;
            assert!(
                byte_idx < data.len(),
                "unpack_bits: bit {} out of range for {}-byte region",
                bit + b,
                data.len()
            );
            if (data[byte_idx] >> bit_idx) & 1 != 0 {
                value |= 1 << b;
            }
        }
        out.push(value);
        bit += bits;
    }
    out
}

const K_SUPERBLOCK: usize = 256;
const K_SUBBLOCK: usize = 32;
const K_SUBBLOCKS: usize = K_SUPERBLOCK / K_SUBBLOCK;

/// Shared shape for the K-quants: a 256-element superblock split into 8
/// subblocks of 32, each with its own scale and min derived from a packed
/// scale table, quantized against a superblock-level d/dmin pair.
fn dequantize_k_quant(
    raw: &[u8],
    element_count: usize,
    block_bytes: usize,
    scale_bits: usize,
    scale_table_bytes: usize,
    code_bits: usize,
) -> Vec<f32> {
    let mut out = Vec::with_capacity(element_count);
    for block in raw.chunks(block_bytes) {
        let d = f16::from_le_bytes([block[block_bytes - 4], block[block_bytes - 3]]).to_f32();
        let dmin = f16::from_le_bytes([block[block_bytes - 2], block[block_bytes - 1]]).to_f32();

        let scale_table = &block[..scale_table_bytes];
        let scales = unpack_bits(scale_table, 0, scale_bits, K_SUBBLOCKS);
        let mins = unpack_bits(scale_table, scale_bits * K_SUBBLOCKS, scale_bits, K_SUBBLOCKS);

        let codes_start = scale_table_bytes;
        let codes = &block[codes_start..block_bytes - 4];

        for sub in 0..K_SUBBLOCKS {
            let sub_scale = d * scales[sub] as f32;
            let sub_min = dmin * mins[sub] as f32;
            let values = unpack_bits(codes, sub * K_SUBBLOCK * code_bits, code_bits, K_SUBBLOCK);
            for v in values {
                out.push(v as f32 * sub_scale - sub_min);
            }
        }
    }
    out.truncate(element_count);
    out
}

fn dequantize_q2_k(raw: &[u8], element_count: usize) -> Vec<f32> {
    dequantize_k_quant(raw, element_count, 256 / 4 + 256 / 16 + 2 + 2, 4, 256 / 16, 2)
}

fn dequantize_q3_k(raw: &[u8], element_count: usize) -> Vec<f32> {
    // codes: 256 * 3 bits = 96 bytes, scale table: 12 bytes, d + dmin: 4 bytes.
    dequantize_k_quant(raw, element_count, 256 / 8 + 256 / 4 + 12 + 2 + 2, 6, 12, 3)
}

fn dequantize_q4_k(raw: &[u8], element_count: usize) -> Vec<f32> {
    dequantize_k_quant(raw, element_count, 256 / 2 + 12 + 2 + 2, 6, 12, 4)
}

fn dequantize_q5_k(raw: &[u8], element_count: usize) -> Vec<f32> {
    dequantize_k_quant(raw, element_count, 256 / 2 + 256 / 8 + 12 + 2 + 2, 6, 12, 5)
}

fn dequantize_q6_k(raw: &[u8], element_count: usize) -> Vec<f32> {
    // codes: 256 * 6 bits = 192 bytes, scale table: 16 bytes, d + dmin: 4 bytes.
    dequantize_k_quant(
        raw,
        element_count,
        256 / 2 + 256 / 4 + 256 / 16 + 2 + 2,
        4,
        256 / 16,
        6,
    )
}
