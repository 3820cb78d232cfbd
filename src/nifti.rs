//! Minimal NIfTI-1 codec for integer label volumes.
//!
//! The pipeline only ever rewrites voxel *values* of label volumes; geometry
//! (affine, qform/sform, pixdim) must survive every pass untouched. Instead of
//! re-deriving header fields, the raw header bytes up to `vox_offset` are kept
//! verbatim and written back on save, with only `datatype`, `bitpix` and the
//! scaling slope/intercept patched. Gzip output uses a zeroed mtime so that
//! re-running a pass over identical inputs produces byte-identical files.

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

/// Errors that can occur while reading or writing label volumes.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed NIfTI file '{path}': {reason}")]
    Malformed { path: String, reason: String },

    #[error("Unsupported NIfTI datatype code {0}")]
    UnsupportedDatatype(i16),

    #[error("Shape mismatch: reference {reference:?} vs volume {volume:?}")]
    ShapeMismatch {
        reference: Vec<usize>,
        volume: Vec<usize>,
    },
}

const HEADER_SIZE: usize = 348;
const DEFAULT_VOX_OFFSET: usize = 352;

const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;
const DT_UINT32: i16 = 768;

/// A label volume: preserved raw header plus an integer voxel array.
pub struct NiftiVolume {
    raw_header: Vec<u8>,
    data: ArrayD<i32>,
}

impl NiftiVolume {
    /// Builds a volume with a synthetic header (identity geometry).
    ///
    /// Used when no source header exists, e.g. in tests.
    pub fn from_data(data: ArrayD<i32>) -> Self {
        let mut header = vec![0u8; DEFAULT_VOX_OFFSET];
        header[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
        let ndim = data.ndim() as i16;
        header[40..42].copy_from_slice(&ndim.to_le_bytes());
        for (i, &d) in data.shape().iter().enumerate() {
            let off = 42 + 2 * i;
            header[off..off + 2].copy_from_slice(&(d as i16).to_le_bytes());
        }
        // pixdim[1..=ndim] = 1.0
        for i in 0..data.ndim() {
            let off = 80 + 4 * i;
            header[off..off + 4].copy_from_slice(&1.0f32.to_le_bytes());
        }
        header[70..72].copy_from_slice(&DT_INT32.to_le_bytes());
        header[72..74].copy_from_slice(&32i16.to_le_bytes());
        header[108..112].copy_from_slice(&(DEFAULT_VOX_OFFSET as f32).to_le_bytes());
        header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
        header[344..348].copy_from_slice(b"n+1\0");
        Self {
            raw_header: header,
            data,
        }
    }

    /// Loads a volume from a `.nii` or `.nii.gz` file.
    pub fn load(path: &Path) -> Result<Self, VolumeError> {
        let bytes = read_maybe_gzipped(path)?;
        let malformed = |reason: &str| VolumeError::Malformed {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_SIZE {
            return Err(malformed("file shorter than NIfTI-1 header"));
        }
        let sizeof_hdr = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if sizeof_hdr != HEADER_SIZE as i32 {
            return Err(malformed("not a little-endian NIfTI-1 file"));
        }
        let magic = &bytes[344..348];
        if magic != b"n+1\0" && magic != b"ni1\0" {
            return Err(malformed("bad magic"));
        }

        let ndim = i16::from_le_bytes(bytes[40..42].try_into().unwrap());
        if !(1..=7).contains(&ndim) {
            return Err(malformed("invalid dim[0]"));
        }
        let mut dims = Vec::with_capacity(ndim as usize);
        for i in 0..ndim as usize {
            let off = 42 + 2 * i;
            let d = i16::from_le_bytes(bytes[off..off + 2].try_into().unwrap());
            if d < 1 {
                return Err(malformed("non-positive dimension"));
            }
            dims.push(d as usize);
        }
        let nvox: usize = dims.iter().product();

        let datatype = i16::from_le_bytes(bytes[70..72].try_into().unwrap());
        let vox_offset = f32::from_le_bytes(bytes[108..112].try_into().unwrap()) as usize;
        let vox_offset = vox_offset.max(HEADER_SIZE);
        let slope = f32::from_le_bytes(bytes[112..116].try_into().unwrap());
        let inter = f32::from_le_bytes(bytes[116..120].try_into().unwrap());
        if vox_offset > bytes.len() {
            return Err(malformed("vox_offset beyond end of file"));
        }

        let voxels = decode_voxels(&bytes[vox_offset..], datatype, nvox, slope, inter)
            .map_err(|e| match e {
                DecodeError::Unsupported(code) => VolumeError::UnsupportedDatatype(code),
                DecodeError::Truncated => malformed("voxel data truncated"),
            })?;

        let data = ArrayD::from_shape_vec(IxDyn(&dims), voxels)
            .map_err(|_| malformed("voxel count does not match dimensions"))?;

        Ok(Self {
            raw_header: bytes[..vox_offset].to_vec(),
            data,
        })
    }

    /// Saves the volume, gzipping when the path ends in `.gz`.
    ///
    /// Voxels are written as int16 when every value fits, int32 otherwise, so
    /// identical data always serializes identically.
    pub fn save(&self, path: &Path) -> Result<(), VolumeError> {
        let fits_i16 = self
            .data
            .iter()
            .all(|&v| v >= i16::MIN as i32 && v <= i16::MAX as i32);
        let (datatype, bitpix) = if fits_i16 { (DT_INT16, 16i16) } else { (DT_INT32, 32i16) };

        let mut header = self.raw_header.clone();
        header[70..72].copy_from_slice(&datatype.to_le_bytes());
        header[72..74].copy_from_slice(&bitpix.to_le_bytes());
        header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
        header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

        let mut out = Vec::with_capacity(header.len() + self.data.len() * (bitpix as usize / 8));
        out.extend_from_slice(&header);
        if fits_i16 {
            for &v in self.data.iter() {
                out.extend_from_slice(&(v as i16).to_le_bytes());
            }
        } else {
            for &v in self.data.iter() {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }

        write_volume_bytes(path, &out)?;
        Ok(())
    }

    /// Voxel array, shared reference.
    pub fn data(&self) -> &ArrayD<i32> {
        &self.data
    }

    /// Applies `f` to every voxel in place.
    pub fn map_values_inplace<F: Fn(i32) -> i32>(&mut self, f: F) {
        self.data.mapv_inplace(f);
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Replaces this volume's header with the reference volume's header.
    ///
    /// Shapes must match; this is how auxiliary channels are forced to carry
    /// exactly the geometry of their `_0000` counterpart.
    pub fn adopt_geometry_from(&mut self, reference: &NiftiVolume) -> Result<(), VolumeError> {
        if reference.shape() != self.shape() {
            return Err(VolumeError::ShapeMismatch {
                reference: reference.shape().to_vec(),
                volume: self.shape().to_vec(),
            });
        }
        self.raw_header = reference.raw_header.clone();
        Ok(())
    }
}

enum DecodeError {
    Unsupported(i16),
    Truncated,
}

fn decode_voxels(
    bytes: &[u8],
    datatype: i16,
    nvox: usize,
    slope: f32,
    inter: f32,
) -> Result<Vec<i32>, DecodeError> {
    let width = match datatype {
        DT_UINT8 | DT_INT8 => 1,
        DT_INT16 | DT_UINT16 => 2,
        DT_INT32 | DT_UINT32 | DT_FLOAT32 => 4,
        DT_FLOAT64 => 8,
        other => return Err(DecodeError::Unsupported(other)),
    };
    if bytes.len() < nvox * width {
        return Err(DecodeError::Truncated);
    }
    let scaled = slope != 0.0 && (slope != 1.0 || inter != 0.0);
    let scale = |raw: f64| -> i32 {
        let v = if scaled {
            raw * slope as f64 + inter as f64
        } else {
            raw
        };
        v.round() as i32
    };

    let mut out = Vec::with_capacity(nvox);
    for i in 0..nvox {
        let off = i * width;
        let raw = match datatype {
            DT_UINT8 => bytes[off] as f64,
            DT_INT8 => bytes[off] as i8 as f64,
            DT_INT16 => i16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as f64,
            DT_UINT16 => u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as f64,
            DT_INT32 => i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as f64,
            DT_UINT32 => u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as f64,
            DT_FLOAT32 => f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as f64,
            DT_FLOAT64 => f64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()),
            _ => unreachable!(),
        };
        out.push(scale(raw));
    }
    Ok(out)
}

fn read_maybe_gzipped(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    let raw = std::fs::read(path)?;
    if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        let mut decoder = flate2::read::GzDecoder::new(&raw[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

fn write_volume_bytes(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let file = std::fs::File::create(path)?;
        // mtime 0 keeps re-runs byte-identical
        let mut encoder = flate2::GzBuilder::new()
            .mtime(0)
            .write(file, Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()?;
    } else {
        std::fs::write(path, bytes)?;
    }
    Ok(())
}

/// Returns true when `name` looks like a volume file (`.nii` or `.nii.gz`).
pub fn is_volume_name(name: &str) -> bool {
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

/// Strips the volume extension from a file name.
pub fn volume_stem(name: &str) -> Option<&str> {
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
}

/// Copies a volume file to `dst`, gzipping uncompressed sources on the way.
///
/// Already-compressed sources are copied verbatim.
pub fn stage_compressed(src: &Path, dst: &Path) -> Result<(), VolumeError> {
    let raw = std::fs::read(src)?;
    if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        std::fs::write(dst, &raw)?;
    } else {
        let file = std::fs::File::create(dst)?;
        let mut encoder = flate2::GzBuilder::new()
            .mtime(0)
            .write(file, Compression::default());
        encoder.write_all(&raw)?;
        encoder.finish()?;
    }
    Ok(())
}
