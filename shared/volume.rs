// ========================================================================================
//                               NIfTI volume I/O
// ========================================================================================

// Volumes are held flat, frame by frame. Within a frame, voxel (x, y, z) sits
// at `x·ny·nz + y·nz + z`, which is the full-volume index used everywhere else.

use flate2::Compression;
use flate2::write::GzEncoder;
use log::debug;
use ndarray::ArrayView2;
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEADER_BYTES: usize = 348;
const DATA_OFFSET: usize = 352;
const DATATYPE_FLOAT64: i16 = 64;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode NIfTI volume {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("{path} has {ndim} dimensions; only 3-D and 4-D volumes are supported")]
    Dimensionality { path: PathBuf, ndim: usize },
    #[error("{path} has shape {found:?} but the reference volume has shape {expected:?}")]
    GeometryMismatch {
        path: PathBuf,
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error("{name} holds {found} frames but {expected} were requested")]
    FrameMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("block written to {name} is malformed: {reason}")]
    BlockShape { name: String, reason: String },
    #[error("{field} of {value} does not fit in a NIfTI-1 header")]
    HeaderOverflow { field: &'static str, value: usize },
    #[error("voxel {voxel} lies outside {name}, which has {n_voxels} voxels")]
    VoxelOutOfRange {
        name: String,
        voxel: usize,
        n_voxels: usize,
    },
}

/// Spatial layout copied from a reference image into every output.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    pub dims: [usize; 3],
    pub pixdim: [f32; 3],
    pub sform_code: i16,
    pub srow: [[f32; 4]; 3],
}

impl VolumeGeometry {
    /// Axis-aligned geometry with unit voxels.
    pub fn with_dims(dims: [usize; 3]) -> Self {
        Self {
            dims,
            pixdim: [1.0; 3],
            sform_code: 1,
            srow: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
        }
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn flat_index(&self, x: usize, y: usize, z: usize) -> usize {
        x * self.dims[1] * self.dims[2] + y * self.dims[2] + z
    }
}

/// A volume with one or more frames.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeData {
    pub geometry: VolumeGeometry,
    pub n_frames: usize,
    values: Vec<f64>,
}

impl VolumeData {
    pub fn zeros(geometry: VolumeGeometry, n_frames: usize) -> Self {
        let len = geometry.n_voxels() * n_frames;
        Self {
            geometry,
            n_frames,
            values: vec![0.0; len],
        }
    }

    pub fn from_frame(geometry: VolumeGeometry, values: Vec<f64>) -> Result<Self, VolumeError> {
        if values.len() != geometry.n_voxels() {
            return Err(VolumeError::BlockShape {
                name: "volume".to_string(),
                reason: format!(
                    "{} values supplied for {} voxels",
                    values.len(),
                    geometry.n_voxels()
                ),
            });
        }
        Ok(Self {
            geometry,
            n_frames: 1,
            values,
        })
    }

    pub fn frame(&self, frame: usize) -> &[f64] {
        let n = self.geometry.n_voxels();
        &self.values[frame * n..(frame + 1) * n]
    }

    /// Voxels of the first frame holding a finite non-zero value.
    pub fn nonzero_mask(&self) -> Vec<bool> {
        self.frame(0)
            .iter()
            .map(|value| value.is_finite() && *value != 0.0)
            .collect()
    }

    /// First frame read as non-negative counts.
    pub fn counts(&self) -> Vec<usize> {
        self.frame(0)
            .iter()
            .map(|value| {
                if value.is_finite() && *value > 0.0 {
                    value.round() as usize
                } else {
                    0
                }
            })
            .collect()
    }

    /// Places a (voxels × width) block at the given voxels.
    fn apply_block(
        &mut self,
        name: &str,
        values: &ArrayView2<f64>,
        voxels: &[usize],
        frame: Frame,
    ) -> Result<(), VolumeError> {
        let n_voxels = self.geometry.n_voxels();
        if values.nrows() != voxels.len() {
            return Err(VolumeError::BlockShape {
                name: name.to_string(),
                reason: format!("{} rows for {} voxels", values.nrows(), voxels.len()),
            });
        }
        let first_frame = match frame {
            Frame::Index(index) => {
                if values.ncols() != 1 || index >= self.n_frames {
                    return Err(VolumeError::BlockShape {
                        name: name.to_string(),
                        reason: format!(
                            "frame {index} of {} written with width {}",
                            self.n_frames,
                            values.ncols()
                        ),
                    });
                }
                index
            }
            Frame::All => {
                if values.ncols() != self.n_frames {
                    return Err(VolumeError::BlockShape {
                        name: name.to_string(),
                        reason: format!(
                            "width {} written across {} frames",
                            values.ncols(),
                            self.n_frames
                        ),
                    });
                }
                0
            }
        };
        for (row, &voxel) in values.rows().into_iter().zip(voxels) {
            if voxel >= n_voxels {
                return Err(VolumeError::VoxelOutOfRange {
                    name: name.to_string(),
                    voxel,
                    n_voxels,
                });
            }
            for (offset, &value) in row.iter().enumerate() {
                self.values[(first_frame + offset) * n_voxels + voxel] = value;
            }
        }
        Ok(())
    }
}

/// Which frames of a volume a block covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A single-column block written into one frame.
    Index(usize),
    /// One column per frame.
    All,
}

/// Destination for per-voxel statistic blocks.
///
/// Writes are positional: voxels that are not named keep their previous value,
/// and blocks written to different frames of the same volume accumulate.
pub trait VolumeWriter {
    fn write_block(
        &mut self,
        name: &str,
        values: &ArrayView2<f64>,
        voxels: &[usize],
        frame: Frame,
        n_frames: usize,
    ) -> Result<(), VolumeError>;
}

pub fn read_volume(path: &Path) -> Result<VolumeData, VolumeError> {
    let decode = |reason: String| VolumeError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| decode(e.to_string()))?;
    let header = object.header();
    let pixdim = [header.pixdim[1], header.pixdim[2], header.pixdim[3]];
    let sform_code = header.sform_code;
    let srow = [header.srow_x, header.srow_y, header.srow_z];
    let array = object
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| decode(e.to_string()))?;

    let shape = array.shape().to_vec();
    let (dims, n_frames) = match shape.as_slice() {
        [x, y, z] => ([*x, *y, *z], 1),
        [x, y, z, t] => ([*x, *y, *z], *t),
        other => {
            return Err(VolumeError::Dimensionality {
                path: path.to_path_buf(),
                ndim: other.len(),
            });
        }
    };
    let geometry = if sform_code > 0 {
        VolumeGeometry {
            dims,
            pixdim,
            sform_code,
            srow,
        }
    } else {
        let mut geometry = VolumeGeometry::with_dims(dims);
        geometry.pixdim = pixdim;
        for axis in 0..3 {
            geometry.srow[axis][axis] = pixdim[axis];
        }
        geometry
    };

    // Logical iteration runs over (x, y, z, t) with t fastest.
    let n_voxels = geometry.n_voxels();
    let mut values = vec![0.0; n_voxels * n_frames];
    for (position, &value) in array.iter().enumerate() {
        let frame = position % n_frames;
        let voxel = position / n_frames;
        values[frame * n_voxels + voxel] = value;
    }
    debug!(
        "Read {} with shape {:?} and {n_frames} frame(s)",
        path.display(),
        dims
    );
    Ok(VolumeData {
        geometry,
        n_frames,
        values,
    })
}

fn put_i16(header: &mut [u8], offset: usize, value: i16) {
    header[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_f32(header: &mut [u8], offset: usize, value: f32) {
    header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn header_dim(field: &'static str, value: usize) -> Result<i16, VolumeError> {
    i16::try_from(value).map_err(|_| VolumeError::HeaderOverflow { field, value })
}

/// Single-file NIfTI-1 bytes with float64 voxels.
pub fn encode_nifti(volume: &VolumeData) -> Result<Vec<u8>, VolumeError> {
    let geometry = &volume.geometry;
    let [nx, ny, nz] = geometry.dims;
    let mut header = [0u8; HEADER_BYTES];
    header[0..4].copy_from_slice(&(HEADER_BYTES as i32).to_le_bytes());

    let ndim: i16 = if volume.n_frames > 1 { 4 } else { 3 };
    let dim = [
        ndim,
        header_dim("x dimension", nx)?,
        header_dim("y dimension", ny)?,
        header_dim("z dimension", nz)?,
        header_dim("frame count", volume.n_frames)?,
        1,
        1,
        1,
    ];
    for (i, &d) in dim.iter().enumerate() {
        put_i16(&mut header, 40 + i * 2, d);
    }
    put_i16(&mut header, 70, DATATYPE_FLOAT64);
    put_i16(&mut header, 72, 64);

    let pixdim = [
        1.0,
        geometry.pixdim[0],
        geometry.pixdim[1],
        geometry.pixdim[2],
        1.0,
        1.0,
        1.0,
        1.0,
    ];
    for (i, &p) in pixdim.iter().enumerate() {
        put_f32(&mut header, 76 + i * 4, p);
    }
    put_f32(&mut header, 108, DATA_OFFSET as f32);
    put_f32(&mut header, 112, 1.0);
    put_i16(&mut header, 254, geometry.sform_code.max(1));
    for (row, values) in geometry.srow.iter().enumerate() {
        for (i, &value) in values.iter().enumerate() {
            put_f32(&mut header, 280 + row * 16 + i * 4, value);
        }
    }
    header[344..348].copy_from_slice(b"n+1\0");

    let n_voxels = geometry.n_voxels();
    let mut bytes = Vec::with_capacity(DATA_OFFSET + n_voxels * volume.n_frames * 8);
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&[0u8; DATA_OFFSET - HEADER_BYTES]);
    // On disk x varies fastest.
    for frame in 0..volume.n_frames {
        let data = volume.frame(frame);
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let value = data[geometry.flat_index(x, y, z)];
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
    Ok(bytes)
}

/// Writes `.nii`, or gzip-compressed `.nii.gz` when the path asks for it.
pub fn write_volume(path: &Path, volume: &VolumeData) -> Result<(), VolumeError> {
    let io_error = |source| VolumeError::Io {
        path: path.to_path_buf(),
        source,
    };
    let raw = encode_nifti(volume)?;
    let bytes = if path.to_string_lossy().ends_with(".gz") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).map_err(io_error)?;
        encoder.finish().map_err(io_error)?
    } else {
        raw
    };
    fs::write(path, bytes).map_err(io_error)
}

/// Writes `<outdir>/<name>.nii`, merging each block into whatever the file
/// already holds.
#[derive(Debug, Clone)]
pub struct NiftiVolumeWriter {
    outdir: PathBuf,
    geometry: VolumeGeometry,
}

impl NiftiVolumeWriter {
    pub fn new(outdir: impl Into<PathBuf>, geometry: VolumeGeometry) -> Self {
        Self {
            outdir: outdir.into(),
            geometry,
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.outdir.join(format!("{name}.nii"))
    }

    fn load_or_create(&self, name: &str, path: &Path, n_frames: usize) -> Result<VolumeData, VolumeError> {
        if !path.exists() {
            return Ok(VolumeData::zeros(self.geometry.clone(), n_frames));
        }
        let mut existing = read_volume(path)?;
        if existing.geometry.dims != self.geometry.dims {
            return Err(VolumeError::GeometryMismatch {
                path: path.to_path_buf(),
                expected: self.geometry.dims,
                found: existing.geometry.dims,
            });
        }
        if existing.n_frames != n_frames {
            return Err(VolumeError::FrameMismatch {
                name: name.to_string(),
                expected: n_frames,
                found: existing.n_frames,
            });
        }
        existing.geometry = self.geometry.clone();
        Ok(existing)
    }
}

impl VolumeWriter for NiftiVolumeWriter {
    fn write_block(
        &mut self,
        name: &str,
        values: &ArrayView2<f64>,
        voxels: &[usize],
        frame: Frame,
        n_frames: usize,
    ) -> Result<(), VolumeError> {
        let path = self.path_for(name);
        let mut volume = self.load_or_create(name, &path, n_frames)?;
        volume.apply_block(name, values, voxels, frame)?;
        write_volume(&path, &volume)
    }
}

/// Keeps every written volume in memory.
#[derive(Debug, Clone)]
pub struct MemoryVolumeWriter {
    geometry: VolumeGeometry,
    volumes: BTreeMap<String, VolumeData>,
}

impl MemoryVolumeWriter {
    pub fn new(geometry: VolumeGeometry) -> Self {
        Self {
            geometry,
            volumes: BTreeMap::new(),
        }
    }

    pub fn volume(&self, name: &str) -> Option<&VolumeData> {
        self.volumes.get(name)
    }
}

impl VolumeWriter for MemoryVolumeWriter {
    fn write_block(
        &mut self,
        name: &str,
        values: &ArrayView2<f64>,
        voxels: &[usize],
        frame: Frame,
        n_frames: usize,
    ) -> Result<(), VolumeError> {
        let volume = self
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| VolumeData::zeros(self.geometry.clone(), n_frames));
        if volume.n_frames != n_frames {
            return Err(VolumeError::FrameMismatch {
                name: name.to_string(),
                expected: n_frames,
                found: volume.n_frames,
            });
        }
        volume.apply_block(name, values, voxels, frame)
    }
}
