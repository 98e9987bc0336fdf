// ========================================================================================
//                          Memory-mapped product stores
// ========================================================================================

// The batching stage leaves its per-voxel products on disk as little-endian
// float64 `.npy` arrays, one row per voxel in mask-rank order. Only the rows a
// voxel group needs are ever copied out of the mapping.

use log::debug;
use memmap2::Mmap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const VALUE_BYTES: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a readable npy array: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("row {row} requested from {path}, which only has {rows} rows")]
    RowOutOfRange {
        path: PathBuf,
        row: usize,
        rows: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NpyHeader {
    order: ByteOrder,
    shape: Vec<usize>,
    data_offset: usize,
}

fn format_error(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::Format {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Value of `key` in the python-literal header dictionary, up to the next
/// top-level comma or closing brace.
fn header_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let quoted = [format!("'{key}'"), format!("\"{key}\"")];
    let start = quoted.iter().find_map(|k| header.find(k.as_str()).map(|i| i + k.len()))?;
    let rest = header[start..].trim_start().strip_prefix(':')?.trim_start();
    if let Some(tuple) = rest.strip_prefix('(') {
        let end = tuple.find(')')?;
        return Some(&rest[..end + 2]);
    }
    let end = rest.find([',', '}']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<NpyHeader, StoreError> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(format_error(path, "missing npy magic string"));
    }
    let major = bytes[6];
    let (header_len, prefix) = match major {
        1 => (usize::from(u16::from_le_bytes([bytes[8], bytes[9]])), 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(format_error(path, "truncated header length"));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        other => return Err(format_error(path, format!("unsupported npy version {other}"))),
    };
    let data_offset = prefix + header_len;
    let header = bytes
        .get(prefix..data_offset)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .ok_or_else(|| format_error(path, "truncated or non-ascii header"))?;

    let descr = header_field(header, "descr")
        .ok_or_else(|| format_error(path, "header has no descr"))?
        .trim_matches(|c| c == '\'' || c == '"');
    let order = match descr {
        "<f8" | "=f8" => ByteOrder::Little,
        ">f8" => ByteOrder::Big,
        other => {
            return Err(format_error(
                path,
                format!("dtype {other} is not float64"),
            ));
        }
    };
    if header_field(header, "fortran_order") != Some("False") {
        return Err(format_error(path, "only C-ordered arrays are supported"));
    }
    let shape_text = header_field(header, "shape")
        .ok_or_else(|| format_error(path, "header has no shape"))?;
    let shape = shape_text
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|e| format_error(path, format!("bad shape entry {dim}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if shape.is_empty() || shape.len() > 2 {
        return Err(format_error(
            path,
            format!("expected a 1-D or 2-D array, found shape {shape_text}"),
        ));
    }
    Ok(NpyHeader {
        order,
        shape,
        data_offset,
    })
}

/// A read-only, memory-mapped float64 matrix stored as `.npy`.
///
/// One-dimensional arrays are exposed as a single column.
#[derive(Debug)]
pub struct NpyRowStore {
    path: PathBuf,
    mmap: Mmap,
    order: ByteOrder,
    data_offset: usize,
    rows: usize,
    cols: usize,
}

impl NpyRowStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let io_error = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_error)?;
        // The file is opened read-only and never truncated while mapped.
        let mmap = unsafe { Mmap::map(&file).map_err(io_error)? };
        let header = parse_header(path, &mmap)?;
        let rows = header.shape[0];
        let cols = header.shape.get(1).copied().unwrap_or(1);
        let needed = header.data_offset + rows * cols * VALUE_BYTES;
        if mmap.len() < needed {
            return Err(format_error(
                path,
                format!("holds {} bytes but its shape needs {needed}", mmap.len()),
            ));
        }
        debug!("Mapped {} ({rows} x {cols})", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            order: header.order,
            data_offset: header.data_offset,
            rows,
            cols,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    fn value(&self, row: usize, col: usize) -> f64 {
        let start = self.data_offset + (row * self.cols + col) * VALUE_BYTES;
        let mut raw = [0u8; VALUE_BYTES];
        raw.copy_from_slice(&self.mmap[start..start + VALUE_BYTES]);
        match self.order {
            ByteOrder::Little => f64::from_le_bytes(raw),
            ByteOrder::Big => f64::from_be_bytes(raw),
        }
    }

    /// Copies the listed rows, in the order given.
    pub fn read_rows(&self, rows: &[usize]) -> Result<Array2<f64>, StoreError> {
        if let Some(&row) = rows.iter().find(|&&row| row >= self.rows) {
            return Err(StoreError::RowOutOfRange {
                path: self.path.clone(),
                row,
                rows: self.rows,
            });
        }
        Ok(Array2::from_shape_fn((rows.len(), self.cols), |(i, j)| {
            self.value(rows[i], j)
        }))
    }

    /// Copies the first column of the listed rows.
    pub fn read_column(&self, rows: &[usize]) -> Result<Array1<f64>, StoreError> {
        Ok(self.read_rows(rows)?.column(0).to_owned())
    }

    pub fn read_all(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.rows, self.cols), |(i, j)| self.value(i, j))
    }
}

fn write_npy(path: &Path, shape: &[usize], values: impl Iterator<Item = f64>) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let shape_text = match shape {
        [len] => format!("({len},)"),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!("{{'descr': '<f8', 'fortran_order': False, 'shape': {shape_text}, }}");
    // Pad so the data starts on a 64-byte boundary, header ends with a newline.
    let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');
    let header_len = u16::try_from(header.len())
        .map_err(|_| format_error(path, "header too long for npy version 1"))?;

    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(NPY_MAGIC).map_err(io_error)?;
    writer.write_all(&[1, 0]).map_err(io_error)?;
    writer.write_all(&header_len.to_le_bytes()).map_err(io_error)?;
    writer.write_all(header.as_bytes()).map_err(io_error)?;
    for value in values {
        writer.write_all(&value.to_le_bytes()).map_err(io_error)?;
    }
    writer.flush().map_err(io_error)
}

/// Writes a C-ordered 2-D float64 `.npy` file.
pub fn write_npy_matrix(path: &Path, data: &ArrayView2<f64>) -> Result<(), StoreError> {
    write_npy(path, &[data.nrows(), data.ncols()], data.iter().copied())
}

/// Writes a 1-D float64 `.npy` file.
pub fn write_npy_vector(path: &Path, data: &ArrayView1<f64>) -> Result<(), StoreError> {
    write_npy(path, &[data.len()], data.iter().copied())
}
