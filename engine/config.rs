//! Run configuration: a TOML file plus the design CSVs it points at.
//!
//! Relative paths in the file are resolved against the directory holding the
//! configuration file.

use crate::estimate::FisherScoringOptions;
use crate::inference::{DEFAULT_MINLOG, InferenceSettings};
use crate::types::{Contrast, ContrastPlan, LayoutError, RandomEffectsLayout};
use ndarray::Array2;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 2^32 bytes.
pub const DEFAULT_MAX_MEMORY: u64 = 1 << 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to read CSV {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("design file {path} is malformed: {reason}")]
    Design { path: PathBuf, reason: String },
    #[error("invalid random-effects layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("invalid MAXMEM expression {expression:?}: {source}")]
    MaxMemory {
        expression: String,
        #[source]
        source: MemoryExpressionError,
    },
    #[error("contrast {name} has {found} columns but the design has {expected} fixed effects")]
    ContrastWidth {
        name: String,
        expected: usize,
        found: usize,
    },
}

// --- On-disk layout ---

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    outdir: PathBuf,
    #[serde(rename = "X")]
    fixed_design: PathBuf,
    #[serde(rename = "Y_files")]
    y_files: PathBuf,
    #[serde(rename = "Z")]
    random_factors: Vec<RandomFactorFiles>,
    contrasts: Vec<ContrastEntry>,
    #[serde(default)]
    analysis_mask: Option<PathBuf>,
    #[serde(rename = "MAXMEM", default)]
    max_memory: Option<MemorySetting>,
    #[serde(rename = "OutputCovB", default = "default_true")]
    output_cov_b: bool,
    #[serde(default = "default_blocks")]
    voxel_blocks: usize,
    #[serde(default = "default_minlog")]
    minlog: f64,
    #[serde(default)]
    estimation: EstimationSection,
}

#[derive(Debug, Clone, Deserialize)]
struct RandomFactorFiles {
    design: PathBuf,
    factor: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct ContrastEntry {
    name: String,
    vector: ContrastValues,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ContrastValues {
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MemorySetting {
    Bytes(u64),
    Expression(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct EstimationSection {
    max_iterations: usize,
    tolerance: f64,
    reml: bool,
}

impl Default for EstimationSection {
    fn default() -> Self {
        let options = FisherScoringOptions::default();
        Self {
            max_iterations: options.max_iterations,
            tolerance: options.tolerance,
            reml: options.reml,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_blocks() -> usize {
    1
}

fn default_minlog() -> f64 {
    DEFAULT_MINLOG
}

// --- Resolved configuration ---

/// Everything one run needs, validated and with designs summarised.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub outdir: PathBuf,
    /// Observations in the full design.
    pub n: usize,
    /// Fixed effects.
    pub p: usize,
    pub layout: RandomEffectsLayout,
    pub contrasts: ContrastPlan,
    /// Volume whose geometry every output copies.
    pub reference_volume: PathBuf,
    pub analysis_mask: Option<PathBuf>,
    pub max_memory: u64,
    pub voxel_blocks: usize,
    pub inference: InferenceSettings,
    pub estimation: FisherScoringOptions,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses configuration text, resolving relative paths against `base`.
    pub fn from_toml_str(text: &str, base: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        let resolve = |path: &Path| -> PathBuf {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        };

        let fixed = read_numeric_csv(&resolve(&file.fixed_design))?;
        let (n, p) = fixed.dim();
        if n == 0 || p == 0 {
            return Err(ConfigError::Invalid {
                key: "X",
                reason: format!("design has shape {n} x {p}"),
            });
        }

        if file.random_factors.is_empty() {
            return Err(ConfigError::Invalid {
                key: "Z",
                reason: "at least one random factor is required".to_string(),
            });
        }
        let mut levels = Vec::with_capacity(file.random_factors.len());
        let mut params = Vec::with_capacity(file.random_factors.len());
        for factor in &file.random_factors {
            let design_path = resolve(&factor.design);
            let design = read_numeric_csv(&design_path)?;
            if design.nrows() != n {
                return Err(ConfigError::Design {
                    path: design_path,
                    reason: format!("{} rows but X has {n}", design.nrows()),
                });
            }
            let factor_path = resolve(&factor.factor);
            let labels = read_factor_labels(&factor_path)?;
            if labels.len() != n {
                return Err(ConfigError::Design {
                    path: factor_path,
                    reason: format!("{} rows but X has {n}", labels.len()),
                });
            }
            let distinct: HashSet<&str> = labels.iter().map(String::as_str).collect();
            levels.push(distinct.len());
            params.push(design.ncols());
        }
        let layout = RandomEffectsLayout::new(levels, params)?;

        let contrasts = build_contrasts(&file.contrasts, p)?;
        let reference_volume = read_reference_path(&resolve(&file.y_files), &resolve)?;
        let max_memory = match &file.max_memory {
            None => DEFAULT_MAX_MEMORY,
            Some(MemorySetting::Bytes(bytes)) => *bytes,
            Some(MemorySetting::Expression(expression)) => evaluate_memory_expression(expression)
                .map_err(|source| ConfigError::MaxMemory {
                    expression: expression.clone(),
                    source,
                })?,
        };
        if file.voxel_blocks == 0 {
            return Err(ConfigError::Invalid {
                key: "voxel_blocks",
                reason: "must be at least 1".to_string(),
            });
        }
        if !file.minlog.is_finite() || file.minlog >= 0.0 {
            return Err(ConfigError::Invalid {
                key: "minlog",
                reason: format!("{} is not a negative finite number", file.minlog),
            });
        }
        if !(file.estimation.tolerance > 0.0) {
            return Err(ConfigError::Invalid {
                key: "estimation.tolerance",
                reason: format!("{} is not positive", file.estimation.tolerance),
            });
        }

        Ok(Self {
            outdir: resolve(&file.outdir),
            n,
            p,
            layout,
            contrasts,
            reference_volume,
            analysis_mask: file.analysis_mask.as_deref().map(resolve),
            max_memory,
            voxel_blocks: file.voxel_blocks,
            inference: InferenceSettings {
                reml: file.estimation.reml,
                output_cov_b: file.output_cov_b,
                minlog: file.minlog,
            },
            estimation: FisherScoringOptions {
                max_iterations: file.estimation.max_iterations,
                tolerance: file.estimation.tolerance,
                reml: file.estimation.reml,
            },
        })
    }

    /// Directory holding the batching stage's product stores.
    pub fn tmp_dir(&self) -> PathBuf {
        self.outdir.join("tmp")
    }
}

fn build_contrasts(entries: &[ContrastEntry], p: usize) -> Result<ContrastPlan, ConfigError> {
    if entries.is_empty() {
        return Err(ConfigError::Invalid {
            key: "contrasts",
            reason: "at least one contrast is required".to_string(),
        });
    }
    let mut contrasts = Vec::with_capacity(entries.len());
    for entry in entries {
        let rows = match &entry.vector {
            ContrastValues::Vector(values) => vec![values.clone()],
            ContrastValues::Matrix(rows) => rows.clone(),
        };
        let found = rows.first().map_or(0, Vec::len);
        if rows.is_empty() || rows.iter().any(|row| row.len() != found) {
            return Err(ConfigError::Invalid {
                key: "contrasts",
                reason: format!("contrast {} has ragged or empty rows", entry.name),
            });
        }
        if found != p {
            return Err(ConfigError::ContrastWidth {
                name: entry.name.clone(),
                expected: p,
                found,
            });
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let matrix = Array2::from_shape_vec((flat.len() / p, p), flat).map_err(|e| {
            ConfigError::Invalid {
                key: "contrasts",
                reason: format!("contrast {}: {e}", entry.name),
            }
        })?;
        contrasts.push(Contrast::from_matrix(entry.name.clone(), matrix));
    }
    Ok(ContrastPlan::new(contrasts))
}

fn csv_reader(path: &Path) -> Result<csv::Reader<fs::File>, ConfigError> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| ConfigError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

/// Reads a headerless numeric CSV into a matrix.
pub fn read_numeric_csv(path: &Path) -> Result<Array2<f64>, ConfigError> {
    let mut reader = csv_reader(path)?;
    let mut values = Vec::new();
    let mut width = None;
    let mut rows = 0;
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|source| ConfigError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        if *width.get_or_insert(record.len()) != record.len() {
            return Err(ConfigError::Design {
                path: path.to_path_buf(),
                reason: format!("row {} has {} columns", line + 1, record.len()),
            });
        }
        for field in record.iter() {
            let value = field.parse::<f64>().map_err(|e| ConfigError::Design {
                path: path.to_path_buf(),
                reason: format!("row {}: {field:?} is not a number ({e})", line + 1),
            })?;
            values.push(value);
        }
        rows += 1;
    }
    Array2::from_shape_vec((rows, width.unwrap_or(0)), values).map_err(|e| ConfigError::Design {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// First column of a headerless CSV, as grouping labels.
fn read_factor_labels(path: &Path) -> Result<Vec<String>, ConfigError> {
    let mut reader = csv_reader(path)?;
    let mut labels = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| ConfigError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let label = record.get(0).unwrap_or_default();
        labels.push(label.to_string());
    }
    Ok(labels)
}

fn read_reference_path(
    y_files: &Path,
    resolve: &dyn Fn(&Path) -> PathBuf,
) -> Result<PathBuf, ConfigError> {
    let text = fs::read_to_string(y_files).map_err(|source| ConfigError::Io {
        path: y_files.to_path_buf(),
        source,
    })?;
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| resolve(Path::new(line)))
        .ok_or_else(|| ConfigError::Invalid {
            key: "Y_files",
            reason: format!("{} lists no volumes", y_files.display()),
        })
}

// --- Memory expressions ---

#[derive(Debug, Error)]
pub enum MemoryExpressionError {
    #[error("unexpected character {0:?}")]
    UnexpectedCharacter(char),
    #[error("bad number {text:?}: {source}")]
    BadNumber {
        text: String,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("unexpected {0}")]
    UnexpectedToken(String),
    #[error("unbalanced parentheses")]
    UnbalancedParentheses,
    #[error("expression ends early")]
    UnexpectedEnd,
    #[error("unexpected trailing input")]
    TrailingInput,
    #[error("evaluates to {0}, which is not a byte count")]
    NotAByteCount(f64),
}

/// Evaluates a byte count such as `2**32` or `8 * (1024 ^ 3)`.
///
/// Supports `+ - * / ** ^` and parentheses; `**` and `^` are exponentiation and
/// associate to the right.
pub fn evaluate_memory_expression(expression: &str) -> Result<u64, MemoryExpressionError> {
    let tokens = tokenize(expression)?;
    let mut parser = ExpressionParser { tokens, position: 0 };
    let value = parser.sum()?;
    if parser.position != parser.tokens.len() {
        return Err(MemoryExpressionError::TrailingInput);
    }
    if !value.is_finite() || value < 0.0 {
        return Err(MemoryExpressionError::NotAByteCount(value));
    }
    Ok(value.floor() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Times,
    Divide,
    Power,
    Open,
    Close,
}

fn tokenize(expression: &str) -> Result<Vec<Token>, MemoryExpressionError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => {}
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '/' => tokens.push(Token::Divide),
            '^' => tokens.push(Token::Power),
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Power);
                    i += 1;
                } else {
                    tokens.push(Token::Times);
                }
            }
            digit if digit.is_ascii_digit() || digit == '.' => {
                let start = i;
                while i + 1 < chars.len() && (chars[i + 1].is_ascii_digit() || chars[i + 1] == '.') {
                    i += 1;
                }
                let text: String = chars[start..=i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|source| MemoryExpressionError::BadNumber {
                        text: text.clone(),
                        source,
                    })?;
                tokens.push(Token::Number(value));
            }
            other => return Err(MemoryExpressionError::UnexpectedCharacter(other)),
        }
        i += 1;
    }
    Ok(tokens)
}

struct ExpressionParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExpressionParser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        self.position += 1;
        token
    }

    fn sum(&mut self) -> Result<f64, MemoryExpressionError> {
        let mut value = self.product()?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.position += 1;
            let rhs = self.product()?;
            value = if op == Token::Plus { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn product(&mut self) -> Result<f64, MemoryExpressionError> {
        let mut value = self.power()?;
        while let Some(op @ (Token::Times | Token::Divide)) = self.peek() {
            self.position += 1;
            let rhs = self.power()?;
            value = if op == Token::Times { value * rhs } else { value / rhs };
        }
        Ok(value)
    }

    fn power(&mut self) -> Result<f64, MemoryExpressionError> {
        let base = self.unary()?;
        if self.peek() == Some(Token::Power) {
            self.position += 1;
            let exponent = self.power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<f64, MemoryExpressionError> {
        if self.peek() == Some(Token::Minus) {
            self.position += 1;
            return Ok(-self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<f64, MemoryExpressionError> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Open) => {
                let value = self.sum()?;
                match self.advance() {
                    Some(Token::Close) => Ok(value),
                    _ => Err(MemoryExpressionError::UnbalancedParentheses),
                }
            }
            Some(other) => Err(MemoryExpressionError::UnexpectedToken(format!("{other:?}"))),
            None => Err(MemoryExpressionError::UnexpectedEnd),
        }
    }
}
