use crate::error::{EvoError, Result};
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::Path;

/// One observation (a sequence in the family)
#[derive(Debug, Clone)]
pub struct Observation {
    pub name: String,
    pub seq: String,
    pub seq_msa: String,
}

/// Square-or-rectangular sparse matrix, one hash row per matrix row.
/// Duplicate coordinates are summed, as when a COO matrix is compressed.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    n_cols: usize,
    rows: Vec<FxHashMap<usize, f64>>,
}

impl SparseMatrix {
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        SparseMatrix {
            n_cols,
            rows: vec![FxHashMap::default(); n_rows],
        }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        *self.rows[row].entry(col).or_insert(0.0) += value;
    }

    #[cfg(test)]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.rows
            .get(row)
            .and_then(|r| r.get(&col))
            .copied()
            .unwrap_or(0.0)
    }

    /// Nonzero cells of one row, sorted by column.
    pub fn row_nonzero(&self, row: usize) -> Vec<(usize, f64)> {
        let mut cells: Vec<(usize, f64)> = self.rows[row]
            .iter()
            .filter(|(_, v)| **v != 0.0)
            .map(|(&c, &v)| (c, v))
            .collect();
        cells.sort_by_key(|&(c, _)| c);
        cells
    }

    /// Number of strictly positive entries in a row.
    pub fn positive_in_row(&self, row: usize) -> usize {
        self.rows[row].values().filter(|&&v| v > 0.0).count()
    }

    /// Elementwise `self - other`; cells that cancel to zero are dropped.
    pub fn subtract(&self, other: &SparseMatrix) -> Result<SparseMatrix> {
        if self.n_rows() != other.n_rows() || self.n_cols != other.n_cols {
            return Err(EvoError::ShapeMismatch(format!(
                "cannot subtract a {}x{} matrix from a {}x{} matrix",
                other.n_rows(),
                other.n_cols,
                self.n_rows(),
                self.n_cols
            )));
        }
        let mut out = self.clone();
        for (row, cells) in other.rows.iter().enumerate() {
            for (&col, &v) in cells {
                out.add(row, col, -v);
            }
        }
        for row in out.rows.iter_mut() {
            row.retain(|_, v| *v != 0.0);
        }
        Ok(out)
    }
}

/// Dense positions x categories score matrix (row-major)
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl ScoreMatrix {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
            return Err(EvoError::ShapeMismatch(format!(
                "score row {} has {} values, expected {}",
                i,
                r.len(),
                cols
            )));
        }
        let n = rows.len();
        Ok(ScoreMatrix {
            rows: n,
            cols,
            data: rows.into_iter().flatten().collect(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

/// Category index -> symbol, iterated in ascending index order
pub type Vocabulary = BTreeMap<usize, String>;

/// An annotated set of observations plus everything upstream stages attached to it.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub obs: Vec<Observation>,
    obs_index: FxHashMap<String, usize>,
    distances: Option<SparseMatrix>,
    graphs: FxHashMap<String, SparseMatrix>,
    embeddings: FxHashMap<String, Vec<[f64; 2]>>,
    vocabularies: FxHashMap<String, Vocabulary>,
    scores: FxHashMap<String, ScoreMatrix>,
    /// Observation-level categorical columns, in insertion order
    obs_annotations: Vec<(String, Vec<String>)>,
}

impl Dataset {
    pub fn new(obs: Vec<Observation>) -> Self {
        let obs_index = obs
            .iter()
            .enumerate()
            .map(|(i, o)| (o.name.clone(), i))
            .collect();
        Dataset {
            obs,
            obs_index,
            ..Default::default()
        }
    }

    pub fn n_obs(&self) -> usize {
        self.obs.len()
    }

    pub fn obs_position(&self, name: &str) -> Option<usize> {
        self.obs_index.get(name).copied()
    }

    /// The neighbor-distance matrix; an absent one reads as all zeros.
    pub fn distances(&self) -> SparseMatrixView<'_> {
        SparseMatrixView {
            matrix: self.distances.as_ref(),
            n_rows: self.n_obs(),
        }
    }

    pub fn set_distances(&mut self, matrix: SparseMatrix) {
        self.distances = Some(matrix);
    }

    pub fn graph(&self, key: &str) -> Option<&SparseMatrix> {
        self.graphs.get(key)
    }

    pub fn insert_graph(&mut self, key: impl Into<String>, matrix: SparseMatrix) {
        self.graphs.insert(key.into(), matrix);
    }

    /// Coordinates stored under `X_{basis}`
    pub fn embedding(&self, basis: &str) -> Option<&[[f64; 2]]> {
        self.embeddings
            .get(&format!("X_{}", basis))
            .map(|v| v.as_slice())
    }

    pub fn insert_embedding(&mut self, basis: &str, coords: Vec<[f64; 2]>) {
        self.embeddings.insert(format!("X_{}", basis), coords);
    }

    pub fn vocabulary(&self, key: &str) -> Option<&Vocabulary> {
        self.vocabularies.get(key)
    }

    pub fn insert_vocabulary(&mut self, key: impl Into<String>, vocab: Vocabulary) {
        self.vocabularies.insert(key.into(), vocab);
    }

    pub fn scores(&self, key: &str) -> Option<&ScoreMatrix> {
        self.scores.get(key)
    }

    pub fn insert_scores(&mut self, key: impl Into<String>, scores: ScoreMatrix) {
        self.scores.insert(key.into(), scores);
    }

    pub fn obs_annotation(&self, key: &str) -> Option<&[String]> {
        self.obs_annotations
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    #[cfg(test)]
    pub fn obs_annotations(&self) -> &[(String, Vec<String>)] {
        &self.obs_annotations
    }

    /// Adds or replaces an observation-level column.
    pub fn set_obs_annotation(
        &mut self,
        key: impl Into<String>,
        values: Vec<String>,
    ) -> Result<()> {
        if values.len() != self.n_obs() {
            return Err(EvoError::ShapeMismatch(format!(
                "annotation has {} values for {} observations",
                values.len(),
                self.n_obs()
            )));
        }
        let key = key.into();
        match self.obs_annotations.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = values,
            None => self.obs_annotations.push((key, values)),
        }
        Ok(())
    }
}

/// Read-only view that treats a missing distance matrix as empty.
pub struct SparseMatrixView<'a> {
    matrix: Option<&'a SparseMatrix>,
    n_rows: usize,
}

impl<'a> SparseMatrixView<'a> {
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn positive_in_row(&self, row: usize) -> usize {
        self.matrix.map_or(0, |m| m.positive_in_row(row))
    }

    pub fn row_nonzero(&self, row: usize) -> Vec<(usize, f64)> {
        self.matrix.map_or_else(Vec::new, |m| m.row_nonzero(row))
    }
}

fn parse_index(field: &str, line: usize, what: &str) -> Result<usize> {
    field
        .parse()
        .map_err(|_| EvoError::parse(line, format!("invalid {} `{}`", what, field)))
}

fn parse_value(field: &str, line: usize) -> Result<f64> {
    field
        .trim()
        .parse()
        .map_err(|_| EvoError::parse(line, format!("invalid number `{}`", field)))
}

fn check_obs(idx: usize, n_obs: usize, line: usize) -> Result<usize> {
    if idx >= n_obs {
        return Err(EvoError::parse(
            line,
            format!("observation {} not declared ({} observations)", idx, n_obs),
        ));
    }
    Ok(idx)
}

fn fields(line: &str) -> Vec<&str> {
    line.split('\t').collect()
}

fn is_record(line: &str) -> bool {
    !line.trim().is_empty() && !line.starts_with('#')
}

/// Parse an annotation file held in memory.
///
/// Observation (`O`) records are collected in a first pass so that every
/// other record type can refer to observations regardless of file order.
pub fn parse_annotations(text: &str) -> Result<Dataset> {
    // First pass: observations
    let mut obs = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if !is_record(line) || !line.starts_with("O\t") {
            continue;
        }
        let parts = fields(line);
        if parts.len() < 4 {
            return Err(EvoError::parse(i + 1, "O record needs name, seq and seqs_msa"));
        }
        if obs.iter().any(|o: &Observation| o.name == parts[1]) {
            return Err(EvoError::parse(i + 1, format!("duplicate observation `{}`", parts[1])));
        }
        obs.push(Observation {
            name: parts[1].to_string(),
            seq: parts[2].to_string(),
            seq_msa: parts[3].to_string(),
        });
    }
    let n_obs = obs.len();
    let mut dataset = Dataset::new(obs);

    // Second pass: everything attached to the observations
    let mut distances = SparseMatrix::new(n_obs, n_obs);
    let mut graphs: FxHashMap<String, SparseMatrix> = FxHashMap::default();
    let mut embeddings: FxHashMap<String, Vec<Option<[f64; 2]>>> = FxHashMap::default();
    let mut vocabularies: FxHashMap<String, Vocabulary> = FxHashMap::default();
    let mut score_rows: FxHashMap<String, BTreeMap<usize, Vec<f64>>> = FxHashMap::default();

    for (i, line) in text.lines().enumerate() {
        let lineno = i + 1;
        if !is_record(line) {
            continue;
        }
        let parts = fields(line);
        match parts[0] {
            "O" => {}
            "E" => {
                if parts.len() < 5 {
                    return Err(EvoError::parse(lineno, "E record needs basis, obs, x, y"));
                }
                let idx = check_obs(parse_index(parts[2], lineno, "observation")?, n_obs, lineno)?;
                let x = parse_value(parts[3], lineno)?;
                let y = parse_value(parts[4], lineno)?;
                let coords = embeddings
                    .entry(parts[1].to_string())
                    .or_insert_with(|| vec![None; n_obs]);
                coords[idx] = Some([x, y]);
            }
            "D" => {
                if parts.len() < 4 {
                    return Err(EvoError::parse(lineno, "D record needs row, col, value"));
                }
                let row = check_obs(parse_index(parts[1], lineno, "row")?, n_obs, lineno)?;
                let col = check_obs(parse_index(parts[2], lineno, "column")?, n_obs, lineno)?;
                distances.add(row, col, parse_value(parts[3], lineno)?);
            }
            "G" => {
                if parts.len() < 5 {
                    return Err(EvoError::parse(lineno, "G record needs key, row, col, value"));
                }
                let row = check_obs(parse_index(parts[2], lineno, "row")?, n_obs, lineno)?;
                let col = check_obs(parse_index(parts[3], lineno, "column")?, n_obs, lineno)?;
                graphs
                    .entry(parts[1].to_string())
                    .or_insert_with(|| SparseMatrix::new(n_obs, n_obs))
                    .add(row, col, parse_value(parts[4], lineno)?);
            }
            "V" => {
                if parts.len() < 4 {
                    return Err(EvoError::parse(lineno, "V record needs key, index, symbol"));
                }
                let idx = parse_index(parts[2], lineno, "vocabulary index")?;
                vocabularies
                    .entry(parts[1].to_string())
                    .or_default()
                    .insert(idx, parts[3].to_string());
            }
            "S" => {
                if parts.len() < 4 {
                    return Err(EvoError::parse(lineno, "S record needs key, position, values"));
                }
                let pos = parse_index(parts[2], lineno, "position")?;
                let values = parts[3]
                    .split(',')
                    .map(|v| parse_value(v, lineno))
                    .collect::<Result<Vec<f64>>>()?;
                score_rows
                    .entry(parts[1].to_string())
                    .or_default()
                    .insert(pos, values);
            }
            other => {
                return Err(EvoError::parse(lineno, format!("unknown record type `{}`", other)));
            }
        }
    }

    dataset.set_distances(distances);
    for (key, matrix) in graphs {
        dataset.insert_graph(key, matrix);
    }
    for (basis, coords) in embeddings {
        let missing = coords.iter().position(|c| c.is_none());
        if let Some(idx) = missing {
            return Err(EvoError::ShapeMismatch(format!(
                "embedding `{}` has no coordinates for observation {}",
                basis, idx
            )));
        }
        dataset.insert_embedding(&basis, coords.into_iter().flatten().collect());
    }
    for (key, vocab) in vocabularies {
        dataset.insert_vocabulary(key, vocab);
    }
    for (key, rows) in score_rows {
        for (expected, &pos) in rows.keys().enumerate() {
            if expected != pos {
                return Err(EvoError::ShapeMismatch(format!(
                    "score matrix `{}` skips position {} (next is {})",
                    key, expected, pos
                )));
            }
        }
        let matrix = ScoreMatrix::from_rows(rows.into_values().collect())?;
        debug!("Score matrix `{}`: {}x{}", key, matrix.rows(), matrix.cols());
        dataset.insert_scores(key, matrix);
    }

    Ok(dataset)
}

/// Load an annotation file from disk
pub fn load_dataset(path: &Path) -> Result<Dataset> {
    info!("Loading annotations from {:?}...", path);
    let text = std::fs::read_to_string(path)?;
    let dataset = parse_annotations(&text)?;
    info!(
        "Found {} observations, {} graphs, {} embeddings, {} score matrices",
        dataset.n_obs(),
        dataset.graphs.len(),
        dataset.embeddings.len(),
        dataset.scores.len()
    );
    Ok(dataset)
}
