use crate::color::{category_color, Colormap, Rgb};
use crate::dataset::{Dataset, ScoreMatrix};
use crate::embedding;
use crate::error::{EvoError, Result};
use crate::figure::{Anchor, Figure, OutputConfig, Shape, GLYPH};
use log::{debug, info, warn};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;

/// Column labels of a score matrix: vocabulary symbols in ascending index order.
fn column_symbols(
    dataset: &Dataset,
    vocab_key: &str,
    scores: &ScoreMatrix,
) -> Result<Vec<String>> {
    let vocab = dataset
        .vocabulary(vocab_key)
        .ok_or_else(|| EvoError::missing("vocabulary", vocab_key))?;
    if vocab.len() != scores.cols() {
        return Err(EvoError::ShapeMismatch(format!(
            "vocabulary `{}` has {} symbols but the score matrix has {} columns",
            vocab_key,
            vocab.len(),
            scores.cols()
        )));
    }
    Ok(vocab.values().cloned().collect())
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

#[derive(Debug, Clone)]
pub struct HeatmapOptions {
    /// Keep rows whose absolute score sum reaches this percentile (0 keeps all)
    pub percentile_keep: f64,
    /// Vocabulary is read from `{basis}_vocabulary`
    pub basis: String,
    pub key: String,
    pub cmap: String,
    /// Save as `evolocity_{save}` in the figure directory
    pub save: Option<String>,
}

impl Default for HeatmapOptions {
    fn default() -> Self {
        HeatmapOptions {
            percentile_keep: 0.0,
            basis: "onehot".to_string(),
            key: "residue_scores".to_string(),
            cmap: "RdBu".to_string(),
            save: None,
        }
    }
}

/// Filtered, normalized scores ready to draw
#[derive(Debug, Clone)]
pub struct ScoreTable {
    /// Original position of each kept row
    pub positions: Vec<usize>,
    pub symbols: Vec<String>,
    /// Values divided by `end`, within [-1, 1]
    pub values: Vec<Vec<f64>>,
    /// Symmetric bound the raw values were divided by
    pub end: f64,
}

/// Apply the percentile filter and scale by `max(|min|, max)`.
pub fn normalized_scores(dataset: &Dataset, opts: &HeatmapOptions) -> Result<ScoreTable> {
    let scores = dataset
        .scores(&opts.key)
        .ok_or_else(|| EvoError::missing("score matrix", &opts.key))?;
    let symbols = column_symbols(dataset, &format!("{}_vocabulary", opts.basis), scores)?;

    let mut positions: Vec<usize> = (0..scores.rows()).collect();
    if opts.percentile_keep > 0.0 {
        let sums: Vec<f64> = (0..scores.rows())
            .map(|r| scores.row(r).iter().map(|v| v.abs()).sum())
            .collect();
        let cutoff = percentile(&sums, opts.percentile_keep);
        positions.retain(|&r| sums[r] >= cutoff);
        debug!(
            "Percentile {} cutoff {:.4}: kept {} of {} positions",
            opts.percentile_keep,
            cutoff,
            positions.len(),
            scores.rows()
        );
    }

    let kept: Vec<&[f64]> = positions.iter().map(|&r| scores.row(r)).collect();
    let min = kept.iter().flat_map(|r| r.iter()).copied().fold(f64::INFINITY, f64::min);
    let max = kept
        .iter()
        .flat_map(|r| r.iter())
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let end = if kept.iter().all(|r| r.is_empty()) {
        0.0
    } else {
        min.abs().max(max)
    };

    let values = kept
        .iter()
        .map(|row| {
            row.iter()
                .map(|&v| if end > 0.0 && end.is_finite() { v / end } else { v })
                .collect()
        })
        .collect();

    Ok(ScoreTable {
        positions,
        symbols,
        values,
        end,
    })
}

/// Every `step`-th label, where `step` keeps labels from overlapping.
fn label_step(cell_px: f64, label_px: f64) -> usize {
    if cell_px <= 0.0 {
        return 1;
    }
    ((label_px / cell_px).ceil() as usize).max(1)
}

/// Draw a score table as a heatmap with a zero-centered color scale.
pub fn heatmap_figure(table: &ScoreTable, cmap: Colormap, dpi: f64) -> Figure {
    let rows = table.values.len();
    let cols = table.symbols.len();

    let width_in = (cols / 2).max(5) as f64;
    let height_in = (rows / 20).max(5) as f64;

    let widest_row_label = table
        .positions
        .iter()
        .map(|p| p.to_string().len())
        .max()
        .unwrap_or(1) as f64;
    let left = widest_row_label * GLYPH + 12.0;
    let mut figure = Figure::with_margins(
        (width_in * dpi).round() as u32,
        (height_in * dpi).round() as u32,
        dpi,
        left,
        80.0,
        20.0,
        30.0,
    );
    figure.set_range((0.0, cols.max(1) as f64), (0.0, rows.max(1) as f64));
    figure.set_invert_y(true);

    for (r, row) in table.values.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            if v.is_nan() {
                continue;
            }
            figure.push(Shape::Cell {
                x0: c as f64,
                y0: r as f64,
                x1: c as f64 + 1.0,
                y1: r as f64 + 1.0,
                fill: cmap.sample_range(v, -1.0, 1.0),
                zorder: 0,
            });
        }
    }

    let area = figure.area();
    let widest_symbol = table.symbols.iter().map(|s| s.chars().count()).max().unwrap_or(1) as f64;
    let col_step = label_step(area.width / cols.max(1) as f64, widest_symbol * GLYPH + 2.0);
    for (c, symbol) in table.symbols.iter().enumerate().step_by(col_step) {
        let (x, _) = figure.to_pixel([c as f64 + 0.5, 0.0]);
        figure.label(symbol.clone(), x, area.top + area.height + 12.0, Anchor::Middle);
    }
    let row_step = label_step(area.height / rows.max(1) as f64, GLYPH + 2.0);
    for (r, pos) in table.positions.iter().enumerate().step_by(row_step) {
        let (_, y) = figure.to_pixel([0.0, r as f64 + 0.5]);
        figure.label(pos.to_string(), area.left - 6.0, y, Anchor::End);
    }

    figure.set_colorbar(cmap, -1.0, 1.0);
    figure
}

/// Heatmap of per-position, per-category scores.
///
/// With `save` the figure is written to `{figdir}/evolocity_{save}` and
/// nothing is returned; otherwise the unsaved figure is handed back.
pub fn residue_scores(
    dataset: &Dataset,
    opts: &HeatmapOptions,
    output: &OutputConfig,
) -> Result<Option<Figure>> {
    let cmap = Colormap::by_name(&opts.cmap)?;
    let table = normalized_scores(dataset, opts)?;
    info!(
        "Rendering {}x{} score heatmap (scale {:.4})",
        table.values.len(),
        table.symbols.len(),
        table.end
    );
    let figure = heatmap_figure(&table, cmap, output.dpi);

    match &opts.save {
        Some(save) => {
            let mut name = format!("evolocity_{}", save);
            if std::path::Path::new(&name).extension().is_none() {
                name.push_str(".png");
            }
            figure.save(&output.figure_path(&name)?)?;
            Ok(None)
        }
        None => Ok(Some(figure)),
    }
}

/// One pick of the lowest-score scan
#[derive(Debug, Clone, PartialEq)]
pub struct LowScore {
    pub position: usize,
    pub category: usize,
    pub score: f64,
}

/// The `n_plot` positions holding the lowest scores, one pick per position.
///
/// Cells are visited in ascending score order (row-major among ties); a
/// position is taken at its lowest cell and its other cells are skipped.
/// The matrix is left untouched. Picks come back in scan order.
pub fn lowest_scores(scores: &ScoreMatrix, n_plot: usize) -> Vec<LowScore> {
    let mut cells: Vec<(f64, usize, usize)> = Vec::with_capacity(scores.rows() * scores.cols());
    for r in 0..scores.rows() {
        for c in 0..scores.cols() {
            cells.push((scores.get(r, c), r, c));
        }
    }
    cells.sort_by(|a, b| a.0.total_cmp(&b.0));

    let wanted = n_plot.min(scores.rows());
    let mut seen: FxHashSet<usize> = FxHashSet::default();
    let mut picks = Vec::with_capacity(wanted);
    for (score, position, category) in cells {
        if picks.len() >= wanted {
            break;
        }
        if !seen.insert(position) {
            continue;
        }
        picks.push(LowScore {
            position,
            category,
            score,
        });
    }
    picks
}

/// Map ungapped reference positions to columns of the reference alignment.
///
/// Every ungapped alignment character must match the raw reference at the
/// same ungapped position.
pub fn reference_columns(seq: &str, seq_msa: &str) -> Result<FxHashMap<usize, usize>> {
    let raw: Vec<char> = seq.chars().collect();
    let mut pos2msa = FxHashMap::default();
    let mut ref_idx = 0usize;
    for (idx, ch) in seq_msa.chars().enumerate() {
        if ch == '-' {
            continue;
        }
        let expected = *raw.get(ref_idx).ok_or(EvoError::IndexOutOfRange {
            what: "reference position",
            index: ref_idx,
            len: raw.len(),
        })?;
        if ch != expected {
            return Err(EvoError::AlignmentMismatch {
                position: ref_idx,
                aligned: ch,
                raw: expected,
            });
        }
        pos2msa.insert(ref_idx, idx);
        ref_idx += 1;
    }
    Ok(pos2msa)
}

/// The aligned symbol every observation carries at `position`.
pub fn position_categories(
    dataset: &Dataset,
    position: usize,
    pos2msa: Option<&FxHashMap<usize, usize>>,
) -> Result<Vec<String>> {
    let column = match pos2msa {
        Some(map) => *map.get(&position).ok_or(EvoError::IndexOutOfRange {
            what: "reference position",
            index: position,
            len: map.len(),
        })?,
        None => position,
    };
    dataset
        .obs
        .iter()
        .map(|o| {
            o.seq_msa
                .chars()
                .nth(column)
                .map(|c| c.to_string())
                .ok_or(EvoError::IndexOutOfRange {
                    what: "alignment column",
                    index: column,
                    len: o.seq_msa.chars().count(),
                })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CategoryOptions {
    /// Positions to plot; the lowest-scoring ones are chosen when absent
    pub positions: Option<Vec<usize>>,
    pub n_plot: usize,
    pub namespace: String,
    /// Observation whose ungapped sequence defines the positions
    pub reference: Option<String>,
    pub verbose: bool,
    pub basis: String,
    pub score_key: String,
    pub vocab_key: String,
}

impl Default for CategoryOptions {
    fn default() -> Self {
        CategoryOptions {
            positions: None,
            n_plot: 5,
            namespace: "residue_categories".to_string(),
            reference: None,
            verbose: true,
            basis: "umap".to_string(),
            score_key: "residue_scores".to_string(),
            vocab_key: "onehot_vocabulary".to_string(),
        }
    }
}

/// Pick positions, annotate each observation with its symbol there, and
/// write one embedding scatter per position colored by that symbol.
/// Returns the plotted positions.
pub fn residue_categories(
    dataset: &mut Dataset,
    opts: &CategoryOptions,
    output: &OutputConfig,
) -> Result<Vec<usize>> {
    embedding::coordinates(dataset, &opts.basis)?;

    let pos2msa = match &opts.reference {
        Some(name) => {
            let idx = dataset
                .obs_position(name)
                .ok_or_else(|| EvoError::missing("reference observation", name))?;
            let reference = &dataset.obs[idx];
            Some(reference_columns(&reference.seq, &reference.seq_msa)?)
        }
        None => None,
    };

    let positions: Vec<usize> = match &opts.positions {
        Some(positions) => {
            // Repeats would render and write the same file twice
            let mut seen: FxHashSet<usize> = FxHashSet::default();
            positions.iter().copied().filter(|p| seen.insert(*p)).collect()
        }
        None => {
            let scores = dataset
                .scores(&opts.score_key)
                .ok_or_else(|| EvoError::missing("score matrix", &opts.score_key))?;
            let symbols = column_symbols(dataset, &opts.vocab_key, scores)?;
            if opts.n_plot > scores.rows() {
                warn!(
                    "Asked for {} positions but only {} exist",
                    opts.n_plot,
                    scores.rows()
                );
            }
            let picks = lowest_scores(scores, opts.n_plot);
            if opts.verbose {
                for (k, pick) in picks.iter().enumerate() {
                    debug!("Position {} scored {:.4}", pick.position, pick.score);
                    info!(
                        "Lowest score {}: {}{}",
                        k + 1,
                        symbols[pick.category],
                        pick.position + 1
                    );
                }
            }
            let sorted: BTreeSet<usize> = picks.iter().map(|p| p.position).collect();
            sorted.into_iter().collect()
        }
    };

    // Annotate everything before any file is written
    for &pos in &positions {
        let categories = position_categories(dataset, pos, pos2msa.as_ref())?;
        dataset.set_obs_annotation(format!("pos{}", pos), categories)?;
    }

    let dataset: &Dataset = dataset;
    positions
        .par_iter()
        .map(|&pos| {
            let figure = category_figure(dataset, &opts.basis, &format!("pos{}", pos), output)?;
            let name = format!("{}_{}_pos{}.png", opts.basis, opts.namespace, pos);
            figure.save(&output.figure_path(&name)?)
        })
        .collect::<Result<Vec<()>>>()?;

    write_categories_tsv(dataset, &positions, &opts.namespace, output);
    Ok(positions)
}

/// Embedding scatter colored by an observation-level annotation, with the
/// neighbor graph drawn underneath.
pub fn category_figure(
    dataset: &Dataset,
    basis: &str,
    key: &str,
    output: &OutputConfig,
) -> Result<Figure> {
    let coords = embedding::coordinates(dataset, basis)?;
    let values = dataset
        .obs_annotation(key)
        .ok_or_else(|| EvoError::missing("observation annotation", key))?;

    let categories: BTreeSet<&str> = values.iter().map(|v| v.as_str()).collect();
    let palette: FxHashMap<&str, Rgb> = categories
        .iter()
        .enumerate()
        .map(|(rank, &name)| (name, category_color(name, rank)))
        .collect();

    let base = output.new_figure();
    let (width, height) = base.size();
    let mut figure = Figure::with_margins(width, height, output.dpi, 20.0, 110.0, 30.0, 20.0);
    figure.fit(coords);
    embedding::draw_neighbor_edges(dataset, coords, &mut figure);
    let colors: Vec<Rgb> = values.iter().map(|v| palette[v.as_str()]).collect();
    embedding::scatter(
        &mut figure,
        coords,
        &colors,
        embedding::default_marker_size(coords.len()),
        1,
    );
    for name in &categories {
        figure.add_legend_entry(name.to_string(), palette[name]);
    }
    figure.set_title(key.to_string());
    Ok(figure)
}

/// Write per-observation categories to `{figdir}/{namespace}.categories.tsv`
fn write_categories_tsv(
    dataset: &Dataset,
    positions: &[usize],
    namespace: &str,
    output: &OutputConfig,
) {
    let columns: Vec<(String, &[String])> = positions
        .iter()
        .filter_map(|p| {
            let key = format!("pos{}", p);
            dataset.obs_annotation(&key).map(|v| (key, v))
        })
        .collect();

    let mut content = String::from("name");
    for (key, _) in &columns {
        content.push('\t');
        content.push_str(key);
    }
    content.push('\n');
    for (i, obs) in dataset.obs.iter().enumerate() {
        content.push_str(&obs.name);
        for (_, values) in &columns {
            content.push('\t');
            content.push_str(&values[i]);
        }
        content.push('\n');
    }

    let tsv_name = format!("{}.categories.tsv", namespace);
    match output
        .figure_path(&tsv_name)
        .and_then(|path| std::fs::write(&path, content).map(|_| path).map_err(EvoError::from))
    {
        Ok(path) => info!("Category assignments saved to {:?}", path),
        Err(e) => warn!("could not write category TSV: {}", e),
    }
}
