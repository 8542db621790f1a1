use crate::color::Rgb;
use crate::dataset::Dataset;
use crate::error::{EvoError, Result};
use crate::figure::{Figure, OutputConfig, Shape};
use log::debug;

const EDGE_COLOR: Rgb = (200, 200, 200);
const BACKGROUND_COLOR: Rgb = (211, 211, 211);

/// Coordinates of `X_{basis}` or a missing-annotation error
pub fn coordinates<'a>(dataset: &'a Dataset, basis: &str) -> Result<&'a [[f64; 2]]> {
    dataset
        .embedding(basis)
        .ok_or_else(|| EvoError::missing("embedding", format!("X_{}", basis)))
}

/// Marker area that keeps large embeddings readable (120000 / n, clamped).
pub fn default_marker_size(n_obs: usize) -> f64 {
    (120_000.0 / n_obs.max(1) as f64).clamp(4.0, 100.0)
}

/// Scatter every observation with its own fill color.
pub fn scatter(
    figure: &mut Figure,
    coords: &[[f64; 2]],
    colors: &[Rgb],
    size: f64,
    zorder: i32,
) {
    for (&at, &fill) in coords.iter().zip(colors) {
        figure.push(Shape::Marker {
            at,
            size,
            fill,
            edge: None,
            zorder,
        });
    }
}

/// Neighbor-graph edges under the scatter, one segment per connected pair.
pub fn draw_neighbor_edges(dataset: &Dataset, coords: &[[f64; 2]], figure: &mut Figure) {
    let distances = dataset.distances();
    let mut count = 0usize;
    for row in 0..distances.n_rows() {
        for (col, _) in distances.row_nonzero(row) {
            // one segment per unordered pair
            let mirrored = || distances.row_nonzero(col).iter().any(|&(c, _)| c == row);
            if col == row || (col < row && mirrored()) {
                continue;
            }
            if let (Some(&from), Some(&to)) = (coords.get(row), coords.get(col)) {
                figure.push(Shape::Segment {
                    from,
                    to,
                    width: 1.0,
                    color: EDGE_COLOR,
                    zorder: 0,
                });
                count += 1;
            }
        }
    }
    debug!("Drew {} neighbor edges", count);
}

/// New figure showing the whole embedding in light grey, ready for a path on top.
pub fn background_figure(dataset: &Dataset, basis: &str, output: &OutputConfig) -> Result<Figure> {
    let coords = coordinates(dataset, basis)?;
    let mut figure = output.new_figure();
    figure.fit(coords);
    let colors = vec![BACKGROUND_COLOR; coords.len()];
    scatter(&mut figure, coords, &colors, default_marker_size(coords.len()), 1);
    figure.set_title(basis.to_string());
    Ok(figure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::parse_annotations;

    #[test]
    fn symmetric_neighbors_draw_once() {
        let text = "O\ta\tA\tA\nO\tb\tA\tA\nO\tc\tA\tA\n\
                    E\tumap\t0\t0\t0\nE\tumap\t1\t1\t0\nE\tumap\t2\t0\t1\n\
                    D\t0\t1\t1\nD\t1\t0\t1\nD\t2\t0\t2\n";
        let ds = parse_annotations(text).unwrap();
        let coords = coordinates(&ds, "umap").unwrap();
        let mut fig = Figure::new(100, 100, 100.0);
        draw_neighbor_edges(&ds, coords, &mut fig);
        assert_eq!(fig.segment_count(), 2);
    }

    #[test]
    fn background_needs_embedding() {
        let ds = parse_annotations("O\ta\tA\tA\n").unwrap();
        assert!(matches!(
            background_figure(&ds, "umap", &OutputConfig::default()),
            Err(EvoError::MissingAnnotation { .. })
        ));
    }

    #[test]
    fn marker_size_is_clamped() {
        assert_eq!(default_marker_size(10), 100.0);
        assert_eq!(default_marker_size(12_000), 10.0);
        assert_eq!(default_marker_size(1_000_000), 4.0);
    }
}
